mod runner;

pub use runner::{RunnerCancel, RunnerOutcome, TaskRunner};

use std::fmt::Debug;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{common::TradeId, error::FiatSwapError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// Peer or artifact failed a check. The trade cannot continue.
    Verification,
    /// Local resources were insufficient. The user may re-attempt.
    Resource,
    /// Peer or network unreachable. The remainder stays queued.
    Transport,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub reason: String,
}

impl TaskFailure {
    pub fn verification(reason: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Verification,
            reason: reason.into(),
        }
    }

    pub fn resource(reason: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Resource,
            reason: reason.into(),
        }
    }

    pub fn transport(reason: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transport,
            reason: reason.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskOutcome {
    Complete,
    Failed(TaskFailure),
}

impl TaskOutcome {
    pub fn failed_verification(reason: impl Into<String>) -> Self {
        TaskOutcome::Failed(TaskFailure::verification(reason))
    }

    pub fn failed_resource(reason: impl Into<String>) -> Self {
        TaskOutcome::Failed(TaskFailure::resource(reason))
    }

    pub fn failed_transport(reason: impl Into<String>) -> Self {
        TaskOutcome::Failed(TaskFailure::transport(reason))
    }

    /// Classifies an error returned by a collaborator. Contract violations are
    /// passed through to the runner.
    pub fn from_service_error(error: FiatSwapError) -> TaskResult {
        match error {
            FiatSwapError::ContractViolation { .. } => Err(error),
            FiatSwapError::Transport { .. } | FiatSwapError::ChannelClosed { .. } => {
                Ok(TaskOutcome::failed_transport(error.to_string()))
            }
            _ => Ok(TaskOutcome::failed_resource(error.to_string())),
        }
    }
}

/// `Ok` carries the task's terminal outcome. `Err` is reserved for contract
/// violations, which the runner escalates instead of reporting as a failure.
pub type TaskResult = Result<TaskOutcome, FiatSwapError>;

/// One atomic protocol step bound to a model. Must tolerate being re-run from
/// persisted state.
#[async_trait]
pub trait Task<M: Send>: Debug + Send + Sync {
    async fn run(&self, model: &mut M) -> TaskResult;
}

/// A model a `TaskRunner` can drive and checkpoint.
#[async_trait]
pub trait ProtocolModel: Send + Sync + Sized {
    type Task: Task<Self> + Clone;

    fn trade_id(&self) -> TradeId;

    /// Remembers the not-yet-run remainder so a resume can re-queue it.
    fn record_pending_tasks(&mut self, tasks: Vec<Self::Task>);

    async fn persist(&self) -> Result<(), FiatSwapError>;
}
