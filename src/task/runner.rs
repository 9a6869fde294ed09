use std::{collections::VecDeque, sync::Arc, time::Duration};

use tokio::{select, sync::watch};
use tracing::{debug, error, trace, warn};

use crate::{common::TradeId, error::FiatSwapError};

use super::{ProtocolModel, Task, TaskFailure, TaskOutcome};

type SuccessHandler = Box<dyn FnOnce() + Send>;
type FailureHandler = Box<dyn FnOnce(&str) + Send>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunnerOutcome {
    Completed,
    Failed(TaskFailure),
    Cancelled,
}

/// Cancels the runner it was taken from. The task in flight is abandoned at
/// its next await point and nothing after it runs.
#[derive(Clone)]
pub struct RunnerCancel {
    tx: Arc<watch::Sender<bool>>,
}

impl RunnerCancel {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Runs an ordered list of tasks against one model, strictly one after the
/// other. The model is persisted after every completed task; a failed task
/// stops the list and the continuation is told exactly once.
pub struct TaskRunner<M: ProtocolModel> {
    trade_id: TradeId,
    tasks: VecDeque<M::Task>,
    on_success: Option<SuccessHandler>,
    on_failure: Option<FailureHandler>,
    task_timeout: Option<Duration>,
    cancel_tx: Arc<watch::Sender<bool>>,
    cancel_rx: watch::Receiver<bool>,
}

impl<M: ProtocolModel> TaskRunner<M> {
    pub fn new(
        trade_id: TradeId,
        on_success: impl FnOnce() + Send + 'static,
        on_failure: impl FnOnce(&str) + Send + 'static,
    ) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Self {
            trade_id,
            tasks: VecDeque::new(),
            on_success: Some(Box::new(on_success)),
            on_failure: Some(Box::new(on_failure)),
            task_timeout: None,
            cancel_tx: Arc::new(cancel_tx),
            cancel_rx,
        }
    }

    pub fn add_tasks(&mut self, tasks: impl IntoIterator<Item = M::Task>) {
        self.tasks.extend(tasks);
    }

    pub fn with_timeout(mut self, task_timeout: Option<Duration>) -> Self {
        self.task_timeout = task_timeout;
        self
    }

    pub fn cancel_handle(&self) -> RunnerCancel {
        RunnerCancel {
            tx: self.cancel_tx.clone(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.tasks.len()
    }

    fn succeed(&mut self) {
        if let Some(on_success) = self.on_success.take() {
            on_success();
        }
        self.on_failure = None;
    }

    fn fail(&mut self, reason: &str) {
        if let Some(on_failure) = self.on_failure.take() {
            on_failure(reason);
        }
        self.on_success = None;
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    /// Drives the queue to its end. Contract violations surface as `Err` after
    /// the failure continuation ran; all other endings are an outcome.
    pub async fn run(mut self, model: &mut M) -> Result<RunnerOutcome, FiatSwapError> {
        while let Some(task) = self.tasks.pop_front() {
            if self.is_cancelled() {
                self.tasks.push_front(task);
                return Ok(self.cancelled());
            }

            trace!("Trade w/ TradeID {} run {:?}", self.trade_id, task);
            let result = match run_one(self.task_timeout, self.cancel_rx.clone(), &task, model)
                .await
            {
                Some(result) => result,
                None => {
                    self.tasks.push_front(task);
                    return Ok(self.cancelled());
                }
            };

            match result {
                Ok(TaskOutcome::Complete) => {
                    model.record_pending_tasks(self.tasks.iter().cloned().collect());
                    if let Err(error) = model.persist().await {
                        let reason = format!("Persisting after {:?} failed - {}", task, error);
                        error!("Trade w/ TradeID {} {}", self.trade_id, reason);
                        self.fail(&reason);
                        if matches!(error, FiatSwapError::ContractViolation { .. }) {
                            return Err(error);
                        }
                        return Ok(RunnerOutcome::Failed(TaskFailure::resource(reason)));
                    }
                    debug!("Trade w/ TradeID {} completed {:?}", self.trade_id, task);
                }
                Ok(TaskOutcome::Failed(failure)) => {
                    warn!(
                        "Trade w/ TradeID {} {:?} failed ({:?}) - {}",
                        self.trade_id, task, failure.kind, failure.reason
                    );
                    self.fail(&failure.reason);
                    return Ok(RunnerOutcome::Failed(failure));
                }
                Err(error) => {
                    error!(
                        "Trade w/ TradeID {} {:?} violated its contract - {}",
                        self.trade_id, task, error
                    );
                    self.fail(&error.to_string());
                    return Err(error);
                }
            }
        }

        self.succeed();
        Ok(RunnerOutcome::Completed)
    }

    fn cancelled(&mut self) -> RunnerOutcome {
        debug!(
            "Trade w/ TradeID {} runner cancelled with {} tasks left",
            self.trade_id,
            self.tasks.len()
        );
        self.fail("Task runner cancelled");
        RunnerOutcome::Cancelled
    }
}

async fn cancellation(mut cancel_rx: watch::Receiver<bool>) {
    loop {
        let cancelled = *cancel_rx.borrow_and_update();
        if cancelled {
            return;
        }
        if cancel_rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// `None` when cancelled before the task finished.
async fn run_one<M: ProtocolModel>(
    task_timeout: Option<Duration>,
    cancel_rx: watch::Receiver<bool>,
    task: &M::Task,
    model: &mut M,
) -> Option<Result<TaskOutcome, FiatSwapError>> {
    let task_future = async move {
        match task_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, task.run(model)).await {
                Ok(result) => result,
                Err(_) => Ok(TaskOutcome::failed_transport(format!(
                    "{:?} timed out after {:?}",
                    task, timeout
                ))),
            },
            None => task.run(model).await,
        }
    };

    select! {
        result = task_future => Some(result),
        _ = cancellation(cancel_rx) => None,
    }
}
