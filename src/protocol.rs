use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bitcoin::Txid;
use tokio::{
    select,
    sync::{mpsc, oneshot},
    task::{JoinError, JoinHandle},
};
use tracing::{debug, error, info, warn};

use crate::{
    common::{Role, TradeId},
    error::FiatSwapError,
    message::ProtocolMessage,
    model::SharedTradeModel,
    notif::{Notifier, TradeNotif},
    task::{FailureKind, ProtocolModel, RunnerCancel, RunnerOutcome, TaskRunner},
    trade::{ConfidenceWatch, Trade, TradeState},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum UserAction {
    TakeOffer,
    FiatPaymentStarted,
    FiatPaymentReceived,
}

/// What a role model adds on top of being runnable: deciding which task list
/// an event starts, if any.
#[async_trait]
pub(crate) trait RoleModel: ProtocolModel + 'static {
    const ROLE: Role;

    fn trade(&self) -> &Trade;

    fn shared(&self) -> &SharedTradeModel;

    fn pending_tasks(&self) -> &[Self::Task];

    /// Task list for an inbound message, `OutOfPhase` when the message is not
    /// expected now. Rejection leaves the model untouched.
    fn accept_message(
        &mut self,
        message: ProtocolMessage,
    ) -> Result<Vec<Self::Task>, FiatSwapError>;

    fn accept_user_action(&mut self, action: UserAction)
        -> Result<Vec<Self::Task>, FiatSwapError>;

    async fn remove_persisted(&self) -> Result<(), FiatSwapError>;
}

fn out_of_phase(trade_id: TradeId, description: impl Into<String>) -> FiatSwapError {
    FiatSwapError::OutOfPhase {
        trade_id,
        description: description.into(),
    }
}

type OutcomeRsp = oneshot::Sender<Result<RunnerOutcome, FiatSwapError>>;

enum ProtocolRequest {
    Message {
        message: ProtocolMessage,
        rsp_tx: OutcomeRsp,
    },
    UserAction {
        action: UserAction,
        rsp_tx: OutcomeRsp,
    },
    Resume {
        rsp_tx: OutcomeRsp,
    },
    Cancel {
        rsp_tx: oneshot::Sender<Result<(), FiatSwapError>>,
    },
    Close {
        rsp_tx: oneshot::Sender<Result<(), FiatSwapError>>,
    },
    Shutdown {
        rsp_tx: oneshot::Sender<Result<(), FiatSwapError>>,
    },
}

enum ConfirmationEvent {
    DepositBuilding { depth: u32 },
    PayoutBuilding { depth: u32 },
}

#[derive(Clone, Default)]
struct CancelSlot {
    slot: Arc<Mutex<Option<RunnerCancel>>>,
}

impl CancelSlot {
    fn lock(&self) -> MutexGuard<'_, Option<RunnerCancel>> {
        match self.slot.lock() {
            Ok(slot) => slot,
            Err(error) => {
                panic!("Error locking runner cancel slot - {}", error);
            }
        }
    }
}

#[derive(Clone)]
pub struct TradeProtocolAccess {
    trade_id: TradeId,
    tx: mpsc::Sender<ProtocolRequest>,
    runner_cancel: CancelSlot,
}

impl TradeProtocolAccess {
    pub fn trade_id(&self) -> TradeId {
        self.trade_id
    }

    pub async fn handle_message(
        &self,
        message: ProtocolMessage,
    ) -> Result<RunnerOutcome, FiatSwapError> {
        let (rsp_tx, rsp_rx) = oneshot::channel();
        self.tx
            .send(ProtocolRequest::Message { message, rsp_tx })
            .await?;
        rsp_rx.await?
    }

    async fn user_action(&self, action: UserAction) -> Result<RunnerOutcome, FiatSwapError> {
        let (rsp_tx, rsp_rx) = oneshot::channel();
        self.tx
            .send(ProtocolRequest::UserAction { action, rsp_tx })
            .await?;
        rsp_rx.await?
    }

    pub async fn take_offer(&self) -> Result<RunnerOutcome, FiatSwapError> {
        self.user_action(UserAction::TakeOffer).await
    }

    pub async fn fiat_payment_started(&self) -> Result<RunnerOutcome, FiatSwapError> {
        self.user_action(UserAction::FiatPaymentStarted).await
    }

    pub async fn fiat_payment_received(&self) -> Result<RunnerOutcome, FiatSwapError> {
        self.user_action(UserAction::FiatPaymentReceived).await
    }

    pub async fn resume(&self) -> Result<RunnerOutcome, FiatSwapError> {
        let (rsp_tx, rsp_rx) = oneshot::channel();
        self.tx.send(ProtocolRequest::Resume { rsp_tx }).await?;
        rsp_rx.await?
    }

    /// Abandons the task list in flight, if any, then cancels the trade.
    pub async fn cancel(&self) -> Result<(), FiatSwapError> {
        if let Some(runner_cancel) = self.runner_cancel.lock().as_ref() {
            runner_cancel.cancel();
        }
        let (rsp_tx, rsp_rx) = oneshot::channel();
        self.tx.send(ProtocolRequest::Cancel { rsp_tx }).await?;
        rsp_rx.await?
    }

    pub(crate) async fn close(&self) -> Result<(), FiatSwapError> {
        let (rsp_tx, rsp_rx) = oneshot::channel();
        self.tx.send(ProtocolRequest::Close { rsp_tx }).await?;
        rsp_rx.await?
    }

    pub(crate) async fn shutdown(&self) -> Result<(), FiatSwapError> {
        let (rsp_tx, rsp_rx) = oneshot::channel();
        self.tx.send(ProtocolRequest::Shutdown { rsp_tx }).await?;
        rsp_rx.await?
    }
}

/// A running protocol instance: the trade plus the actor that owns its model.
pub(crate) struct TradeProtocol {
    pub(crate) trade: Trade,
    pub(crate) role: Role,
    access: TradeProtocolAccess,
    task_handle: JoinHandle<()>,
}

impl TradeProtocol {
    pub(crate) fn spawn<R: RoleModel>(model: R, notifier: Notifier) -> Self {
        let trade = model.trade().clone();
        let trade_id = trade.id();
        let channel_size = model.shared().config().request_channel_size;
        let (tx, rx) = mpsc::channel::<ProtocolRequest>(channel_size);
        let (event_tx, event_rx) = mpsc::channel::<ConfirmationEvent>(channel_size);
        let runner_cancel = CancelSlot::default();

        let actor = ProtocolActor {
            trade_id,
            model,
            rx,
            event_tx,
            event_rx,
            notifier,
            runner_cancel: runner_cancel.clone(),
            deposit_watch_armed: false,
            payout_watch_armed: false,
            watch_handles: Vec::new(),
        };
        let task_handle = tokio::spawn(async move { actor.run().await });

        Self {
            trade,
            role: R::ROLE,
            access: TradeProtocolAccess {
                trade_id,
                tx,
                runner_cancel,
            },
            task_handle,
        }
    }

    pub(crate) fn new_accessor(&self) -> TradeProtocolAccess {
        self.access.clone()
    }

    pub(crate) async fn await_task_handle(self) -> Result<(), JoinError> {
        self.task_handle.await
    }
}

struct ProtocolActor<R: RoleModel> {
    trade_id: TradeId,
    model: R,
    rx: mpsc::Receiver<ProtocolRequest>,
    event_tx: mpsc::Sender<ConfirmationEvent>,
    event_rx: mpsc::Receiver<ConfirmationEvent>,
    notifier: Notifier,
    runner_cancel: CancelSlot,
    deposit_watch_armed: bool,
    payout_watch_armed: bool,
    watch_handles: Vec<JoinHandle<()>>,
}

impl<R: RoleModel> ProtocolActor<R> {
    async fn run(mut self) {
        self.arm_watches();

        loop {
            select! {
                Some(request) = self.rx.recv() => {
                    match request {
                        ProtocolRequest::Message { message, rsp_tx } => {
                            let result = self.handle_message(message).await;
                            self.respond(rsp_tx, result);
                        },
                        ProtocolRequest::UserAction { action, rsp_tx } => {
                            let result = self.handle_user_action(action).await;
                            self.respond(rsp_tx, result);
                        },
                        ProtocolRequest::Resume { rsp_tx } => {
                            let result = self.resume().await;
                            self.respond(rsp_tx, result);
                        },
                        ProtocolRequest::Cancel { rsp_tx } => {
                            let result = self.cancel().await;
                            let cancelled = result.is_ok();
                            self.respond(rsp_tx, result);
                            if cancelled {
                                break;
                            }
                        },
                        ProtocolRequest::Close { rsp_tx } => {
                            let result = self.model.remove_persisted().await;
                            let closed = result.is_ok();
                            self.respond(rsp_tx, result);
                            if closed {
                                break;
                            }
                        },
                        ProtocolRequest::Shutdown { rsp_tx } => {
                            self.respond(rsp_tx, Ok(()));
                            break;
                        },
                    }
                },

                Some(event) = self.event_rx.recv() => {
                    self.handle_confirmation(event).await;
                },

                else => break,
            }
        }

        for handle in self.watch_handles.drain(..) {
            handle.abort();
        }
        debug!("Trade w/ TradeID {} protocol actor exited", self.trade_id);
    }

    fn respond<T>(&self, rsp_tx: oneshot::Sender<Result<T, FiatSwapError>>, result: Result<T, FiatSwapError>) {
        if rsp_tx.send(result).is_err() {
            warn!(
                "Trade w/ TradeID {} requester went away before the response",
                self.trade_id
            );
        }
    }

    fn ensure_idle(&self) -> Result<(), FiatSwapError> {
        let state = self.model.trade().state();
        if state.is_terminal() {
            return Err(out_of_phase(self.trade_id, format!("trade already {}", state)));
        }
        if !self.model.pending_tasks().is_empty() {
            return Err(out_of_phase(
                self.trade_id,
                format!(
                    "{} tasks of an earlier step still pending, resume first",
                    self.model.pending_tasks().len()
                ),
            ));
        }
        Ok(())
    }

    async fn handle_message(
        &mut self,
        message: ProtocolMessage,
    ) -> Result<RunnerOutcome, FiatSwapError> {
        let kind = message.kind();
        if let Err(error) = self.ensure_idle() {
            warn!("Trade w/ TradeID {} rejected {} - {}", self.trade_id, kind, error);
            return Err(error);
        }
        // Accepting may itself observe the deposit confirmation.
        let before = self.model.trade().state();
        let accepted = self.model.accept_message(message);
        self.settle_inline_transition(before).await;
        let tasks = match accepted {
            Ok(tasks) => tasks,
            Err(error) => {
                warn!("Trade w/ TradeID {} rejected {} - {}", self.trade_id, kind, error);
                return Err(error);
            }
        };
        debug!("Trade w/ TradeID {} accepted {}", self.trade_id, kind);
        self.run_tasks(tasks).await
    }

    /// Checkpoints and announces a transition made outside any task list.
    async fn settle_inline_transition(&mut self, before: TradeState) {
        if self.model.trade().state() == before {
            return;
        }
        if let Err(error) = self.model.persist().await {
            error!(
                "Trade w/ TradeID {} persist after {} - {}",
                self.trade_id,
                self.model.trade().state(),
                error
            );
        }
        self.notify_state_change(before);
        self.arm_watches();
    }

    async fn handle_user_action(
        &mut self,
        action: UserAction,
    ) -> Result<RunnerOutcome, FiatSwapError> {
        self.ensure_idle()?;
        let tasks = self.model.accept_user_action(action)?;
        info!("Trade w/ TradeID {} user action {:?}", self.trade_id, action);
        self.run_tasks(tasks).await
    }

    async fn resume(&mut self) -> Result<RunnerOutcome, FiatSwapError> {
        let state = self.model.trade().state();
        if state.is_terminal() {
            return Err(out_of_phase(self.trade_id, format!("trade already {}", state)));
        }
        let tasks = self.model.pending_tasks().to_vec();
        if tasks.is_empty() {
            debug!("Trade w/ TradeID {} nothing to resume", self.trade_id);
            return Ok(RunnerOutcome::Completed);
        }
        info!(
            "Trade w/ TradeID {} resuming {} pending tasks",
            self.trade_id,
            tasks.len()
        );
        self.run_tasks(tasks).await
    }

    async fn run_tasks(&mut self, tasks: Vec<R::Task>) -> Result<RunnerOutcome, FiatSwapError> {
        if tasks.is_empty() {
            return Ok(RunnerOutcome::Completed);
        }
        let state_before = self.model.trade().state();

        // The list itself is the first checkpoint, so a crash before the
        // first task completes still leaves it to resume.
        self.model.record_pending_tasks(tasks.clone());
        self.model.persist().await?;

        let trade_id = self.trade_id;
        let notifier = self.notifier.clone();
        let mut runner = TaskRunner::<R>::new(
            trade_id,
            move || debug!("Trade w/ TradeID {} task list completed", trade_id),
            move |reason: &str| {
                notifier.notify(TradeNotif::TaskFailed {
                    trade_id,
                    reason: reason.to_string(),
                })
            },
        )
        .with_timeout(self.model.shared().config().task_timeout);
        runner.add_tasks(tasks);

        *self.runner_cancel.lock() = Some(runner.cancel_handle());
        let result = runner.run(&mut self.model).await;
        *self.runner_cancel.lock() = None;

        match &result {
            Ok(RunnerOutcome::Failed(failure)) if failure.kind == FailureKind::Verification => {
                self.fail_trade(&failure.reason).await;
            }
            Ok(_) => {}
            Err(error) => {
                self.notifier.notify(TradeNotif::ProtocolViolation {
                    trade_id,
                    description: error.to_string(),
                });
                self.fail_trade(&error.to_string()).await;
            }
        }

        self.notify_state_change(state_before);
        self.arm_watches();
        result
    }

    async fn fail_trade(&mut self, reason: &str) {
        let trade = self.model.trade();
        if !trade.state().is_terminal() {
            if let Err(error) = trade.fail(reason) {
                error!("Trade w/ TradeID {} could not fail - {}", self.trade_id, error);
            }
        }
        self.model.record_pending_tasks(Vec::new());
        if let Err(error) = self.model.persist().await {
            error!(
                "Trade w/ TradeID {} persist after failure - {}",
                self.trade_id, error
            );
        }
    }

    async fn cancel(&mut self) -> Result<(), FiatSwapError> {
        let state = self.model.trade().state();
        if state.is_terminal() || state.is_deposit_confirmed() {
            return Err(out_of_phase(
                self.trade_id,
                format!("cannot cancel in {}", state),
            ));
        }
        self.model.trade().fail("Trade cancelled by user")?;
        self.model.remove_persisted().await?;
        info!("Trade w/ TradeID {} cancelled in {}", self.trade_id, state);
        self.notify_state_change(state);
        Ok(())
    }

    fn notify_state_change(&self, before: TradeState) {
        let state = self.model.trade().state();
        if state != before {
            self.notifier.notify(TradeNotif::StateChanged {
                trade_id: self.trade_id,
                state,
            });
        }
    }

    fn arm_watches(&mut self) {
        let trade = self.model.trade().clone();
        match trade.state() {
            TradeState::DepositPublished if !self.deposit_watch_armed => {
                if let Some(deposit_tx) = trade.deposit_tx() {
                    self.spawn_watch(deposit_tx.txid, 1, |depth| {
                        ConfirmationEvent::DepositBuilding { depth }
                    });
                    self.deposit_watch_armed = true;
                }
            }
            TradeState::PayoutTxPublished if !self.payout_watch_armed => {
                if let Some(payout_tx) = trade.payout_tx() {
                    let min_depth = self.model.shared().config().payout_confirmations;
                    self.spawn_watch(payout_tx.txid, min_depth, |depth| {
                        ConfirmationEvent::PayoutBuilding { depth }
                    });
                    self.payout_watch_armed = true;
                }
            }
            _ => {}
        }
    }

    fn spawn_watch(
        &mut self,
        txid: Txid,
        min_depth: u32,
        event: fn(u32) -> ConfirmationEvent,
    ) {
        let watch =
            ConfidenceWatch::subscribe(self.model.shared().wallet(), self.trade_id, txid, min_depth);
        let event_tx = self.event_tx.clone();
        let trade_id = self.trade_id;
        let handle = tokio::spawn(async move {
            if let Some(depth) = watch.building().await {
                if event_tx.send(event(depth)).await.is_err() {
                    debug!("Trade w/ TradeID {} confirmation after actor exit", trade_id);
                }
            }
        });
        self.watch_handles.push(handle);
    }

    async fn handle_confirmation(&mut self, event: ConfirmationEvent) {
        let trade = self.model.trade().clone();
        let before = trade.state();
        let fired = match event {
            ConfirmationEvent::DepositBuilding { depth } => {
                let fired = trade.confirm_deposit();
                if fired {
                    info!(
                        "Trade w/ TradeID {} deposit confirmed at depth {}",
                        self.trade_id, depth
                    );
                }
                fired
            }
            ConfirmationEvent::PayoutBuilding { depth } => {
                let fired = trade.confirm_payout();
                if fired {
                    info!(
                        "Trade w/ TradeID {} payout confirmed at depth {}, trade completed",
                        self.trade_id, depth
                    );
                }
                fired
            }
        };
        if fired {
            self.settle_inline_transition(before).await;
        }
    }
}
