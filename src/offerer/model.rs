use async_trait::async_trait;
use bitcoin::Txid;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    common::{Role, SignedTx, TradeId},
    error::FiatSwapError,
    message::ProtocolMessage,
    model::{
        persistence_key, LocalKeys, NodeContext, OffererModel, PersistedModel, SharedTradeModel,
        TakerModel, TaskOwned,
    },
    protocol::{RoleModel, UserAction},
    services::PayoutTerms,
    task::ProtocolModel,
    trade::{Trade, TradeSnapshot, TradeState},
};

use super::tasks::BuyerAsOffererTask;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuyerAsOffererRecord {
    pub trade: TradeSnapshot,
    pub offerer: OffererModel,
    pub taker: TakerModel,
    pub take_offer_fee_txid: TaskOwned<Txid>,
    pub published_deposit_tx: TaskOwned<SignedTx>,
    pub payout_terms: TaskOwned<PayoutTerms>,
    pub inbound_message: Option<ProtocolMessage>,
    pub pending_tasks: Vec<BuyerAsOffererTask>,
}

/// The offerer's side of a trade on a buy offer: it buys bitcoin and pays
/// fiat, the taker sells.
pub struct BuyerAsOffererModel {
    pub(super) shared: SharedTradeModel,
    pub(super) trade: Trade,
    pub(super) offerer: OffererModel,
    pub(super) taker: TakerModel,
    pub(super) take_offer_fee_txid: TaskOwned<Txid>,
    pub(super) published_deposit_tx: TaskOwned<SignedTx>,
    pub(super) payout_terms: TaskOwned<PayoutTerms>,
    pub(super) inbound_message: Option<ProtocolMessage>,
    pending_tasks: Vec<BuyerAsOffererTask>,
}

impl BuyerAsOffererModel {
    pub const MODEL_TYPE_NAME: &'static str = "BuyerAsOffererModel";

    pub fn persistence_key(trade_id: TradeId) -> String {
        persistence_key(Self::MODEL_TYPE_NAME, trade_id)
    }

    /// Picks up a persisted copy for the same trade if there is one.
    pub async fn new(trade: Trade, context: &NodeContext) -> Result<Self, FiatSwapError> {
        let shared = SharedTradeModel::new(trade.offer(), context);
        let key = Self::persistence_key(trade.id());
        let record = match shared.read_record(Self::MODEL_TYPE_NAME, &key).await? {
            Some(PersistedModel::BuyerAsOfferer(record)) => Some(record),
            Some(other) => {
                return Err(FiatSwapError::contract(format!(
                    "{} holds a {} record",
                    key,
                    other.model_type_name()
                )))
            }
            None => None,
        };
        Self::assemble(shared, trade, record)
    }

    pub fn restore(
        record: BuyerAsOffererRecord,
        context: &NodeContext,
    ) -> Result<Self, FiatSwapError> {
        let trade = Trade::from_snapshot(record.trade.clone())?;
        let shared = SharedTradeModel::new(trade.offer(), context);
        Self::assemble(shared, trade, Some(record))
    }

    fn assemble(
        shared: SharedTradeModel,
        trade: Trade,
        record: Option<BuyerAsOffererRecord>,
    ) -> Result<Self, FiatSwapError> {
        let fiat_account_id = &shared.offer().fiat_account_id;
        let fiat_account = shared.user().fiat_account(fiat_account_id).ok_or_else(|| {
            FiatSwapError::simple(format!(
                "Offer {} names unknown fiat account {}",
                shared.offer().id,
                fiat_account_id
            ))
        })?;
        let keys = LocalKeys::derive(shared.wallet(), trade.id());
        let local_peer = shared.local_peer().clone();

        let mut model = match record {
            Some(record) => {
                debug!(
                    "Trade w/ TradeID {} adopting persisted {}",
                    trade.id(),
                    Self::MODEL_TYPE_NAME
                );
                Self {
                    shared,
                    trade,
                    offerer: record.offerer,
                    taker: record.taker,
                    take_offer_fee_txid: record.take_offer_fee_txid,
                    published_deposit_tx: record.published_deposit_tx,
                    payout_terms: record.payout_terms,
                    inbound_message: record.inbound_message,
                    pending_tasks: record.pending_tasks,
                }
            }
            None => Self {
                shared,
                trade,
                offerer: OffererModel::default(),
                taker: TakerModel::default(),
                take_offer_fee_txid: TaskOwned::default(),
                published_deposit_tx: TaskOwned::default(),
                payout_terms: TaskOwned::default(),
                inbound_message: None,
                pending_tasks: Vec::new(),
            },
        };
        let user = model.shared.user().clone();
        model
            .offerer
            .identity
            .attach_local(keys, &user, fiat_account, local_peer);
        Ok(model)
    }

    pub fn offerer(&self) -> &OffererModel {
        &self.offerer
    }

    pub fn taker(&self) -> &TakerModel {
        &self.taker
    }

    pub fn take_offer_fee_txid(&self) -> Option<&Txid> {
        self.take_offer_fee_txid.get()
    }

    pub fn published_deposit_tx(&self) -> Option<&SignedTx> {
        self.published_deposit_tx.get()
    }

    pub fn payout_terms(&self) -> Option<&PayoutTerms> {
        self.payout_terms.get()
    }

    pub fn record(&self) -> BuyerAsOffererRecord {
        BuyerAsOffererRecord {
            trade: self.trade.snapshot(),
            offerer: self.offerer.clone(),
            taker: self.taker.clone(),
            take_offer_fee_txid: self.take_offer_fee_txid.clone(),
            published_deposit_tx: self.published_deposit_tx.clone(),
            payout_terms: self.payout_terms.clone(),
            inbound_message: self.inbound_message.clone(),
            pending_tasks: self.pending_tasks.clone(),
        }
    }

    fn out_of_phase(&self, description: impl Into<String>) -> FiatSwapError {
        FiatSwapError::OutOfPhase {
            trade_id: self.trade.id(),
            description: description.into(),
        }
    }
}

#[async_trait]
impl ProtocolModel for BuyerAsOffererModel {
    type Task = BuyerAsOffererTask;

    fn trade_id(&self) -> TradeId {
        self.trade.id()
    }

    fn record_pending_tasks(&mut self, tasks: Vec<BuyerAsOffererTask>) {
        self.pending_tasks = tasks;
    }

    async fn persist(&self) -> Result<(), FiatSwapError> {
        self.offerer.identity.ensure_local_complete(Role::Offerer)?;
        let record = PersistedModel::BuyerAsOfferer(self.record());
        let key = Self::persistence_key(self.trade.id());
        self.shared
            .write_record(Self::MODEL_TYPE_NAME, &key, &record)
            .await
    }
}

#[async_trait]
impl RoleModel for BuyerAsOffererModel {
    const ROLE: Role = Role::Offerer;

    fn trade(&self) -> &Trade {
        &self.trade
    }

    fn shared(&self) -> &SharedTradeModel {
        &self.shared
    }

    fn pending_tasks(&self) -> &[BuyerAsOffererTask] {
        &self.pending_tasks
    }

    fn accept_message(
        &mut self,
        message: ProtocolMessage,
    ) -> Result<Vec<BuyerAsOffererTask>, FiatSwapError> {
        if message.trade_id() != Some(self.trade.id()) {
            return Err(self.out_of_phase(format!("{} for another trade", message.kind())));
        }
        let state = self.trade.state();

        let tasks = match &message {
            ProtocolMessage::RequestTakeOffer {
                taker_account_id, ..
            } => {
                if state != TradeState::Preparation || self.published_deposit_tx.is_set() {
                    return Err(self.out_of_phase(format!("take offer request in {}", state)));
                }
                if let Some(account_id) = self.taker.identity.account_id.get() {
                    if account_id != taker_account_id {
                        return Err(self.out_of_phase("offer already taken by another account"));
                    }
                }
                vec![
                    BuyerAsOffererTask::ProcessRequestTakeOffer,
                    BuyerAsOffererTask::VerifyTakeOfferFeePayment,
                    BuyerAsOffererTask::VerifyTakerAccount,
                    BuyerAsOffererTask::CreateDepositInputs,
                    BuyerAsOffererTask::CreateAndSignContract,
                    BuyerAsOffererTask::RespondToTakeOfferRequest,
                ]
            }
            ProtocolMessage::DepositTxPublished { deposit_tx, .. } => {
                if state == TradeState::DepositPublished
                    && self.published_deposit_tx.get() == Some(deposit_tx)
                {
                    debug!("Trade w/ TradeID {} duplicate deposit notice", self.trade.id());
                    return Ok(Vec::new());
                }
                if state != TradeState::Preparation || !self.offerer.deposit_inputs.is_set() {
                    return Err(self.out_of_phase(format!("deposit published in {}", state)));
                }
                vec![
                    BuyerAsOffererTask::ProcessDepositTxPublished,
                    BuyerAsOffererTask::SetDepositPublished,
                ]
            }
            ProtocolMessage::PayoutTxPublished { payout_tx, .. } => {
                if state == TradeState::PayoutTxPublished
                    && self.trade.payout_tx().as_ref() == Some(payout_tx)
                {
                    return Ok(Vec::new());
                }
                if state != TradeState::FiatPaymentStarted {
                    return Err(self.out_of_phase(format!("payout published in {}", state)));
                }
                vec![BuyerAsOffererTask::ProcessPayoutTxPublished]
            }
            other => {
                return Err(self.out_of_phase(format!("{} is not for the offerer", other.kind())));
            }
        };

        self.inbound_message = Some(message);
        Ok(tasks)
    }

    fn accept_user_action(
        &mut self,
        action: UserAction,
    ) -> Result<Vec<BuyerAsOffererTask>, FiatSwapError> {
        let state = self.trade.state();
        match action {
            UserAction::FiatPaymentStarted if state == TradeState::DepositConfirmed => Ok(vec![
                BuyerAsOffererTask::SignPayoutTx,
                BuyerAsOffererTask::SendFiatTransferStarted,
                BuyerAsOffererTask::SetFiatPaymentStarted,
            ]),
            _ => Err(self.out_of_phase(format!("{:?} in {}", action, state))),
        }
    }

    async fn remove_persisted(&self) -> Result<(), FiatSwapError> {
        let key = Self::persistence_key(self.trade.id());
        self.shared
            .remove_record(Self::MODEL_TYPE_NAME, &key)
            .await
    }
}
