use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

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

use super::tasks::SellerAsTakerTask;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SellerAsTakerRecord {
    pub trade: TradeSnapshot,
    pub offerer: OffererModel,
    pub taker: TakerModel,
    pub take_offer_fee_tx: TaskOwned<SignedTx>,
    pub published_deposit_tx: TaskOwned<SignedTx>,
    pub payout_terms: TaskOwned<PayoutTerms>,
    pub inbound_message: Option<ProtocolMessage>,
    pub pending_tasks: Vec<SellerAsTakerTask>,
}

/// The taker's side of a trade on a buy offer: it sells bitcoin and receives
/// fiat.
pub struct SellerAsTakerModel {
    pub(super) shared: SharedTradeModel,
    pub(super) trade: Trade,
    pub(super) offerer: OffererModel,
    pub(super) taker: TakerModel,
    pub(super) take_offer_fee_tx: TaskOwned<SignedTx>,
    pub(super) published_deposit_tx: TaskOwned<SignedTx>,
    pub(super) payout_terms: TaskOwned<PayoutTerms>,
    pub(super) inbound_message: Option<ProtocolMessage>,
    pending_tasks: Vec<SellerAsTakerTask>,
}

impl SellerAsTakerModel {
    pub const MODEL_TYPE_NAME: &'static str = "SellerAsTakerModel";

    pub fn persistence_key(trade_id: TradeId) -> String {
        persistence_key(Self::MODEL_TYPE_NAME, trade_id)
    }

    pub async fn new(trade: Trade, context: &NodeContext) -> Result<Self, FiatSwapError> {
        let shared = SharedTradeModel::new(trade.offer(), context);
        let key = Self::persistence_key(trade.id());
        let record = match shared.read_record(Self::MODEL_TYPE_NAME, &key).await? {
            Some(PersistedModel::SellerAsTaker(record)) => Some(record),
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
        record: SellerAsTakerRecord,
        context: &NodeContext,
    ) -> Result<Self, FiatSwapError> {
        let trade = Trade::from_snapshot(record.trade.clone())?;
        let shared = SharedTradeModel::new(trade.offer(), context);
        Self::assemble(shared, trade, Some(record))
    }

    fn assemble(
        shared: SharedTradeModel,
        trade: Trade,
        record: Option<SellerAsTakerRecord>,
    ) -> Result<Self, FiatSwapError> {
        let user = shared.user().clone();
        let fiat_account = user.fiat_accounts.first().cloned().ok_or_else(|| {
            FiatSwapError::simple(format!("Account {} has no fiat account", user.account_id))
        })?;
        let keys = LocalKeys::derive(shared.wallet(), trade.id());
        let payout_address = keys.address_entry.address.clone();
        let local_peer = shared.local_peer().clone();
        let offerer_message_pub_key = shared.offer().offerer_message_pub_key;
        let offerer_peer = shared.offer().offerer_peer.clone();

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
                    take_offer_fee_tx: record.take_offer_fee_tx,
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
                take_offer_fee_tx: TaskOwned::default(),
                published_deposit_tx: TaskOwned::default(),
                payout_terms: TaskOwned::default(),
                inbound_message: None,
                pending_tasks: Vec::new(),
            },
        };

        model
            .taker
            .identity
            .attach_local(keys, &user, fiat_account, local_peer);
        model.taker.payout_address.assign_local(payout_address);

        // Both are public in the offer, so known before first contact.
        model
            .offerer
            .identity
            .message_pub_key
            .set("offerer.message_pub_key", offerer_message_pub_key)?;
        model.offerer.identity.peer = Some(offerer_peer);
        Ok(model)
    }

    pub fn offerer(&self) -> &OffererModel {
        &self.offerer
    }

    pub fn taker(&self) -> &TakerModel {
        &self.taker
    }

    pub fn take_offer_fee_tx(&self) -> Option<&SignedTx> {
        self.take_offer_fee_tx.get()
    }

    pub fn published_deposit_tx(&self) -> Option<&SignedTx> {
        self.published_deposit_tx.get()
    }

    pub fn payout_terms(&self) -> Option<&PayoutTerms> {
        self.payout_terms.get()
    }

    pub fn record(&self) -> SellerAsTakerRecord {
        SellerAsTakerRecord {
            trade: self.trade.snapshot(),
            offerer: self.offerer.clone(),
            taker: self.taker.clone(),
            take_offer_fee_tx: self.take_offer_fee_tx.clone(),
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

    /// The offerer may see the deposit build before our own watch reports it.
    /// The wallet is asked directly so the transfer notice is not refused.
    fn observe_deposit_confidence(&self) {
        if self.trade.state() != TradeState::DepositPublished {
            return;
        }
        let Some(deposit_tx) = self.trade.deposit_tx() else {
            return;
        };
        let building = self
            .shared
            .wallet()
            .confidence_for_txid(&deposit_tx.txid)
            .map(|confidence| confidence.is_building())
            .unwrap_or(false);
        if building && self.trade.confirm_deposit() {
            info!(
                "Trade w/ TradeID {} deposit {} confirmed",
                self.trade.id(),
                deposit_tx.txid
            );
        }
    }
}

#[async_trait]
impl ProtocolModel for SellerAsTakerModel {
    type Task = SellerAsTakerTask;

    fn trade_id(&self) -> TradeId {
        self.trade.id()
    }

    fn record_pending_tasks(&mut self, tasks: Vec<SellerAsTakerTask>) {
        self.pending_tasks = tasks;
    }

    async fn persist(&self) -> Result<(), FiatSwapError> {
        self.taker.identity.ensure_local_complete(Role::Taker)?;
        let record = PersistedModel::SellerAsTaker(self.record());
        let key = Self::persistence_key(self.trade.id());
        self.shared
            .write_record(Self::MODEL_TYPE_NAME, &key, &record)
            .await
    }
}

#[async_trait]
impl RoleModel for SellerAsTakerModel {
    const ROLE: Role = Role::Taker;

    fn trade(&self) -> &Trade {
        &self.trade
    }

    fn shared(&self) -> &SharedTradeModel {
        &self.shared
    }

    fn pending_tasks(&self) -> &[SellerAsTakerTask] {
        &self.pending_tasks
    }

    fn accept_message(
        &mut self,
        message: ProtocolMessage,
    ) -> Result<Vec<SellerAsTakerTask>, FiatSwapError> {
        if message.trade_id() != Some(self.trade.id()) {
            return Err(self.out_of_phase(format!("{} for another trade", message.kind())));
        }

        let tasks = match &message {
            ProtocolMessage::RespondToTakeOfferRequest { .. } => {
                let state = self.trade.state();
                if state != TradeState::TakeOfferFeePaid {
                    return Err(self.out_of_phase(format!("take offer response in {}", state)));
                }
                vec![
                    SellerAsTakerTask::ProcessRespondToTakeOfferRequest,
                    SellerAsTakerTask::VerifyOffererAccount,
                    SellerAsTakerTask::VerifyContract,
                    SellerAsTakerTask::SignAndPublishDepositTx,
                    SellerAsTakerTask::SendDepositTxPublished,
                ]
            }
            ProtocolMessage::FiatTransferStarted { .. } => {
                self.observe_deposit_confidence();
                let state = self.trade.state();
                if state != TradeState::DepositConfirmed {
                    return Err(self.out_of_phase(format!("fiat transfer started in {}", state)));
                }
                vec![
                    SellerAsTakerTask::ProcessFiatTransferStarted,
                    SellerAsTakerTask::SetFiatPaymentStarted,
                ]
            }
            other => {
                return Err(self.out_of_phase(format!("{} is not for the taker", other.kind())));
            }
        };

        self.inbound_message = Some(message);
        Ok(tasks)
    }

    fn accept_user_action(
        &mut self,
        action: UserAction,
    ) -> Result<Vec<SellerAsTakerTask>, FiatSwapError> {
        let state = self.trade.state();
        match action {
            UserAction::TakeOffer if state == TradeState::Preparation => Ok(vec![
                SellerAsTakerTask::PayTakeOfferFee,
                SellerAsTakerTask::SendTakeOfferRequest,
            ]),
            UserAction::FiatPaymentReceived if state == TradeState::FiatPaymentStarted => {
                Ok(vec![
                    SellerAsTakerTask::VerifyOffererPayoutSignature,
                    SellerAsTakerTask::SetFiatPaymentReceived,
                    SellerAsTakerTask::SignAndPublishPayoutTx,
                    SellerAsTakerTask::SendPayoutTxPublished,
                ])
            }
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
