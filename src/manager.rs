use std::{
    collections::HashMap,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use bitcoin::Amount;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    common::{parse_address, FeePolicy, Role, SignedTx, TradeId},
    error::FiatSwapError,
    message::ProtocolMessage,
    model::{NodeContext, PersistedModel, CLOSED_TRADE_NAMESPACE},
    notif::{Notifier, TradeNotif},
    offer::{Direction, Offer},
    offerer::BuyerAsOffererModel,
    protocol::{RoleModel, TradeProtocol, TradeProtocolAccess},
    task::RunnerOutcome,
    taker::SellerAsTakerModel,
    trade::{Trade, TradeSnapshot, TradeState},
};

/// Registry of one node's trades. Pending trades each run a protocol actor;
/// closed trades are kept as plain snapshots.
pub struct TradeManager {
    context: NodeContext,
    notifier: Notifier,
    open_offers: RwLock<HashMap<Uuid, Offer>>,
    pending: RwLock<HashMap<TradeId, TradeProtocol>>,
    closed: RwLock<HashMap<TradeId, Trade>>,
    current_pending_trade: RwLock<Option<TradeId>>,
}

fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(error) => {
            panic!("Error reading trade manager - {}", error);
        }
    }
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(error) => {
            panic!("Error writing trade manager - {}", error);
        }
    }
}

enum RestoredModel {
    Offerer(BuyerAsOffererModel),
    Taker(SellerAsTakerModel),
}

fn outcome_result(trade_id: TradeId, outcome: RunnerOutcome) -> Result<(), FiatSwapError> {
    match outcome {
        RunnerOutcome::Completed => Ok(()),
        RunnerOutcome::Failed(failure) => Err(FiatSwapError::TaskFailed {
            trade_id,
            kind: failure.kind,
            reason: failure.reason,
        }),
        RunnerOutcome::Cancelled => Err(FiatSwapError::simple(format!(
            "Trade w/ TradeID {} task list cancelled",
            trade_id
        ))),
    }
}

impl TradeManager {
    pub fn new(context: NodeContext) -> Self {
        Self {
            context,
            notifier: Notifier::default(),
            open_offers: RwLock::new(HashMap::new()),
            pending: RwLock::new(HashMap::new()),
            closed: RwLock::new(HashMap::new()),
            current_pending_trade: RwLock::new(None),
        }
    }

    pub fn context(&self) -> &NodeContext {
        &self.context
    }

    // Notifications

    pub fn register_notif_tx(&self, tx: mpsc::Sender<TradeNotif>) {
        self.notifier.set_tx(Some(tx));
    }

    /// Registers a fresh channel sized by the config and hands back its
    /// receiving end. Replaces any earlier registration.
    pub fn subscribe_notifs(&self) -> mpsc::Receiver<TradeNotif> {
        let (notif_tx, notif_rx) = mpsc::channel(self.context.config.notif_channel_size);
        self.register_notif_tx(notif_tx);
        notif_rx
    }

    pub fn unregister_notif_tx(&self) {
        self.notifier.set_tx(None);
    }

    // Open offers

    /// Only buy offers are supported, the offerer always buys bitcoin.
    pub fn add_open_offer(&self, offer: Offer) -> Result<(), FiatSwapError> {
        if offer.direction != Direction::Buy {
            return Err(FiatSwapError::simple(format!(
                "Offer {} - only buy offers can be opened",
                offer.id
            )));
        }
        offer.validate()?;
        if self.context.user.fiat_account(&offer.fiat_account_id).is_none() {
            return Err(FiatSwapError::simple(format!(
                "Offer {} - fiat account {} unknown",
                offer.id, offer.fiat_account_id
            )));
        }
        info!("Offer {} opened for {}", offer.id, offer.amount);
        write_lock(&self.open_offers).insert(offer.id, offer);
        Ok(())
    }

    pub fn remove_open_offer(&self, offer_id: Uuid) -> Option<Offer> {
        let removed = write_lock(&self.open_offers).remove(&offer_id);
        if removed.is_some() {
            debug!("Offer {} removed", offer_id);
        }
        removed
    }

    pub fn open_offers(&self) -> Vec<Offer> {
        read_lock(&self.open_offers).values().cloned().collect()
    }

    /// The reply arrives as a `TradeNotif::OfferAvailability`.
    pub async fn request_offer_availability(&self, offer: &Offer) -> Result<(), FiatSwapError> {
        let message = ProtocolMessage::RequestIsOfferAvailable {
            offer_id: offer.id,
            taker_peer: self.context.local_peer.clone(),
        };
        self.context
            .services
            .transport
            .send_message(&offer.offerer_peer, message)
            .await
    }

    // Trade lifecycle

    pub async fn take_offer(
        &self,
        offer: Offer,
        trade_amount: Amount,
    ) -> Result<Trade, FiatSwapError> {
        if offer.direction != Direction::Buy {
            return Err(FiatSwapError::simple(format!(
                "Offer {} - only buy offers can be taken",
                offer.id
            )));
        }
        offer.validate()?;
        offer.validate_trade_amount(trade_amount)?;
        let trade_id = offer.trade_id();
        if self.trade(trade_id).is_some() {
            return Err(FiatSwapError::simple(format!(
                "Trade w/ TradeID {} already exists",
                trade_id
            )));
        }

        let trade = Trade::new(offer, trade_amount);
        let model = SellerAsTakerModel::new(trade.clone(), &self.context).await?;
        let access = self.insert_pending(TradeProtocol::spawn(model, self.notifier.clone()));
        info!("Trade w/ TradeID {} taking offer for {}", trade_id, trade_amount);

        let outcome = access.take_offer().await?;
        outcome_result(trade_id, outcome)?;
        Ok(trade)
    }

    /// Entry point of the transport for everything a peer sends us.
    pub async fn handle_message(&self, message: ProtocolMessage) -> Result<(), FiatSwapError> {
        match message {
            ProtocolMessage::RequestIsOfferAvailable {
                offer_id,
                taker_peer,
            } => {
                let is_available = read_lock(&self.open_offers).contains_key(&offer_id);
                debug!("Offer {} availability requested - {}", offer_id, is_available);
                let reply = ProtocolMessage::ReportOfferAvailability {
                    offer_id,
                    is_available,
                };
                self.context
                    .services
                    .transport
                    .send_message(&taker_peer, reply)
                    .await
            }
            ProtocolMessage::ReportOfferAvailability {
                offer_id,
                is_available,
            } => {
                self.notifier.notify(TradeNotif::OfferAvailability {
                    offer_id,
                    is_available,
                });
                Ok(())
            }
            ProtocolMessage::RequestTakeOffer {
                trade_id,
                trade_amount,
                ..
            } if self.accessor(trade_id).is_err() => {
                let access = self.open_offerer_trade(trade_id, trade_amount).await?;
                access.handle_message(message).await?;
                Ok(())
            }
            message => {
                let Some(trade_id) = message.trade_id() else {
                    return Err(FiatSwapError::simple(format!(
                        "{} without trade id",
                        message.kind()
                    )));
                };
                let access = self.accessor(trade_id)?;
                access.handle_message(message).await?;
                Ok(())
            }
        }
    }

    /// The offer leaves the open set before the first await, so of two
    /// concurrent requests only one finds it. It is put back if the trade
    /// cannot be opened.
    async fn open_offerer_trade(
        &self,
        trade_id: TradeId,
        trade_amount: Amount,
    ) -> Result<TradeProtocolAccess, FiatSwapError> {
        let offer = write_lock(&self.open_offers)
            .remove(&trade_id.uuid())
            .ok_or(FiatSwapError::UnknownTrade { trade_id })?;
        debug!("Offer {} reserved for trade", offer.id);

        match self.spawn_offerer_trade(offer.clone(), trade_amount).await {
            Ok(access) => {
                info!("Trade w/ TradeID {} take offer request accepted", trade_id);
                Ok(access)
            }
            Err(error) => {
                warn!("Offer {} released - {}", offer.id, error);
                write_lock(&self.open_offers).insert(offer.id, offer);
                Err(error)
            }
        }
    }

    async fn spawn_offerer_trade(
        &self,
        offer: Offer,
        trade_amount: Amount,
    ) -> Result<TradeProtocolAccess, FiatSwapError> {
        offer.validate_trade_amount(trade_amount)?;
        let trade = Trade::new(offer, trade_amount);
        let model = BuyerAsOffererModel::new(trade, &self.context).await?;
        Ok(self.insert_pending(TradeProtocol::spawn(model, self.notifier.clone())))
    }

    fn insert_pending(&self, protocol: TradeProtocol) -> TradeProtocolAccess {
        let trade_id = protocol.trade.id();
        let role = protocol.role;
        let access = protocol.new_accessor();
        write_lock(&self.pending).insert(trade_id, protocol);
        *write_lock(&self.current_pending_trade) = Some(trade_id);
        self.notifier
            .notify(TradeNotif::PendingTradeAdded { trade_id, role });
        access
    }

    fn accessor(&self, trade_id: TradeId) -> Result<TradeProtocolAccess, FiatSwapError> {
        read_lock(&self.pending)
            .get(&trade_id)
            .map(|protocol| protocol.new_accessor())
            .ok_or(FiatSwapError::UnknownTrade { trade_id })
    }

    pub async fn on_fiat_payment_started(&self, trade_id: TradeId) -> Result<(), FiatSwapError> {
        let outcome = self.accessor(trade_id)?.fiat_payment_started().await?;
        outcome_result(trade_id, outcome)
    }

    pub async fn on_fiat_payment_received(&self, trade_id: TradeId) -> Result<(), FiatSwapError> {
        let outcome = self.accessor(trade_id)?.fiat_payment_received().await?;
        outcome_result(trade_id, outcome)
    }

    /// Re-runs what an earlier resource or transport failure left queued.
    pub async fn resume_trade(&self, trade_id: TradeId) -> Result<(), FiatSwapError> {
        let outcome = self.accessor(trade_id)?.resume().await?;
        outcome_result(trade_id, outcome)
    }

    pub async fn cancel_trade(&self, trade_id: TradeId) -> Result<(), FiatSwapError> {
        self.accessor(trade_id)?.cancel().await?;
        self.move_to_closed(trade_id).await
    }

    /// Only completed trades, or failed ones that never locked funds, can be
    /// closed.
    pub async fn close_trade(&self, trade_id: TradeId) -> Result<(), FiatSwapError> {
        let trade = read_lock(&self.pending)
            .get(&trade_id)
            .map(|protocol| protocol.trade.clone())
            .ok_or(FiatSwapError::UnknownTrade { trade_id })?;
        let state = trade.state();
        let closable = match state {
            TradeState::Completed => true,
            TradeState::Failed => trade.deposit_tx().is_none(),
            _ => false,
        };
        if !closable {
            return Err(FiatSwapError::OutOfPhase {
                trade_id,
                description: format!("cannot close in {}", state),
            });
        }
        self.accessor(trade_id)?.close().await?;
        self.move_to_closed(trade_id).await
    }

    async fn move_to_closed(&self, trade_id: TradeId) -> Result<(), FiatSwapError> {
        let protocol = write_lock(&self.pending).remove(&trade_id);
        let Some(protocol) = protocol else {
            return Err(FiatSwapError::UnknownTrade { trade_id });
        };
        let trade = protocol.trade.clone();
        if let Err(error) = protocol.await_task_handle().await {
            error!("Trade w/ TradeID {} protocol actor join - {}", trade_id, error);
        }

        let blob = serde_json::to_string(&trade.snapshot())?;
        self.context
            .services
            .persistence
            .write(CLOSED_TRADE_NAMESPACE, &trade_id.to_string(), blob)
            .await?;
        write_lock(&self.closed).insert(trade_id, trade);

        {
            let mut current = write_lock(&self.current_pending_trade);
            if *current == Some(trade_id) {
                *current = read_lock(&self.pending).keys().next().copied();
            }
        }
        info!("Trade w/ TradeID {} closed", trade_id);
        self.notifier
            .notify(TradeNotif::PendingTradeRemoved { trade_id });
        Ok(())
    }

    pub fn amount_to_withdraw(&self, trade_id: TradeId) -> Amount {
        let wallet = &self.context.services.wallet;
        wallet.balance_for_address(&wallet.address_entry(trade_id).address)
    }

    /// Sweeps the trade address to `to_address` and closes the trade.
    pub async fn withdraw(
        &self,
        trade_id: TradeId,
        to_address: &str,
    ) -> Result<SignedTx, FiatSwapError> {
        let state = self
            .pending_trade(trade_id)
            .ok_or(FiatSwapError::UnknownTrade { trade_id })?
            .state();
        if state != TradeState::Completed {
            return Err(FiatSwapError::OutOfPhase {
                trade_id,
                description: format!("cannot withdraw in {}", state),
            });
        }
        parse_address(to_address, self.context.config.network)?;

        let wallet = &self.context.services.wallet;
        let from_address = wallet.address_entry(trade_id).address;
        let balance = wallet.balance_for_address(&from_address);
        let amount = balance
            .checked_sub(FeePolicy::TX_FEE)
            .filter(|amount| *amount > Amount::ZERO)
            .ok_or(FiatSwapError::InsufficientFunds {
                needed: FeePolicy::TX_FEE,
                available: balance,
            })?;
        let withdraw_tx = wallet.send_funds(&from_address, to_address, amount).await?;
        info!(
            "Trade w/ TradeID {} withdrew {} in {}",
            trade_id, amount, withdraw_tx.txid
        );
        self.close_trade(trade_id).await?;
        Ok(withdraw_tx)
    }

    // Queries

    pub fn pending_trades(&self) -> HashMap<TradeId, Trade> {
        read_lock(&self.pending)
            .iter()
            .map(|(trade_id, protocol)| (*trade_id, protocol.trade.clone()))
            .collect()
    }

    pub fn pending_trade(&self, trade_id: TradeId) -> Option<Trade> {
        read_lock(&self.pending)
            .get(&trade_id)
            .map(|protocol| protocol.trade.clone())
    }

    pub fn pending_role(&self, trade_id: TradeId) -> Option<Role> {
        read_lock(&self.pending)
            .get(&trade_id)
            .map(|protocol| protocol.role)
    }

    pub fn closed_trades(&self) -> Vec<Trade> {
        read_lock(&self.closed).values().cloned().collect()
    }

    pub fn trade(&self, trade_id: TradeId) -> Option<Trade> {
        self.pending_trade(trade_id)
            .or_else(|| read_lock(&self.closed).get(&trade_id).cloned())
    }

    pub fn current_pending_trade(&self) -> Option<Trade> {
        let current = *read_lock(&self.current_pending_trade);
        current.and_then(|trade_id| self.pending_trade(trade_id))
    }

    // Restart

    /// Rebuilds every persisted trade and resumes the ones interrupted
    /// mid task list. Returns the ids of the restored pending trades.
    ///
    /// Every record is decoded before any actor is spawned. A record that
    /// does not decode or restore is logged and left in place.
    pub async fn restore(&self) -> Result<Vec<TradeId>, FiatSwapError> {
        let persistence = self.context.services.persistence.clone();
        let mut models = Vec::new();

        for namespace in [
            BuyerAsOffererModel::MODEL_TYPE_NAME,
            SellerAsTakerModel::MODEL_TYPE_NAME,
        ] {
            for key in persistence.keys(namespace).await? {
                let Some(blob) = persistence.read(namespace, &key).await? else {
                    continue;
                };
                match self.restore_model(&blob) {
                    Ok(model) => models.push(model),
                    Err(error) => warn!("Skipping persisted {} {} - {}", namespace, key, error),
                }
            }
        }

        let mut closed = Vec::new();
        for key in persistence.keys(CLOSED_TRADE_NAMESPACE).await? {
            let Some(blob) = persistence.read(CLOSED_TRADE_NAMESPACE, &key).await? else {
                continue;
            };
            let restored = serde_json::from_str::<TradeSnapshot>(&blob)
                .map_err(FiatSwapError::from)
                .and_then(Trade::from_snapshot);
            match restored {
                Ok(trade) => closed.push(trade),
                Err(error) => warn!("Skipping closed trade {} - {}", key, error),
            }
        }

        let mut restored = Vec::new();
        let mut to_resume = Vec::new();
        for model in models {
            let (protocol, has_pending) = match model {
                RestoredModel::Offerer(model) => {
                    let has_pending = !model.pending_tasks().is_empty();
                    (TradeProtocol::spawn(model, self.notifier.clone()), has_pending)
                }
                RestoredModel::Taker(model) => {
                    let has_pending = !model.pending_tasks().is_empty();
                    (TradeProtocol::spawn(model, self.notifier.clone()), has_pending)
                }
            };
            let trade_id = protocol.trade.id();
            debug!(
                "Trade w/ TradeID {} restored in {}",
                trade_id,
                protocol.trade.state()
            );
            let access = self.insert_pending(protocol);
            restored.push(trade_id);
            if has_pending {
                to_resume.push(access);
            }
        }
        {
            let mut closed_trades = write_lock(&self.closed);
            for trade in closed {
                closed_trades.insert(trade.id(), trade);
            }
        }

        for access in to_resume {
            let trade_id = access.trade_id();
            match access.resume().await.and_then(|outcome| outcome_result(trade_id, outcome)) {
                Ok(()) => info!("Trade w/ TradeID {} resumed", trade_id),
                Err(error) => warn!("Trade w/ TradeID {} resume failed - {}", trade_id, error),
            }
        }

        info!("Restored {} pending trades", restored.len());
        Ok(restored)
    }

    fn restore_model(&self, blob: &str) -> Result<RestoredModel, FiatSwapError> {
        match PersistedModel::decode(blob)? {
            PersistedModel::BuyerAsOfferer(record) => Ok(RestoredModel::Offerer(
                BuyerAsOffererModel::restore(record, &self.context)?,
            )),
            PersistedModel::SellerAsTaker(record) => Ok(RestoredModel::Taker(
                SellerAsTakerModel::restore(record, &self.context)?,
            )),
        }
    }

    pub async fn shutdown(&self) -> Result<(), FiatSwapError> {
        let protocols: Vec<TradeProtocol> = write_lock(&self.pending)
            .drain()
            .map(|(_, protocol)| protocol)
            .collect();
        for protocol in protocols {
            let trade_id = protocol.trade.id();
            protocol.new_accessor().shutdown().await?;
            if let Err(error) = protocol.await_task_handle().await {
                error!("Trade w/ TradeID {} protocol actor join - {}", trade_id, error);
            }
        }
        *write_lock(&self.current_pending_trade) = None;
        Ok(())
    }
}
