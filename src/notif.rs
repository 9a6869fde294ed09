use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use crate::{
    common::{Role, TradeId},
    trade::TradeState,
};

#[derive(Clone, Debug, PartialEq)]
pub enum TradeNotif {
    PendingTradeAdded { trade_id: TradeId, role: Role },
    PendingTradeRemoved { trade_id: TradeId },
    StateChanged { trade_id: TradeId, state: TradeState },
    TaskFailed { trade_id: TradeId, reason: String },
    OfferAvailability { offer_id: Uuid, is_available: bool },
    ProtocolViolation { trade_id: TradeId, description: String },
}

/// Fan-out point shared by the manager and every protocol actor. Sending never
/// blocks; a full or missing receiver drops the notification.
#[derive(Clone, Default)]
pub(crate) struct Notifier {
    tx: Arc<RwLock<Option<mpsc::Sender<TradeNotif>>>>,
}

impl Notifier {
    pub(crate) fn set_tx(&self, tx: Option<mpsc::Sender<TradeNotif>>) {
        match self.tx.write() {
            Ok(mut guard) => *guard = tx,
            Err(error) => panic!("Error writing notif tx - {}", error),
        }
    }

    pub(crate) fn notify(&self, notif: TradeNotif) {
        let tx = match self.tx.read() {
            Ok(guard) => guard.clone(),
            Err(error) => panic!("Error reading notif tx - {}", error),
        };
        let Some(tx) = tx else {
            return;
        };
        if let Err(error) = tx.try_send(notif) {
            warn!("Dropped trade notification - {}", error);
        }
    }
}
