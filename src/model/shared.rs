use std::sync::Arc;

use tracing::{debug, trace};

use crate::{
    common::{PeerRef, TradeId, UserIdentity},
    config::ProtocolConfig,
    error::FiatSwapError,
    message::ProtocolMessage,
    offer::Offer,
    persist::Persistence,
    services::{BlockChainService, MessageTransport, SignatureService, TradeServices, WalletService},
    task::{TaskOutcome, TaskResult},
};

use super::record::PersistedModel;

/// What a node brings to every trade it takes part in.
#[derive(Clone)]
pub struct NodeContext {
    pub services: TradeServices,
    pub user: UserIdentity,
    pub local_peer: PeerRef,
    pub config: ProtocolConfig,
}

/// Role agnostic context of one trade. Service handles are fixed at
/// construction and there is no way to swap them afterwards.
#[derive(Clone)]
pub struct SharedTradeModel {
    id: TradeId,
    offer: Arc<Offer>,
    context: NodeContext,
}

impl SharedTradeModel {
    pub fn new(offer: &Offer, context: &NodeContext) -> Self {
        Self {
            id: offer.trade_id(),
            offer: Arc::new(offer.clone()),
            context: context.clone(),
        }
    }

    pub fn id(&self) -> TradeId {
        self.id
    }

    pub fn offer(&self) -> &Offer {
        &self.offer
    }

    pub fn wallet(&self) -> &dyn WalletService {
        self.context.services.wallet.as_ref()
    }

    pub fn block_chain(&self) -> &dyn BlockChainService {
        self.context.services.block_chain.as_ref()
    }

    pub fn signature(&self) -> &dyn SignatureService {
        self.context.services.signature.as_ref()
    }

    pub fn transport(&self) -> &dyn MessageTransport {
        self.context.services.transport.as_ref()
    }

    pub fn persistence(&self) -> &dyn Persistence {
        self.context.services.persistence.as_ref()
    }

    pub fn user(&self) -> &UserIdentity {
        &self.context.user
    }

    pub fn local_peer(&self) -> &PeerRef {
        &self.context.local_peer
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.context.config
    }

    /// Sends to the peer; an unreachable peer is a transport failure of the
    /// sending task.
    pub(crate) async fn send_message(&self, peer: &PeerRef, message: ProtocolMessage) -> TaskResult {
        let kind = message.kind();
        match self.transport().send_message(peer, message).await {
            Ok(()) => {
                debug!("Trade w/ TradeID {} sent {} to {}", self.id, kind, peer);
                Ok(TaskOutcome::Complete)
            }
            Err(error) => TaskOutcome::from_service_error(error),
        }
    }

    pub(crate) async fn read_record(
        &self,
        namespace: &str,
        key: &str,
    ) -> Result<Option<PersistedModel>, FiatSwapError> {
        match self.persistence().read(namespace, key).await? {
            Some(blob) => Ok(Some(PersistedModel::decode(&blob)?)),
            None => Ok(None),
        }
    }

    pub(crate) async fn write_record(
        &self,
        namespace: &str,
        key: &str,
        record: &PersistedModel,
    ) -> Result<(), FiatSwapError> {
        let blob = record.encode()?;
        trace!("Trade w/ TradeID {} persist {} bytes to {}", self.id, blob.len(), key);
        self.persistence().write(namespace, key, blob).await
    }

    pub(crate) async fn remove_record(&self, namespace: &str, key: &str) -> Result<(), FiatSwapError> {
        self.persistence().remove(namespace, key).await
    }
}
