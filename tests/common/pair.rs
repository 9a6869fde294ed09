use std::{sync::Arc, time::Duration};

use bitcoin::Txid;
use tokio::{
    sync::mpsc,
    time::{sleep, timeout},
};

use fiatswap_trading::{
    common::FeePolicy,
    message::ProtocolMessage,
    notif::TradeNotif,
    persist::MemoryPersistence,
    services::{EcdsaSignatureService, PayoutTerms, SignatureService, WalletService},
    testing::{SomeTestParams, TestChain, TestNode, TestTransport},
    Trade, TradeManager,
};

pub const WAIT: Duration = Duration::from_secs(5);

/// An offerer and a taker node on one chain and one message bus.
pub struct TradingPair {
    pub chain: TestChain,
    pub transport: TestTransport,
    pub offerer: TestNode,
    pub taker: TestNode,
    pub offerer_manager: Arc<TradeManager>,
    pub taker_manager: Arc<TradeManager>,
}

impl TradingPair {
    pub fn new() -> Self {
        let chain = TestChain::new();
        let transport = TestTransport::new();
        let offerer = TestNode::offerer_on(chain.clone(), transport.clone(), MemoryPersistence::new());
        let taker = TestNode::taker_on(chain.clone(), transport.clone(), MemoryPersistence::new());

        let offerer_manager = offerer.manager();
        let taker_manager = taker.manager();
        transport.connect(SomeTestParams::offerer_peer(), offerer_manager.clone());
        transport.connect(SomeTestParams::taker_peer(), taker_manager.clone());

        Self {
            chain,
            transport,
            offerer,
            taker,
            offerer_manager,
            taker_manager,
        }
    }

    /// Stops the taker's manager and brings up a fresh one over the same
    /// wallet and storage. Nothing is restored yet.
    pub async fn restart_taker(&mut self) -> Arc<TradeManager> {
        self.taker_manager.shutdown().await.unwrap();
        self.transport.disconnect(&SomeTestParams::taker_peer());

        let taker_manager = self.taker.manager();
        self.transport
            .connect(SomeTestParams::taker_peer(), taker_manager.clone());
        self.taker_manager = taker_manager.clone();
        taker_manager
    }

    /// The split an honest offerer proposes once the deposit is locked.
    pub fn payout_terms(&self, trade: &Trade) -> PayoutTerms {
        let trade_id = trade.id();
        let taker_contribution =
            FeePolicy::taker_contribution(trade.trade_amount(), trade.security_deposit()).unwrap();
        PayoutTerms::for_buyer_as_offerer(
            trade.trade_amount(),
            trade.security_deposit(),
            taker_contribution,
            self.offerer.wallet.address_entry(trade_id).address,
            self.taker.wallet.address_entry(trade_id).address,
        )
        .unwrap()
    }

    /// Signs `terms` with the offerer's trade key, as the offerer would.
    pub fn offerer_payout_signature(&self, trade: &Trade, terms: &PayoutTerms) -> Vec<u8> {
        let deposit_tx = trade.deposit_tx().unwrap();
        let sighash = self.offerer.wallet.payout_sighash(&deposit_tx, terms).unwrap();
        let key_pair = self.offerer.wallet.address_entry(trade.id()).key_pair;
        EcdsaSignatureService::new().sign(&key_pair, &sighash).unwrap()
    }

    pub fn fiat_transfer_started(
        trade: &Trade,
        payout_terms: PayoutTerms,
        offerer_signature: Vec<u8>,
    ) -> ProtocolMessage {
        ProtocolMessage::FiatTransferStarted {
            trade_id: trade.id(),
            offerer_signature,
            payout_terms,
        }
    }

    /// Waits until `count` confidence watches are armed for `txid`.
    pub async fn wait_for_watches(&self, txid: &Txid, count: usize) {
        let wait = async {
            while self.chain.subscriber_count(txid) < count {
                sleep(Duration::from_millis(10)).await;
            }
        };
        if timeout(WAIT, wait).await.is_err() {
            panic!("Timed out waiting for {} watches on {}", count, txid);
        }
    }
}

pub fn notif_channel(manager: &TradeManager) -> mpsc::Receiver<TradeNotif> {
    manager.subscribe_notifs()
}

/// Next notification matching `predicate`, skipping the others.
pub async fn next_notif(
    notif_rx: &mut mpsc::Receiver<TradeNotif>,
    predicate: impl Fn(&TradeNotif) -> bool,
) -> TradeNotif {
    let wait = async {
        while let Some(notif) = notif_rx.recv().await {
            if predicate(&notif) {
                return Some(notif);
            }
        }
        None
    };
    match timeout(WAIT, wait).await {
        Ok(Some(notif)) => notif,
        Ok(None) => panic!("Notification channel closed"),
        Err(_) => panic!("Timed out waiting for notification"),
    }
}
