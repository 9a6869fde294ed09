use bitcoin::Txid;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::{
    common::{TradeId, TxConfidence},
    services::WalletService,
};

/// One-shot view of a transaction's confidence. `building()` consumes the
/// watch, so the subscription resolves at most once and is dropped afterwards.
pub struct ConfidenceWatch {
    trade_id: TradeId,
    txid: Txid,
    min_depth: u32,
    current: Option<TxConfidence>,
    rx: mpsc::Receiver<TxConfidence>,
}

impl ConfidenceWatch {
    pub fn subscribe(
        wallet: &dyn WalletService,
        trade_id: TradeId,
        txid: Txid,
        min_depth: u32,
    ) -> Self {
        // Subscribe before sampling so an update in between is not lost.
        let rx = wallet.subscribe_tx_confidence(&txid);
        let current = wallet.confidence_for_txid(&txid);
        Self {
            trade_id,
            txid,
            min_depth: min_depth.max(1),
            current,
            rx,
        }
    }

    fn is_deep_enough(&self, confidence: &TxConfidence) -> bool {
        match confidence {
            TxConfidence::Building { depth } => *depth >= self.min_depth,
            _ => false,
        }
    }

    /// Resolves with the depth once the transaction builds on the chain, or
    /// `None` if the subscription ends or the transaction dies first.
    pub async fn building(mut self) -> Option<u32> {
        if let Some(confidence) = self.current.take() {
            if let Some(depth) = self.check(confidence) {
                return depth;
            }
        }

        while let Some(confidence) = self.rx.recv().await {
            if let Some(depth) = self.check(confidence) {
                return depth;
            }
        }
        debug!(
            "Trade w/ TradeID {} confidence subscription for {} closed",
            self.trade_id, self.txid
        );
        None
    }

    fn check(&self, confidence: TxConfidence) -> Option<Option<u32>> {
        trace!(
            "Trade w/ TradeID {} tx {} confidence {:?}",
            self.trade_id,
            self.txid,
            confidence
        );
        match confidence {
            TxConfidence::Building { depth } if self.is_deep_enough(&confidence) => {
                Some(Some(depth))
            }
            TxConfidence::Dead => {
                warn!(
                    "Trade w/ TradeID {} tx {} is dead",
                    self.trade_id, self.txid
                );
                Some(None)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::hashes::Hash;

    use crate::testing::{SomeTestParams, TestWallet};

    use super::*;

    #[tokio::test]
    async fn test_resolves_once_on_building() {
        let wallet = TestWallet::new(SomeTestParams::taker_secret_key());
        let txid = Txid::from_byte_array([7; 32]);
        let trade_id = SomeTestParams::buy_offer().trade_id();

        let watch = ConfidenceWatch::subscribe(&wallet, trade_id, txid, 1);
        wallet.set_confidence(&txid, TxConfidence::Pending);
        wallet.set_confidence(&txid, TxConfidence::Building { depth: 1 });
        wallet.set_confidence(&txid, TxConfidence::Building { depth: 2 });

        assert_eq!(watch.building().await, Some(1));
        // The consumed watch dropped its receiver.
        assert_eq!(wallet.confidence_subscriber_count(&txid), 0);
    }

    #[tokio::test]
    async fn test_already_building_resolves_immediately() {
        let wallet = TestWallet::new(SomeTestParams::taker_secret_key());
        let txid = Txid::from_byte_array([8; 32]);
        let trade_id = SomeTestParams::buy_offer().trade_id();
        wallet.set_confidence(&txid, TxConfidence::Building { depth: 3 });

        let watch = ConfidenceWatch::subscribe(&wallet, trade_id, txid, 2);
        assert_eq!(watch.building().await, Some(3));
    }

    #[tokio::test]
    async fn test_dead_tx_resolves_none() {
        let wallet = TestWallet::new(SomeTestParams::taker_secret_key());
        let txid = Txid::from_byte_array([9; 32]);
        let trade_id = SomeTestParams::buy_offer().trade_id();

        let watch = ConfidenceWatch::subscribe(&wallet, trade_id, txid, 1);
        wallet.set_confidence(&txid, TxConfidence::Dead);
        assert_eq!(watch.building().await, None);
    }
}
