mod common;

#[cfg(test)]
mod test {
    use bitcoin::{hashes::Hash, Amount, Txid};
    use uuid::Uuid;

    use fiatswap_trading::{
        common::TxConfidence,
        message::ProtocolMessage,
        model::CLOSED_TRADE_NAMESPACE,
        notif::TradeNotif,
        persist::{MemoryPersistence, Persistence},
        services::{PayoutTerms, TradeTxKind},
        task::FailureKind,
        taker::SellerAsTakerModel,
        testing::{wait_for_state, SomeTestParams, TestChain, TestNode, TestTransport},
        FiatSwapError, Trade, TradeState,
    };

    use super::common::{
        logger::setup as logger_setup,
        pair::{next_notif, notif_channel, TradingPair, WAIT},
    };

    #[tokio::test]
    async fn test_unregistered_offerer_fails_taker() {
        logger_setup();

        let pair = TradingPair::new();
        let offer = SomeTestParams::buy_offer();
        let trade_id = offer.trade_id();
        let mut taker_notif_rx = notif_channel(&pair.taker_manager);
        pair.taker
            .block_chain
            .reject_registration(SomeTestParams::offerer_identity().account_id);

        pair.offerer_manager.add_open_offer(offer.clone()).unwrap();
        let taker_trade = pair
            .taker_manager
            .take_offer(offer.clone(), offer.amount)
            .await
            .unwrap();

        let notif = next_notif(&mut taker_notif_rx, |notif| {
            matches!(notif, TradeNotif::TaskFailed { .. })
        })
        .await;
        assert_eq!(
            notif,
            TradeNotif::TaskFailed {
                trade_id,
                reason: "Account registration validation for peer faultHandler.onFault."
                    .to_string()
            }
        );
        wait_for_state(&taker_trade, TradeState::Failed, WAIT)
            .await
            .unwrap();
        assert_eq!(
            taker_trade.failure_reason().as_deref(),
            Some("Account registration validation for peer faultHandler.onFault.")
        );

        // Nothing after the verification ran
        assert!(taker_trade.deposit_tx().is_none());
        assert_eq!(pair.taker.wallet.broadcast_count(TradeTxKind::Deposit), 0);
        assert_eq!(pair.transport.sent_count("DepositTxPublished"), 0);

        // No funds were locked, so the trade can be closed
        pair.taker_manager.close_trade(trade_id).await.unwrap();
        assert!(pair.taker_manager.pending_trades().is_empty());
        assert_eq!(pair.taker_manager.closed_trades().len(), 1);
    }

    #[tokio::test]
    async fn test_black_listed_taker_fails_offerer() {
        logger_setup();

        let pair = TradingPair::new();
        let offer = SomeTestParams::buy_offer();
        let trade_id = offer.trade_id();
        pair.offerer
            .block_chain
            .black_list(SomeTestParams::taker_identity().account_id);

        pair.offerer_manager.add_open_offer(offer.clone()).unwrap();
        let taker_trade = pair
            .taker_manager
            .take_offer(offer.clone(), offer.amount)
            .await
            .unwrap();
        wait_for_state(&taker_trade, TradeState::DepositPublished, WAIT)
            .await
            .unwrap();

        let offerer_trade = pair.offerer_manager.pending_trade(trade_id).unwrap();
        wait_for_state(&offerer_trade, TradeState::Failed, WAIT)
            .await
            .unwrap();
        assert_eq!(
            offerer_trade.failure_reason().as_deref(),
            Some("Taker is blacklisted.")
        );
        assert!(offerer_trade.deposit_tx().is_none());
    }

    #[tokio::test]
    async fn test_cancel_before_deposit() {
        logger_setup();

        let pair = TradingPair::new();
        let offer = SomeTestParams::buy_offer();
        let trade_id = offer.trade_id();
        pair.transport
            .set_unreachable(&SomeTestParams::offerer_peer(), true);

        // Fee is paid, the request never arrives
        match pair
            .taker_manager
            .take_offer(offer.clone(), offer.amount)
            .await
        {
            Err(FiatSwapError::TaskFailed { kind, .. }) => {
                assert_eq!(kind, FailureKind::Transport)
            }
            other => panic!("Expected TaskFailed, got {:?}", other),
        }
        let taker_trade = pair.taker_manager.pending_trade(trade_id).unwrap();
        assert_eq!(taker_trade.state(), TradeState::TakeOfferFeePaid);

        let model_key = SellerAsTakerModel::persistence_key(trade_id);
        assert!(pair
            .taker
            .persistence
            .read(SellerAsTakerModel::MODEL_TYPE_NAME, &model_key)
            .await
            .unwrap()
            .is_some());

        pair.taker_manager.cancel_trade(trade_id).await.unwrap();
        assert_eq!(taker_trade.state(), TradeState::Failed);
        assert_eq!(
            taker_trade.failure_reason().as_deref(),
            Some("Trade cancelled by user")
        );
        assert!(pair
            .taker
            .persistence
            .read(SellerAsTakerModel::MODEL_TYPE_NAME, &model_key)
            .await
            .unwrap()
            .is_none());
        assert!(pair
            .taker
            .persistence
            .keys(SellerAsTakerModel::MODEL_TYPE_NAME)
            .await
            .unwrap()
            .is_empty());
        assert!(pair
            .taker
            .persistence
            .read(CLOSED_TRADE_NAMESPACE, &trade_id.to_string())
            .await
            .unwrap()
            .is_some());
        assert!(pair.taker_manager.pending_trades().is_empty());
        assert!(pair.taker_manager.current_pending_trade().is_none());
    }

    #[tokio::test]
    async fn test_cancel_after_deposit_confirmed_rejected() {
        logger_setup();

        let pair = TradingPair::new();
        let offer = SomeTestParams::buy_offer();
        let trade_id = offer.trade_id();

        pair.offerer_manager.add_open_offer(offer.clone()).unwrap();
        let taker_trade = pair
            .taker_manager
            .take_offer(offer.clone(), offer.amount)
            .await
            .unwrap();
        wait_for_state(&taker_trade, TradeState::DepositPublished, WAIT)
            .await
            .unwrap();
        pair.chain.mine(&taker_trade.deposit_tx().unwrap().txid);
        wait_for_state(&taker_trade, TradeState::DepositConfirmed, WAIT)
            .await
            .unwrap();

        match pair.taker_manager.cancel_trade(trade_id).await {
            Err(FiatSwapError::OutOfPhase { .. }) => {}
            other => panic!("Expected OutOfPhase, got {:?}", other),
        }
        match pair.taker_manager.close_trade(trade_id).await {
            Err(FiatSwapError::OutOfPhase { .. }) => {}
            other => panic!("Expected OutOfPhase, got {:?}", other),
        }
        assert_eq!(taker_trade.state(), TradeState::DepositConfirmed);
        assert!(pair.taker_manager.pending_trade(trade_id).is_some());
    }

    #[tokio::test]
    async fn test_message_for_unknown_trade() {
        logger_setup();

        let pair = TradingPair::new();
        let offer = SomeTestParams::buy_offer();
        let message = ProtocolMessage::FiatTransferStarted {
            trade_id: offer.trade_id(),
            offerer_signature: vec![0; 70],
            payout_terms: PayoutTerms {
                offerer_amount: Amount::from_sat(1_100_000),
                taker_amount: Amount::from_sat(100_000),
                offerer_address: "offerer".to_string(),
                taker_address: "taker".to_string(),
            },
        };

        match pair.taker_manager.handle_message(message).await {
            Err(FiatSwapError::UnknownTrade { trade_id }) => {
                assert_eq!(trade_id, offer.trade_id())
            }
            other => panic!("Expected UnknownTrade, got {:?}", other),
        }
        match pair.offerer_manager.on_fiat_payment_started(offer.trade_id()).await {
            Err(FiatSwapError::UnknownTrade { trade_id }) => {
                assert_eq!(trade_id, offer.trade_id())
            }
            other => panic!("Expected UnknownTrade, got {:?}", other),
        }
        assert!(pair.taker_manager.pending_trades().is_empty());
    }

    /// Takes the offer and waits until the taker's deposit is published.
    async fn deposit_published(pair: &TradingPair) -> Trade {
        let offer = SomeTestParams::buy_offer();
        pair.offerer_manager.add_open_offer(offer.clone()).unwrap();
        let taker_trade = pair
            .taker_manager
            .take_offer(offer.clone(), offer.amount)
            .await
            .unwrap();
        wait_for_state(&taker_trade, TradeState::DepositPublished, WAIT)
            .await
            .unwrap();
        taker_trade
    }

    async fn deposit_confirmed(pair: &TradingPair) -> Trade {
        let taker_trade = deposit_published(pair).await;
        pair.chain.mine(&taker_trade.deposit_tx().unwrap().txid);
        wait_for_state(&taker_trade, TradeState::DepositConfirmed, WAIT)
            .await
            .unwrap();
        taker_trade
    }

    #[tokio::test]
    async fn test_fiat_transfer_before_deposit_confirmed_rejected() {
        logger_setup();

        let pair = TradingPair::new();
        let taker_trade = deposit_published(&pair).await;
        let terms = pair.payout_terms(&taker_trade);
        let signature = pair.offerer_payout_signature(&taker_trade, &terms);
        let message = TradingPair::fiat_transfer_started(&taker_trade, terms, signature);

        match pair.taker_manager.handle_message(message).await {
            Err(FiatSwapError::OutOfPhase { trade_id, .. }) => {
                assert_eq!(trade_id, taker_trade.id())
            }
            other => panic!("Expected OutOfPhase, got {:?}", other),
        }
        assert_eq!(taker_trade.state(), TradeState::DepositPublished);
        assert!(taker_trade.failure_reason().is_none());

        // Still accepted once the deposit confirms
        pair.chain.mine(&taker_trade.deposit_tx().unwrap().txid);
        wait_for_state(&taker_trade, TradeState::DepositConfirmed, WAIT)
            .await
            .unwrap();
        let terms = pair.payout_terms(&taker_trade);
        let signature = pair.offerer_payout_signature(&taker_trade, &terms);
        let message = TradingPair::fiat_transfer_started(&taker_trade, terms, signature);
        pair.taker_manager.handle_message(message).await.unwrap();
        assert_eq!(taker_trade.state(), TradeState::FiatPaymentStarted);
    }

    #[tokio::test]
    async fn test_mismatched_payout_terms_fail_taker() {
        logger_setup();

        let pair = TradingPair::new();
        let trade_id = SomeTestParams::buy_offer().trade_id();
        let mut taker_notif_rx = notif_channel(&pair.taker_manager);
        let taker_trade = deposit_confirmed(&pair).await;

        let mut terms = pair.payout_terms(&taker_trade);
        terms.offerer_amount = terms.offerer_amount + Amount::from_sat(1);
        let signature = pair.offerer_payout_signature(&taker_trade, &terms);
        let message = TradingPair::fiat_transfer_started(&taker_trade, terms, signature);

        // The message was accepted, its verification failed the trade
        pair.taker_manager.handle_message(message).await.unwrap();
        let notif = next_notif(&mut taker_notif_rx, |notif| {
            matches!(notif, TradeNotif::TaskFailed { .. })
        })
        .await;
        assert_eq!(
            notif,
            TradeNotif::TaskFailed {
                trade_id,
                reason: "Payout terms do not match the locked deposit.".to_string()
            }
        );
        assert_eq!(taker_trade.state(), TradeState::Failed);
        assert_eq!(
            taker_trade.failure_reason().as_deref(),
            Some("Payout terms do not match the locked deposit.")
        );
        assert_eq!(pair.taker.wallet.broadcast_count(TradeTxKind::Payout), 0);
    }

    #[tokio::test]
    async fn test_invalid_payout_signature_fails_taker() {
        logger_setup();

        let pair = TradingPair::new();
        let taker_trade = deposit_confirmed(&pair).await;

        // Terms are honest, the signature covers something else
        let terms = pair.payout_terms(&taker_trade);
        let mut other_terms = terms.clone();
        other_terms.taker_amount = Amount::ZERO;
        let signature = pair.offerer_payout_signature(&taker_trade, &other_terms);
        let message = TradingPair::fiat_transfer_started(&taker_trade, terms, signature);
        pair.taker_manager.handle_message(message).await.unwrap();
        assert_eq!(taker_trade.state(), TradeState::FiatPaymentStarted);

        match pair
            .taker_manager
            .on_fiat_payment_received(taker_trade.id())
            .await
        {
            Err(FiatSwapError::TaskFailed { kind, reason, .. }) => {
                assert_eq!(kind, FailureKind::Verification);
                assert_eq!(reason, "Offerer payout signature is invalid.");
            }
            other => panic!("Expected TaskFailed, got {:?}", other),
        }
        assert_eq!(taker_trade.state(), TradeState::Failed);
        assert!(taker_trade.payout_tx().is_none());
        assert_eq!(pair.taker.wallet.broadcast_count(TradeTxKind::Payout), 0);
        assert_eq!(pair.transport.sent_count("PayoutTxPublished"), 0);
    }

    #[tokio::test]
    async fn test_deposit_confirmed_announced_once() {
        logger_setup();

        let pair = TradingPair::new();
        let trade_id = SomeTestParams::buy_offer().trade_id();
        let mut taker_notif_rx = notif_channel(&pair.taker_manager);
        let taker_trade = deposit_published(&pair).await;
        let txid = taker_trade.deposit_tx().unwrap().txid;
        pair.wait_for_watches(&txid, 2).await;

        for depth in 1..=3 {
            pair.chain
                .set_confidence(&txid, TxConfidence::Building { depth });
        }
        let offerer_trade = pair.offerer_manager.pending_trade(trade_id).unwrap();
        wait_for_state(&offerer_trade, TradeState::DepositConfirmed, WAIT)
            .await
            .unwrap();
        // The taker sees Building again when the transfer notice arrives
        pair.offerer_manager
            .on_fiat_payment_started(trade_id)
            .await
            .unwrap();

        let mut confirmed = 0;
        loop {
            let notif = next_notif(&mut taker_notif_rx, |notif| {
                matches!(notif, TradeNotif::StateChanged { .. })
            })
            .await;
            match notif {
                TradeNotif::StateChanged {
                    state: TradeState::DepositConfirmed,
                    ..
                } => confirmed += 1,
                TradeNotif::StateChanged {
                    state: TradeState::FiatPaymentStarted,
                    ..
                } => break,
                _ => {}
            }
        }
        assert_eq!(confirmed, 1);
        assert_eq!(taker_trade.state(), TradeState::FiatPaymentStarted);
    }

    #[tokio::test]
    async fn test_confirmation_seen_on_message_is_announced() {
        logger_setup();

        let pair = TradingPair::new();
        let trade_id = SomeTestParams::buy_offer().trade_id();
        let mut taker_notif_rx = notif_channel(&pair.taker_manager);
        let taker_trade = deposit_published(&pair).await;
        let txid = taker_trade.deposit_tx().unwrap().txid;
        pair.wait_for_watches(&txid, 2).await;

        // No watch hears of the block, the transfer notice is the first to
        // observe it
        pair.chain
            .set_confidence_unannounced(&txid, TxConfidence::Building { depth: 1 });
        let terms = pair.payout_terms(&taker_trade);
        let signature = pair.offerer_payout_signature(&taker_trade, &terms);
        let message = TradingPair::fiat_transfer_started(&taker_trade, terms, signature);
        pair.taker_manager.handle_message(message).await.unwrap();

        let notif = next_notif(&mut taker_notif_rx, |notif| {
            matches!(
                notif,
                TradeNotif::StateChanged {
                    state: TradeState::DepositConfirmed | TradeState::FiatPaymentStarted,
                    ..
                }
            )
        })
        .await;
        assert_eq!(
            notif,
            TradeNotif::StateChanged {
                trade_id,
                state: TradeState::DepositConfirmed
            }
        );
        let notif = next_notif(&mut taker_notif_rx, |notif| {
            matches!(notif, TradeNotif::StateChanged { .. })
        })
        .await;
        assert_eq!(
            notif,
            TradeNotif::StateChanged {
                trade_id,
                state: TradeState::FiatPaymentStarted
            }
        );
    }

    fn request_take_offer(taker_account_id: &str, take_offer_fee_txid: Txid) -> ProtocolMessage {
        let offer = SomeTestParams::buy_offer();
        let taker = SomeTestParams::taker_identity();
        let taker_pub_key = SomeTestParams::message_pub_key(&SomeTestParams::taker_secret_key());
        ProtocolMessage::RequestTakeOffer {
            trade_id: offer.trade_id(),
            trade_amount: offer.amount,
            take_offer_fee_txid,
            taker_account_id: taker_account_id.to_string(),
            taker_pub_key,
            taker_message_pub_key: taker.message_pub_key,
            taker_fiat_account: taker.fiat_accounts[0].clone(),
            taker_peer: SomeTestParams::taker_peer(),
        }
    }

    #[tokio::test]
    async fn test_concurrent_take_requests_open_one_trade() {
        logger_setup();

        let data_dir = std::env::temp_dir().join(Uuid::new_v4().to_string());
        let chain = TestChain::new();
        let transport = TestTransport::new();
        let offerer = TestNode::offerer_on_disk(chain.clone(), transport.clone(), &data_dir);
        let offerer_manager = offerer.manager();
        let taker = TestNode::taker_on(chain.clone(), transport.clone(), MemoryPersistence::new());
        transport.connect(SomeTestParams::taker_peer(), taker.manager());

        let offer = SomeTestParams::buy_offer();
        offerer_manager.add_open_offer(offer.clone()).unwrap();
        let first_fee_txid = Txid::from_byte_array([3; 32]);
        let second_fee_txid = Txid::from_byte_array([4; 32]);
        chain.set_confidence(&first_fee_txid, TxConfidence::Pending);
        chain.set_confidence(&second_fee_txid, TxConfidence::Pending);

        let (first, second) = tokio::join!(
            offerer_manager.handle_message(request_take_offer("taker-account", first_fee_txid)),
            offerer_manager.handle_message(request_take_offer("other-account", second_fee_txid)),
        );
        let results = [first, second];
        assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 1);
        assert_eq!(offerer_manager.pending_trades().len(), 1);
        assert!(offerer_manager.open_offers().is_empty());
        assert_eq!(transport.sent_count("RespondToTakeOfferRequest"), 1);

        let offerer_trade = offerer_manager.pending_trade(offer.trade_id()).unwrap();
        assert_eq!(offerer_trade.state(), TradeState::Preparation);
        assert!(offerer_trade.contract().is_some());

        offerer_manager.shutdown().await.unwrap();
        let _ = std::fs::remove_dir_all(&data_dir);
    }
}
