mod common;

#[cfg(test)]
mod test {
    use fiatswap_trading::{
        common::FeePolicy,
        model::CLOSED_TRADE_NAMESPACE,
        notif::TradeNotif,
        offerer::BuyerAsOffererModel,
        persist::Persistence,
        services::{TradeTxKind, WalletService},
        testing::{wait_for_state, SomeTestParams},
        FiatSwapError, TradeState,
    };

    use super::common::{
        logger::setup as logger_setup,
        pair::{next_notif, notif_channel, TradingPair, WAIT},
    };

    #[tokio::test]
    async fn test_buy_offer() {
        logger_setup();

        let pair = TradingPair::new();
        let offer = SomeTestParams::buy_offer();
        let trade_id = offer.trade_id();
        let mut taker_notif_rx = notif_channel(&pair.taker_manager);

        // Offerer - Open the offer
        pair.offerer_manager.add_open_offer(offer.clone()).unwrap();

        // Taker - Check availability, then take the whole amount
        pair.taker_manager
            .request_offer_availability(&offer)
            .await
            .unwrap();
        let notif = next_notif(&mut taker_notif_rx, |notif| {
            matches!(notif, TradeNotif::OfferAvailability { .. })
        })
        .await;
        assert_eq!(
            notif,
            TradeNotif::OfferAvailability {
                offer_id: offer.id,
                is_available: true
            }
        );

        let taker_trade = pair
            .taker_manager
            .take_offer(offer.clone(), offer.amount)
            .await
            .unwrap();
        assert_eq!(pair.taker.wallet.broadcast_count(TradeTxKind::TakeOfferFee), 1);

        // Both sides see the deposit
        wait_for_state(&taker_trade, TradeState::DepositPublished, WAIT)
            .await
            .unwrap();
        let offerer_trade = pair.offerer_manager.pending_trade(trade_id).unwrap();
        wait_for_state(&offerer_trade, TradeState::DepositPublished, WAIT)
            .await
            .unwrap();
        assert!(pair.offerer_manager.open_offers().is_empty());
        let deposit_tx = taker_trade.deposit_tx().unwrap();
        assert_eq!(offerer_trade.deposit_tx(), Some(deposit_tx.clone()));

        // Offerer - Fiat cannot start before the deposit confirms
        match pair.offerer_manager.on_fiat_payment_started(trade_id).await {
            Err(FiatSwapError::OutOfPhase { .. }) => {}
            other => panic!("Expected OutOfPhase, got {:?}", other),
        }

        pair.chain.mine(&deposit_tx.txid);
        wait_for_state(&offerer_trade, TradeState::DepositConfirmed, WAIT)
            .await
            .unwrap();
        wait_for_state(&taker_trade, TradeState::DepositConfirmed, WAIT)
            .await
            .unwrap();

        // Offerer - Fiat payment started, once
        pair.offerer_manager
            .on_fiat_payment_started(trade_id)
            .await
            .unwrap();
        assert_eq!(offerer_trade.state(), TradeState::FiatPaymentStarted);
        match pair.offerer_manager.on_fiat_payment_started(trade_id).await {
            Err(FiatSwapError::OutOfPhase { .. }) => {}
            other => panic!("Expected OutOfPhase, got {:?}", other),
        }
        assert_eq!(pair.transport.sent_count("FiatTransferStarted"), 1);

        // Taker - Fiat received, payout goes out
        wait_for_state(&taker_trade, TradeState::FiatPaymentStarted, WAIT)
            .await
            .unwrap();
        pair.taker_manager
            .on_fiat_payment_received(trade_id)
            .await
            .unwrap();
        assert_eq!(taker_trade.state(), TradeState::PayoutTxPublished);
        wait_for_state(&offerer_trade, TradeState::PayoutTxPublished, WAIT)
            .await
            .unwrap();
        let payout_tx = taker_trade.payout_tx().unwrap();
        assert_eq!(offerer_trade.payout_tx(), Some(payout_tx.clone()));

        pair.chain.mine(&payout_tx.txid);
        wait_for_state(&offerer_trade, TradeState::Completed, WAIT)
            .await
            .unwrap();
        wait_for_state(&taker_trade, TradeState::Completed, WAIT)
            .await
            .unwrap();
        assert_eq!(pair.taker.wallet.broadcast_count(TradeTxKind::Deposit), 1);
        assert_eq!(pair.taker.wallet.broadcast_count(TradeTxKind::Payout), 1);

        // Buyer gets the bitcoin plus its deposit, seller its deposit back
        assert_eq!(
            pair.offerer_manager.amount_to_withdraw(trade_id),
            offer.amount + offer.security_deposit
        );
        assert_eq!(
            pair.taker_manager.amount_to_withdraw(trade_id),
            offer.security_deposit
        );

        // Offerer - Withdraw and close
        let to_address = pair.offerer.wallet.registration_address_entry().address;
        pair.offerer_manager
            .withdraw(trade_id, &to_address)
            .await
            .unwrap();
        assert_eq!(
            pair.chain.balance(&to_address),
            offer.amount + offer.security_deposit - FeePolicy::TX_FEE
        );
        assert_eq!(pair.offerer_manager.amount_to_withdraw(trade_id), bitcoin::Amount::ZERO);
        assert!(pair.offerer_manager.pending_trade(trade_id).is_none());
        assert_eq!(pair.offerer_manager.closed_trades().len(), 1);
        assert_eq!(
            pair.offerer_manager.trade(trade_id).unwrap().state(),
            TradeState::Completed
        );

        let model_key = BuyerAsOffererModel::persistence_key(trade_id);
        assert!(pair
            .offerer
            .persistence
            .read(BuyerAsOffererModel::MODEL_TYPE_NAME, &model_key)
            .await
            .unwrap()
            .is_none());
        assert!(pair
            .offerer
            .persistence
            .read(CLOSED_TRADE_NAMESPACE, &trade_id.to_string())
            .await
            .unwrap()
            .is_some());

        match pair.offerer_manager.withdraw(trade_id, &to_address).await {
            Err(FiatSwapError::UnknownTrade { .. }) => {}
            other => panic!("Expected UnknownTrade, got {:?}", other),
        }

        pair.offerer_manager.shutdown().await.unwrap();
        pair.taker_manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_take_offer_outside_amount_range() {
        logger_setup();

        let pair = TradingPair::new();
        let offer = SomeTestParams::buy_offer();
        pair.offerer_manager.add_open_offer(offer.clone()).unwrap();

        let too_small = offer.min_amount - bitcoin::Amount::from_sat(1);
        assert!(pair
            .taker_manager
            .take_offer(offer.clone(), too_small)
            .await
            .is_err());
        assert!(pair.taker_manager.pending_trades().is_empty());
        assert_eq!(pair.taker.wallet.broadcast_count(TradeTxKind::TakeOfferFee), 0);
    }

    #[tokio::test]
    async fn test_unlisted_offer_reported_unavailable() {
        logger_setup();

        let pair = TradingPair::new();
        let offer = SomeTestParams::buy_offer();
        let mut taker_notif_rx = notif_channel(&pair.taker_manager);

        pair.taker_manager
            .request_offer_availability(&offer)
            .await
            .unwrap();
        let notif = next_notif(&mut taker_notif_rx, |notif| {
            matches!(notif, TradeNotif::OfferAvailability { .. })
        })
        .await;
        assert_eq!(
            notif,
            TradeNotif::OfferAvailability {
                offer_id: offer.id,
                is_available: false
            }
        );
    }
}
