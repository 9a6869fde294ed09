mod common;

#[cfg(test)]
mod test {
    use serde_json::{json, Value};

    use fiatswap_trading::{
        model::CLOSED_TRADE_NAMESPACE,
        notif::TradeNotif,
        persist::Persistence,
        services::TradeTxKind,
        task::FailureKind,
        taker::SellerAsTakerModel,
        testing::{wait_for_state, SomeTestParams},
        FiatSwapError, TradeState,
    };

    use super::common::{
        logger::setup as logger_setup,
        pair::{next_notif, notif_channel, TradingPair, WAIT},
    };

    #[tokio::test]
    async fn test_restore_taker_after_crash() {
        logger_setup();

        let mut pair = TradingPair::new();
        let offer = SomeTestParams::buy_offer();
        let trade_id = offer.trade_id();
        let mut taker_notif_rx = notif_channel(&pair.taker_manager);

        // The deposit notice never makes it to the offerer
        pair.transport.set_blocked("DepositTxPublished", true);
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
        match notif {
            TradeNotif::TaskFailed { reason, .. } => assert!(reason.contains("unreachable")),
            other => panic!("Expected TaskFailed, got {:?}", other),
        }
        assert_eq!(taker_trade.state(), TradeState::DepositPublished);
        assert_eq!(pair.taker.wallet.broadcast_count(TradeTxKind::Deposit), 1);
        let deposit_tx = taker_trade.deposit_tx().unwrap();

        let offerer_trade = pair.offerer_manager.pending_trade(trade_id).unwrap();
        assert_eq!(offerer_trade.state(), TradeState::Preparation);

        // Queued remainder blocks everything else until resumed
        match pair.taker_manager.on_fiat_payment_received(trade_id).await {
            Err(FiatSwapError::OutOfPhase { description, .. }) => {
                assert!(description.contains("resume first"))
            }
            other => panic!("Expected OutOfPhase, got {:?}", other),
        }

        // Crash. Pretend it hit right after the deposit broadcast, before the
        // checkpoint recorded it.
        let taker_manager = pair.restart_taker().await;
        let namespace = SellerAsTakerModel::MODEL_TYPE_NAME;
        let key = SellerAsTakerModel::persistence_key(trade_id);
        let blob = pair
            .taker
            .persistence
            .read(namespace, &key)
            .await
            .unwrap()
            .unwrap();
        let mut record: Value = serde_json::from_str(&blob).unwrap();
        assert_eq!(record["model"], json!("SellerAsTaker"));
        assert_eq!(record["pending_tasks"], json!(["SendDepositTxPublished"]));
        record["pending_tasks"] = json!(["SignAndPublishDepositTx", "SendDepositTxPublished"]);
        record["published_deposit_tx"] = Value::Null;
        pair.taker
            .persistence
            .write(namespace, &key, record.to_string())
            .await
            .unwrap();

        pair.transport.set_blocked("DepositTxPublished", false);
        let restored = taker_manager.restore().await.unwrap();
        assert_eq!(restored, vec![trade_id]);

        // Same deposit, broadcast once, now delivered
        let taker_trade = taker_manager.pending_trade(trade_id).unwrap();
        assert_eq!(taker_trade.deposit_tx(), Some(deposit_tx.clone()));
        assert_eq!(pair.taker.wallet.broadcast_count(TradeTxKind::Deposit), 1);
        assert_eq!(pair.taker.wallet.broadcast_count(TradeTxKind::TakeOfferFee), 1);
        wait_for_state(&offerer_trade, TradeState::DepositPublished, WAIT)
            .await
            .unwrap();
        assert_eq!(offerer_trade.deposit_tx(), Some(deposit_tx.clone()));

        // The restored actor watches the deposit again
        pair.chain.mine(&deposit_tx.txid);
        wait_for_state(&taker_trade, TradeState::DepositConfirmed, WAIT)
            .await
            .unwrap();
        wait_for_state(&offerer_trade, TradeState::DepositConfirmed, WAIT)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_resume_after_transport_failure() {
        logger_setup();

        let pair = TradingPair::new();
        let offer = SomeTestParams::buy_offer();
        let trade_id = offer.trade_id();
        let offerer_peer = SomeTestParams::offerer_peer();

        pair.offerer_manager.add_open_offer(offer.clone()).unwrap();
        pair.transport.set_unreachable(&offerer_peer, true);
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

        pair.transport.set_unreachable(&offerer_peer, false);
        pair.taker_manager.resume_trade(trade_id).await.unwrap();

        // The fee is not paid twice
        assert_eq!(pair.taker.wallet.broadcast_count(TradeTxKind::TakeOfferFee), 1);
        let taker_trade = pair.taker_manager.pending_trade(trade_id).unwrap();
        wait_for_state(&taker_trade, TradeState::DepositPublished, WAIT)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_restore_idle_trade_without_rerun() -> anyhow::Result<()> {
        logger_setup();

        let mut pair = TradingPair::new();
        let offer = SomeTestParams::buy_offer();
        let trade_id = offer.trade_id();

        pair.offerer_manager.add_open_offer(offer.clone())?;
        let taker_trade = pair
            .taker_manager
            .take_offer(offer.clone(), offer.amount)
            .await?;
        wait_for_state(&taker_trade, TradeState::DepositPublished, WAIT).await?;
        let offerer_trade = pair
            .offerer_manager
            .pending_trade(trade_id)
            .ok_or_else(|| anyhow::anyhow!("offerer has no trade {}", trade_id))?;
        wait_for_state(&offerer_trade, TradeState::DepositPublished, WAIT).await?;

        // Idle trade comes back in the same state, nothing re-run
        let taker_manager = pair.restart_taker().await;
        assert!(taker_manager.pending_trades().is_empty());
        let restored = taker_manager.restore().await?;
        assert_eq!(restored, vec![trade_id]);
        let restored_trade = taker_manager
            .trade(trade_id)
            .ok_or_else(|| anyhow::anyhow!("trade {} not restored", trade_id))?;
        assert_eq!(restored_trade.state(), TradeState::DepositPublished);
        assert_eq!(restored_trade.deposit_tx(), taker_trade.deposit_tx());
        assert_eq!(pair.taker.wallet.broadcast_count(TradeTxKind::Deposit), 1);
        assert_eq!(
            taker_manager.current_pending_trade().map(|trade| trade.id()),
            Some(trade_id)
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_restore_skips_undecodable_records() -> anyhow::Result<()> {
        logger_setup();

        let mut pair = TradingPair::new();
        let offer = SomeTestParams::buy_offer();
        let trade_id = offer.trade_id();

        pair.offerer_manager.add_open_offer(offer.clone())?;
        let taker_trade = pair
            .taker_manager
            .take_offer(offer.clone(), offer.amount)
            .await?;
        wait_for_state(&taker_trade, TradeState::DepositPublished, WAIT).await?;
        let contract = taker_trade
            .contract()
            .ok_or_else(|| anyhow::anyhow!("trade {} has no contract", trade_id))?;

        // Records that no longer decode sit next to the good one
        let taker_manager = pair.restart_taker().await;
        let persistence = pair.taker.persistence.clone();
        persistence
            .write(
                SellerAsTakerModel::MODEL_TYPE_NAME,
                "0000-not-a-trade",
                "{\"model\": \"SellerAsTaker\", \"trade\": 42}".to_string(),
            )
            .await?;
        persistence
            .write(CLOSED_TRADE_NAMESPACE, "0000-not-a-trade", "garbage".to_string())
            .await?;

        let restored = taker_manager.restore().await?;
        assert_eq!(restored, vec![trade_id]);
        assert_eq!(taker_manager.pending_trades().len(), 1);
        assert!(taker_manager.closed_trades().is_empty());

        // The signed contract comes back with the trade
        let restored_trade = taker_manager
            .trade(trade_id)
            .ok_or_else(|| anyhow::anyhow!("trade {} not restored", trade_id))?;
        assert_eq!(restored_trade.state(), TradeState::DepositPublished);
        assert_eq!(restored_trade.contract(), Some(contract));
        Ok(())
    }
}
