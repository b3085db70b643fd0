mod common;

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use tri_escrow::{
        testing::{SomeTestOfferParams, StubChain},
        trade::{Phase, State},
    };

    use super::common::harness::{wait_for_phase, wait_for_state, TestNet};
    use super::common::logger::setup as logger_setup;

    #[tokio::test]
    async fn test_happy_path_to_withdrawn() {
        logger_setup();

        let data_root = TempDir::new().unwrap();
        let net = TestNet::start(data_root.path(), StubChain::new(1_000)).await;
        net.register_default_deposits();

        let trade_id = SomeTestOfferParams::some_uuid();
        let offer = SomeTestOfferParams::default_buy_offer();

        // Take the offer: taker creates its trade locally, then the init
        // request fans out through arbitrator and maker
        let taker_access = net
            .taker
            .manager
            .take_offer(offer, SomeTestOfferParams::taker_account_details())
            .await
            .unwrap();

        // All three participants converge on a signed contract
        let maker_snapshot =
            wait_for_state(&net.maker.manager, trade_id, State::ContractSigned).await;
        let taker_snapshot =
            wait_for_state(&net.taker.manager, trade_id, State::ContractSigned).await;
        assert_eq!(maker_snapshot.contract_hash, taker_snapshot.contract_hash);
        assert!(maker_snapshot.contract_hash.is_some());

        // Offer got reserved on the maker side
        assert!(net.maker.offer_book.is_reserved(trade_id));

        // Both traders fund the escrow through the arbitrator
        let maker_access = net
            .maker
            .manager
            .get_trade_accessor(trade_id)
            .await
            .unwrap();
        maker_access
            .send_deposit("maker-deposit-tx".to_string(), "maker-deposit-hex".to_string())
            .await
            .unwrap();
        taker_access
            .send_deposit("taker-deposit-tx".to_string(), "taker-deposit-hex".to_string())
            .await
            .unwrap();

        // Arbitrator publishes both deposits and both traders learn the ids
        wait_for_snapshot_deposits(&net, trade_id).await;

        // Confirmation plus the unlock window
        net.advance_blocks(3).await;
        wait_for_phase(&net.maker.manager, trade_id, Phase::DepositsUnlocked).await;
        wait_for_phase(&net.taker.manager, trade_id, Phase::DepositsUnlocked).await;

        // Buyer (maker of this buy offer) pays fiat and says so
        maker_access.confirm_payment_sent().await.unwrap();
        wait_for_state(
            &net.taker.manager,
            trade_id,
            State::SellerReceivedPaymentSentMsg,
        )
        .await;

        // Seller confirms receipt; payout is built, verified and published
        taker_access.confirm_payment_received().await.unwrap();
        let maker_snapshot =
            wait_for_phase(&net.maker.manager, trade_id, Phase::PayoutPublished).await;
        let taker_snapshot =
            wait_for_phase(&net.taker.manager, trade_id, Phase::PayoutPublished).await;

        assert!(maker_snapshot.payout_tx_id.is_some());
        assert_eq!(maker_snapshot.payout_tx_id, taker_snapshot.payout_tx_id);
        assert!(maker_snapshot.is_payout_published);
        assert!(!maker_snapshot.is_funds_locked_in);

        // The payout actually hit the chain
        let submitted = net.chain.submitted_tx_ids();
        assert!(submitted.contains(maker_snapshot.payout_tx_id.as_ref().unwrap()));

        // Completion retires the trade into the closed set
        net.maker
            .manager
            .on_trade_completed(trade_id)
            .await
            .unwrap();
        assert!(net.maker.manager.get_trade(trade_id).await.is_some());
        assert_eq!(net.maker.manager.get_closed_trades().await.len(), 1);
        assert!(net.maker.manager.get_trades().await.is_empty());

        let closed = net.maker.manager.get_closed_trades().await;
        assert_eq!(closed[0].state, State::WithdrawCompleted);
        assert!(closed[0].is_completed);

        net.shutdown().await;
    }

    async fn wait_for_snapshot_deposits(net: &TestNet, trade_id: uuid::Uuid) {
        super::common::harness::wait_for_snapshot(&net.maker.manager, trade_id, |snapshot| {
            snapshot.maker.deposit_tx_id.is_some() && snapshot.taker.deposit_tx_id.is_some()
        })
        .await;
        super::common::harness::wait_for_snapshot(&net.taker.manager, trade_id, |snapshot| {
            snapshot.maker.deposit_tx_id.is_some() && snapshot.taker.deposit_tx_id.is_some()
        })
        .await;
    }
}
