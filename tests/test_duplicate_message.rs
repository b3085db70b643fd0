mod common;

#[cfg(test)]
mod tests {
    use tempfile::TempDir;
    use uuid::Uuid;

    use tri_escrow::{
        protocol::{DepositResponse, TradeMessage, TradeMessageEnvelope},
        testing::{SomeTestOfferParams, SomeTestParams, StubChain},
        trade::State,
    };

    use super::common::harness::{wait_for_snapshot, wait_for_state, TestNet};
    use super::common::logger::setup as logger_setup;

    /// Replaying an already-applied DepositResponse must leave the trade
    /// exactly where it was: a logged warning, not an error and not a
    /// state change.
    #[tokio::test]
    async fn test_duplicate_deposit_response_is_ignored() {
        logger_setup();

        let data_root = TempDir::new().unwrap();
        let net = TestNet::start(data_root.path(), StubChain::new(1_000)).await;
        net.register_default_deposits();

        let trade_id = SomeTestOfferParams::some_uuid();
        let offer = SomeTestOfferParams::default_buy_offer();

        let taker_access = net
            .taker
            .manager
            .take_offer(offer, SomeTestOfferParams::taker_account_details())
            .await
            .unwrap();
        wait_for_state(&net.maker.manager, trade_id, State::ContractSigned).await;

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

        let before = wait_for_snapshot(&net.maker.manager, trade_id, |snapshot| {
            snapshot.maker.deposit_tx_id.is_some() && snapshot.taker.deposit_tx_id.is_some()
        })
        .await;

        // Replay the arbitrator's DepositResponse verbatim
        let replay = TradeMessageEnvelope {
            sender_pubkey: SomeTestParams::arbitrator_pubkey(),
            trade_id,
            msg_uid: Uuid::new_v4(),
            message: TradeMessage::DepositResponse(DepositResponse {
                buyer_deposit_tx_id: "maker-deposit-tx".to_string(),
                seller_deposit_tx_id: "taker-deposit-tx".to_string(),
            }),
        };
        net.inject(SomeTestParams::maker_pubkey(), replay).await;

        // Give the replay time to be (not) applied
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;

        let after = net.maker.manager.get_trade(trade_id).await.unwrap();
        assert_eq!(before.state, after.state);
        assert_eq!(before.phase, after.phase);
        assert_eq!(before.maker.deposit_tx_id, after.maker.deposit_tx_id);
        assert_eq!(before.taker.deposit_tx_id, after.taker.deposit_tx_id);
        assert!(after.error_message.is_none());
        assert!(!after.failed);

        net.shutdown().await;
    }
}
