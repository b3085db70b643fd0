mod common;

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use tri_escrow::{
        testing::{SomeTestOfferParams, StubChain},
        trade::State,
    };

    use super::common::harness::{wait_for_state, TestNet};
    use super::common::logger::setup as logger_setup;

    /// A trade that has paid fees moves to the failed set instead of
    /// vanishing, and can be recovered back into the open set while its
    /// escrow and payout addresses are still known to the wallet.
    #[tokio::test]
    async fn test_fail_then_unfail_round_trip() {
        logger_setup();

        let data_root = TempDir::new().unwrap();
        let net = TestNet::start(data_root.path(), StubChain::new(1_000)).await;
        net.register_default_deposits();

        let trade_id = SomeTestOfferParams::some_uuid();
        let offer = SomeTestOfferParams::default_buy_offer();

        net.taker
            .manager
            .take_offer(offer, SomeTestOfferParams::taker_account_details())
            .await
            .unwrap();
        wait_for_state(&net.maker.manager, trade_id, State::ContractSigned).await;

        // The maker has a reserve tx on record, so failing is not a
        // discard: the trade lands in the failed set with its error
        net.maker
            .manager
            .fail_trade(trade_id, "wallet connection lost")
            .await
            .unwrap();

        assert!(net.maker.manager.get_trades().await.is_empty());
        let failed = net.maker.manager.get_failed_trades().await;
        assert_eq!(failed.len(), 1);
        assert!(failed[0].failed);
        assert_eq!(
            failed[0].error_message.as_deref(),
            Some("wallet connection lost")
        );

        // Escrow wallet reopens and the payout address is ours: recovery
        // is allowed and the trade is open again
        net.maker.manager.unfail_trade(trade_id).await.unwrap();
        assert!(net.maker.manager.get_failed_trades().await.is_empty());
        let recovered = net.maker.manager.get_trade(trade_id).await.unwrap();
        assert!(!recovered.failed);
        assert_eq!(recovered.state, State::ContractSigned);

        net.shutdown().await;
    }

    /// A trade failing before any fee is paid is discarded outright, its
    /// offer reservation unwound.
    #[tokio::test]
    async fn test_early_failure_is_discarded() {
        logger_setup();

        let data_root = TempDir::new().unwrap();
        let net = TestNet::start(data_root.path(), StubChain::new(1_000)).await;
        net.register_default_deposits();

        let trade_id = SomeTestOfferParams::some_uuid();
        let offer = SomeTestOfferParams::default_buy_offer();

        // Taker with no reserve tx: nothing paid yet on this side
        let mut taker_account = SomeTestOfferParams::taker_account_details();
        taker_account.reserve_tx_id = None;
        taker_account.reserve_tx_key_images = Vec::new();

        net.taker
            .manager
            .take_offer(offer, taker_account)
            .await
            .unwrap();
        wait_for_state(&net.taker.manager, trade_id, State::ContractSigned).await;

        net.taker
            .manager
            .fail_trade(trade_id, "taker gave up")
            .await
            .unwrap();

        // Discarded, not failed: no trace in either collection
        assert!(net.taker.manager.get_trades().await.is_empty());
        assert!(net.taker.manager.get_failed_trades().await.is_empty());
        assert!(net.taker.manager.get_trade(trade_id).await.is_none());

        net.shutdown().await;
    }
}
