mod common;

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use tri_escrow::{
        testing::{SomeTestOfferParams, StubChain},
        trade::{Phase, State},
    };

    use super::common::harness::{wait_for_phase, wait_for_snapshot, wait_for_state, TestNet};
    use super::common::logger::setup as logger_setup;

    /// An open trade persisted mid-deposit survives a restart: the reload
    /// reconstructs the same predicates without replaying messages, and
    /// the deposit watcher re-arms so subsequent blocks advance it.
    #[tokio::test]
    async fn test_restart_rearms_deposit_watcher() {
        logger_setup();

        let data_root = TempDir::new().unwrap();
        let chain = StubChain::new(1_000);

        // First run: up to deposits requested and ids known everywhere
        {
            let net = TestNet::start(data_root.path(), chain.clone()).await;
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
                .send_deposit(
                    "maker-deposit-tx".to_string(),
                    "maker-deposit-hex".to_string(),
                )
                .await
                .unwrap();
            taker_access
                .send_deposit(
                    "taker-deposit-tx".to_string(),
                    "taker-deposit-hex".to_string(),
                )
                .await
                .unwrap();

            let snapshot = wait_for_snapshot(&net.maker.manager, trade_id, |snapshot| {
                snapshot.maker.deposit_tx_id.is_some() && snapshot.taker.deposit_tx_id.is_some()
            })
            .await;
            assert_eq!(snapshot.phase, Phase::DepositRequested);

            // Persist-and-crash: everything torn down mid-flight
            net.shutdown().await;
        }

        // Second run from the same data dirs and chain
        {
            let net = TestNet::start(data_root.path(), chain.clone()).await;
            let trade_id = SomeTestOfferParams::some_uuid();

            // Reload reproduced the same derived state without replay
            let restored = net.maker.manager.get_trade(trade_id).await.unwrap();
            assert_eq!(restored.phase, Phase::DepositRequested);
            assert!(!restored.is_funds_locked_in);
            assert!(restored.maker.deposit_tx_id.is_some());
            assert!(restored.taker.deposit_tx_id.is_some());
            assert!(restored.contract_hash.is_some());

            // New blocks drive the re-armed watcher through confirmation
            // and unlock
            net.advance_blocks(3).await;
            let maker_snapshot =
                wait_for_phase(&net.maker.manager, trade_id, Phase::DepositsUnlocked).await;
            assert_eq!(
                maker_snapshot.state,
                State::DepositTxsUnlockedInBlockchain
            );
            wait_for_phase(&net.taker.manager, trade_id, Phase::DepositsUnlocked).await;
            wait_for_phase(&net.arbitrator.manager, trade_id, Phase::DepositsUnlocked).await;

            net.shutdown().await;
        }
    }
}
