use std::{collections::HashMap, path::Path, sync::Arc, time::Duration};

use secp256k1::{SecretKey, XOnlyPublicKey};
use tokio::{sync::mpsc, task::JoinHandle, time::sleep};
use uuid::Uuid;

use tri_escrow::{
    common::config::EngineConfig,
    manager::TradeManager,
    protocol::TradeMessageEnvelope,
    testing::{
        SomeTestOfferParams, SomeTestParams, StubChain, StubEscrowWalletFactory, StubOfferBook,
        StubWalletBackend,
    },
    trade::{Phase, State, TradeSnapshot},
};

pub const WAIT_TIMEOUT_MS: u64 = 5_000;
const CHANNEL_SIZE: usize = 64;

#[allow(dead_code)]
pub struct TestNode {
    pub manager: TradeManager,
    pub pubkey: XOnlyPublicKey,
    pub offer_book: Arc<StubOfferBook>,
}

#[allow(dead_code)]
pub struct TestNet {
    pub maker: TestNode,
    pub taker: TestNode,
    pub arbitrator: TestNode,
    pub chain: StubChain,
    inbound_txs: HashMap<XOnlyPublicKey, mpsc::Sender<TradeMessageEnvelope>>,
    router_handles: Vec<JoinHandle<()>>,
}

#[allow(dead_code)]
impl TestNet {
    /// Three nodes wired through an in-memory router, sharing one stub
    /// chain. Restarting with the same `data_root` and chain restores the
    /// previous run's trades.
    pub async fn start(data_root: &Path, chain: StubChain) -> TestNet {
        let keys = [
            ("maker", SomeTestParams::maker_private_key()),
            ("taker", SomeTestParams::taker_private_key()),
            ("arbitrator", SomeTestParams::arbitrator_private_key()),
        ];

        let mut inbound_txs = HashMap::new();
        let mut channels = Vec::new();
        for (_, key) in keys.iter() {
            let (out_tx, out_rx) = mpsc::channel(CHANNEL_SIZE);
            let (in_tx, in_rx) = mpsc::channel(CHANNEL_SIZE);
            inbound_txs.insert(SomeTestParams::pubkey_for(*key), in_tx);
            channels.push((out_tx, out_rx, in_rx));
        }

        let mut router_handles = Vec::new();
        let mut nodes = Vec::new();
        let offer = SomeTestOfferParams::default_buy_offer();

        for ((name, key), (out_tx, out_rx, in_rx)) in keys.iter().zip(channels) {
            let pubkey = SomeTestParams::pubkey_for(*key);

            let maker_account = if *name == "maker" {
                Some(SomeTestOfferParams::maker_account_details())
            } else {
                None
            };
            let offer_book = Arc::new(StubOfferBook::with_offer(offer.clone(), maker_account));

            let own_payout_address = format!("{}-payout-addr", name);
            let wallet = Arc::new(StubWalletBackend::with_known_addresses(&[
                own_payout_address.as_str(),
            ]));
            let factory = Arc::new(StubEscrowWalletFactory::new(chain.clone()));

            let mut config = EngineConfig::with_data_dir(data_root.join(name));
            config.unlock_window = 2;
            config.accepted_arbitrators = vec![SomeTestParams::arbitrator_pubkey()];
            config.trade_period_tick_secs = 3600;

            let manager = TradeManager::new(
                *key,
                config,
                offer_book.clone(),
                wallet,
                factory,
                out_tx.clone(),
                in_rx,
            )
            .await
            .unwrap();

            // Route this node's outbound messages to the addressee
            let routes = inbound_txs.clone();
            let mut out_rx = out_rx;
            router_handles.push(tokio::spawn(async move {
                while let Some(outbound) = out_rx.recv().await {
                    if let Some(in_tx) = routes.get(&outbound.to) {
                        let _ = in_tx.send(outbound.envelope).await;
                    }
                }
            }));

            nodes.push(TestNode {
                manager,
                pubkey,
                offer_book,
            });
        }

        let arbitrator = nodes.pop().unwrap();
        let taker = nodes.pop().unwrap();
        let maker = nodes.pop().unwrap();

        TestNet {
            maker,
            taker,
            arbitrator,
            chain,
            inbound_txs,
            router_handles,
        }
    }

    /// Registers both parties' deposit transactions on the stub chain
    /// with the amounts the default buy offer calls for: the buyer posts
    /// its security deposit, the seller its deposit plus the trade amount.
    pub fn register_default_deposits(&self) {
        let amount = SomeTestOfferParams::some_amount();
        let security_deposit = amount * 15 / 100;
        self.chain
            .register_tx("maker-deposit-hex", "maker-deposit-tx", security_deposit);
        self.chain.register_tx(
            "taker-deposit-hex",
            "taker-deposit-tx",
            security_deposit + amount,
        );
    }

    /// Advances the chain and fans the new height out to every node.
    pub async fn advance_blocks(&self, blocks: u64) {
        for _ in 0..blocks {
            let height = self.chain.advance_block();
            for node in [&self.maker, &self.taker, &self.arbitrator] {
                let _ = node.manager.block_event_tx().send(height);
            }
            sleep(Duration::from_millis(50)).await;
        }
    }

    /// Injects an envelope directly into a node's inbound channel, as if
    /// the transport delivered it.
    pub async fn inject(&self, to: XOnlyPublicKey, envelope: TradeMessageEnvelope) {
        self.inbound_txs
            .get(&to)
            .expect("unknown injection target")
            .send(envelope)
            .await
            .unwrap();
    }

    pub async fn shutdown(self) {
        for handle in self.router_handles {
            handle.abort();
        }
        self.maker.manager.shutdown().await.unwrap();
        self.taker.manager.shutdown().await.unwrap();
        self.arbitrator.manager.shutdown().await.unwrap();
    }
}

#[allow(dead_code)]
pub async fn wait_for_snapshot(
    manager: &TradeManager,
    trade_id: Uuid,
    predicate: impl Fn(&TradeSnapshot) -> bool,
) -> TradeSnapshot {
    let mut waited = 0u64;
    loop {
        if let Some(snapshot) = manager.get_trade(trade_id).await {
            if predicate(&snapshot) {
                return snapshot;
            }
        }
        if waited >= WAIT_TIMEOUT_MS {
            panic!("timed out waiting for trade {} condition", trade_id);
        }
        sleep(Duration::from_millis(50)).await;
        waited += 50;
    }
}

#[allow(dead_code)]
pub async fn wait_for_phase(manager: &TradeManager, trade_id: Uuid, phase: Phase) -> TradeSnapshot {
    wait_for_snapshot(manager, trade_id, |snapshot| snapshot.phase >= phase).await
}

#[allow(dead_code)]
pub async fn wait_for_state(manager: &TradeManager, trade_id: Uuid, state: State) -> TradeSnapshot {
    wait_for_snapshot(manager, trade_id, |snapshot| snapshot.state == state).await
}
