use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use secp256k1::{KeyPair, Secp256k1, SecretKey, XOnlyPublicKey};
use tokio::{
    sync::{broadcast, mpsc, RwLock, Semaphore},
    time::{interval, Duration},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    comms::{CommsAccess, OutboundMessage},
    common::{
        config::EngineConfig,
        error::TriEscrowError,
        types::{Direction, TradeRole},
        utils::now_unix_secs,
    },
    offer::{OfferBookAccess, OpenOffer, TradeAccountDetails},
    protocol::{
        InitTradeRequest, ProtocolAccess, ProtocolContext, TradeMessage, TradeMessageEnvelope,
        TradeProtocol,
    },
    trade::{NewTradeParams, Phase, Trade, TradePeer, TradeSnapshot},
    wallet::{EscrowWalletFactory, WalletBackend},
};

const BLOCK_EVENT_CHANNEL_SIZE: usize = 64;

/// Process-wide registry of all trades. Receives every inbound
/// trade-protocol message, resolves or creates the target trade, enforces
/// one protocol instance per trade uid, and owns the failed/closed
/// collections and crash-recovery bookkeeping.
pub struct TradeManager {
    inner: Arc<ManagerInner>,
    dispatch_handle: tokio::task::JoinHandle<()>,
    tick_handle: tokio::task::JoinHandle<()>,
}

struct ManagerInner {
    config: EngineConfig,
    keypair: KeyPair,
    pubkey: XOnlyPublicKey,
    comms: CommsAccess,
    offer_book: Arc<dyn OfferBookAccess>,
    wallet: Arc<dyn WalletBackend>,
    escrow_factory: Arc<dyn EscrowWalletFactory>,
    protocols: RwLock<HashMap<Uuid, TradeProtocol>>,
    trade_index: RwLock<HashMap<Uuid, Uuid>>,
    closed: RwLock<HashMap<Uuid, TradeSnapshot>>,
    failed: RwLock<HashMap<Uuid, TradeSnapshot>>,
    block_tx: broadcast::Sender<u64>,
}

impl TradeManager {
    pub async fn new(
        key: SecretKey,
        config: EngineConfig,
        offer_book: Arc<dyn OfferBookAccess>,
        wallet: Arc<dyn WalletBackend>,
        escrow_factory: Arc<dyn EscrowWalletFactory>,
        outbound_tx: mpsc::Sender<OutboundMessage>,
        mut inbound_rx: mpsc::Receiver<TradeMessageEnvelope>,
    ) -> Result<TradeManager, TriEscrowError> {
        let secp = Secp256k1::new();
        let keypair = KeyPair::from_secret_key(&secp, &key);
        let pubkey = XOnlyPublicKey::from_keypair(&keypair).0;

        for dir in [
            Self::open_dir(&config.data_dir),
            Self::closed_dir(&config.data_dir),
            Self::failed_dir(&config.data_dir),
        ] {
            fs::create_dir_all(&dir)?;
        }

        let (block_tx, _) = broadcast::channel(BLOCK_EVENT_CHANNEL_SIZE);

        let inner = Arc::new(ManagerInner {
            config,
            keypair,
            pubkey,
            comms: CommsAccess::new(outbound_tx),
            offer_book,
            wallet,
            escrow_factory,
            protocols: RwLock::new(HashMap::new()),
            trade_index: RwLock::new(HashMap::new()),
            closed: RwLock::new(HashMap::new()),
            failed: RwLock::new(HashMap::new()),
            block_tx,
        });

        inner.restore_trades().await?;
        if let Some(error) = inner.reconcile_frozen_outputs().await.err() {
            error!("Frozen output reconciliation failed - {}", error);
        }

        let dispatch_inner = inner.clone();
        let dispatch_handle = tokio::spawn(async move {
            while let Some(envelope) = inbound_rx.recv().await {
                dispatch_inner.dispatch(envelope).await;
            }
            debug!("TradeManager dispatch task exiting");
        });

        let tick_inner = inner.clone();
        let tick_secs = tick_inner.config.trade_period_tick_secs;
        let tick_handle = tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(tick_secs));
            loop {
                ticker.tick().await;
                tick_inner.update_all_period_states().await;
            }
        });

        Ok(TradeManager {
            inner,
            dispatch_handle,
            tick_handle,
        })
    }

    fn open_dir(data_dir: &Path) -> PathBuf {
        data_dir.join("trades").join("open")
    }

    fn closed_dir(data_dir: &Path) -> PathBuf {
        data_dir.join("trades").join("closed")
    }

    fn failed_dir(data_dir: &Path) -> PathBuf {
        data_dir.join("trades").join("failed")
    }

    pub fn pubkey(&self) -> XOnlyPublicKey {
        self.inner.pubkey
    }

    /// Clone of the new-block broadcast sender. The application's chain
    /// watcher pushes heights into this; every open trade subscribes.
    pub fn block_event_tx(&self) -> broadcast::Sender<u64> {
        self.inner.block_tx.clone()
    }

    /// Taker entry point: creates the local taker-role trade before the
    /// first message leaves this node, then sends the init request to the
    /// offer's arbitrator.
    pub async fn take_offer(
        &self,
        offer: OpenOffer,
        taker_account: TradeAccountDetails,
    ) -> Result<ProtocolAccess, TriEscrowError> {
        self.inner.take_offer(offer, taker_account).await
    }

    pub async fn get_trade(&self, trade_id: Uuid) -> Option<TradeSnapshot> {
        self.inner.get_trade(trade_id).await
    }

    pub async fn get_trade_accessor(&self, trade_id: Uuid) -> Option<ProtocolAccess> {
        self.inner.accessor_for_trade(trade_id).await
    }

    pub async fn get_trades(&self) -> Vec<TradeSnapshot> {
        self.inner.get_trades().await
    }

    pub async fn get_closed_trades(&self) -> Vec<TradeSnapshot> {
        self.inner.closed.read().await.values().cloned().collect()
    }

    pub async fn get_failed_trades(&self) -> Vec<TradeSnapshot> {
        self.inner.failed.read().await.values().cloned().collect()
    }

    /// Marks the payout-published trade completed and moves it to the
    /// closed collection.
    pub async fn on_trade_completed(&self, trade_id: Uuid) -> Result<(), TriEscrowError> {
        let accessor = self
            .inner
            .accessor_for_trade(trade_id)
            .await
            .ok_or_else(|| {
                TriEscrowError::Simple(format!("No open trade with id {}", trade_id))
            })?;
        accessor.complete_trade().await?;
        self.inner.move_to_closed(trade_id).await
    }

    /// Closes the dispute on a trade and retires it to the closed set.
    pub async fn close_disputed_trade(&self, trade_id: Uuid) -> Result<(), TriEscrowError> {
        let accessor = self
            .inner
            .accessor_for_trade(trade_id)
            .await
            .ok_or_else(|| {
                TriEscrowError::Simple(format!("No open trade with id {}", trade_id))
            })?;
        accessor.close_dispute().await?;
        self.inner.move_to_closed(trade_id).await
    }

    /// Classifies and retires a broken trade. Trades that have paid fees
    /// or published deposits go to the failed set for later recovery;
    /// anything earlier is discarded outright with its artifacts undone.
    pub async fn fail_trade(
        &self,
        trade_id: Uuid,
        reason: impl Into<String>,
    ) -> Result<(), TriEscrowError> {
        self.inner.fail_trade(trade_id, reason.into()).await
    }

    /// Moves a failed trade back into the open set, but only when both
    /// its escrow wallet and its payout address are still recoverable.
    /// Anything else is refused rather than retried.
    pub async fn unfail_trade(&self, trade_id: Uuid) -> Result<(), TriEscrowError> {
        self.inner.unfail_trade(trade_id).await
    }

    pub async fn shutdown(self) -> Result<(), TriEscrowError> {
        self.dispatch_handle.abort();
        self.tick_handle.abort();

        let mut protocols = self.inner.protocols.write().await;
        for (uid, protocol) in protocols.drain() {
            let accessor = protocol.new_accessor();
            if let Some(error) = accessor.shutdown().await.err() {
                warn!("Error shutting down protocol for trade uid {} - {}", uid, error);
            }
            if let Some(error) = protocol.task_handle.await.err() {
                warn!("Protocol task for trade uid {} ended with error - {}", uid, error);
            }
        }
        self.inner.trade_index.write().await.clear();
        Ok(())
    }
}

impl ManagerInner {
    fn protocol_context(&self, trade_id: Uuid) -> Result<ProtocolContext, TriEscrowError> {
        let wallet = self.escrow_factory.open_escrow_wallet(trade_id)?;
        Ok(ProtocolContext {
            keypair: self.keypair,
            pubkey: self.pubkey,
            config: self.config.clone(),
            comms: self.comms.clone(),
            wallet,
            block_rx: self.block_tx.subscribe(),
        })
    }

    async fn register(&self, trade_id: Uuid, protocol: TradeProtocol, uid: Uuid) {
        self.protocols.write().await.insert(uid, protocol);
        self.trade_index.write().await.insert(trade_id, uid);
    }

    async fn deregister(&self, trade_id: Uuid) -> Option<TradeProtocol> {
        let uid = self.trade_index.write().await.remove(&trade_id)?;
        self.protocols.write().await.remove(&uid)
    }

    async fn accessor_for_trade(&self, trade_id: Uuid) -> Option<ProtocolAccess> {
        let uid = *self.trade_index.read().await.get(&trade_id)?;
        let protocols = self.protocols.read().await;
        protocols.get(&uid).map(|protocol| protocol.new_accessor())
    }

    async fn message_tx_for_trade(
        &self,
        trade_id: Uuid,
    ) -> Option<mpsc::Sender<TradeMessageEnvelope>> {
        let uid = *self.trade_index.read().await.get(&trade_id)?;
        let protocols = self.protocols.read().await;
        protocols.get(&uid).map(|protocol| protocol.message_tx())
    }

    async fn get_trade(&self, trade_id: Uuid) -> Option<TradeSnapshot> {
        if let Some(accessor) = self.accessor_for_trade(trade_id).await {
            return accessor.snapshot().await.ok();
        }
        // Fall back to the retired collections
        let closed = self.closed.read().await;
        if let Some(snapshot) = closed.values().find(|snapshot| snapshot.id == trade_id) {
            return Some(snapshot.clone());
        }
        drop(closed);
        let failed = self.failed.read().await;
        failed
            .values()
            .find(|snapshot| snapshot.id == trade_id)
            .cloned()
    }

    async fn get_trades(&self) -> Vec<TradeSnapshot> {
        let accessors: Vec<ProtocolAccess> = {
            let protocols = self.protocols.read().await;
            protocols
                .values()
                .map(|protocol| protocol.new_accessor())
                .collect()
        };

        let mut snapshots = Vec::with_capacity(accessors.len());
        for accessor in accessors {
            if let Ok(snapshot) = accessor.snapshot().await {
                snapshots.push(snapshot);
            }
        }
        snapshots
    }

    // Startup recovery

    /// Reloads every persisted trade. Open trades get their protocol
    /// actors re-spawned under a bounded pool, since each one opens its
    /// escrow wallet. Closed and failed trades load as snapshots only.
    async fn restore_trades(self: &Arc<Self>) -> Result<(), TriEscrowError> {
        let open_paths = Self::trade_files(&TradeManager::open_dir(&self.config.data_dir))?;
        let semaphore = Arc::new(Semaphore::new(self.config.restore_concurrency));
        let mut join_handles = Vec::new();

        for path in open_paths {
            let inner = self.clone();
            let semaphore = semaphore.clone();
            join_handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await;
                if let Some(error) = inner.restore_open_trade(&path).await.err() {
                    error!(
                        "Failed restoring trade from {} - {}",
                        path.display(),
                        error
                    );
                }
            }));
        }
        for join_handle in join_handles {
            let _ = join_handle.await;
        }

        for (dir, collection) in [
            (TradeManager::closed_dir(&self.config.data_dir), &self.closed),
            (TradeManager::failed_dir(&self.config.data_dir), &self.failed),
        ] {
            for path in Self::trade_files(&dir)? {
                match Trade::restore(&path) {
                    Ok((uid, trade)) => {
                        let snapshot = trade.snapshot();
                        trade.terminate();
                        collection.write().await.insert(uid, snapshot);
                    }
                    Err(error) => {
                        error!(
                            "Failed loading retired trade from {} - {}",
                            path.display(),
                            error
                        );
                    }
                }
            }
        }

        let open_count = self.protocols.read().await.len();
        info!(
            "TradeManager restored {} open, {} closed, {} failed trades",
            open_count,
            self.closed.read().await.len(),
            self.failed.read().await.len()
        );
        Ok(())
    }

    async fn restore_open_trade(&self, path: &Path) -> Result<(), TriEscrowError> {
        let (uid, trade) = Trade::restore(path)?;
        let trade_id = trade.id();
        let ctx = self.protocol_context(trade_id)?;
        let protocol = TradeProtocol::new(ctx, trade);
        self.register(trade_id, protocol, uid).await;
        Ok(())
    }

    fn trade_files(dir: &Path) -> Result<Vec<PathBuf>, TriEscrowError> {
        let mut paths = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().map(|ext| ext == "json").unwrap_or(false) {
                paths.push(path);
            }
        }
        Ok(paths)
    }

    /// Any output frozen in the main wallet that no open offer or open
    /// trade still claims is thawed. Orphaned reservations from a crash
    /// mid-operation must not pin funds forever.
    async fn reconcile_frozen_outputs(&self) -> Result<(), TriEscrowError> {
        let frozen = self.wallet.frozen_outputs()?;
        if frozen.is_empty() {
            return Ok(());
        }

        let mut referenced: Vec<String> = self.offer_book.reserved_key_images()?;
        for snapshot in self.get_trades().await {
            for peer in [&snapshot.maker, &snapshot.taker] {
                referenced.extend(peer.reserve_tx_key_images.iter().cloned());
            }
        }

        let mut thawed = 0usize;
        for key_image in frozen {
            if !referenced.contains(&key_image) {
                if let Some(error) = self.wallet.thaw_output(&key_image).err() {
                    error!("Failed thawing orphaned output {} - {}", key_image, error);
                } else {
                    thawed += 1;
                }
            }
        }
        if thawed > 0 {
            info!("Thawed {} orphaned frozen outputs", thawed);
        }
        Ok(())
    }

    async fn update_all_period_states(&self) {
        let accessors: Vec<ProtocolAccess> = {
            let protocols = self.protocols.read().await;
            protocols
                .values()
                .map(|protocol| protocol.new_accessor())
                .collect()
        };
        for accessor in accessors {
            if let Some(error) = accessor.update_period_state().await.err() {
                debug!("Period state update skipped - {}", error);
            }
        }
    }

    // Message dispatch

    async fn dispatch(&self, envelope: TradeMessageEnvelope) {
        if envelope.trade_id.is_nil() {
            warn!(
                "Dropping trade message of type {} with empty trade id from {}",
                envelope.message, envelope.sender_pubkey
            );
            return;
        }

        debug!(
            "TradeManager dispatching {} for trade {} from {}",
            envelope.message, envelope.trade_id, envelope.sender_pubkey
        );

        match &envelope.message {
            TradeMessage::InitTradeRequest(request) => {
                let request = request.clone();
                self.handle_init_trade_request(envelope, request).await;
            }
            _ => {
                match self.message_tx_for_trade(envelope.trade_id).await {
                    Some(message_tx) => {
                        if let Some(error) = message_tx.send(envelope).await.err() {
                            error!("Failed forwarding message to trade protocol - {}", error);
                        }
                    }
                    None => {
                        warn!(
                            "No open trade with id {} for message of type {}, ignoring",
                            envelope.trade_id, envelope.message
                        );
                    }
                }
            }
        }
    }

    /// First-contact handling for init-trade requests, on both the
    /// arbitrator and the maker path. All validation happens before any
    /// side-effect; a failing handler rolls the side-effects back.
    async fn handle_init_trade_request(
        &self,
        envelope: TradeMessageEnvelope,
        request: InitTradeRequest,
    ) {
        let offer = match self.offer_book.get_open_offer(request.offer_id) {
            Ok(Some(offer)) => offer,
            Ok(None) => {
                warn!(
                    "InitTradeRequest for unknown offer {}, ignoring",
                    request.offer_id
                );
                return;
            }
            Err(error) => {
                error!("Offer lookup failed for {} - {}", request.offer_id, error);
                return;
            }
        };

        if request.amount != offer.amount || request.price != offer.price {
            warn!(
                "InitTradeRequest for offer {} with mismatched terms ({} @ {} vs offer {} @ {}), ignoring",
                offer.id, request.amount, request.price, offer.amount, offer.price
            );
            return;
        }

        if request.arbitrator_pubkey == self.pubkey {
            self.handle_init_trade_as_arbitrator(envelope, request, offer)
                .await;
        } else if offer.owner_pubkey == self.pubkey {
            self.handle_init_trade_as_maker(envelope, request, offer)
                .await;
        } else {
            warn!(
                "InitTradeRequest for offer {} addressed to neither our maker nor our arbitrator role, ignoring",
                offer.id
            );
        }
    }

    async fn handle_init_trade_as_arbitrator(
        &self,
        envelope: TradeMessageEnvelope,
        request: InitTradeRequest,
        offer: OpenOffer,
    ) {
        if offer.arbitrator_pubkey != self.pubkey {
            warn!(
                "InitTradeRequest for offer {} but this node is not its registered arbitrator, ignoring",
                offer.id
            );
            return;
        }

        let sender = envelope.sender_pubkey;
        let sender_is_maker = sender == offer.owner_pubkey;
        let sender_is_taker = sender == request.taker_pubkey;
        if !sender_is_maker && !sender_is_taker {
            warn!(
                "InitTradeRequest for offer {} from {} who is neither its maker nor its taker, ignoring",
                offer.id, sender
            );
            return;
        }

        let created = if self.accessor_for_trade(offer.id).await.is_none() {
            // First contact: create the arbitrator-role trade
            let params = self.trade_params_as_arbitrator(&offer, &request);
            if let Some(error) = self.spawn_trade(params).await.err() {
                error!(
                    "Failed creating arbitrator trade for offer {} - {}",
                    offer.id, error
                );
                return;
            }
            true
        } else {
            false
        };

        match self.message_tx_for_trade(offer.id).await {
            Some(message_tx) => {
                if let Some(error) = message_tx.send(envelope).await.err() {
                    error!(
                        "Arbitrator handler failed for trade {} - {}",
                        offer.id, error
                    );
                    if created {
                        self.rollback_trade(offer.id, false).await;
                    }
                }
            }
            None => {
                if created {
                    self.rollback_trade(offer.id, false).await;
                }
            }
        }
    }

    async fn handle_init_trade_as_maker(
        &self,
        envelope: TradeMessageEnvelope,
        request: InitTradeRequest,
        offer: OpenOffer,
    ) {
        if !offer.is_available() {
            warn!(
                "InitTradeRequest for offer {} which is not available, ignoring",
                offer.id
            );
            return;
        }

        let sender = envelope.sender_pubkey;
        if !self.config.accepted_arbitrators.contains(&sender)
            || sender != offer.arbitrator_pubkey
        {
            warn!(
                "InitTradeRequest for offer {} from {} who is not an accepted arbitrator, ignoring",
                offer.id, sender
            );
            return;
        }

        if self.accessor_for_trade(offer.id).await.is_some() {
            // Retry of the relayed init; forward to the existing instance
            if let Some(message_tx) = self.message_tx_for_trade(offer.id).await {
                let _ = message_tx.send(envelope).await;
            }
            return;
        }

        let maker_account = match self.offer_book.maker_account(offer.id) {
            Ok(Some(maker_account)) => maker_account,
            Ok(None) => {
                warn!(
                    "No maker payment account bound to offer {}, ignoring",
                    offer.id
                );
                return;
            }
            Err(error) => {
                error!("Maker account lookup failed for {} - {}", offer.id, error);
                return;
            }
        };

        if let Some(error) = self.offer_book.reserve_offer(offer.id).err() {
            error!("Failed reserving offer {} - {}", offer.id, error);
            return;
        }

        let params = self.trade_params_as_maker(&offer, &request, maker_account);
        if let Some(error) = self.spawn_trade(params).await.err() {
            error!(
                "Failed creating maker trade for offer {} - {}",
                offer.id, error
            );
            if let Some(unreserve_err) = self.offer_book.unreserve_offer(offer.id).err() {
                error!("Failed unreserving offer {} - {}", offer.id, unreserve_err);
            }
            return;
        }

        if let Some(message_tx) = self.message_tx_for_trade(offer.id).await {
            if let Some(error) = message_tx.send(envelope).await.err() {
                error!("Maker handler failed for trade {} - {}", offer.id, error);
                self.rollback_trade(offer.id, true).await;
            }
        }
    }

    fn trade_params_as_arbitrator(
        &self,
        offer: &OpenOffer,
        request: &InitTradeRequest,
    ) -> NewTradeParams {
        let mut params = self.base_trade_params(offer, request.taker_fee);
        params.role = TradeRole::Arbitrator;
        params.maker = TradePeer::with_pubkey(offer.owner_pubkey);
        params.taker = TradePeer::with_pubkey(request.taker_pubkey);
        params.arbitrator = TradePeer::with_pubkey(self.pubkey);
        params
    }

    fn trade_params_as_maker(
        &self,
        offer: &OpenOffer,
        request: &InitTradeRequest,
        maker_account: TradeAccountDetails,
    ) -> NewTradeParams {
        let mut params = self.base_trade_params(offer, request.taker_fee);
        params.role = TradeRole::for_maker(offer.direction);
        params.maker = TradePeer {
            pubkey: Some(self.pubkey),
            account_id: Some(maker_account.account_id),
            payment_method: Some(maker_account.payment_method),
            payment_account_payload_hash: Some(maker_account.payment_account_payload_hash),
            payout_address: Some(maker_account.payout_address),
            reserve_tx_id: maker_account.reserve_tx_id,
            reserve_tx_key_images: maker_account.reserve_tx_key_images,
            ..TradePeer::default()
        };
        params.taker = TradePeer::with_pubkey(request.taker_pubkey);
        params.arbitrator = TradePeer::with_pubkey(offer.arbitrator_pubkey);
        params
    }

    fn base_trade_params(&self, offer: &OpenOffer, taker_fee: u64) -> NewTradeParams {
        let (buyer_security_deposit, seller_security_deposit) = match offer.direction {
            Direction::Buy => {
                (offer.maker_deposit_amount(), offer.taker_deposit_amount())
            }
            Direction::Sell => {
                (offer.taker_deposit_amount(), offer.maker_deposit_amount())
            }
        };

        NewTradeParams {
            id: offer.id,
            role: TradeRole::Arbitrator, // overwritten by callers
            direction: offer.direction,
            amount: offer.amount,
            price: offer.price,
            taker_fee,
            buyer_security_deposit,
            seller_security_deposit,
            currency: offer.currency,
            payment_method: offer.payment_method,
            lock_time: self.config.unlock_window,
            take_offer_date: now_unix_secs(),
            maker: TradePeer::default(),
            taker: TradePeer::default(),
            arbitrator: TradePeer::default(),
        }
    }

    async fn spawn_trade(&self, params: NewTradeParams) -> Result<Uuid, TriEscrowError> {
        let trade_id = params.id;
        // Open the escrow wallet before anything is persisted, so a wallet
        // failure leaves no orphaned trade file behind
        let ctx = self.protocol_context(trade_id)?;
        let trade = Trade::new(TradeManager::open_dir(&self.config.data_dir), params);
        let uid = trade.uid();
        let protocol = TradeProtocol::new(ctx, trade);
        self.register(trade_id, protocol, uid).await;
        Ok(uid)
    }

    /// Tears a just-created trade back down after its handler failed.
    async fn rollback_trade(&self, trade_id: Uuid, unreserve: bool) {
        warn!("Rolling back trade {}", trade_id);
        if let Some(protocol) = self.deregister(trade_id).await {
            let accessor = protocol.new_accessor();
            let uid = accessor.snapshot().await.ok().map(|snapshot| snapshot.uid);
            let _ = accessor.shutdown().await;
            let _ = protocol.task_handle.await;
            // A rolled-back trade must not resurrect at next startup
            if let Some(uid) = uid {
                let open_path = TradeManager::open_dir(&self.config.data_dir)
                    .join(format!("{}-trade.json", uid));
                if let Some(error) = fs::remove_file(&open_path).err() {
                    warn!(
                        "Failed removing rolled-back trade file {} - {}",
                        open_path.display(),
                        error
                    );
                }
            }
        }
        if unreserve {
            if let Some(error) = self.offer_book.unreserve_offer(trade_id).err() {
                error!("Failed unreserving offer {} - {}", trade_id, error);
            }
        }
        if let Some(error) = self.escrow_factory.close_escrow_wallet(trade_id).err() {
            debug!("Escrow wallet close for {} - {}", trade_id, error);
        }
    }

    // Taker path

    async fn take_offer(
        &self,
        offer: OpenOffer,
        taker_account: TradeAccountDetails,
    ) -> Result<ProtocolAccess, TriEscrowError> {
        if !offer.is_available() {
            return Err(TriEscrowError::Simple(format!(
                "Offer {} is not available to take",
                offer.id
            )));
        }
        if self.accessor_for_trade(offer.id).await.is_some() {
            return Err(TriEscrowError::Simple(format!(
                "Trade for offer {} already exists",
                offer.id
            )));
        }

        let taker_fee = offer.amount * self.config.taker_fee_bps / 10_000;
        let mut params = self.base_trade_params(&offer, taker_fee);
        params.role = TradeRole::for_taker(offer.direction);
        params.maker = TradePeer::with_pubkey(offer.owner_pubkey);
        params.taker = TradePeer {
            pubkey: Some(self.pubkey),
            account_id: Some(taker_account.account_id),
            payment_method: Some(taker_account.payment_method),
            payment_account_payload_hash: Some(taker_account.payment_account_payload_hash),
            payout_address: Some(taker_account.payout_address),
            reserve_tx_id: taker_account.reserve_tx_id,
            reserve_tx_key_images: taker_account.reserve_tx_key_images,
            ..TradePeer::default()
        };
        params.arbitrator = TradePeer::with_pubkey(offer.arbitrator_pubkey);

        self.spawn_trade(params).await?;

        let accessor = self
            .accessor_for_trade(offer.id)
            .await
            .ok_or_else(|| TriEscrowError::Simple("Trade vanished after creation".to_string()))?;

        if let Some(error) = accessor.take_offer().await.err() {
            self.rollback_trade(offer.id, false).await;
            return Err(error);
        }

        Ok(accessor)
    }

    // Retirement

    async fn move_to_closed(&self, trade_id: Uuid) -> Result<(), TriEscrowError> {
        let snapshot = self
            .get_trade(trade_id)
            .await
            .ok_or_else(|| TriEscrowError::Simple(format!("No trade with id {}", trade_id)))?;
        let uid = snapshot.uid;

        self.retire_protocol(trade_id).await;
        self.move_trade_file(uid, &TradeManager::open_dir(&self.config.data_dir), &TradeManager::closed_dir(&self.config.data_dir))?;
        self.closed.write().await.insert(uid, snapshot);
        info!("Trade {} moved to closed set", trade_id);
        Ok(())
    }

    async fn fail_trade(&self, trade_id: Uuid, reason: String) -> Result<(), TriEscrowError> {
        let accessor = self.accessor_for_trade(trade_id).await.ok_or_else(|| {
            TriEscrowError::Simple(format!("No open trade with id {}", trade_id))
        })?;

        accessor.fail_trade(reason.clone()).await?;
        let snapshot = accessor.snapshot().await?;
        let uid = snapshot.uid;

        let own_peer = match snapshot.role {
            TradeRole::BuyerAsMaker
            | TradeRole::SellerAsMaker => &snapshot.maker,
            TradeRole::BuyerAsTaker
            | TradeRole::SellerAsTaker => &snapshot.taker,
            TradeRole::Arbitrator => &snapshot.arbitrator,
        };
        let fee_paid =
            own_peer.reserve_tx_id.is_some() || snapshot.phase >= Phase::DepositsPublished;

        self.retire_protocol(trade_id).await;

        if fee_paid {
            // Far enough along that silent removal could strand funds
            self.move_trade_file(
                uid,
                &TradeManager::open_dir(&self.config.data_dir),
                &TradeManager::failed_dir(&self.config.data_dir),
            )?;
            self.failed.write().await.insert(uid, snapshot);
            warn!("Trade {} moved to failed set - {}", trade_id, reason);
        } else {
            // Early failure: tear everything down and discard
            let open_path = TradeManager::open_dir(&self.config.data_dir)
                .join(format!("{}-trade.json", uid));
            if let Some(error) = fs::remove_file(&open_path).err() {
                warn!("Failed removing trade file {} - {}", open_path.display(), error);
            }
            if let Some(error) = self.offer_book.unreserve_offer(trade_id).err() {
                debug!("Offer {} unreserve on discard - {}", trade_id, error);
            }
            if !snapshot.is_funds_locked_in {
                if let Some(error) = self.escrow_factory.delete_escrow_wallet(trade_id).err() {
                    debug!("Escrow wallet delete for {} - {}", trade_id, error);
                }
            }
            info!("Trade {} discarded before funds at risk - {}", trade_id, reason);
        }
        Ok(())
    }

    async fn unfail_trade(&self, trade_id: Uuid) -> Result<(), TriEscrowError> {
        let uid = {
            let failed = self.failed.read().await;
            failed
                .values()
                .find(|snapshot| snapshot.id == trade_id)
                .map(|snapshot| snapshot.uid)
        }
        .ok_or_else(|| {
            TriEscrowError::Simple(format!("No failed trade with id {}", trade_id))
        })?;

        let failed_path = TradeManager::failed_dir(&self.config.data_dir)
            .join(format!("{}-trade.json", uid));
        let (_, mut trade) = Trade::restore(&failed_path)?;

        // Recovery preconditions: the escrow wallet must reopen and the
        // payout address must still be ours. Refuse otherwise; never
        // fabricate address bindings.
        let escrow_wallet = match self.escrow_factory.open_escrow_wallet(trade_id) {
            Ok(wallet) => wallet,
            Err(error) => {
                trade.terminate();
                return Err(TriEscrowError::Simple(format!(
                    "Refusing to unfail trade {}: escrow wallet not recoverable - {}",
                    trade_id, error
                )));
            }
        };

        let own_payout_address = trade
            .data()
            .peer(trade.own_slot())
            .payout_address
            .unwrap_or_default();
        let payout_known = !own_payout_address.is_empty()
            && self.wallet.has_address(&own_payout_address).unwrap_or(false);
        if !payout_known && !trade.role().is_arbitrator() {
            trade.terminate();
            return Err(TriEscrowError::Simple(format!(
                "Refusing to unfail trade {}: payout address not recoverable",
                trade_id
            )));
        }

        trade.clear_failed();
        trade.terminate();

        self.move_trade_file(
            uid,
            &TradeManager::failed_dir(&self.config.data_dir),
            &TradeManager::open_dir(&self.config.data_dir),
        )?;
        self.failed.write().await.remove(&uid);

        let open_path = TradeManager::open_dir(&self.config.data_dir)
            .join(format!("{}-trade.json", uid));
        let (uid, trade) = Trade::restore(&open_path)?;
        let ctx = ProtocolContext {
            keypair: self.keypair,
            pubkey: self.pubkey,
            config: self.config.clone(),
            comms: self.comms.clone(),
            wallet: escrow_wallet,
            block_rx: self.block_tx.subscribe(),
        };
        let protocol = TradeProtocol::new(ctx, trade);
        self.register(trade_id, protocol, uid).await;
        info!("Trade {} recovered from failed set", trade_id);
        Ok(())
    }

    async fn retire_protocol(&self, trade_id: Uuid) {
        if let Some(protocol) = self.deregister(trade_id).await {
            let accessor = protocol.new_accessor();
            let _ = accessor.shutdown().await;
            let _ = protocol.task_handle.await;
        }
        if let Some(error) = self.escrow_factory.close_escrow_wallet(trade_id).err() {
            debug!("Escrow wallet close for {} - {}", trade_id, error);
        }
    }

    fn move_trade_file(&self, uid: Uuid, from: &Path, to: &Path) -> Result<(), TriEscrowError> {
        let file_name = format!("{}-trade.json", uid);
        fs::rename(from.join(&file_name), to.join(&file_name))?;
        Ok(())
    }
}
