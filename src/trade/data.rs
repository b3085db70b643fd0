use std::{
    path::{Path, PathBuf},
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use iso_currency::Currency;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    common::{
        error::TriEscrowError,
        persist::Persister,
        types::{Direction, FiatPaymentMethod, SerdeGenericTrait, TradeRole, TxIdString},
    },
    contract::Contract,
};

use super::{DisputeState, PeerSlot, State, TradePeer, TradePeriodState};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct TradeDataStore {
    // Identity
    pub(crate) id: Uuid,
    pub(crate) uid: Uuid,
    pub(crate) role: TradeRole,

    // Economic terms, derived from the offer at creation
    pub(crate) direction: Direction,
    pub(crate) amount: u64,
    pub(crate) price: u64,
    pub(crate) taker_fee: u64,
    pub(crate) buyer_security_deposit: u64,
    pub(crate) seller_security_deposit: u64,
    pub(crate) currency: Currency,
    pub(crate) payment_method: FiatPaymentMethod,
    pub(crate) lock_time: u64,
    pub(crate) take_offer_date: u64,

    // Participants
    pub(crate) maker: TradePeer,
    pub(crate) taker: TradePeer,
    pub(crate) arbitrator: TradePeer,

    // State machine axes
    pub(crate) state: State,
    pub(crate) dispute_state: DisputeState,
    pub(crate) period_state: TradePeriodState,

    // Deposit tracking
    pub(crate) deposit_confirmed_at: Option<u64>,
    pub(crate) unlock_height: Option<u64>,

    // Agreement and payout
    pub(crate) contract: Option<Contract>,
    pub(crate) contract_hash: Option<String>,
    pub(crate) payout_tx_id: Option<TxIdString>,
    pub(crate) payout_tx_hex: Option<String>,

    // Failure bookkeeping
    pub(crate) error_message: Option<String>,
    pub(crate) failed: bool,
}

#[typetag::serde(name = "tri-escrow-trade-data")]
impl SerdeGenericTrait for TradeDataStore {
    fn any_ref(&self) -> &dyn std::any::Any {
        self
    }
}

/// Persisted per-trade state. Every mutation queues a write-behind
/// persist, so a reload at any point reconstructs the same predicates
/// without replaying messages.
pub struct TradeData {
    pub(crate) trade_id: Uuid,
    pub(crate) trade_uid: Uuid,
    data_path: PathBuf,
    store: Arc<RwLock<TradeDataStore>>,
    persister: Persister,
}

impl TradeData {
    pub(crate) fn new(dir_path: impl AsRef<Path>, store: TradeDataStore) -> Self {
        let trade_id = store.id;
        let trade_uid = store.uid;
        let data_path = dir_path.as_ref().join(format!("{}-trade.json", trade_uid));

        let store = Arc::new(RwLock::new(store));
        let generic_store: Arc<RwLock<dyn SerdeGenericTrait + 'static>> = store.clone();
        let persister = Persister::new(generic_store, &data_path);
        persister.queue();

        Self {
            trade_id,
            trade_uid,
            data_path,
            store,
            persister,
        }
    }

    pub(crate) fn restore(data_path: impl AsRef<Path>) -> Result<(Uuid, Self), TriEscrowError> {
        let json = Persister::restore(&data_path)?;
        let store: TradeDataStore = serde_json::from_str(&json)?;

        let trade_id = store.id;
        let trade_uid = store.uid;

        let store = Arc::new(RwLock::new(store));
        let generic_store: Arc<RwLock<dyn SerdeGenericTrait + 'static>> = store.clone();
        let persister = Persister::new(generic_store, &data_path);

        let data = Self {
            trade_id,
            trade_uid,
            data_path: data_path.as_ref().to_path_buf(),
            store,
            persister,
        };

        Ok((trade_uid, data))
    }

    pub(crate) fn data_path(&self) -> &Path {
        &self.data_path
    }

    fn read_store(&self) -> RwLockReadGuard<'_, TradeDataStore> {
        match self.store.read() {
            Ok(store) => store,
            Err(error) => {
                panic!("Error reading store - {}", error);
            }
        }
    }

    fn write_store(&self) -> RwLockWriteGuard<'_, TradeDataStore> {
        match self.store.write() {
            Ok(store) => store,
            Err(error) => {
                panic!("Error writing store - {}", error);
            }
        }
    }

    // Getter methods

    pub fn role(&self) -> TradeRole {
        self.read_store().role
    }

    pub fn direction(&self) -> Direction {
        self.read_store().direction
    }

    pub fn amount(&self) -> u64 {
        self.read_store().amount
    }

    pub fn price(&self) -> u64 {
        self.read_store().price
    }

    pub fn taker_fee(&self) -> u64 {
        self.read_store().taker_fee
    }

    pub fn buyer_security_deposit(&self) -> u64 {
        self.read_store().buyer_security_deposit
    }

    pub fn seller_security_deposit(&self) -> u64 {
        self.read_store().seller_security_deposit
    }

    pub fn currency(&self) -> Currency {
        self.read_store().currency
    }

    pub fn payment_method(&self) -> FiatPaymentMethod {
        self.read_store().payment_method
    }

    pub fn lock_time(&self) -> u64 {
        self.read_store().lock_time
    }

    pub fn take_offer_date(&self) -> u64 {
        self.read_store().take_offer_date
    }

    pub fn state(&self) -> State {
        self.read_store().state
    }

    pub fn dispute_state(&self) -> DisputeState {
        self.read_store().dispute_state
    }

    pub fn period_state(&self) -> TradePeriodState {
        self.read_store().period_state
    }

    pub fn deposit_confirmed_at(&self) -> Option<u64> {
        self.read_store().deposit_confirmed_at
    }

    pub fn unlock_height(&self) -> Option<u64> {
        self.read_store().unlock_height
    }

    pub fn contract(&self) -> Option<Contract> {
        self.read_store().contract.to_owned()
    }

    pub fn contract_hash(&self) -> Option<String> {
        self.read_store().contract_hash.to_owned()
    }

    pub fn payout_tx_id(&self) -> Option<TxIdString> {
        self.read_store().payout_tx_id.to_owned()
    }

    pub fn payout_tx_hex(&self) -> Option<String> {
        self.read_store().payout_tx_hex.to_owned()
    }

    pub fn error_message(&self) -> Option<String> {
        self.read_store().error_message.to_owned()
    }

    pub fn failed(&self) -> bool {
        self.read_store().failed
    }

    pub fn peer(&self, slot: PeerSlot) -> TradePeer {
        let store = self.read_store();
        match slot {
            PeerSlot::Maker => store.maker.to_owned(),
            PeerSlot::Taker => store.taker.to_owned(),
            PeerSlot::Arbitrator => store.arbitrator.to_owned(),
        }
    }

    // Setter methods

    pub(crate) fn set_state(&mut self, state: State) {
        self.write_store().state = state;
        self.persister.queue();
    }

    pub(crate) fn set_dispute_state(&mut self, dispute_state: DisputeState) {
        self.write_store().dispute_state = dispute_state;
        self.persister.queue();
    }

    pub(crate) fn set_period_state(&mut self, period_state: TradePeriodState) {
        self.write_store().period_state = period_state;
        self.persister.queue();
    }

    pub(crate) fn set_deposit_confirmed_at(&mut self, at: u64) {
        self.write_store().deposit_confirmed_at = Some(at);
        self.persister.queue();
    }

    pub(crate) fn set_unlock_height(&mut self, height: u64) {
        self.write_store().unlock_height = Some(height);
        self.persister.queue();
    }

    pub(crate) fn set_contract(&mut self, contract: Contract, contract_hash: String) {
        self.write_store().contract = Some(contract);
        self.write_store().contract_hash = Some(contract_hash);
        self.persister.queue();
    }

    pub(crate) fn set_payout_tx(&mut self, tx_id: TxIdString, tx_hex: Option<String>) {
        self.write_store().payout_tx_id = Some(tx_id);
        if let Some(tx_hex) = tx_hex {
            self.write_store().payout_tx_hex = Some(tx_hex);
        }
        self.persister.queue();
    }

    pub(crate) fn set_error_message(&mut self, error_message: impl Into<String>) {
        self.write_store().error_message = Some(error_message.into());
        self.persister.queue();
    }

    pub(crate) fn set_failed(&mut self, failed: bool) {
        self.write_store().failed = failed;
        self.persister.queue();
    }

    pub(crate) fn modify_peer(&mut self, slot: PeerSlot, modify: impl FnOnce(&mut TradePeer)) {
        {
            let mut store = self.write_store();
            let peer = match slot {
                PeerSlot::Maker => &mut store.maker,
                PeerSlot::Taker => &mut store.taker,
                PeerSlot::Arbitrator => &mut store.arbitrator,
            };
            modify(peer);
        }
        self.persister.queue();
    }

    pub(crate) fn terminate(self) {
        self.persister.terminate()
    }
}
