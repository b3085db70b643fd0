use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use uuid::Uuid;

use crate::{
    common::{error::TriEscrowError, types::AddressString},
    offer::{OfferBookAccess, OfferStatus, OpenOffer, TradeAccountDetails},
    wallet::{
        CreatedTx, EscrowWallet, EscrowWalletFactory, SignedTx, TransferDestination, TxDescription,
        TxInfo, WalletBackend,
    },
};

/// Shared fake chain backing every stub escrow wallet in a test. Tests
/// register deposit hex/id pairs up front, then drive confirmation by
/// advancing blocks.
#[derive(Default)]
pub struct StubChainState {
    pub height: u64,
    pub txs: HashMap<String, TxInfo>,
    pub hex_to_tx_id: HashMap<String, String>,
    pub descriptions: HashMap<String, TxDescription>,
    pub submitted: Vec<String>,
    pub payout_fee: u64,
    payout_counter: u64,
}

#[derive(Clone, Default)]
pub struct StubChain {
    state: Arc<Mutex<StubChainState>>,
}

impl StubChain {
    pub fn new(payout_fee: u64) -> Self {
        let chain = Self::default();
        chain.state.lock().unwrap().payout_fee = payout_fee;
        chain
    }

    /// Registers a known transaction hex with its id and the amount the
    /// escrow wallet will see coming in once it is submitted.
    pub fn register_tx(&self, tx_hex: &str, tx_id: &str, incoming_amount: u64) {
        let mut state = self.state.lock().unwrap();
        state
            .hex_to_tx_id
            .insert(tx_hex.to_string(), tx_id.to_string());
        state.txs.insert(
            tx_id.to_string(),
            TxInfo {
                tx_id: tx_id.to_string(),
                confirmations: 0,
                height: None,
                incoming_amount,
            },
        );
    }

    /// Registers a decode result for a transaction hex, for driving the
    /// verification path with hand-crafted (e.g. tampered) transactions.
    pub fn register_description(&self, tx_hex: &str, tx_id: &str, description: TxDescription) {
        let mut state = self.state.lock().unwrap();
        state
            .hex_to_tx_id
            .insert(tx_hex.to_string(), tx_id.to_string());
        state.descriptions.insert(tx_hex.to_string(), description);
    }

    /// Advances the chain one block and confirms everything submitted.
    pub fn advance_block(&self) -> u64 {
        let mut state = self.state.lock().unwrap();
        state.height += 1;
        let height = state.height;
        let submitted = state.submitted.clone();
        for tx_id in submitted {
            if let Some(tx) = state.txs.get_mut(&tx_id) {
                if tx.height.is_none() {
                    tx.height = Some(height);
                }
                tx.confirmations += 1;
            }
        }
        height
    }

    pub fn height(&self) -> u64 {
        self.state.lock().unwrap().height
    }

    pub fn submitted_tx_ids(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .submitted
            .iter()
            .filter_map(|hex| state.hex_to_tx_id.get(hex).cloned())
            .collect()
    }
}

pub struct StubEscrowWallet {
    chain: StubChain,
    primary_address: AddressString,
}

impl StubEscrowWallet {
    pub fn new(chain: StubChain) -> Self {
        Self {
            chain,
            primary_address: "escrow-primary-addr".to_string(),
        }
    }
}

impl EscrowWallet for StubEscrowWallet {
    fn primary_address(&self) -> AddressString {
        self.primary_address.clone()
    }

    fn height(&self) -> Result<u64, TriEscrowError> {
        Ok(self.chain.height())
    }

    fn fee_estimate(&self) -> Result<u64, TriEscrowError> {
        Ok(self.chain.state.lock().unwrap().payout_fee)
    }

    fn get_tx(&self, tx_id: &str) -> Result<Option<TxInfo>, TriEscrowError> {
        Ok(self.chain.state.lock().unwrap().txs.get(tx_id).cloned())
    }

    fn incoming_amount(&self, tx_id: &str) -> Result<u64, TriEscrowError> {
        self.chain
            .state
            .lock()
            .unwrap()
            .txs
            .get(tx_id)
            .map(|tx| tx.incoming_amount)
            .ok_or_else(|| TriEscrowError::Wallet(format!("unknown tx {}", tx_id)))
    }

    fn create_tx(
        &self,
        destinations: Vec<TransferDestination>,
    ) -> Result<CreatedTx, TriEscrowError> {
        let mut state = self.chain.state.lock().unwrap();
        state.payout_counter += 1;
        let fee = state.payout_fee;
        let tx_id = format!("payout-tx-{}", state.payout_counter);
        let tx_hex = format!("payout-hex-{}", state.payout_counter);
        let output_sum: u64 = destinations.iter().map(|destination| destination.amount).sum();

        state.hex_to_tx_id.insert(tx_hex.clone(), tx_id.clone());
        state.descriptions.insert(
            tx_hex.clone(),
            TxDescription {
                num_transfers: 1,
                destinations: destinations.clone(),
                change_address: None,
                change_amount: 0,
                fee,
                output_sum,
            },
        );
        state.txs.insert(
            tx_id.clone(),
            TxInfo {
                tx_id: tx_id.clone(),
                confirmations: 0,
                height: None,
                incoming_amount: 0,
            },
        );

        Ok(CreatedTx {
            tx_id,
            tx_hex,
            fee,
            destinations,
            change_amount: 0,
        })
    }

    fn describe_tx(&self, tx_hex: &str) -> Result<TxDescription, TriEscrowError> {
        self.chain
            .state
            .lock()
            .unwrap()
            .descriptions
            .get(tx_hex)
            .cloned()
            .ok_or_else(|| TriEscrowError::Wallet(format!("cannot decode tx hex {}", tx_hex)))
    }

    fn sign_tx(&self, tx_hex: &str) -> Result<SignedTx, TriEscrowError> {
        let state = self.chain.state.lock().unwrap();
        let tx_id = state
            .hex_to_tx_id
            .get(tx_hex)
            .cloned()
            .ok_or_else(|| TriEscrowError::Wallet(format!("cannot sign unknown hex {}", tx_hex)))?;
        Ok(SignedTx {
            tx_id,
            tx_hex: tx_hex.to_string(),
        })
    }

    fn submit_tx(&self, tx_hex: &str) -> Result<String, TriEscrowError> {
        let mut state = self.chain.state.lock().unwrap();
        let tx_id = state
            .hex_to_tx_id
            .get(tx_hex)
            .cloned()
            .ok_or_else(|| TriEscrowError::Wallet(format!("cannot submit unknown hex {}", tx_hex)))?;
        if !state.submitted.contains(&tx_hex.to_string()) {
            state.submitted.push(tx_hex.to_string());
        }
        Ok(tx_id)
    }

    fn flush(&self) -> Result<(), TriEscrowError> {
        Ok(())
    }
}

pub struct StubEscrowWalletFactory {
    chain: StubChain,
}

impl StubEscrowWalletFactory {
    pub fn new(chain: StubChain) -> Self {
        Self { chain }
    }
}

impl EscrowWalletFactory for StubEscrowWalletFactory {
    fn open_escrow_wallet(
        &self,
        _trade_id: Uuid,
    ) -> Result<Arc<dyn EscrowWallet>, TriEscrowError> {
        Ok(Arc::new(StubEscrowWallet::new(self.chain.clone())))
    }

    fn close_escrow_wallet(&self, _trade_id: Uuid) -> Result<(), TriEscrowError> {
        Ok(())
    }

    fn delete_escrow_wallet(&self, _trade_id: Uuid) -> Result<(), TriEscrowError> {
        Ok(())
    }
}

#[derive(Default)]
pub struct StubWalletBackend {
    pub frozen: Mutex<Vec<String>>,
    pub known_addresses: Mutex<HashSet<String>>,
    pub height: Mutex<u64>,
}

impl StubWalletBackend {
    pub fn with_known_addresses(addresses: &[&str]) -> Self {
        let backend = Self::default();
        {
            let mut known = backend.known_addresses.lock().unwrap();
            for address in addresses {
                known.insert(address.to_string());
            }
        }
        backend
    }
}

impl WalletBackend for StubWalletBackend {
    fn height(&self) -> Result<u64, TriEscrowError> {
        Ok(*self.height.lock().unwrap())
    }

    fn freeze_output(&self, key_image: &str) -> Result<(), TriEscrowError> {
        self.frozen.lock().unwrap().push(key_image.to_string());
        Ok(())
    }

    fn thaw_output(&self, key_image: &str) -> Result<(), TriEscrowError> {
        self.frozen
            .lock()
            .unwrap()
            .retain(|frozen| frozen != key_image);
        Ok(())
    }

    fn frozen_outputs(&self) -> Result<Vec<String>, TriEscrowError> {
        Ok(self.frozen.lock().unwrap().clone())
    }

    fn has_address(&self, address: &str) -> Result<bool, TriEscrowError> {
        Ok(self.known_addresses.lock().unwrap().contains(address))
    }
}

#[derive(Default)]
pub struct StubOfferBook {
    offers: Mutex<HashMap<Uuid, OpenOffer>>,
    maker_accounts: Mutex<HashMap<Uuid, TradeAccountDetails>>,
    reserved: Mutex<HashSet<Uuid>>,
}

impl StubOfferBook {
    pub fn with_offer(offer: OpenOffer, maker_account: Option<TradeAccountDetails>) -> Self {
        let book = Self::default();
        if let Some(maker_account) = maker_account {
            book.maker_accounts
                .lock()
                .unwrap()
                .insert(offer.id, maker_account);
        }
        book.offers.lock().unwrap().insert(offer.id, offer);
        book
    }

    pub fn is_reserved(&self, offer_id: Uuid) -> bool {
        self.reserved.lock().unwrap().contains(&offer_id)
    }
}

impl OfferBookAccess for StubOfferBook {
    fn get_open_offer(&self, offer_id: Uuid) -> Result<Option<OpenOffer>, TriEscrowError> {
        let offers = self.offers.lock().unwrap();
        let reserved = self.reserved.lock().unwrap();
        Ok(offers.get(&offer_id).map(|offer| {
            let mut offer = offer.clone();
            if reserved.contains(&offer_id) {
                offer.status = OfferStatus::Reserved;
            }
            offer
        }))
    }

    fn reserve_offer(&self, offer_id: Uuid) -> Result<(), TriEscrowError> {
        self.reserved.lock().unwrap().insert(offer_id);
        Ok(())
    }

    fn unreserve_offer(&self, offer_id: Uuid) -> Result<(), TriEscrowError> {
        self.reserved.lock().unwrap().remove(&offer_id);
        Ok(())
    }

    fn maker_account(
        &self,
        offer_id: Uuid,
    ) -> Result<Option<TradeAccountDetails>, TriEscrowError> {
        Ok(self.maker_accounts.lock().unwrap().get(&offer_id).cloned())
    }

    fn reserved_key_images(&self) -> Result<Vec<String>, TriEscrowError> {
        let offers = self.offers.lock().unwrap();
        Ok(offers
            .values()
            .flat_map(|offer| offer.reserve_tx_key_images.iter().cloned())
            .collect())
    }
}
