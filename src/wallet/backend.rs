use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[cfg(test)]
use mockall::automock;

use crate::common::{
    error::TriEscrowError,
    types::{AddressString, TxIdString},
};

/// Transaction as seen by a wallet, queried by hash.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TxInfo {
    pub tx_id: TxIdString,
    pub confirmations: u64,
    pub height: Option<u64>,
    pub incoming_amount: u64,
}

impl TxInfo {
    pub fn is_confirmed(&self) -> bool {
        self.confirmations >= 1
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferDestination {
    pub address: AddressString,
    pub amount: u64,
}

/// Decode-only view of a transaction. `output_sum` is the sum over the raw
/// outputs, independent of the parsed destination/change split, so callers
/// can cross-check the wallet's own parsing.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TxDescription {
    pub num_transfers: usize,
    pub destinations: Vec<TransferDestination>,
    pub change_address: Option<AddressString>,
    pub change_amount: u64,
    pub fee: u64,
    pub output_sum: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreatedTx {
    pub tx_id: TxIdString,
    pub tx_hex: String,
    pub fee: u64,
    pub destinations: Vec<TransferDestination>,
    pub change_amount: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignedTx {
    pub tx_id: TxIdString,
    pub tx_hex: String,
}

/// The node's primary wallet. Shared process-wide; frozen-output
/// bookkeeping must always be recomputed from the live reservation set.
#[cfg_attr(test, automock)]
pub trait WalletBackend: Send + Sync {
    fn height(&self) -> Result<u64, TriEscrowError>;
    fn freeze_output(&self, key_image: &str) -> Result<(), TriEscrowError>;
    fn thaw_output(&self, key_image: &str) -> Result<(), TriEscrowError>;
    fn frozen_outputs(&self) -> Result<Vec<String>, TriEscrowError>;
    fn has_address(&self, address: &str) -> Result<bool, TriEscrowError>;
}

/// The 2-of-3 multisig wallet for a single trade. Exclusively used by that
/// trade's protocol handler while the trade is open. All calls block.
#[cfg_attr(test, automock)]
pub trait EscrowWallet: Send + Sync {
    fn primary_address(&self) -> AddressString;
    fn height(&self) -> Result<u64, TriEscrowError>;
    fn fee_estimate(&self) -> Result<u64, TriEscrowError>;
    fn get_tx(&self, tx_id: &str) -> Result<Option<TxInfo>, TriEscrowError>;
    fn incoming_amount(&self, tx_id: &str) -> Result<u64, TriEscrowError>;

    /// Construct a transaction paying `destinations`. Never relays; the
    /// implicit fee is inputs minus outputs and construction fails when
    /// that fee is insufficient for the network.
    fn create_tx(
        &self,
        destinations: Vec<TransferDestination>,
    ) -> Result<CreatedTx, TriEscrowError>;

    fn describe_tx(&self, tx_hex: &str) -> Result<TxDescription, TriEscrowError>;
    fn sign_tx(&self, tx_hex: &str) -> Result<SignedTx, TriEscrowError>;
    fn submit_tx(&self, tx_hex: &str) -> Result<TxIdString, TriEscrowError>;
    fn flush(&self) -> Result<(), TriEscrowError>;
}

/// Opens and disposes the named escrow wallet keyed by trade id. Opening is
/// the expensive step bounded by the manager's restore pool.
#[cfg_attr(test, automock)]
pub trait EscrowWalletFactory: Send + Sync {
    fn open_escrow_wallet(&self, trade_id: Uuid) -> Result<Arc<dyn EscrowWallet>, TriEscrowError>;
    fn close_escrow_wallet(&self, trade_id: Uuid) -> Result<(), TriEscrowError>;
    fn delete_escrow_wallet(&self, trade_id: Uuid) -> Result<(), TriEscrowError>;
}
