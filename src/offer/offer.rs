use iso_currency::Currency;
use secp256k1::XOnlyPublicKey;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString, IntoStaticStr};
use uuid::Uuid;

#[cfg(test)]
use mockall::automock;

use crate::common::{
    error::TriEscrowError,
    types::{AddressString, Direction, FiatPaymentMethod, TxIdString},
};

#[derive(
    Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Debug, EnumString, Display, IntoStaticStr,
)]
pub enum OfferStatus {
    Available,
    Reserved,
}

/// An open offer as published to the book. Immutable once a trade begins;
/// trades borrow it read-only and never own it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OpenOffer {
    pub id: Uuid,
    pub direction: Direction,
    pub amount: u64,
    pub price: u64,
    pub currency: Currency,
    pub payment_method: FiatPaymentMethod,
    pub maker_deposit_pct: u64,
    pub taker_deposit_pct: u64,
    pub owner_pubkey: XOnlyPublicKey,
    pub arbitrator_pubkey: XOnlyPublicKey,
    pub status: OfferStatus,
    pub reserve_tx_key_images: Vec<String>,
}

impl OpenOffer {
    pub fn is_available(&self) -> bool {
        self.status == OfferStatus::Available
    }

    pub fn maker_deposit_amount(&self) -> u64 {
        self.amount * self.maker_deposit_pct / 100
    }

    pub fn taker_deposit_amount(&self) -> u64 {
        self.amount * self.taker_deposit_pct / 100
    }
}

/// A participant's own payment-account binding for one trade: identity of
/// the fiat account, its payload hash, and where the payout should land.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TradeAccountDetails {
    pub account_id: String,
    pub payment_method: FiatPaymentMethod,
    pub payment_account_payload_hash: String,
    pub payout_address: AddressString,
    pub reserve_tx_id: Option<TxIdString>,
    pub reserve_tx_key_images: Vec<String>,
}

/// Boundary to the offer book. Listing and matching live outside this
/// crate; the trade engine only resolves, reserves and releases offers.
#[cfg_attr(test, automock)]
pub trait OfferBookAccess: Send + Sync {
    fn get_open_offer(&self, offer_id: Uuid) -> Result<Option<OpenOffer>, TriEscrowError>;
    fn reserve_offer(&self, offer_id: Uuid) -> Result<(), TriEscrowError>;
    fn unreserve_offer(&self, offer_id: Uuid) -> Result<(), TriEscrowError>;

    /// The maker's own payment-account binding for an offer it published.
    fn maker_account(&self, offer_id: Uuid)
        -> Result<Option<TradeAccountDetails>, TriEscrowError>;

    /// Key images currently backing open-offer reservations. Consulted by
    /// the frozen-output reconciliation at startup.
    fn reserved_key_images(&self) -> Result<Vec<String>, TriEscrowError>;
}
