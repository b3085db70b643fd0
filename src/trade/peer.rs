use secp256k1::XOnlyPublicKey;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString, IntoStaticStr};
use url::Url;

use crate::common::types::{AddressString, FiatPaymentMethod, TxIdString};

/// Which participant slot a peer record describes. Distinct from
/// `TradeRole`: every trade carries all three slots, while a node plays
/// exactly one role.
#[derive(
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    Clone,
    Copy,
    Debug,
    EnumString,
    Display,
    IntoStaticStr,
)]
pub enum PeerSlot {
    Maker,
    Taker,
    Arbitrator,
}

/// Per-participant scratch state accumulated over the trade setup
/// ceremony. Owned exclusively by the trade that created it; never shared
/// across trades.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TradePeer {
    pub pubkey: Option<XOnlyPublicKey>,
    pub node_address: Option<Url>,
    pub account_id: Option<String>,
    pub payment_method: Option<FiatPaymentMethod>,
    pub payment_account_payload_hash: Option<String>,
    pub payout_address: Option<AddressString>,
    pub multisig_hex: Option<String>,
    pub reserve_tx_id: Option<TxIdString>,
    pub reserve_tx_key_images: Vec<String>,
    pub deposit_tx_id: Option<TxIdString>,
    pub deposit_tx_hex: Option<String>,
    pub contract_signature: Option<String>,
}

impl TradePeer {
    pub fn with_pubkey(pubkey: XOnlyPublicKey) -> Self {
        Self {
            pubkey: Some(pubkey),
            ..Self::default()
        }
    }

    /// Everything the contract needs from this participant.
    pub fn has_contract_data(&self) -> bool {
        self.account_id.is_some()
            && self.payment_method.is_some()
            && self.payment_account_payload_hash.is_some()
            && self.payout_address.is_some()
    }
}
