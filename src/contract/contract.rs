use iso_currency::Currency;
use secp256k1::XOnlyPublicKey;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::common::types::{AddressString, FiatPaymentMethod};

/// Immutable record of the final agreed trade terms. Built once both
/// parties have exchanged identity and payment data, and reproducible
/// bit-for-bit by maker and taker from the same inputs so the two
/// independently computed contracts hash identically.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contract {
    pub trade_id: Uuid,
    pub trade_amount: u64,
    pub trade_price: u64,
    pub currency: Currency,
    pub is_buyer_maker_and_seller_taker: bool,
    pub maker_account_id: String,
    pub taker_account_id: String,
    pub maker_payment_method_id: FiatPaymentMethod,
    pub taker_payment_method_id: FiatPaymentMethod,
    pub maker_payment_account_payload_hash: String,
    pub taker_payment_account_payload_hash: String,
    pub maker_pubkey: XOnlyPublicKey,
    pub taker_pubkey: XOnlyPublicKey,
    pub arbitrator_pubkey: XOnlyPublicKey,
    pub maker_payout_address: AddressString,
    pub taker_payout_address: AddressString,
    pub lock_time: u64,
    pub(super) _private: (),
}

impl Contract {
    /// Hash over the canonical JSON encoding. Exchanged out-of-band to
    /// detect divergent contracts before anything is signed against one.
    pub fn hash(&self) -> String {
        let json = serde_json::to_string(self).expect("contract must serialize");
        sha256::digest(json)
    }

    // Role-relative accessors resolve through the maker/taker flag rather
    // than storing buyer/seller fields twice.

    pub fn buyer_payout_address(&self) -> &AddressString {
        if self.is_buyer_maker_and_seller_taker {
            &self.maker_payout_address
        } else {
            &self.taker_payout_address
        }
    }

    pub fn seller_payout_address(&self) -> &AddressString {
        if self.is_buyer_maker_and_seller_taker {
            &self.taker_payout_address
        } else {
            &self.maker_payout_address
        }
    }

    pub fn buyer_pubkey(&self) -> &XOnlyPublicKey {
        if self.is_buyer_maker_and_seller_taker {
            &self.maker_pubkey
        } else {
            &self.taker_pubkey
        }
    }

    pub fn seller_pubkey(&self) -> &XOnlyPublicKey {
        if self.is_buyer_maker_and_seller_taker {
            &self.taker_pubkey
        } else {
            &self.maker_pubkey
        }
    }

    pub fn buyer_account_id(&self) -> &str {
        if self.is_buyer_maker_and_seller_taker {
            &self.maker_account_id
        } else {
            &self.taker_account_id
        }
    }

    pub fn seller_account_id(&self) -> &str {
        if self.is_buyer_maker_and_seller_taker {
            &self.taker_account_id
        } else {
            &self.maker_account_id
        }
    }

    /// Field-by-field divergence summary against a peer's contract.
    /// Operational aid for refusing trades whose locally and remotely
    /// computed contracts disagree; not part of the protocol itself.
    pub fn diff(&self, other: &Contract) -> Vec<String> {
        let mut diffs = Vec::new();

        macro_rules! check {
            ($field:ident) => {
                if self.$field != other.$field {
                    diffs.push(format!(
                        "{}: {:?} != {:?}",
                        stringify!($field),
                        self.$field,
                        other.$field
                    ));
                }
            };
        }

        check!(trade_id);
        check!(trade_amount);
        check!(trade_price);
        check!(currency);
        check!(is_buyer_maker_and_seller_taker);
        check!(maker_account_id);
        check!(taker_account_id);
        check!(maker_payment_method_id);
        check!(taker_payment_method_id);
        check!(maker_payment_account_payload_hash);
        check!(taker_payment_account_payload_hash);
        check!(maker_pubkey);
        check!(taker_pubkey);
        check!(arbitrator_pubkey);
        check!(maker_payout_address);
        check!(taker_payout_address);
        check!(lock_time);

        diffs
    }
}
