use std::str::FromStr;

use iso_currency::Currency;
use secp256k1::{KeyPair, Secp256k1, SecretKey, XOnlyPublicKey};
use uuid::Uuid;

use crate::{
    common::types::{
        Direction, FiatPaymentMethod, PaymentAccountPayload, SerdeGenericsPlaceholder,
    },
    offer::{OfferStatus, OpenOffer, TradeAccountDetails},
};

pub struct SomeTestParams {}

impl SomeTestParams {
    pub fn maker_private_key() -> SecretKey {
        SecretKey::from_slice(&[0x11; 32]).unwrap()
    }

    pub fn taker_private_key() -> SecretKey {
        SecretKey::from_slice(&[0x22; 32]).unwrap()
    }

    pub fn arbitrator_private_key() -> SecretKey {
        SecretKey::from_slice(&[0x33; 32]).unwrap()
    }

    pub fn pubkey_for(key: SecretKey) -> XOnlyPublicKey {
        let secp = Secp256k1::new();
        XOnlyPublicKey::from_keypair(&KeyPair::from_secret_key(&secp, &key)).0
    }

    pub fn maker_pubkey() -> XOnlyPublicKey {
        Self::pubkey_for(Self::maker_private_key())
    }

    pub fn taker_pubkey() -> XOnlyPublicKey {
        Self::pubkey_for(Self::taker_private_key())
    }

    pub fn arbitrator_pubkey() -> XOnlyPublicKey {
        Self::pubkey_for(Self::arbitrator_private_key())
    }
}

pub struct SomeTestOfferParams {}

impl SomeTestOfferParams {
    pub fn some_uuid() -> Uuid {
        Uuid::from_str("20c38e4e-37a8-4ab2-954b-8a7f56904185").unwrap()
    }

    /// 1.0 coin in atomic units.
    pub fn some_amount() -> u64 {
        1_000_000_000_000
    }

    /// 150.00 in fiat minor units.
    pub fn some_price() -> u64 {
        15_000
    }

    pub fn default_buy_offer() -> OpenOffer {
        OpenOffer {
            id: Self::some_uuid(),
            direction: Direction::Buy,
            amount: Self::some_amount(),
            price: Self::some_price(),
            currency: Currency::EUR,
            payment_method: FiatPaymentMethod::Sepa,
            maker_deposit_pct: 15,
            taker_deposit_pct: 15,
            owner_pubkey: SomeTestParams::maker_pubkey(),
            arbitrator_pubkey: SomeTestParams::arbitrator_pubkey(),
            status: OfferStatus::Available,
            reserve_tx_key_images: vec!["maker-reserve-ki".to_string()],
        }
    }

    fn payload_hash_for(account_id: &str) -> String {
        PaymentAccountPayload {
            payment_method: FiatPaymentMethod::Sepa,
            account_id: account_id.to_string(),
            details: Box::new(SerdeGenericsPlaceholder {}),
        }
        .payload_hash()
    }

    pub fn maker_account_details() -> TradeAccountDetails {
        TradeAccountDetails {
            account_id: "maker-sepa-acct".to_string(),
            payment_method: FiatPaymentMethod::Sepa,
            payment_account_payload_hash: Self::payload_hash_for("maker-sepa-acct"),
            payout_address: "maker-payout-addr".to_string(),
            reserve_tx_id: Some("maker-reserve-tx".to_string()),
            reserve_tx_key_images: vec!["maker-reserve-ki".to_string()],
        }
    }

    pub fn taker_account_details() -> TradeAccountDetails {
        TradeAccountDetails {
            account_id: "taker-sepa-acct".to_string(),
            payment_method: FiatPaymentMethod::Sepa,
            payment_account_payload_hash: Self::payload_hash_for("taker-sepa-acct"),
            payout_address: "taker-payout-addr".to_string(),
            reserve_tx_id: Some("taker-reserve-tx".to_string()),
            reserve_tx_key_images: vec!["taker-reserve-ki".to_string()],
        }
    }
}
