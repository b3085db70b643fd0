use iso_currency::Currency;
use secp256k1::XOnlyPublicKey;
use uuid::Uuid;

use crate::common::{
    error::TriEscrowError,
    types::{AddressString, FiatPaymentMethod},
};

use super::Contract;

pub struct ContractBuilder {
    trade_id: Option<Uuid>,
    trade_amount: Option<u64>,
    trade_price: Option<u64>,
    currency: Option<Currency>,
    is_buyer_maker_and_seller_taker: Option<bool>,
    maker_account_id: Option<String>,
    taker_account_id: Option<String>,
    maker_payment_method_id: Option<FiatPaymentMethod>,
    taker_payment_method_id: Option<FiatPaymentMethod>,
    maker_payment_account_payload_hash: Option<String>,
    taker_payment_account_payload_hash: Option<String>,
    maker_pubkey: Option<XOnlyPublicKey>,
    taker_pubkey: Option<XOnlyPublicKey>,
    arbitrator_pubkey: Option<XOnlyPublicKey>,
    maker_payout_address: Option<AddressString>,
    taker_payout_address: Option<AddressString>,
    lock_time: Option<u64>,
}

impl ContractBuilder {
    pub fn new() -> Self {
        Self {
            trade_id: None,
            trade_amount: None,
            trade_price: None,
            currency: None,
            is_buyer_maker_and_seller_taker: None,
            maker_account_id: None,
            taker_account_id: None,
            maker_payment_method_id: None,
            taker_payment_method_id: None,
            maker_payment_account_payload_hash: None,
            taker_payment_account_payload_hash: None,
            maker_pubkey: None,
            taker_pubkey: None,
            arbitrator_pubkey: None,
            maker_payout_address: None,
            taker_payout_address: None,
            lock_time: None,
        }
    }

    pub fn trade_id(&mut self, trade_id: Uuid) -> &mut Self {
        self.trade_id = Some(trade_id);
        self
    }

    pub fn trade_amount(&mut self, trade_amount: u64) -> &mut Self {
        self.trade_amount = Some(trade_amount);
        self
    }

    pub fn trade_price(&mut self, trade_price: u64) -> &mut Self {
        self.trade_price = Some(trade_price);
        self
    }

    pub fn currency(&mut self, currency: Currency) -> &mut Self {
        self.currency = Some(currency);
        self
    }

    pub fn is_buyer_maker_and_seller_taker(&mut self, flag: bool) -> &mut Self {
        self.is_buyer_maker_and_seller_taker = Some(flag);
        self
    }

    pub fn maker_account_id(&mut self, account_id: impl Into<String>) -> &mut Self {
        self.maker_account_id = Some(account_id.into());
        self
    }

    pub fn taker_account_id(&mut self, account_id: impl Into<String>) -> &mut Self {
        self.taker_account_id = Some(account_id.into());
        self
    }

    pub fn maker_payment_method_id(&mut self, method: FiatPaymentMethod) -> &mut Self {
        self.maker_payment_method_id = Some(method);
        self
    }

    pub fn taker_payment_method_id(&mut self, method: FiatPaymentMethod) -> &mut Self {
        self.taker_payment_method_id = Some(method);
        self
    }

    pub fn maker_payment_account_payload_hash(&mut self, hash: impl Into<String>) -> &mut Self {
        self.maker_payment_account_payload_hash = Some(hash.into());
        self
    }

    pub fn taker_payment_account_payload_hash(&mut self, hash: impl Into<String>) -> &mut Self {
        self.taker_payment_account_payload_hash = Some(hash.into());
        self
    }

    pub fn maker_pubkey(&mut self, pubkey: XOnlyPublicKey) -> &mut Self {
        self.maker_pubkey = Some(pubkey);
        self
    }

    pub fn taker_pubkey(&mut self, pubkey: XOnlyPublicKey) -> &mut Self {
        self.taker_pubkey = Some(pubkey);
        self
    }

    pub fn arbitrator_pubkey(&mut self, pubkey: XOnlyPublicKey) -> &mut Self {
        self.arbitrator_pubkey = Some(pubkey);
        self
    }

    pub fn maker_payout_address(&mut self, address: impl Into<AddressString>) -> &mut Self {
        self.maker_payout_address = Some(address.into());
        self
    }

    pub fn taker_payout_address(&mut self, address: impl Into<AddressString>) -> &mut Self {
        self.taker_payout_address = Some(address.into());
        self
    }

    pub fn lock_time(&mut self, lock_time: u64) -> &mut Self {
        self.lock_time = Some(lock_time);
        self
    }

    pub fn build(&self) -> Result<Contract, TriEscrowError> {
        macro_rules! require {
            ($field:ident) => {
                match self.$field.as_ref() {
                    Some(value) => value.to_owned(),
                    None => {
                        return Err(TriEscrowError::Simple(format!(
                            "Contract requires {} to be defined",
                            stringify!($field)
                        )))
                    }
                }
            };
        }

        let maker_payment_method_id = require!(maker_payment_method_id);
        let taker_payment_method_id = require!(taker_payment_method_id);

        if !maker_payment_method_id.accepts_taker_method(taker_payment_method_id) {
            return Err(TriEscrowError::Simple(format!(
                "Contract payment methods must match, maker {} vs taker {}",
                maker_payment_method_id, taker_payment_method_id
            )));
        }

        Ok(Contract {
            trade_id: require!(trade_id),
            trade_amount: require!(trade_amount),
            trade_price: require!(trade_price),
            currency: require!(currency),
            is_buyer_maker_and_seller_taker: require!(is_buyer_maker_and_seller_taker),
            maker_account_id: require!(maker_account_id),
            taker_account_id: require!(taker_account_id),
            maker_payment_method_id,
            taker_payment_method_id,
            maker_payment_account_payload_hash: require!(maker_payment_account_payload_hash),
            taker_payment_account_payload_hash: require!(taker_payment_account_payload_hash),
            maker_pubkey: require!(maker_pubkey),
            taker_pubkey: require!(taker_pubkey),
            arbitrator_pubkey: require!(arbitrator_pubkey),
            maker_payout_address: require!(maker_payout_address),
            taker_payout_address: require!(taker_payout_address),
            lock_time: require!(lock_time),
            _private: (),
        })
    }
}

impl Default for ContractBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    fn some_pubkey(fill: u8) -> XOnlyPublicKey {
        let secp = secp256k1::Secp256k1::new();
        let secret = secp256k1::SecretKey::from_slice(&[fill; 32]).unwrap();
        let keypair = secp256k1::KeyPair::from_secret_key(&secp, &secret);
        XOnlyPublicKey::from_keypair(&keypair).0
    }

    fn some_builder() -> ContractBuilder {
        let mut builder = ContractBuilder::new();
        builder
            .trade_id(Uuid::from_str("20c38e4e-37a8-4ab2-954b-8a7f56904185").unwrap())
            .trade_amount(1_000_000_000_000)
            .trade_price(15_000)
            .currency(Currency::EUR)
            .is_buyer_maker_and_seller_taker(true)
            .maker_account_id("maker-acct")
            .taker_account_id("taker-acct")
            .maker_payment_method_id(FiatPaymentMethod::Sepa)
            .taker_payment_method_id(FiatPaymentMethod::Sepa)
            .maker_payment_account_payload_hash("maker-hash")
            .taker_payment_account_payload_hash("taker-hash")
            .maker_pubkey(some_pubkey(1))
            .taker_pubkey(some_pubkey(2))
            .arbitrator_pubkey(some_pubkey(3))
            .maker_payout_address("maker-payout-addr")
            .taker_payout_address("taker-payout-addr")
            .lock_time(10);
        builder
    }

    #[test]
    fn builds_with_matching_payment_methods() {
        let contract = some_builder().build().unwrap();
        assert_eq!(contract.buyer_payout_address(), "maker-payout-addr");
        assert_eq!(contract.seller_payout_address(), "taker-payout-addr");
        assert_eq!(contract.buyer_pubkey(), &some_pubkey(1));
        assert_eq!(contract.seller_pubkey(), &some_pubkey(2));
    }

    #[test]
    fn role_accessors_flip_with_maker_taker_flag() {
        let mut builder = some_builder();
        builder.is_buyer_maker_and_seller_taker(false);
        let contract = builder.build().unwrap();
        assert_eq!(contract.buyer_payout_address(), "taker-payout-addr");
        assert_eq!(contract.seller_payout_address(), "maker-payout-addr");
    }

    #[test]
    fn sepa_offer_accepts_sepa_instant_taker() {
        let mut builder = some_builder();
        builder.taker_payment_method_id(FiatPaymentMethod::SepaInstant);
        assert!(builder.build().is_ok());
    }

    #[test]
    fn mismatched_payment_methods_rejected() {
        let mut builder = some_builder();
        builder.taker_payment_method_id(FiatPaymentMethod::Zelle);
        assert!(builder.build().is_err());
    }

    #[test]
    fn identical_inputs_build_identical_contracts() {
        let contract_a = some_builder().build().unwrap();
        let contract_b = some_builder().build().unwrap();
        assert_eq!(contract_a, contract_b);
        assert_eq!(contract_a.hash(), contract_b.hash());
        assert!(contract_a.diff(&contract_b).is_empty());
    }

    #[test]
    fn diff_names_divergent_fields() {
        let contract_a = some_builder().build().unwrap();
        let mut builder = some_builder();
        builder.taker_payout_address("substituted-addr");
        let contract_b = builder.build().unwrap();

        let diffs = contract_a.diff(&contract_b);
        assert_eq!(diffs.len(), 1);
        assert!(diffs[0].starts_with("taker_payout_address"));
        assert_ne!(contract_a.hash(), contract_b.hash());
    }
}
