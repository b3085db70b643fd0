use dyn_clone::DynClone;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString, IntoStaticStr};

use std::any::Any;
use std::fmt::Debug;
use std::time::Duration;

pub type TxIdString = String;
pub type AddressString = String;

/// Direction of the offer from the maker's point of view. A `Buy` offer
/// means the maker buys the escrowed coin and pays fiat, so the maker is
/// the buyer and the taker is the seller.
#[derive(
    Serialize, Deserialize, PartialEq, Eq, Hash, Clone, Copy, Debug, EnumString, Display,
    IntoStaticStr,
)]
pub enum Direction {
    Buy,
    Sell,
}

impl Direction {
    pub fn inverted(&self) -> Direction {
        match self {
            Direction::Buy => Direction::Sell,
            Direction::Sell => Direction::Buy,
        }
    }
}

/// Role this node plays in a trade, fixed at trade creation. Buyer/seller
/// follows from the offer direction; behavior differences hang off this
/// enum instead of runtime type checks.
#[derive(
    Serialize, Deserialize, PartialEq, Eq, Hash, Clone, Copy, Debug, EnumString, Display,
    IntoStaticStr,
)]
pub enum TradeRole {
    BuyerAsMaker,
    BuyerAsTaker,
    SellerAsMaker,
    SellerAsTaker,
    Arbitrator,
}

impl TradeRole {
    /// Maker of a `Buy` offer buys the escrowed coin; the taker takes the
    /// opposite side.
    pub fn for_maker(direction: Direction) -> TradeRole {
        match direction {
            Direction::Buy => TradeRole::BuyerAsMaker,
            Direction::Sell => TradeRole::SellerAsMaker,
        }
    }

    pub fn for_taker(direction: Direction) -> TradeRole {
        match direction {
            Direction::Buy => TradeRole::SellerAsTaker,
            Direction::Sell => TradeRole::BuyerAsTaker,
        }
    }

    pub fn is_maker(&self) -> bool {
        matches!(self, TradeRole::BuyerAsMaker | TradeRole::SellerAsMaker)
    }

    pub fn is_taker(&self) -> bool {
        matches!(self, TradeRole::BuyerAsTaker | TradeRole::SellerAsTaker)
    }

    pub fn is_buyer(&self) -> bool {
        matches!(self, TradeRole::BuyerAsMaker | TradeRole::BuyerAsTaker)
    }

    pub fn is_seller(&self) -> bool {
        matches!(self, TradeRole::SellerAsMaker | TradeRole::SellerAsTaker)
    }

    pub fn is_arbitrator(&self) -> bool {
        matches!(self, TradeRole::Arbitrator)
    }
}

// Subset of fiat rails this engine has been traded over. Trade limits and
// risk association belong to the higher layers, same as chargeback policy.
#[derive(
    PartialEq, Eq, Hash, Clone, Copy, Debug, Serialize, Deserialize, EnumString, Display,
    IntoStaticStr,
)]
pub enum FiatPaymentMethod {
    Sepa,
    SepaInstant,
    Revolut,
    FasterPayments,
    NationalBank,
    Swish,
    Zelle,
    Pix,
    CashApp,
    Venmo,
}

impl FiatPaymentMethod {
    /// Maximum trade period for this rail. Slow bank rails get days,
    /// instant rails get a day.
    pub fn max_trade_period(&self) -> Duration {
        const DAY: Duration = Duration::from_secs(24 * 60 * 60);
        match self {
            FiatPaymentMethod::Sepa => 6 * DAY,
            FiatPaymentMethod::NationalBank => 4 * DAY,
            FiatPaymentMethod::FasterPayments => DAY,
            FiatPaymentMethod::SepaInstant
            | FiatPaymentMethod::Revolut
            | FiatPaymentMethod::Swish
            | FiatPaymentMethod::Zelle
            | FiatPaymentMethod::Pix
            | FiatPaymentMethod::CashApp
            | FiatPaymentMethod::Venmo => DAY,
        }
    }

    /// A SEPA offer may be taken by a SEPA-INSTANT account. Every other
    /// pairing must be an exact match.
    pub fn accepts_taker_method(&self, taker: FiatPaymentMethod) -> bool {
        if *self == taker {
            return true;
        }
        matches!(
            (self, taker),
            (FiatPaymentMethod::Sepa, FiatPaymentMethod::SepaInstant)
        )
    }
}

#[typetag::serde(tag = "type")]
pub trait SerdeGenericTrait: DynClone + Debug + Send + Sync {
    fn any_ref(&self) -> &dyn Any;
}

dyn_clone::clone_trait_object!(SerdeGenericTrait);

impl dyn SerdeGenericTrait {
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.any_ref().downcast_ref()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SerdeGenericsPlaceholder {}

#[typetag::serde(name = "tri-escrow-placeholder")]
impl SerdeGenericTrait for SerdeGenericsPlaceholder {
    fn any_ref(&self) -> &dyn Any {
        self
    }
}

/// Payment-account payload as relayed between peers. The concrete account
/// details stay polymorphic; the contract only ever binds their hash.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PaymentAccountPayload {
    pub payment_method: FiatPaymentMethod,
    pub account_id: String,
    pub details: Box<dyn SerdeGenericTrait>,
}

impl PaymentAccountPayload {
    /// Hash over the canonical JSON encoding. Both sides bind this into the
    /// contract without ever exchanging the raw account details in it.
    pub fn payload_hash(&self) -> String {
        let json = serde_json::to_string(self).expect("payment account payload must serialize");
        sha256::digest(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sepa_accepts_sepa_instant_taker() {
        assert!(FiatPaymentMethod::Sepa.accepts_taker_method(FiatPaymentMethod::SepaInstant));
    }

    #[test]
    fn sepa_instant_does_not_accept_sepa_taker() {
        assert!(!FiatPaymentMethod::SepaInstant.accepts_taker_method(FiatPaymentMethod::Sepa));
    }

    #[test]
    fn zelle_accepts_only_zelle() {
        assert!(FiatPaymentMethod::Zelle.accepts_taker_method(FiatPaymentMethod::Zelle));
        assert!(!FiatPaymentMethod::Zelle.accepts_taker_method(FiatPaymentMethod::Venmo));
    }

    #[test]
    fn payload_hash_is_deterministic() {
        let payload = PaymentAccountPayload {
            payment_method: FiatPaymentMethod::Sepa,
            account_id: "acct-1".to_string(),
            details: Box::new(SerdeGenericsPlaceholder {}),
        };
        assert_eq!(payload.payload_hash(), payload.payload_hash());
    }
}
