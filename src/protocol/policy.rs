use crate::common::{error::TriEscrowError, types::TradeRole};

/// Role-specific payout amount rule, selected once at protocol
/// construction. Keeps role conditionals out of the state machine.
pub trait PayoutAmountPolicy: Send + Sync {
    fn expected_payout(
        &self,
        security_deposit: u64,
        trade_amount: u64,
    ) -> Result<u64, TriEscrowError>;
}

pub struct BuyerPayoutPolicy;

impl PayoutAmountPolicy for BuyerPayoutPolicy {
    fn expected_payout(
        &self,
        security_deposit: u64,
        trade_amount: u64,
    ) -> Result<u64, TriEscrowError> {
        Ok(security_deposit + trade_amount)
    }
}

pub struct SellerPayoutPolicy;

impl PayoutAmountPolicy for SellerPayoutPolicy {
    fn expected_payout(
        &self,
        security_deposit: u64,
        _trade_amount: u64,
    ) -> Result<u64, TriEscrowError> {
        Ok(security_deposit)
    }
}

pub struct ArbitratorPayoutPolicy;

impl PayoutAmountPolicy for ArbitratorPayoutPolicy {
    fn expected_payout(
        &self,
        _security_deposit: u64,
        _trade_amount: u64,
    ) -> Result<u64, TriEscrowError> {
        Err(TriEscrowError::Simple(
            "arbitrator has no payout to compute".to_string(),
        ))
    }
}

pub fn payout_policy_for(role: TradeRole) -> Box<dyn PayoutAmountPolicy> {
    match role {
        TradeRole::BuyerAsMaker | TradeRole::BuyerAsTaker => Box::new(BuyerPayoutPolicy),
        TradeRole::SellerAsMaker | TradeRole::SellerAsTaker => Box::new(SellerPayoutPolicy),
        TradeRole::Arbitrator => Box::new(ArbitratorPayoutPolicy),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buyer_payout_is_deposit_plus_amount() {
        let policy = payout_policy_for(TradeRole::BuyerAsTaker);
        assert_eq!(policy.expected_payout(150, 1000).unwrap(), 1150);
    }

    #[test]
    fn seller_payout_is_deposit_only() {
        let policy = payout_policy_for(TradeRole::SellerAsMaker);
        assert_eq!(policy.expected_payout(150, 1000).unwrap(), 150);
    }

    #[test]
    fn arbitrator_payout_is_rejected() {
        let policy = payout_policy_for(TradeRole::Arbitrator);
        assert!(policy.expected_payout(150, 1000).is_err());
    }
}
