use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString, IntoStaticStr};

/// Coarse stage of a trade. Strictly ordered; the state machine never
/// lowers the phase once reached.
#[derive(
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Clone,
    Copy,
    Debug,
    EnumString,
    Display,
    IntoStaticStr,
)]
pub enum Phase {
    Init,
    DepositRequested,
    DepositsPublished,
    DepositsConfirmed,
    DepositsUnlocked,
    PaymentSent,
    PaymentReceived,
    PayoutPublished,
    Withdrawn,
}

impl Phase {
    pub fn ordinal(&self) -> usize {
        *self as usize
    }

    /// A transition is valid when it raises the phase. Same-phase detail
    /// changes are allowed separately by the state machine.
    pub fn is_valid_transition_to(&self, new_phase: Phase) -> bool {
        new_phase.ordinal() > self.ordinal()
    }
}

/// Fine-grained trade state. Every value belongs to exactly one `Phase`.
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
pub enum State {
    PreparationStarted,
    MultisigPrepared,
    MultisigMade,
    MultisigExchanged,
    ContractSignatureRequested,
    ContractSigned,
    SentDepositRequest,
    SawDepositRequest,
    DepositTxsSeenInNetwork,
    DepositTxsConfirmedInBlockchain,
    DepositTxsUnlockedInBlockchain,
    BuyerConfirmedPaymentSent,
    BuyerSentPaymentSentMsg,
    SellerReceivedPaymentSentMsg,
    SellerConfirmedPaymentReceipt,
    SellerSentPaymentReceivedMsg,
    BuyerReceivedPaymentReceivedMsg,
    PayoutTxPublished,
    SawPayoutTxInNetwork,
    WithdrawCompleted,
}

impl State {
    pub fn phase(&self) -> Phase {
        match self {
            State::PreparationStarted
            | State::MultisigPrepared
            | State::MultisigMade
            | State::MultisigExchanged
            | State::ContractSignatureRequested
            | State::ContractSigned => Phase::Init,

            State::SentDepositRequest | State::SawDepositRequest => Phase::DepositRequested,

            State::DepositTxsSeenInNetwork => Phase::DepositsPublished,
            State::DepositTxsConfirmedInBlockchain => Phase::DepositsConfirmed,
            State::DepositTxsUnlockedInBlockchain => Phase::DepositsUnlocked,

            State::BuyerConfirmedPaymentSent
            | State::BuyerSentPaymentSentMsg
            | State::SellerReceivedPaymentSentMsg => Phase::PaymentSent,

            State::SellerConfirmedPaymentReceipt
            | State::SellerSentPaymentReceivedMsg
            | State::BuyerReceivedPaymentReceivedMsg => Phase::PaymentReceived,

            State::PayoutTxPublished | State::SawPayoutTxInNetwork => Phase::PayoutPublished,

            State::WithdrawCompleted => Phase::Withdrawn,
        }
    }
}

/// Dispute escalation axis. Orthogonal to `State`/`Phase` and advances
/// independently of normal trade progress.
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
pub enum DisputeState {
    NoDispute,
    MediationRequested,
    MediationStartedByPeer,
    MediationClosed,
    RefundRequested,
    RefundRequestStartedByPeer,
    RefundRequestClosed,
    ArbitrationRequested,
    ArbitrationStartedByPeer,
    ArbitrationClosed,
}

impl DisputeState {
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            DisputeState::MediationClosed
                | DisputeState::RefundRequestClosed
                | DisputeState::ArbitrationClosed
        )
    }

    pub fn is_open(&self) -> bool {
        *self != DisputeState::NoDispute && !self.is_closed()
    }
}

/// The kind of dispute a participant opens. Maps onto the requested /
/// started-by-peer / closed sub-sequence of `DisputeState`.
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
pub enum DisputeKind {
    Mediation,
    RefundRequest,
    Arbitration,
}

impl DisputeKind {
    pub fn requested_state(&self) -> DisputeState {
        match self {
            DisputeKind::Mediation => DisputeState::MediationRequested,
            DisputeKind::RefundRequest => DisputeState::RefundRequested,
            DisputeKind::Arbitration => DisputeState::ArbitrationRequested,
        }
    }

    pub fn closed_state(&self) -> DisputeState {
        match self {
            DisputeKind::Mediation => DisputeState::MediationClosed,
            DisputeKind::RefundRequest => DisputeState::RefundRequestClosed,
            DisputeKind::Arbitration => DisputeState::ArbitrationClosed,
        }
    }
}

/// Where the trade sits inside its allowed payment window, relative to
/// deposit confirmation time and the payment method's maximum period.
/// Advisory; nothing protocol-enforced hangs off it.
#[derive(
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Clone,
    Copy,
    Debug,
    EnumString,
    Display,
    IntoStaticStr,
)]
pub enum TradePeriodState {
    FirstHalf,
    SecondHalf,
    TradePeriodOver,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_transition_only_raises() {
        assert!(Phase::Init.is_valid_transition_to(Phase::DepositRequested));
        assert!(Phase::Init.is_valid_transition_to(Phase::Withdrawn));
        assert!(!Phase::DepositsConfirmed.is_valid_transition_to(Phase::DepositsConfirmed));
        assert!(!Phase::PaymentSent.is_valid_transition_to(Phase::DepositsUnlocked));
    }

    #[test]
    fn every_state_maps_to_one_phase() {
        assert_eq!(State::ContractSigned.phase(), Phase::Init);
        assert_eq!(State::SentDepositRequest.phase(), Phase::DepositRequested);
        assert_eq!(
            State::DepositTxsUnlockedInBlockchain.phase(),
            Phase::DepositsUnlocked
        );
        assert_eq!(State::BuyerSentPaymentSentMsg.phase(), Phase::PaymentSent);
        assert_eq!(State::SawPayoutTxInNetwork.phase(), Phase::PayoutPublished);
        assert_eq!(State::WithdrawCompleted.phase(), Phase::Withdrawn);
    }

    #[test]
    fn dispute_closed_states_are_terminal() {
        assert!(DisputeState::MediationClosed.is_closed());
        assert!(DisputeState::RefundRequestClosed.is_closed());
        assert!(DisputeState::ArbitrationClosed.is_closed());
        assert!(!DisputeState::ArbitrationRequested.is_closed());
        assert!(DisputeState::ArbitrationRequested.is_open());
        assert!(!DisputeState::NoDispute.is_open());
    }
}
