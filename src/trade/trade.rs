use std::path::Path;

use iso_currency::Currency;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    common::{
        error::TriEscrowError,
        types::{Direction, FiatPaymentMethod, TradeRole, TxIdString},
    },
    contract::{Contract, ContractBuilder},
};

use super::{
    DisputeState, PeerSlot, Phase, State, TradeData, TradeDataStore, TradePeer, TradePeriodState,
};

/// Inputs for a freshly created trade. The uid is assigned here, not by
/// the caller; several trade attempts may share an offer id across
/// retries, so the uid is what keys the protocol instance.
pub struct NewTradeParams {
    pub id: Uuid,
    pub role: TradeRole,
    pub direction: Direction,
    pub amount: u64,
    pub price: u64,
    pub taker_fee: u64,
    pub buyer_security_deposit: u64,
    pub seller_security_deposit: u64,
    pub currency: Currency,
    pub payment_method: FiatPaymentMethod,
    pub lock_time: u64,
    pub take_offer_date: u64,
    pub maker: TradePeer,
    pub taker: TradePeer,
    pub arbitrator: TradePeer,
}

/// Read-only view of a trade handed across the manager API. Predicates
/// are recomputed from the enums, never stored as flags.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TradeSnapshot {
    pub id: Uuid,
    pub uid: Uuid,
    pub role: TradeRole,
    pub direction: Direction,
    pub amount: u64,
    pub price: u64,
    pub state: State,
    pub phase: Phase,
    pub dispute_state: DisputeState,
    pub period_state: TradePeriodState,
    pub contract_hash: Option<String>,
    pub payout_tx_id: Option<TxIdString>,
    pub maker: TradePeer,
    pub taker: TradePeer,
    pub arbitrator: TradePeer,
    pub error_message: Option<String>,
    pub failed: bool,
    pub is_funds_locked_in: bool,
    pub is_payout_published: bool,
    pub is_completed: bool,
}

/// The long-lived trade aggregate: state machine, peers, contract and
/// payout bookkeeping over a persisted store.
pub struct Trade {
    data: TradeData,
}

impl Trade {
    pub fn new(dir_path: impl AsRef<Path>, params: NewTradeParams) -> Self {
        let store = TradeDataStore {
            id: params.id,
            uid: Uuid::new_v4(),
            role: params.role,
            direction: params.direction,
            amount: params.amount,
            price: params.price,
            taker_fee: params.taker_fee,
            buyer_security_deposit: params.buyer_security_deposit,
            seller_security_deposit: params.seller_security_deposit,
            currency: params.currency,
            payment_method: params.payment_method,
            lock_time: params.lock_time,
            take_offer_date: params.take_offer_date,
            maker: params.maker,
            taker: params.taker,
            arbitrator: params.arbitrator,
            state: State::PreparationStarted,
            dispute_state: DisputeState::NoDispute,
            period_state: TradePeriodState::FirstHalf,
            deposit_confirmed_at: None,
            unlock_height: None,
            contract: None,
            contract_hash: None,
            payout_tx_id: None,
            payout_tx_hex: None,
            error_message: None,
            failed: false,
        };
        let data = TradeData::new(dir_path, store);
        Self { data }
    }

    pub fn restore(data_path: impl AsRef<Path>) -> Result<(Uuid, Self), TriEscrowError> {
        let (trade_uid, data) = TradeData::restore(data_path)?;
        Ok((trade_uid, Self { data }))
    }

    pub fn id(&self) -> Uuid {
        self.data.trade_id
    }

    pub fn uid(&self) -> Uuid {
        self.data.trade_uid
    }

    pub fn data(&self) -> &TradeData {
        &self.data
    }

    pub(crate) fn data_mut(&mut self) -> &mut TradeData {
        &mut self.data
    }

    pub fn role(&self) -> TradeRole {
        self.data.role()
    }

    pub fn state(&self) -> State {
        self.data.state()
    }

    pub fn phase(&self) -> Phase {
        self.data.state().phase()
    }

    pub fn dispute_state(&self) -> DisputeState {
        self.data.dispute_state()
    }

    // State machine

    /// Applies `new_state` only when it keeps the phase or raises it.
    /// A backward-phase attempt is logged and ignored, never applied and
    /// never an error; duplicate and out-of-order messages are expected
    /// under retry-based delivery.
    pub fn set_state_if_valid_transition(&mut self, new_state: State) -> bool {
        let current_state = self.data.state();
        let current_phase = current_state.phase();
        let new_phase = new_state.phase();

        if current_phase.is_valid_transition_to(new_phase) || new_phase == current_phase {
            debug!(
                "Trade w/ TradeUUID {} state {} -> {}",
                self.data.trade_uid, current_state, new_state
            );
            self.data.set_state(new_state);
            true
        } else {
            warn!(
                "Trade w/ TradeUUID {} ignoring transition {} -> {} which would lower phase {} -> {}",
                self.data.trade_uid, current_state, new_state, current_phase, new_phase
            );
            false
        }
    }

    pub fn set_dispute_state(&mut self, dispute_state: DisputeState) {
        debug!(
            "Trade w/ TradeUUID {} dispute state {} -> {}",
            self.data.trade_uid,
            self.data.dispute_state(),
            dispute_state
        );
        self.data.set_dispute_state(dispute_state);
    }

    // Derived predicates. Computed from phase ordinals and the dispute
    // axis only, so a reloaded trade answers identically without replay.

    pub fn is_deposit_published(&self) -> bool {
        self.phase() >= Phase::DepositsPublished
    }

    pub fn is_deposit_confirmed(&self) -> bool {
        self.phase() >= Phase::DepositsConfirmed
    }

    pub fn is_deposit_unlocked(&self) -> bool {
        self.phase() >= Phase::DepositsUnlocked
    }

    pub fn is_payment_sent(&self) -> bool {
        self.phase() >= Phase::PaymentSent
    }

    pub fn is_payment_received(&self) -> bool {
        self.phase() >= Phase::PaymentReceived
    }

    pub fn is_payout_published(&self) -> bool {
        self.phase() >= Phase::PayoutPublished
    }

    pub fn is_completed(&self) -> bool {
        self.phase() == Phase::Withdrawn
    }

    /// Funds count as locked in from first deposit publication until
    /// payout publication or a closing dispute resolution. Gates escrow
    /// wallet deletion and silent trade removal.
    pub fn is_funds_locked_in(&self) -> bool {
        self.is_deposit_published()
            && !self.is_payout_published()
            && !self.data.dispute_state().is_closed()
    }

    /// True once this node has paid anything the network keeps: its
    /// reserve tx, or published deposits.
    pub fn is_fee_paid(&self) -> bool {
        let own = self.data.peer(self.own_slot());
        own.reserve_tx_id.is_some() || self.is_deposit_published()
    }

    pub fn has_failed(&self) -> bool {
        self.data.failed()
    }

    pub fn error_message(&self) -> Option<String> {
        self.data.error_message()
    }

    pub fn fail(&mut self, error_message: impl Into<String>) {
        self.data.set_error_message(error_message);
        self.data.set_failed(true);
    }

    pub fn clear_failed(&mut self) {
        self.data.set_failed(false);
    }

    // Role and slot resolution

    pub fn own_slot(&self) -> PeerSlot {
        match self.data.role() {
            TradeRole::BuyerAsMaker | TradeRole::SellerAsMaker => PeerSlot::Maker,
            TradeRole::BuyerAsTaker | TradeRole::SellerAsTaker => PeerSlot::Taker,
            TradeRole::Arbitrator => PeerSlot::Arbitrator,
        }
    }

    pub fn is_buyer_maker_and_seller_taker(&self) -> bool {
        self.data.direction() == Direction::Buy
    }

    pub fn buyer_slot(&self) -> PeerSlot {
        if self.is_buyer_maker_and_seller_taker() {
            PeerSlot::Maker
        } else {
            PeerSlot::Taker
        }
    }

    pub fn seller_slot(&self) -> PeerSlot {
        if self.is_buyer_maker_and_seller_taker() {
            PeerSlot::Taker
        } else {
            PeerSlot::Maker
        }
    }

    pub fn buyer_deposit_tx_id(&self) -> Option<TxIdString> {
        self.data.peer(self.buyer_slot()).deposit_tx_id
    }

    pub fn seller_deposit_tx_id(&self) -> Option<TxIdString> {
        self.data.peer(self.seller_slot()).deposit_tx_id
    }

    // Trade period

    /// Recomputes the period state from wall-clock time. Monotonic; the
    /// period never moves backwards even if fed a stale clock.
    pub fn update_period_state(&mut self, now_secs: u64) -> TradePeriodState {
        let current = self.data.period_state();
        let confirmed_at = match self.data.deposit_confirmed_at() {
            Some(at) => at,
            None => return current,
        };

        let max_period = self.data.payment_method().max_trade_period().as_secs();
        let elapsed = now_secs.saturating_sub(confirmed_at);

        let computed = if elapsed >= max_period {
            TradePeriodState::TradePeriodOver
        } else if elapsed >= max_period / 2 {
            TradePeriodState::SecondHalf
        } else {
            TradePeriodState::FirstHalf
        };

        let next = current.max(computed);
        if next != current {
            debug!(
                "Trade w/ TradeUUID {} period state {} -> {}",
                self.data.trade_uid, current, next
            );
            self.data.set_period_state(next);
        }
        next
    }

    // Contract

    /// Deterministically assembles the contract from the offer terms and
    /// both sides' exchanged data. Maker and taker must arrive at
    /// field-for-field identical contracts from the same inputs; the hash
    /// exchange catches any divergence.
    pub fn create_contract(&self) -> Result<Contract, TriEscrowError> {
        let maker = self.data.peer(PeerSlot::Maker);
        let taker = self.data.peer(PeerSlot::Taker);
        let arbitrator = self.data.peer(PeerSlot::Arbitrator);

        if !maker.has_contract_data() || !taker.has_contract_data() {
            return Err(TriEscrowError::Simple(format!(
                "Trade w/ TradeUUID {} missing peer data for contract",
                self.data.trade_uid
            )));
        }

        let (maker_pubkey, taker_pubkey, arbitrator_pubkey) =
            match (maker.pubkey, taker.pubkey, arbitrator.pubkey) {
                (Some(m), Some(t), Some(a)) => (m, t, a),
                _ => {
                    return Err(TriEscrowError::Simple(format!(
                        "Trade w/ TradeUUID {} missing participant pubkeys for contract",
                        self.data.trade_uid
                    )))
                }
            };

        let contract = ContractBuilder::new()
            .trade_id(self.data.trade_id)
            .trade_amount(self.data.amount())
            .trade_price(self.data.price())
            .currency(self.data.currency())
            .is_buyer_maker_and_seller_taker(self.is_buyer_maker_and_seller_taker())
            .maker_account_id(maker.account_id.unwrap_or_default())
            .taker_account_id(taker.account_id.unwrap_or_default())
            .maker_payment_method_id(maker.payment_method.unwrap_or_else(|| {
                self.data.payment_method()
            }))
            .taker_payment_method_id(taker.payment_method.unwrap_or_else(|| {
                self.data.payment_method()
            }))
            .maker_payment_account_payload_hash(
                maker.payment_account_payload_hash.unwrap_or_default(),
            )
            .taker_payment_account_payload_hash(
                taker.payment_account_payload_hash.unwrap_or_default(),
            )
            .maker_pubkey(maker_pubkey)
            .taker_pubkey(taker_pubkey)
            .arbitrator_pubkey(arbitrator_pubkey)
            .maker_payout_address(maker.payout_address.unwrap_or_default())
            .taker_payout_address(taker.payout_address.unwrap_or_default())
            .lock_time(self.data.lock_time())
            .build()?;

        Ok(contract)
    }

    pub fn snapshot(&self) -> TradeSnapshot {
        TradeSnapshot {
            id: self.data.trade_id,
            uid: self.data.trade_uid,
            role: self.data.role(),
            direction: self.data.direction(),
            amount: self.data.amount(),
            price: self.data.price(),
            state: self.data.state(),
            phase: self.phase(),
            dispute_state: self.data.dispute_state(),
            period_state: self.data.period_state(),
            contract_hash: self.data.contract_hash(),
            payout_tx_id: self.data.payout_tx_id(),
            maker: self.data.peer(PeerSlot::Maker),
            taker: self.data.peer(PeerSlot::Taker),
            arbitrator: self.data.peer(PeerSlot::Arbitrator),
            error_message: self.data.error_message(),
            failed: self.data.failed(),
            is_funds_locked_in: self.is_funds_locked_in(),
            is_payout_published: self.is_payout_published(),
            is_completed: self.is_completed(),
        }
    }

    pub(crate) fn terminate(self) {
        self.data.terminate()
    }
}
