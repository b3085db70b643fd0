use secp256k1::XOnlyPublicKey;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, IntoStaticStr};
use url::Url;
use uuid::Uuid;

use crate::common::types::{AddressString, FiatPaymentMethod, TxIdString};

/// Decrypted, authenticated trade message as delivered by the transport.
/// `msg_uid` identifies the delivery for acks; `trade_id` routes it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TradeMessageEnvelope {
    pub sender_pubkey: XOnlyPublicKey,
    pub trade_id: Uuid,
    pub msg_uid: Uuid,
    pub message: TradeMessage,
}

#[derive(Clone, Debug, Serialize, Deserialize, Display, IntoStaticStr)]
pub enum TradeMessage {
    InitTradeRequest(InitTradeRequest),
    InitMultisigRequest(InitMultisigRequest),
    SignContractRequest(SignContractRequest),
    SignContractResponse(SignContractResponse),
    DepositRequest(DepositRequest),
    DepositResponse(DepositResponse),
    PaymentSentMessage(PaymentSentMessage),
    PaymentReceivedMessage(PaymentReceivedMessage),
    PayoutPublishedMessage(PayoutPublishedMessage),
    Ack(AckMessage),
}

/// Sent by the taker to the arbitrator to start a trade, and relayed by
/// the arbitrator to the maker. Carries everything the receiving side
/// needs to construct its own trade instance.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InitTradeRequest {
    pub offer_id: Uuid,
    pub amount: u64,
    pub price: u64,
    pub taker_fee: u64,
    pub taker_pubkey: XOnlyPublicKey,
    pub taker_node_address: Option<Url>,
    pub taker_account_id: String,
    pub taker_payment_method: FiatPaymentMethod,
    pub taker_payment_account_payload_hash: String,
    pub taker_payout_address: AddressString,
    pub taker_reserve_tx_id: Option<TxIdString>,
    pub arbitrator_pubkey: XOnlyPublicKey,
}

/// Opaque multisig key material blob. The key-exchange ceremony itself is
/// the wallet layer's business; the engine transports and records it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InitMultisigRequest {
    pub multisig_hex: String,
}

/// Sender's contract-relevant identity and payment data.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignContractRequest {
    pub account_id: String,
    pub payment_method: FiatPaymentMethod,
    pub payment_account_payload_hash: String,
    pub payout_address: AddressString,
    pub reserve_tx_id: Option<TxIdString>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignContractResponse {
    pub contract_hash: String,
    pub signature: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DepositRequest {
    pub deposit_tx_id: TxIdString,
    pub deposit_tx_hex: String,
}

/// Arbitrator's reply once both deposits are in hand and published.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DepositResponse {
    pub buyer_deposit_tx_id: TxIdString,
    pub seller_deposit_tx_id: TxIdString,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PaymentSentMessage {
    /// Reference on the fiat rail, e.g. a transfer id, if the buyer has
    /// one to share.
    pub counter_currency_tx_id: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PaymentReceivedMessage {
    pub signed_payout_tx_hex: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PayoutPublishedMessage {
    pub payout_tx_id: TxIdString,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AckMessage {
    pub source_msg_type: String,
    pub source_msg_uid: Uuid,
    pub success: bool,
    pub error_message: Option<String>,
}
