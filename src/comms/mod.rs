use secp256k1::XOnlyPublicKey;
use tokio::sync::mpsc;

use crate::{common::error::TriEscrowError, protocol::TradeMessageEnvelope};

/// An addressed, outbound trade message. The transport behind the channel
/// owns framing and encryption; the engine only addresses by pubkey.
#[derive(Clone, Debug)]
pub struct OutboundMessage {
    pub to: XOnlyPublicKey,
    pub envelope: TradeMessageEnvelope,
}

/// Cloneable handle for sending trade messages out through whatever
/// transport the application wired up.
#[derive(Clone)]
pub struct CommsAccess {
    tx: mpsc::Sender<OutboundMessage>,
}

impl CommsAccess {
    pub fn new(tx: mpsc::Sender<OutboundMessage>) -> Self {
        Self { tx }
    }

    pub async fn send_trade_message(
        &self,
        to: XOnlyPublicKey,
        envelope: TradeMessageEnvelope,
    ) -> Result<(), TriEscrowError> {
        self.tx.send(OutboundMessage { to, envelope }).await?;
        Ok(())
    }
}
