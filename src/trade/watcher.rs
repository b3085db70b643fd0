use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    common::{error::TriEscrowError, utils::now_unix_secs},
    wallet::EscrowWallet,
};

use super::{State, Trade};

/// Watches both parties' deposit transactions across new blocks and
/// drives the published -> confirmed -> unlocked advance. One instance
/// per trade; arming is idempotent and deposits may appear in either
/// order.
pub struct DepositWatcher {
    armed: bool,
    unlock_window: u64,
}

impl DepositWatcher {
    pub fn new(unlock_window: u64) -> Self {
        Self {
            armed: false,
            unlock_window,
        }
    }

    /// Registers the watcher. A second call while armed is a warning,
    /// not an error, and registers nothing new.
    pub fn arm(&mut self, trade_uid: Uuid) -> bool {
        if self.armed {
            warn!(
                "DepositWatcher w/ TradeUUID {} already armed, ignoring re-arm",
                trade_uid
            );
            return false;
        }
        debug!("DepositWatcher w/ TradeUUID {} armed", trade_uid);
        self.armed = true;
        true
    }

    pub fn disarm(&mut self) {
        self.armed = false;
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Re-fetches both deposit transactions and advances the trade as far
    /// as the chain allows. Returns true once the deposits are unlocked
    /// and the watcher has disarmed itself.
    pub fn on_new_block(
        &mut self,
        height: u64,
        wallet: &dyn EscrowWallet,
        trade: &mut Trade,
    ) -> Result<bool, TriEscrowError> {
        if !self.armed {
            return Ok(false);
        }

        let (buyer_tx_id, seller_tx_id) =
            match (trade.buyer_deposit_tx_id(), trade.seller_deposit_tx_id()) {
                (Some(buyer), Some(seller)) => (buyer, seller),
                _ => return Ok(false),
            };

        let buyer_tx = wallet.get_tx(&buyer_tx_id)?;
        let seller_tx = wallet.get_tx(&seller_tx_id)?;

        let (buyer_tx, seller_tx) = match (buyer_tx, seller_tx) {
            (Some(buyer), Some(seller)) => (buyer, seller),
            _ => return Ok(false),
        };

        if !trade.is_deposit_published() {
            trade.set_state_if_valid_transition(State::DepositTxsSeenInNetwork);
        }

        if !(buyer_tx.is_confirmed() && seller_tx.is_confirmed()) {
            return Ok(false);
        }

        if trade.data().unlock_height().is_none() {
            let confirm_height = buyer_tx
                .height
                .unwrap_or(height)
                .max(seller_tx.height.unwrap_or(height));
            trade
                .data_mut()
                .set_unlock_height(confirm_height + self.unlock_window);
            trade.data_mut().set_deposit_confirmed_at(now_unix_secs());
        }

        trade.set_state_if_valid_transition(State::DepositTxsConfirmedInBlockchain);

        let unlock_height = match trade.data().unlock_height() {
            Some(unlock_height) => unlock_height,
            None => return Ok(false),
        };

        if height >= unlock_height {
            trade.set_state_if_valid_transition(State::DepositTxsUnlockedInBlockchain);
            debug!(
                "DepositWatcher w/ TradeUUID {} deposits unlocked at height {}, disarming",
                trade.uid(),
                height
            );
            self.disarm();
            return Ok(true);
        }

        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use iso_currency::Currency;
    use secp256k1::{KeyPair, Secp256k1, SecretKey, XOnlyPublicKey};
    use tempfile::TempDir;

    use crate::{
        common::types::{Direction, FiatPaymentMethod, TradeRole},
        trade::{NewTradeParams, PeerSlot, Phase, TradePeer},
        wallet::{MockEscrowWallet, TxInfo},
    };

    use super::*;

    fn some_pubkey(fill: u8) -> XOnlyPublicKey {
        let secp = Secp256k1::new();
        let keypair = KeyPair::from_secret_key(&secp, &SecretKey::from_slice(&[fill; 32]).unwrap());
        XOnlyPublicKey::from_keypair(&keypair).0
    }

    fn some_trade_with_deposits(dir: &TempDir) -> Trade {
        let mut trade = Trade::new(
            dir.path(),
            NewTradeParams {
                id: Uuid::new_v4(),
                role: TradeRole::BuyerAsMaker,
                direction: Direction::Buy,
                amount: 1_000_000,
                price: 15_000,
                taker_fee: 2_500,
                buyer_security_deposit: 150_000,
                seller_security_deposit: 150_000,
                currency: Currency::EUR,
                payment_method: FiatPaymentMethod::Sepa,
                lock_time: 10,
                take_offer_date: 1_700_000_000,
                maker: TradePeer::with_pubkey(some_pubkey(1)),
                taker: TradePeer::with_pubkey(some_pubkey(2)),
                arbitrator: TradePeer::with_pubkey(some_pubkey(3)),
            },
        );
        trade.data_mut().modify_peer(PeerSlot::Maker, |peer| {
            peer.deposit_tx_id = Some("buyer-deposit".to_string())
        });
        trade.data_mut().modify_peer(PeerSlot::Taker, |peer| {
            peer.deposit_tx_id = Some("seller-deposit".to_string())
        });
        trade
    }

    fn tx_info(tx_id: &str, confirmations: u64, height: Option<u64>) -> TxInfo {
        TxInfo {
            tx_id: tx_id.to_string(),
            confirmations,
            height,
            incoming_amount: 150_000,
        }
    }

    #[test]
    fn arming_is_idempotent() {
        let mut watcher = DepositWatcher::new(10);
        let uid = Uuid::new_v4();
        assert!(watcher.arm(uid));
        assert!(!watcher.arm(uid));
        assert!(watcher.is_armed());
    }

    #[test]
    fn no_advance_until_both_deposits_seen() {
        let dir = TempDir::new().unwrap();
        let mut trade = some_trade_with_deposits(&dir);
        let mut watcher = DepositWatcher::new(10);
        watcher.arm(trade.uid());

        let mut wallet = MockEscrowWallet::new();
        wallet.expect_get_tx().returning(|tx_id| {
            if tx_id == "buyer-deposit" {
                Ok(Some(TxInfo {
                    tx_id: tx_id.to_string(),
                    confirmations: 0,
                    height: None,
                    incoming_amount: 150_000,
                }))
            } else {
                Ok(None)
            }
        });

        assert!(!watcher.on_new_block(100, &wallet, &mut trade).unwrap());
        assert_eq!(trade.phase(), Phase::Init);
        trade.terminate();
    }

    #[test]
    fn deposits_seen_in_reverse_order_still_advance() {
        let dir = TempDir::new().unwrap();
        let mut trade = some_trade_with_deposits(&dir);
        let mut watcher = DepositWatcher::new(10);
        watcher.arm(trade.uid());

        // Seller deposit first, buyer absent
        let mut wallet = MockEscrowWallet::new();
        wallet.expect_get_tx().returning(|tx_id| {
            if tx_id == "seller-deposit" {
                Ok(Some(TxInfo {
                    tx_id: tx_id.to_string(),
                    confirmations: 0,
                    height: None,
                    incoming_amount: 150_000,
                }))
            } else {
                Ok(None)
            }
        });
        assert!(!watcher.on_new_block(100, &wallet, &mut trade).unwrap());
        assert_eq!(trade.phase(), Phase::Init);

        // Both present and unconfirmed
        let mut wallet = MockEscrowWallet::new();
        wallet
            .expect_get_tx()
            .returning(|tx_id| Ok(Some(tx_info(tx_id, 0, None))));
        assert!(!watcher.on_new_block(101, &wallet, &mut trade).unwrap());
        assert_eq!(trade.phase(), Phase::DepositsPublished);
        trade.terminate();
    }

    #[test]
    fn confirmation_sets_unlock_height_and_unlock_disarms() {
        let dir = TempDir::new().unwrap();
        let mut trade = some_trade_with_deposits(&dir);
        let mut watcher = DepositWatcher::new(10);
        watcher.arm(trade.uid());

        let mut wallet = MockEscrowWallet::new();
        wallet.expect_get_tx().returning(|tx_id| {
            let height = if tx_id == "buyer-deposit" { 100 } else { 102 };
            Ok(Some(tx_info(tx_id, 1, Some(height))))
        });

        // Confirmed at max height 102, unlock at 112
        assert!(!watcher.on_new_block(102, &wallet, &mut trade).unwrap());
        assert_eq!(trade.phase(), Phase::DepositsConfirmed);
        assert_eq!(trade.data().unlock_height(), Some(112));

        // Repeated blocks below the unlock height change nothing
        assert!(!watcher.on_new_block(111, &wallet, &mut trade).unwrap());
        assert_eq!(trade.phase(), Phase::DepositsConfirmed);

        assert!(watcher.on_new_block(112, &wallet, &mut trade).unwrap());
        assert_eq!(trade.phase(), Phase::DepositsUnlocked);
        assert!(!watcher.is_armed());

        // Further blocks are no-ops once disarmed
        assert!(!watcher.on_new_block(113, &wallet, &mut trade).unwrap());
        trade.terminate();
    }
}
