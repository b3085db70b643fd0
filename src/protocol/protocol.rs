use std::sync::Arc;

use secp256k1::{schnorr, KeyPair, Message, Secp256k1, XOnlyPublicKey};
use strum_macros::{Display, IntoStaticStr};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use tokio::{
    select,
    sync::{broadcast, mpsc, oneshot},
};

use crate::{
    comms::CommsAccess,
    common::{
        config::EngineConfig,
        error::TriEscrowError,
        types::{TradeRole, TxIdString},
        utils::now_unix_secs,
    },
    escrow::{create_payout_tx, verify_payout_tx, PayoutDeposits},
    trade::{
        DepositWatcher, DisputeKind, DisputeState, PeerSlot, State, Trade, TradePeriodState,
        TradeSnapshot,
    },
    wallet::EscrowWallet,
};

use super::{
    payout_policy_for, AckMessage, DepositRequest, DepositResponse, InitMultisigRequest,
    InitTradeRequest, PaymentReceivedMessage, PaymentSentMessage, PayoutAmountPolicy,
    PayoutPublishedMessage, SignContractRequest, SignContractResponse, TradeMessage,
    TradeMessageEnvelope,
};

pub enum ProtocolNotif {
    StateChanged(State),
    DisputeStateChanged(DisputeState),
    PayoutPublished(TxIdString),
    TradeError(String),
}

/// Everything a protocol actor needs besides its trade: node identity for
/// contract signing, config, outbound comms, the trade's escrow wallet
/// and a subscription to new-block events.
pub(crate) struct ProtocolContext {
    pub(crate) keypair: KeyPair,
    pub(crate) pubkey: XOnlyPublicKey,
    pub(crate) config: EngineConfig,
    pub(crate) comms: CommsAccess,
    pub(crate) wallet: Arc<dyn EscrowWallet>,
    pub(crate) block_rx: broadcast::Receiver<u64>,
}

#[derive(Clone)]
pub struct ProtocolAccess {
    tx: mpsc::Sender<ProtocolRequest>,
}

impl ProtocolAccess {
    pub(super) fn new(tx: mpsc::Sender<ProtocolRequest>) -> Self {
        Self { tx }
    }

    pub async fn take_offer(&self) -> Result<(), TriEscrowError> {
        let (rsp_tx, rsp_rx) = oneshot::channel::<Result<(), TriEscrowError>>();
        let request = ProtocolRequest::TakeOffer { rsp_tx };
        self.tx.send(request).await?;
        rsp_rx.await?
    }

    pub async fn send_deposit(
        &self,
        deposit_tx_id: TxIdString,
        deposit_tx_hex: String,
    ) -> Result<(), TriEscrowError> {
        let (rsp_tx, rsp_rx) = oneshot::channel::<Result<(), TriEscrowError>>();
        let request = ProtocolRequest::SendDeposit {
            deposit_tx_id,
            deposit_tx_hex,
            rsp_tx,
        };
        self.tx.send(request).await?;
        rsp_rx.await?
    }

    pub async fn confirm_payment_sent(&self) -> Result<(), TriEscrowError> {
        let (rsp_tx, rsp_rx) = oneshot::channel::<Result<(), TriEscrowError>>();
        let request = ProtocolRequest::ConfirmPaymentSent { rsp_tx };
        self.tx.send(request).await?;
        rsp_rx.await?
    }

    pub async fn confirm_payment_received(&self) -> Result<(), TriEscrowError> {
        let (rsp_tx, rsp_rx) = oneshot::channel::<Result<(), TriEscrowError>>();
        let request = ProtocolRequest::ConfirmPaymentReceived { rsp_tx };
        self.tx.send(request).await?;
        rsp_rx.await?
    }

    pub async fn complete_trade(&self) -> Result<(), TriEscrowError> {
        let (rsp_tx, rsp_rx) = oneshot::channel::<Result<(), TriEscrowError>>();
        let request = ProtocolRequest::CompleteTrade { rsp_tx };
        self.tx.send(request).await?;
        rsp_rx.await?
    }

    pub async fn fail_trade(&self, reason: String) -> Result<(), TriEscrowError> {
        let (rsp_tx, rsp_rx) = oneshot::channel::<Result<(), TriEscrowError>>();
        let request = ProtocolRequest::FailTrade { reason, rsp_tx };
        self.tx.send(request).await?;
        rsp_rx.await?
    }

    pub async fn open_dispute(&self, kind: DisputeKind) -> Result<(), TriEscrowError> {
        let (rsp_tx, rsp_rx) = oneshot::channel::<Result<(), TriEscrowError>>();
        let request = ProtocolRequest::OpenDispute { kind, rsp_tx };
        self.tx.send(request).await?;
        rsp_rx.await?
    }

    pub async fn close_dispute(&self) -> Result<(), TriEscrowError> {
        let (rsp_tx, rsp_rx) = oneshot::channel::<Result<(), TriEscrowError>>();
        let request = ProtocolRequest::CloseDispute { rsp_tx };
        self.tx.send(request).await?;
        rsp_rx.await?
    }

    pub async fn update_peer_address(
        &self,
        slot: PeerSlot,
        address: url::Url,
    ) -> Result<(), TriEscrowError> {
        let (rsp_tx, rsp_rx) = oneshot::channel::<Result<(), TriEscrowError>>();
        let request = ProtocolRequest::UpdatePeerAddress {
            slot,
            address,
            rsp_tx,
        };
        self.tx.send(request).await?;
        rsp_rx.await?
    }

    pub async fn update_period_state(&self) -> Result<TradePeriodState, TriEscrowError> {
        let (rsp_tx, rsp_rx) = oneshot::channel::<TradePeriodState>();
        let request = ProtocolRequest::UpdatePeriodState { rsp_tx };
        self.tx.send(request).await?;
        Ok(rsp_rx.await?)
    }

    pub async fn snapshot(&self) -> Result<TradeSnapshot, TriEscrowError> {
        let (rsp_tx, rsp_rx) = oneshot::channel::<TradeSnapshot>();
        let request = ProtocolRequest::QuerySnapshot { rsp_tx };
        self.tx.send(request).await?;
        Ok(rsp_rx.await?)
    }

    pub async fn register_notif_tx(
        &self,
        tx: mpsc::Sender<Result<ProtocolNotif, TriEscrowError>>,
    ) -> Result<(), TriEscrowError> {
        let (rsp_tx, rsp_rx) = oneshot::channel::<Result<(), TriEscrowError>>();
        let request = ProtocolRequest::RegisterNotifTx { tx, rsp_tx };
        self.tx.send(request).await?;
        rsp_rx.await?
    }

    pub async fn unregister_notif_tx(&self) -> Result<(), TriEscrowError> {
        let (rsp_tx, rsp_rx) = oneshot::channel::<Result<(), TriEscrowError>>();
        let request = ProtocolRequest::UnregisterNotifTx { rsp_tx };
        self.tx.send(request).await?;
        rsp_rx.await?
    }

    pub async fn shutdown(&self) -> Result<(), TriEscrowError> {
        let (rsp_tx, rsp_rx) = oneshot::channel::<Result<(), TriEscrowError>>();
        let request = ProtocolRequest::Shutdown { rsp_tx };
        self.tx.send(request).await?; // Shutdown is allowed to fail if already shutdown
        rsp_rx.await?
    }
}

/// One protocol instance per trade. All state mutation for the trade is
/// serialized through this actor, which is what gives per-trade message
/// ordering without any locks around the trade itself.
pub(crate) struct TradeProtocol {
    tx: mpsc::Sender<ProtocolRequest>,
    msg_tx: mpsc::Sender<TradeMessageEnvelope>,
    pub(crate) task_handle: tokio::task::JoinHandle<()>,
}

impl TradeProtocol {
    const REQUEST_CHANNEL_SIZE: usize = 10;
    const MESSAGE_CHANNEL_SIZE: usize = 20;

    pub(crate) fn new(ctx: ProtocolContext, trade: Trade) -> Self {
        let (tx, rx) = mpsc::channel::<ProtocolRequest>(Self::REQUEST_CHANNEL_SIZE);
        let (msg_tx, msg_rx) = mpsc::channel::<TradeMessageEnvelope>(Self::MESSAGE_CHANNEL_SIZE);
        let actor = ProtocolActor::new(rx, msg_rx, ctx, trade);
        let task_handle = tokio::spawn(async move { actor.run().await });
        Self {
            tx,
            msg_tx,
            task_handle,
        }
    }

    pub(crate) fn new_accessor(&self) -> ProtocolAccess {
        ProtocolAccess::new(self.tx.clone())
    }

    pub(crate) fn message_tx(&self) -> mpsc::Sender<TradeMessageEnvelope> {
        self.msg_tx.clone()
    }
}

#[derive(Display, IntoStaticStr)]
pub(super) enum ProtocolRequest {
    TakeOffer {
        rsp_tx: oneshot::Sender<Result<(), TriEscrowError>>,
    },
    SendDeposit {
        deposit_tx_id: TxIdString,
        deposit_tx_hex: String,
        rsp_tx: oneshot::Sender<Result<(), TriEscrowError>>,
    },
    ConfirmPaymentSent {
        rsp_tx: oneshot::Sender<Result<(), TriEscrowError>>,
    },
    ConfirmPaymentReceived {
        rsp_tx: oneshot::Sender<Result<(), TriEscrowError>>,
    },
    CompleteTrade {
        rsp_tx: oneshot::Sender<Result<(), TriEscrowError>>,
    },
    FailTrade {
        reason: String,
        rsp_tx: oneshot::Sender<Result<(), TriEscrowError>>,
    },
    OpenDispute {
        kind: DisputeKind,
        rsp_tx: oneshot::Sender<Result<(), TriEscrowError>>,
    },
    CloseDispute {
        rsp_tx: oneshot::Sender<Result<(), TriEscrowError>>,
    },
    UpdatePeerAddress {
        slot: PeerSlot,
        address: url::Url,
        rsp_tx: oneshot::Sender<Result<(), TriEscrowError>>,
    },
    UpdatePeriodState {
        rsp_tx: oneshot::Sender<TradePeriodState>,
    },
    QuerySnapshot {
        rsp_tx: oneshot::Sender<TradeSnapshot>,
    },
    RegisterNotifTx {
        tx: mpsc::Sender<Result<ProtocolNotif, TriEscrowError>>,
        rsp_tx: oneshot::Sender<Result<(), TriEscrowError>>,
    },
    UnregisterNotifTx {
        rsp_tx: oneshot::Sender<Result<(), TriEscrowError>>,
    },
    Shutdown {
        rsp_tx: oneshot::Sender<Result<(), TriEscrowError>>,
    },
}

struct ProtocolActor {
    rx: mpsc::Receiver<ProtocolRequest>,
    msg_rx: mpsc::Receiver<TradeMessageEnvelope>,
    block_rx: broadcast::Receiver<u64>,
    keypair: KeyPair,
    own_pubkey: XOnlyPublicKey,
    config: EngineConfig,
    comms: CommsAccess,
    wallet: Arc<dyn EscrowWallet>,
    trade: Trade,
    watcher: DepositWatcher,
    payout_policy: Box<dyn PayoutAmountPolicy>,
    contract_request_sent: bool,
    notif_tx: Option<mpsc::Sender<Result<ProtocolNotif, TriEscrowError>>>,
}

impl ProtocolActor {
    fn new(
        rx: mpsc::Receiver<ProtocolRequest>,
        msg_rx: mpsc::Receiver<TradeMessageEnvelope>,
        ctx: ProtocolContext,
        trade: Trade,
    ) -> Self {
        let watcher = DepositWatcher::new(ctx.config.unlock_window);
        let payout_policy = payout_policy_for(trade.role());
        ProtocolActor {
            rx,
            msg_rx,
            block_rx: ctx.block_rx,
            keypair: ctx.keypair,
            own_pubkey: ctx.pubkey,
            config: ctx.config,
            comms: ctx.comms,
            wallet: ctx.wallet,
            trade,
            watcher,
            payout_policy,
            contract_request_sent: false,
            notif_tx: None,
        }
    }

    /// Role-specific gross payout this node should end up with, computed
    /// through the policy picked at construction. The arbitrator's policy
    /// rejects the question outright.
    fn own_expected_payout(&self, deposits: &PayoutDeposits) -> Result<u64, TriEscrowError> {
        let amount = self.trade.data().amount();
        let own_security_deposit = if self.trade.role().is_buyer() {
            deposits.buyer_deposit
        } else {
            deposits.seller_deposit.saturating_sub(amount)
        };
        self.payout_policy
            .expected_payout(own_security_deposit, amount)
    }

    async fn run(mut self) {
        // A restored trade re-arms its watcher if deposits are still
        // maturing; new blocks then pick up exactly where it left off.
        if self.trade.buyer_deposit_tx_id().is_some()
            && self.trade.seller_deposit_tx_id().is_some()
            && !self.trade.is_deposit_unlocked()
            && !self.trade.is_payout_published()
        {
            self.watcher.arm(self.trade.uid());
        }

        loop {
            select! {
                Some(request) = self.rx.recv() => {
                    if self.handle_request(request).await {
                        break;
                    }
                },
                Some(envelope) = self.msg_rx.recv() => {
                    self.handle_trade_message(envelope).await;
                },
                Ok(height) = self.block_rx.recv() => {
                    self.handle_new_block(height).await;
                },
                else => break,
            }
        }
        info!(
            "Protocol w/ TradeUUID {} terminating",
            self.trade.uid()
        );
        self.trade.terminate();
    }

    // Top-down Request Handling

    async fn handle_request(&mut self, request: ProtocolRequest) -> bool {
        let mut terminate = false;

        debug!(
            "Protocol w/ TradeUUID {} handle_request() of type {}",
            self.trade.uid(),
            request
        );

        match request {
            ProtocolRequest::TakeOffer { rsp_tx } => self.take_offer(rsp_tx).await,
            ProtocolRequest::SendDeposit {
                deposit_tx_id,
                deposit_tx_hex,
                rsp_tx,
            } => {
                self.send_deposit(deposit_tx_id, deposit_tx_hex, rsp_tx)
                    .await
            }
            ProtocolRequest::ConfirmPaymentSent { rsp_tx } => {
                self.confirm_payment_sent(rsp_tx).await
            }
            ProtocolRequest::ConfirmPaymentReceived { rsp_tx } => {
                self.confirm_payment_received(rsp_tx).await
            }
            ProtocolRequest::CompleteTrade { rsp_tx } => self.complete_trade(rsp_tx).await,
            ProtocolRequest::FailTrade { reason, rsp_tx } => {
                self.trade.fail(reason.clone());
                self.notify(ProtocolNotif::TradeError(reason)).await;
                rsp_tx.send(Ok(())).unwrap(); // oneshot should not fail
            }
            ProtocolRequest::OpenDispute { kind, rsp_tx } => self.open_dispute(kind, rsp_tx).await,
            ProtocolRequest::CloseDispute { rsp_tx } => self.close_dispute(rsp_tx).await,
            ProtocolRequest::UpdatePeerAddress {
                slot,
                address,
                rsp_tx,
            } => self.update_peer_address(slot, address, rsp_tx),
            ProtocolRequest::UpdatePeriodState { rsp_tx } => {
                let period_state = self.trade.update_period_state(now_unix_secs());
                rsp_tx.send(period_state).unwrap(); // oneshot should not fail
            }
            ProtocolRequest::QuerySnapshot { rsp_tx } => {
                rsp_tx.send(self.trade.snapshot()).unwrap(); // oneshot should not fail
            }
            ProtocolRequest::RegisterNotifTx { tx, rsp_tx } => {
                self.register_notif_tx(tx, rsp_tx);
            }
            ProtocolRequest::UnregisterNotifTx { rsp_tx } => {
                self.unregister_notif_tx(rsp_tx);
            }
            ProtocolRequest::Shutdown { rsp_tx } => {
                rsp_tx.send(Ok(())).unwrap(); // oneshot should not fail
                terminate = true;
            }
        }
        terminate
    }

    fn check_active(&self) -> Result<(), TriEscrowError> {
        if self.trade.has_failed() {
            return Err(TriEscrowError::Simple(format!(
                "Trade w/ TradeUUID {} has failed - {}",
                self.trade.uid(),
                self.trade.error_message().unwrap_or_default()
            )));
        }
        if self.trade.is_completed() {
            return Err(TriEscrowError::Simple(format!(
                "Trade w/ TradeUUID {} already completed",
                self.trade.uid()
            )));
        }
        Ok(())
    }

    async fn take_offer(&mut self, rsp_tx: oneshot::Sender<Result<(), TriEscrowError>>) {
        if let Some(error) = self.check_active().err() {
            rsp_tx.send(Err(error)).unwrap(); // oneshot should not fail
            return;
        }

        if !self.trade.role().is_taker() {
            let error = TriEscrowError::Simple(format!(
                "Only a taker can take an offer, trade role is {}",
                self.trade.role()
            ));
            rsp_tx.send(Err(error)).unwrap(); // oneshot should not fail
            return;
        }

        let arbitrator = self.trade.data().peer(PeerSlot::Arbitrator);
        let arbitrator_pubkey = match arbitrator.pubkey {
            Some(pubkey) => pubkey,
            None => {
                let error = TriEscrowError::Simple(format!(
                    "Trade w/ TradeUUID {} has no arbitrator to request trade init from",
                    self.trade.uid()
                ));
                rsp_tx.send(Err(error)).unwrap(); // oneshot should not fail
                return;
            }
        };

        let own = self.trade.data().peer(PeerSlot::Taker);
        let request = InitTradeRequest {
            offer_id: self.trade.id(),
            amount: self.trade.data().amount(),
            price: self.trade.data().price(),
            taker_fee: self.trade.data().taker_fee(),
            taker_pubkey: self.own_pubkey,
            taker_node_address: own.node_address,
            taker_account_id: own.account_id.unwrap_or_default(),
            taker_payment_method: own
                .payment_method
                .unwrap_or_else(|| self.trade.data().payment_method()),
            taker_payment_account_payload_hash: own
                .payment_account_payload_hash
                .unwrap_or_default(),
            taker_payout_address: own.payout_address.unwrap_or_default(),
            taker_reserve_tx_id: own.reserve_tx_id,
            arbitrator_pubkey,
        };

        let result = self
            .send_message(arbitrator_pubkey, TradeMessage::InitTradeRequest(request))
            .await;
        rsp_tx.send(result).unwrap(); // oneshot should not fail
    }

    async fn send_deposit(
        &mut self,
        deposit_tx_id: TxIdString,
        deposit_tx_hex: String,
        rsp_tx: oneshot::Sender<Result<(), TriEscrowError>>,
    ) {
        if let Some(error) = self.check_active().err() {
            rsp_tx.send(Err(error)).unwrap(); // oneshot should not fail
            return;
        }

        if self.trade.role().is_arbitrator() {
            let error = TriEscrowError::Simple(
                "Arbitrator does not fund the escrow".to_string(),
            );
            rsp_tx.send(Err(error)).unwrap(); // oneshot should not fail
            return;
        }

        if self.trade.state() != State::ContractSigned && self.trade.phase() == crate::trade::Phase::Init
        {
            let error = TriEscrowError::Simple(format!(
                "Trade w/ TradeUUID {} cannot send deposit before the contract is signed",
                self.trade.uid()
            ));
            rsp_tx.send(Err(error)).unwrap(); // oneshot should not fail
            return;
        }

        let own_slot = self.trade.own_slot();
        let tx_id = deposit_tx_id.clone();
        let tx_hex = deposit_tx_hex.clone();
        self.trade.data_mut().modify_peer(own_slot, |peer| {
            peer.deposit_tx_id = Some(tx_id);
            peer.deposit_tx_hex = Some(tx_hex);
        });

        let arbitrator_pubkey = match self.trade.data().peer(PeerSlot::Arbitrator).pubkey {
            Some(pubkey) => pubkey,
            None => {
                let error = TriEscrowError::Simple(format!(
                    "Trade w/ TradeUUID {} has no arbitrator to send the deposit to",
                    self.trade.uid()
                ));
                rsp_tx.send(Err(error)).unwrap(); // oneshot should not fail
                return;
            }
        };

        let result = self
            .send_message(
                arbitrator_pubkey,
                TradeMessage::DepositRequest(DepositRequest {
                    deposit_tx_id,
                    deposit_tx_hex,
                }),
            )
            .await;

        if result.is_ok() {
            self.trade
                .set_state_if_valid_transition(State::SentDepositRequest);
        }
        rsp_tx.send(result).unwrap(); // oneshot should not fail
    }

    async fn confirm_payment_sent(&mut self, rsp_tx: oneshot::Sender<Result<(), TriEscrowError>>) {
        if let Some(error) = self.check_active().err() {
            rsp_tx.send(Err(error)).unwrap(); // oneshot should not fail
            return;
        }

        if !self.trade.role().is_buyer() {
            let error = TriEscrowError::Simple(format!(
                "Only the buyer confirms payment sent, trade role is {}",
                self.trade.role()
            ));
            rsp_tx.send(Err(error)).unwrap(); // oneshot should not fail
            return;
        }

        if !self.trade.is_deposit_unlocked() {
            let error = TriEscrowError::Simple(format!(
                "Trade w/ TradeUUID {} deposits not unlocked yet",
                self.trade.uid()
            ));
            rsp_tx.send(Err(error)).unwrap(); // oneshot should not fail
            return;
        }

        self.trade
            .set_state_if_valid_transition(State::BuyerConfirmedPaymentSent);

        let seller_pubkey = match self.trade.data().peer(self.trade.seller_slot()).pubkey {
            Some(pubkey) => pubkey,
            None => {
                let error = TriEscrowError::Simple(format!(
                    "Trade w/ TradeUUID {} has no seller pubkey",
                    self.trade.uid()
                ));
                rsp_tx.send(Err(error)).unwrap(); // oneshot should not fail
                return;
            }
        };

        let result = self
            .send_message(
                seller_pubkey,
                TradeMessage::PaymentSentMessage(PaymentSentMessage {
                    counter_currency_tx_id: None,
                }),
            )
            .await;

        if result.is_ok() {
            self.trade
                .set_state_if_valid_transition(State::BuyerSentPaymentSentMsg);
            self.notify(ProtocolNotif::StateChanged(self.trade.state()))
                .await;
        }
        rsp_tx.send(result).unwrap(); // oneshot should not fail
    }

    async fn confirm_payment_received(
        &mut self,
        rsp_tx: oneshot::Sender<Result<(), TriEscrowError>>,
    ) {
        if let Some(error) = self.check_active().err() {
            rsp_tx.send(Err(error)).unwrap(); // oneshot should not fail
            return;
        }

        if !self.trade.role().is_seller() {
            let error = TriEscrowError::Simple(format!(
                "Only the seller confirms payment receipt, trade role is {}",
                self.trade.role()
            ));
            rsp_tx.send(Err(error)).unwrap(); // oneshot should not fail
            return;
        }

        if !self.trade.is_payment_sent() {
            let error = TriEscrowError::Simple(format!(
                "Trade w/ TradeUUID {} has no payment-sent confirmation yet",
                self.trade.uid()
            ));
            rsp_tx.send(Err(error)).unwrap(); // oneshot should not fail
            return;
        }

        let result = self.build_and_send_payout().await;
        rsp_tx.send(result).unwrap(); // oneshot should not fail
    }

    /// Seller-side payout production: re-derive both deposits from the
    /// escrow wallet, construct the payout, sign our half and hand it to
    /// the buyer for counter-signature and submission.
    async fn build_and_send_payout(&mut self) -> Result<(), TriEscrowError> {
        let contract = self.trade.data().contract().ok_or_else(|| {
            TriEscrowError::Simple(format!(
                "Trade w/ TradeUUID {} has no contract to pay out against",
                self.trade.uid()
            ))
        })?;

        let (buyer_tx_id, seller_tx_id) = self.deposit_tx_ids()?;

        self.trade
            .set_state_if_valid_transition(State::SellerConfirmedPaymentReceipt);

        let deposits = PayoutDeposits::read(self.wallet.as_ref(), &buyer_tx_id, &seller_tx_id)?;

        let payout_tx =
            match create_payout_tx(self.wallet.as_ref(), &self.config, &contract, deposits) {
                Ok(payout_tx) => payout_tx,
                Err(error) => {
                    // Out of attempts is fatal for the trade, not just the call
                    let message = error.to_string();
                    error!(
                        "Protocol w/ TradeUUID {} payout construction failed - {}",
                        self.trade.uid(),
                        message
                    );
                    self.trade.fail(message.clone());
                    self.notify(ProtocolNotif::TradeError(message)).await;
                    return Err(error);
                }
            };

        // Cross-check the built tx against this role's own payout rule
        if let Ok(expected) = self.own_expected_payout(&deposits) {
            let own_address = self
                .trade
                .data()
                .peer(self.trade.own_slot())
                .payout_address
                .unwrap_or_default();
            let own_destination = payout_tx
                .destinations
                .iter()
                .find(|destination| destination.address == own_address)
                .map(|destination| destination.amount)
                .unwrap_or_default();
            let half_fee = payout_tx.fee / 2;
            if own_destination + half_fee != expected {
                warn!(
                    "Protocol w/ TradeUUID {} built payout pays own side {} + fee {} but policy expects {}",
                    self.trade.uid(),
                    own_destination,
                    half_fee,
                    expected
                );
            }
        }

        let signed = self.wallet.sign_tx(&payout_tx.tx_hex)?;
        self.trade
            .data_mut()
            .set_payout_tx(signed.tx_id.clone(), Some(signed.tx_hex.clone()));

        let buyer_pubkey = self
            .trade
            .data()
            .peer(self.trade.buyer_slot())
            .pubkey
            .ok_or_else(|| {
                TriEscrowError::Simple(format!(
                    "Trade w/ TradeUUID {} has no buyer pubkey",
                    self.trade.uid()
                ))
            })?;

        self.send_message(
            buyer_pubkey,
            TradeMessage::PaymentReceivedMessage(PaymentReceivedMessage {
                signed_payout_tx_hex: signed.tx_hex,
            }),
        )
        .await?;

        self.trade
            .set_state_if_valid_transition(State::SellerSentPaymentReceivedMsg);
        self.notify(ProtocolNotif::StateChanged(self.trade.state()))
            .await;
        Ok(())
    }

    async fn complete_trade(&mut self, rsp_tx: oneshot::Sender<Result<(), TriEscrowError>>) {
        if let Some(error) = self.check_active().err() {
            rsp_tx.send(Err(error)).unwrap(); // oneshot should not fail
            return;
        }

        if !self.trade.is_payout_published() {
            let error = TriEscrowError::Simple(format!(
                "Trade w/ TradeUUID {} cannot complete before payout is published",
                self.trade.uid()
            ));
            rsp_tx.send(Err(error)).unwrap(); // oneshot should not fail
            return;
        }

        self.trade
            .set_state_if_valid_transition(State::WithdrawCompleted);
        self.notify(ProtocolNotif::StateChanged(self.trade.state()))
            .await;
        rsp_tx.send(Ok(())).unwrap(); // oneshot should not fail
    }

    async fn open_dispute(
        &mut self,
        kind: DisputeKind,
        rsp_tx: oneshot::Sender<Result<(), TriEscrowError>>,
    ) {
        if self.trade.dispute_state().is_open() {
            let error = TriEscrowError::Simple(format!(
                "Trade w/ TradeUUID {} already has dispute state {}",
                self.trade.uid(),
                self.trade.dispute_state()
            ));
            rsp_tx.send(Err(error)).unwrap(); // oneshot should not fail
            return;
        }

        self.trade.set_dispute_state(kind.requested_state());
        self.notify(ProtocolNotif::DisputeStateChanged(
            self.trade.dispute_state(),
        ))
        .await;
        rsp_tx.send(Ok(())).unwrap(); // oneshot should not fail
    }

    async fn close_dispute(&mut self, rsp_tx: oneshot::Sender<Result<(), TriEscrowError>>) {
        let closed = match self.trade.dispute_state() {
            DisputeState::MediationRequested | DisputeState::MediationStartedByPeer => {
                DisputeState::MediationClosed
            }
            DisputeState::RefundRequested | DisputeState::RefundRequestStartedByPeer => {
                DisputeState::RefundRequestClosed
            }
            DisputeState::ArbitrationRequested | DisputeState::ArbitrationStartedByPeer => {
                DisputeState::ArbitrationClosed
            }
            other => {
                let error = TriEscrowError::Simple(format!(
                    "Trade w/ TradeUUID {} has no open dispute to close, dispute state {}",
                    self.trade.uid(),
                    other
                ));
                rsp_tx.send(Err(error)).unwrap(); // oneshot should not fail
                return;
            }
        };

        self.trade.set_dispute_state(closed);
        self.notify(ProtocolNotif::DisputeStateChanged(closed)).await;
        rsp_tx.send(Ok(())).unwrap(); // oneshot should not fail
    }

    fn update_peer_address(
        &mut self,
        slot: PeerSlot,
        address: url::Url,
        rsp_tx: oneshot::Sender<Result<(), TriEscrowError>>,
    ) {
        info!(
            "Protocol w/ TradeUUID {} updating {} node address to {}",
            self.trade.uid(),
            slot,
            address
        );
        self.trade
            .data_mut()
            .modify_peer(slot, |peer| peer.node_address = Some(address));
        rsp_tx.send(Ok(())).unwrap(); // oneshot should not fail
    }

    fn register_notif_tx(
        &mut self,
        tx: mpsc::Sender<Result<ProtocolNotif, TriEscrowError>>,
        rsp_tx: oneshot::Sender<Result<(), TriEscrowError>>,
    ) {
        let mut result = Ok(());
        if self.notif_tx.is_some() {
            let error = TriEscrowError::Simple(format!(
                "Protocol w/ TradeUUID {} already have notif_tx registered",
                self.trade.uid()
            ));
            result = Err(error);
        }
        self.notif_tx = Some(tx);
        rsp_tx.send(result).unwrap();
    }

    fn unregister_notif_tx(&mut self, rsp_tx: oneshot::Sender<Result<(), TriEscrowError>>) {
        let mut result = Ok(());
        if self.notif_tx.is_none() {
            let error = TriEscrowError::Simple(format!(
                "Protocol w/ TradeUUID {} expected to already have notif_tx registered",
                self.trade.uid()
            ));
            result = Err(error);
        }
        self.notif_tx = None;
        rsp_tx.send(result).unwrap();
    }

    // Bottom-up Peer Message Handling

    async fn handle_trade_message(&mut self, envelope: TradeMessageEnvelope) {
        debug!(
            "Protocol w/ TradeUUID {} handle_trade_message() from pubkey {}, of type {}",
            self.trade.uid(),
            envelope.sender_pubkey,
            envelope.message
        );

        let sender_slot = match self.slot_for_pubkey(&envelope.sender_pubkey) {
            Some(slot) => slot,
            None => {
                warn!(
                    "Protocol w/ TradeUUID {} received message from pubkey {} not part of this trade, ignoring",
                    self.trade.uid(),
                    envelope.sender_pubkey
                );
                return;
            }
        };

        let msg_type: &'static str = (&envelope.message).into();
        let msg_uid = envelope.msg_uid;

        match envelope.message {
            TradeMessage::InitTradeRequest(request) => {
                self.handle_init_trade_request(sender_slot, request).await;
            }
            TradeMessage::InitMultisigRequest(request) => {
                self.handle_init_multisig_request(sender_slot, request).await;
            }
            TradeMessage::SignContractRequest(request) => {
                self.handle_sign_contract_request(sender_slot, request).await;
            }
            TradeMessage::SignContractResponse(response) => {
                self.handle_sign_contract_response(sender_slot, response)
                    .await;
            }
            TradeMessage::DepositRequest(request) => {
                self.handle_deposit_request(sender_slot, request).await;
            }
            TradeMessage::DepositResponse(response) => {
                self.handle_deposit_response(sender_slot, response, msg_type, msg_uid)
                    .await;
            }
            TradeMessage::PaymentSentMessage(message) => {
                self.handle_payment_sent_message(sender_slot, message, msg_type, msg_uid)
                    .await;
            }
            TradeMessage::PaymentReceivedMessage(message) => {
                self.handle_payment_received_message(sender_slot, message, msg_type, msg_uid)
                    .await;
            }
            TradeMessage::PayoutPublishedMessage(message) => {
                self.handle_payout_published_message(sender_slot, message)
                    .await;
            }
            TradeMessage::Ack(ack) => {
                self.handle_ack(sender_slot, ack);
            }
        }
    }

    async fn handle_init_trade_request(&mut self, sender_slot: PeerSlot, request: InitTradeRequest) {
        match self.trade.role() {
            TradeRole::Arbitrator => {
                if sender_slot == PeerSlot::Taker {
                    self.store_taker_init_data(&request);

                    // Relay to the maker so it can construct its own trade
                    let maker_pubkey = match self.trade.data().peer(PeerSlot::Maker).pubkey {
                        Some(pubkey) => pubkey,
                        None => {
                            error!(
                                "Protocol w/ TradeUUID {} as arbitrator has no maker pubkey to relay init to",
                                self.trade.uid()
                            );
                            return;
                        }
                    };
                    if let Some(error) = self
                        .send_message(maker_pubkey, TradeMessage::InitTradeRequest(request))
                        .await
                        .err()
                    {
                        error!(
                            "Protocol w/ TradeUUID {} failed relaying init trade request - {}",
                            self.trade.uid(),
                            error
                        );
                        return;
                    }
                }
                self.send_own_multisig().await;
            }
            role if role.is_maker() => {
                self.store_taker_init_data(&request);
                self.send_own_multisig().await;
            }
            role => {
                warn!(
                    "Protocol w/ TradeUUID {} with role {} received unexpected InitTradeRequest, ignoring",
                    self.trade.uid(),
                    role
                );
            }
        }
    }

    fn store_taker_init_data(&mut self, request: &InitTradeRequest) {
        let request = request.clone();
        self.trade.data_mut().modify_peer(PeerSlot::Taker, |peer| {
            peer.pubkey = Some(request.taker_pubkey);
            peer.node_address = request.taker_node_address;
            peer.account_id = Some(request.taker_account_id);
            peer.payment_method = Some(request.taker_payment_method);
            peer.payment_account_payload_hash =
                Some(request.taker_payment_account_payload_hash);
            peer.payout_address = Some(request.taker_payout_address);
            peer.reserve_tx_id = request.taker_reserve_tx_id;
        });
    }

    /// Sends this node's multisig key material to the other participants,
    /// exactly once.
    async fn send_own_multisig(&mut self) {
        let own_slot = self.trade.own_slot();
        if self.trade.data().peer(own_slot).multisig_hex.is_some() {
            return;
        }

        let multisig_hex = hex::encode(self.own_pubkey.serialize());
        let hex_clone = multisig_hex.clone();
        self.trade
            .data_mut()
            .modify_peer(own_slot, |peer| peer.multisig_hex = Some(hex_clone));

        for slot in [PeerSlot::Maker, PeerSlot::Taker, PeerSlot::Arbitrator] {
            if slot == own_slot {
                continue;
            }
            if let Some(pubkey) = self.trade.data().peer(slot).pubkey {
                if let Some(error) = self
                    .send_message(
                        pubkey,
                        TradeMessage::InitMultisigRequest(InitMultisigRequest {
                            multisig_hex: multisig_hex.clone(),
                        }),
                    )
                    .await
                    .err()
                {
                    error!(
                        "Protocol w/ TradeUUID {} failed sending multisig to {} - {}",
                        self.trade.uid(),
                        slot,
                        error
                    );
                }
            }
        }

        self.trade
            .set_state_if_valid_transition(State::MultisigPrepared);
    }

    async fn handle_init_multisig_request(
        &mut self,
        sender_slot: PeerSlot,
        request: InitMultisigRequest,
    ) {
        if sender_slot == self.trade.own_slot() {
            warn!(
                "Protocol w/ TradeUUID {} received its own multisig material back, ignoring",
                self.trade.uid()
            );
            return;
        }

        // Duplicate blobs are dropped outright; replying to them would
        // ping-pong forever under the reply-on-new rule below.
        let already_known = self.trade.data().peer(sender_slot).multisig_hex.as_ref()
            == Some(&request.multisig_hex);
        if already_known {
            debug!(
                "Protocol w/ TradeUUID {} already has multisig material from {}, ignoring",
                self.trade.uid(),
                sender_slot
            );
            return;
        }

        self.trade.data_mut().modify_peer(sender_slot, |peer| {
            peer.multisig_hex = Some(request.multisig_hex)
        });

        // First contact broadcasts ours to everyone; afterwards, answer
        // the sender directly in case our broadcast raced ahead of its
        // trade creation and was dropped at its boundary.
        if self.trade.data().peer(self.trade.own_slot()).multisig_hex.is_none() {
            self.send_own_multisig().await;
        } else if let Some(pubkey) = self.trade.data().peer(sender_slot).pubkey {
            let own_hex = self
                .trade
                .data()
                .peer(self.trade.own_slot())
                .multisig_hex
                .unwrap_or_default();
            if let Some(error) = self
                .send_message(
                    pubkey,
                    TradeMessage::InitMultisigRequest(InitMultisigRequest {
                        multisig_hex: own_hex,
                    }),
                )
                .await
                .err()
            {
                error!(
                    "Protocol w/ TradeUUID {} failed answering multisig to {} - {}",
                    self.trade.uid(),
                    sender_slot,
                    error
                );
            }
        }

        let all_exchanged = [PeerSlot::Maker, PeerSlot::Taker, PeerSlot::Arbitrator]
            .iter()
            .all(|slot| self.trade.data().peer(*slot).multisig_hex.is_some());

        if all_exchanged {
            self.trade.set_state_if_valid_transition(State::MultisigMade);
            self.trade
                .set_state_if_valid_transition(State::MultisigExchanged);

            if !self.trade.role().is_arbitrator() && !self.contract_request_sent {
                self.send_sign_contract_request().await;
                self.contract_request_sent = true;
            }
        }
    }

    async fn send_sign_contract_request(&mut self) {
        let own = self.trade.data().peer(self.trade.own_slot());
        let request = SignContractRequest {
            account_id: own.account_id.unwrap_or_default(),
            payment_method: own
                .payment_method
                .unwrap_or_else(|| self.trade.data().payment_method()),
            payment_account_payload_hash: own.payment_account_payload_hash.unwrap_or_default(),
            payout_address: own.payout_address.unwrap_or_default(),
            reserve_tx_id: own.reserve_tx_id,
        };

        let own_slot = self.trade.own_slot();
        for slot in [PeerSlot::Maker, PeerSlot::Taker, PeerSlot::Arbitrator] {
            if slot == own_slot {
                continue;
            }
            if let Some(pubkey) = self.trade.data().peer(slot).pubkey {
                if let Some(error) = self
                    .send_message(
                        pubkey,
                        TradeMessage::SignContractRequest(request.clone()),
                    )
                    .await
                    .err()
                {
                    error!(
                        "Protocol w/ TradeUUID {} failed sending sign contract request to {} - {}",
                        self.trade.uid(),
                        slot,
                        error
                    );
                }
            }
        }

        self.trade
            .set_state_if_valid_transition(State::ContractSignatureRequested);
    }

    async fn handle_sign_contract_request(
        &mut self,
        sender_slot: PeerSlot,
        request: SignContractRequest,
    ) {
        if sender_slot == PeerSlot::Arbitrator {
            warn!(
                "Protocol w/ TradeUUID {} received SignContractRequest from arbitrator, ignoring",
                self.trade.uid()
            );
            return;
        }

        self.trade.data_mut().modify_peer(sender_slot, |peer| {
            peer.account_id = Some(request.account_id);
            peer.payment_method = Some(request.payment_method);
            peer.payment_account_payload_hash = Some(request.payment_account_payload_hash);
            peer.payout_address = Some(request.payout_address);
            if peer.reserve_tx_id.is_none() {
                peer.reserve_tx_id = request.reserve_tx_id;
            }
        });

        self.try_sign_contract().await;
    }

    /// Builds and signs the contract once both trading parties' data is
    /// in. Deterministic construction means maker, taker and arbitrator
    /// each arrive at the same hash independently.
    async fn try_sign_contract(&mut self) {
        if self.trade.data().contract().is_some() {
            return;
        }

        let maker = self.trade.data().peer(PeerSlot::Maker);
        let taker = self.trade.data().peer(PeerSlot::Taker);
        if !maker.has_contract_data() || !taker.has_contract_data() {
            return;
        }

        let contract = match self.trade.create_contract() {
            Ok(contract) => contract,
            Err(error) => {
                error!(
                    "Protocol w/ TradeUUID {} failed creating contract - {}",
                    self.trade.uid(),
                    error
                );
                self.notify(ProtocolNotif::TradeError(error.to_string()))
                    .await;
                return;
            }
        };

        let contract_hash = contract.hash();
        self.trade
            .data_mut()
            .set_contract(contract, contract_hash.clone());

        let signature = match self.sign_hash(&contract_hash) {
            Ok(signature) => signature,
            Err(error) => {
                error!(
                    "Protocol w/ TradeUUID {} failed signing contract hash - {}",
                    self.trade.uid(),
                    error
                );
                return;
            }
        };

        let own_slot = self.trade.own_slot();
        let signature_clone = signature.clone();
        self.trade.data_mut().modify_peer(own_slot, |peer| {
            peer.contract_signature = Some(signature_clone)
        });

        let response = SignContractResponse {
            contract_hash,
            signature,
        };
        for slot in [PeerSlot::Maker, PeerSlot::Taker, PeerSlot::Arbitrator] {
            if slot == own_slot {
                continue;
            }
            if let Some(pubkey) = self.trade.data().peer(slot).pubkey {
                if let Some(error) = self
                    .send_message(
                        pubkey,
                        TradeMessage::SignContractResponse(response.clone()),
                    )
                    .await
                    .err()
                {
                    error!(
                        "Protocol w/ TradeUUID {} failed sending sign contract response to {} - {}",
                        self.trade.uid(),
                        slot,
                        error
                    );
                }
            }
        }

        self.trade
            .set_state_if_valid_transition(State::ContractSignatureRequested);
    }

    async fn handle_sign_contract_response(
        &mut self,
        sender_slot: PeerSlot,
        response: SignContractResponse,
    ) {
        // Arbitrator may see responses before both requests; build ours
        // first if the data is already in hand.
        self.try_sign_contract().await;

        let own_hash = match self.trade.data().contract_hash() {
            Some(hash) => hash,
            None => {
                warn!(
                    "Protocol w/ TradeUUID {} received contract signature before local contract exists, ignoring",
                    self.trade.uid()
                );
                return;
            }
        };

        if response.contract_hash != own_hash {
            let message = format!(
                "Contract hash mismatch with {}: local {} vs peer {}",
                sender_slot, own_hash, response.contract_hash
            );
            error!(
                "Protocol w/ TradeUUID {} {} - refusing trade",
                self.trade.uid(),
                message
            );
            self.notify(ProtocolNotif::TradeError(message)).await;
            return;
        }

        let sender_pubkey = match self.trade.data().peer(sender_slot).pubkey {
            Some(pubkey) => pubkey,
            None => return,
        };

        if !self.verify_hash_signature(&own_hash, &response.signature, &sender_pubkey) {
            warn!(
                "Protocol w/ TradeUUID {} received invalid contract signature from {}, ignoring",
                self.trade.uid(),
                sender_slot
            );
            return;
        }

        self.trade.data_mut().modify_peer(sender_slot, |peer| {
            peer.contract_signature = Some(response.signature)
        });

        let both_signed = self
            .trade
            .data()
            .peer(PeerSlot::Maker)
            .contract_signature
            .is_some()
            && self
                .trade
                .data()
                .peer(PeerSlot::Taker)
                .contract_signature
                .is_some();

        if both_signed {
            self.trade
                .set_state_if_valid_transition(State::ContractSigned);
            self.notify(ProtocolNotif::StateChanged(self.trade.state()))
                .await;
        }
    }

    async fn handle_deposit_request(&mut self, sender_slot: PeerSlot, request: DepositRequest) {
        if !self.trade.role().is_arbitrator() {
            warn!(
                "Protocol w/ TradeUUID {} with role {} received DepositRequest, ignoring",
                self.trade.uid(),
                self.trade.role()
            );
            return;
        }
        if sender_slot == PeerSlot::Arbitrator {
            return;
        }

        self.trade.data_mut().modify_peer(sender_slot, |peer| {
            peer.deposit_tx_id = Some(request.deposit_tx_id);
            peer.deposit_tx_hex = Some(request.deposit_tx_hex);
        });

        self.trade
            .set_state_if_valid_transition(State::SawDepositRequest);

        let maker = self.trade.data().peer(PeerSlot::Maker);
        let taker = self.trade.data().peer(PeerSlot::Taker);
        let (maker_hex, taker_hex) = match (maker.deposit_tx_hex, taker.deposit_tx_hex) {
            (Some(maker_hex), Some(taker_hex)) => (maker_hex, taker_hex),
            _ => return,
        };

        // Both deposits in hand: publish them and tell both traders
        for tx_hex in [&maker_hex, &taker_hex] {
            if let Some(error) = self.wallet.submit_tx(tx_hex).err() {
                error!(
                    "Protocol w/ TradeUUID {} failed submitting deposit tx - {}",
                    self.trade.uid(),
                    error
                );
                self.notify(ProtocolNotif::TradeError(error.to_string()))
                    .await;
                return;
            }
        }

        let buyer_deposit_tx_id = self.trade.buyer_deposit_tx_id().unwrap_or_default();
        let seller_deposit_tx_id = self.trade.seller_deposit_tx_id().unwrap_or_default();
        let response = DepositResponse {
            buyer_deposit_tx_id,
            seller_deposit_tx_id,
        };

        for slot in [PeerSlot::Maker, PeerSlot::Taker] {
            if let Some(pubkey) = self.trade.data().peer(slot).pubkey {
                if let Some(error) = self
                    .send_message(pubkey, TradeMessage::DepositResponse(response.clone()))
                    .await
                    .err()
                {
                    error!(
                        "Protocol w/ TradeUUID {} failed sending deposit response to {} - {}",
                        self.trade.uid(),
                        slot,
                        error
                    );
                }
            }
        }

        self.watcher.arm(self.trade.uid());
    }

    async fn handle_deposit_response(
        &mut self,
        sender_slot: PeerSlot,
        response: DepositResponse,
        msg_type: &'static str,
        msg_uid: Uuid,
    ) {
        if sender_slot != PeerSlot::Arbitrator {
            warn!(
                "Protocol w/ TradeUUID {} received DepositResponse from {}, only the arbitrator sends those, ignoring",
                self.trade.uid(),
                sender_slot
            );
            return;
        }

        if self.trade.buyer_deposit_tx_id().is_some() && self.trade.seller_deposit_tx_id().is_some()
        {
            warn!(
                "Protocol w/ TradeUUID {} already applied a DepositResponse, ignoring duplicate",
                self.trade.uid()
            );
            return;
        }

        let buyer_slot = self.trade.buyer_slot();
        let seller_slot = self.trade.seller_slot();
        let buyer_id = response.buyer_deposit_tx_id.clone();
        let seller_id = response.seller_deposit_tx_id.clone();
        self.trade
            .data_mut()
            .modify_peer(buyer_slot, |peer| peer.deposit_tx_id = Some(buyer_id));
        self.trade
            .data_mut()
            .modify_peer(seller_slot, |peer| peer.deposit_tx_id = Some(seller_id));

        self.watcher.arm(self.trade.uid());

        self.send_ack(sender_slot, msg_type, msg_uid, true, None).await;
    }

    async fn handle_payment_sent_message(
        &mut self,
        sender_slot: PeerSlot,
        _message: PaymentSentMessage,
        msg_type: &'static str,
        msg_uid: Uuid,
    ) {
        if !self.trade.role().is_seller() || sender_slot != self.trade.buyer_slot() {
            warn!(
                "Protocol w/ TradeUUID {} role {} received PaymentSentMessage from {}, ignoring",
                self.trade.uid(),
                self.trade.role(),
                sender_slot
            );
            return;
        }

        self.trade
            .set_state_if_valid_transition(State::SellerReceivedPaymentSentMsg);
        self.notify(ProtocolNotif::StateChanged(self.trade.state()))
            .await;
        self.send_ack(sender_slot, msg_type, msg_uid, true, None).await;
    }

    async fn handle_payment_received_message(
        &mut self,
        sender_slot: PeerSlot,
        message: PaymentReceivedMessage,
        msg_type: &'static str,
        msg_uid: Uuid,
    ) {
        if !self.trade.role().is_buyer() || sender_slot != self.trade.seller_slot() {
            warn!(
                "Protocol w/ TradeUUID {} role {} received PaymentReceivedMessage from {}, ignoring",
                self.trade.uid(),
                self.trade.role(),
                sender_slot
            );
            return;
        }

        let contract = match self.trade.data().contract() {
            Some(contract) => contract,
            None => {
                warn!(
                    "Protocol w/ TradeUUID {} received payout proposal without a contract, ignoring",
                    self.trade.uid()
                );
                return;
            }
        };

        self.trade
            .set_state_if_valid_transition(State::BuyerReceivedPaymentReceivedMsg);

        let (buyer_tx_id, seller_tx_id) = match self.deposit_tx_ids() {
            Ok(ids) => ids,
            Err(error) => {
                error!(
                    "Protocol w/ TradeUUID {} missing deposit ids for payout verification - {}",
                    self.trade.uid(),
                    error
                );
                return;
            }
        };

        let deposits =
            match PayoutDeposits::read(self.wallet.as_ref(), &buyer_tx_id, &seller_tx_id) {
                Ok(deposits) => deposits,
                Err(error) => {
                    error!(
                        "Protocol w/ TradeUUID {} failed reading deposits from escrow wallet - {}",
                        self.trade.uid(),
                        error
                    );
                    self.notify(ProtocolNotif::TradeError(error.to_string()))
                        .await;
                    return;
                }
            };

        // Independently re-derive and verify before counter-signing.
        // Sign and submit only when every check passes.
        let verified = match verify_payout_tx(
            self.wallet.as_ref(),
            &contract,
            deposits,
            &message.signed_payout_tx_hex,
            true,
            true,
        ) {
            Ok(verified) => verified,
            Err(error) => {
                let reason = error.to_string();
                error!(
                    "Protocol w/ TradeUUID {} rejected peer payout tx - {}",
                    self.trade.uid(),
                    reason
                );
                self.notify(ProtocolNotif::TradeError(reason.clone())).await;
                self.send_ack(sender_slot, msg_type, msg_uid, false, Some(reason))
                    .await;
                return;
            }
        };

        // Verified amounts must also line up with this role's payout rule
        if let Ok(expected) = self.own_expected_payout(&deposits) {
            if verified.buyer_amount + verified.tx_cost / 2 != expected {
                warn!(
                    "Protocol w/ TradeUUID {} accepted payout pays own side {} + cost {} but policy expects {}",
                    self.trade.uid(),
                    verified.buyer_amount,
                    verified.tx_cost / 2,
                    expected
                );
            }
        }

        if let Some(error) = self.wallet.flush().err() {
            debug!(
                "Protocol w/ TradeUUID {} wallet flush after payout submit - {}",
                self.trade.uid(),
                error
            );
        }

        self.trade
            .data_mut()
            .set_payout_tx(verified.tx_id.clone(), Some(verified.tx_hex));
        self.trade
            .set_state_if_valid_transition(State::PayoutTxPublished);
        self.notify(ProtocolNotif::PayoutPublished(verified.tx_id.clone()))
            .await;

        let published = PayoutPublishedMessage {
            payout_tx_id: verified.tx_id,
        };
        let own_slot = self.trade.own_slot();
        for slot in [PeerSlot::Maker, PeerSlot::Taker, PeerSlot::Arbitrator] {
            if slot == own_slot {
                continue;
            }
            if let Some(pubkey) = self.trade.data().peer(slot).pubkey {
                if let Some(error) = self
                    .send_message(
                        pubkey,
                        TradeMessage::PayoutPublishedMessage(published.clone()),
                    )
                    .await
                    .err()
                {
                    error!(
                        "Protocol w/ TradeUUID {} failed sending payout published to {} - {}",
                        self.trade.uid(),
                        slot,
                        error
                    );
                }
            }
        }

        self.send_ack(sender_slot, msg_type, msg_uid, true, None).await;
    }

    async fn handle_payout_published_message(
        &mut self,
        _sender_slot: PeerSlot,
        message: PayoutPublishedMessage,
    ) {
        if self.trade.data().payout_tx_id().is_none() {
            self.trade
                .data_mut()
                .set_payout_tx(message.payout_tx_id, None);
        }
        self.trade
            .set_state_if_valid_transition(State::SawPayoutTxInNetwork);
        self.notify(ProtocolNotif::StateChanged(self.trade.state()))
            .await;
    }

    fn handle_ack(&mut self, sender_slot: PeerSlot, ack: AckMessage) {
        if ack.success {
            debug!(
                "Protocol w/ TradeUUID {} received ack from {} for {} ({})",
                self.trade.uid(),
                sender_slot,
                ack.source_msg_type,
                ack.source_msg_uid
            );
        } else {
            warn!(
                "Protocol w/ TradeUUID {} peer {} rejected {} - {}",
                self.trade.uid(),
                sender_slot,
                ack.source_msg_type,
                ack.error_message.unwrap_or_default()
            );
        }
    }

    async fn handle_new_block(&mut self, height: u64) {
        if !self.watcher.is_armed() {
            return;
        }

        let state_before = self.trade.state();
        let wallet = self.wallet.clone();
        if let Some(error) = self
            .watcher
            .on_new_block(height, wallet.as_ref(), &mut self.trade)
            .err()
        {
            error!(
                "Protocol w/ TradeUUID {} deposit watcher failed at height {} - {}",
                self.trade.uid(),
                height,
                error
            );
            return;
        }

        if self.trade.state() != state_before {
            self.notify(ProtocolNotif::StateChanged(self.trade.state()))
                .await;
        }
    }

    // Helpers

    fn slot_for_pubkey(&self, pubkey: &XOnlyPublicKey) -> Option<PeerSlot> {
        for slot in [PeerSlot::Maker, PeerSlot::Taker, PeerSlot::Arbitrator] {
            if self.trade.data().peer(slot).pubkey.as_ref() == Some(pubkey) {
                return Some(slot);
            }
        }
        None
    }

    fn deposit_tx_ids(&self) -> Result<(TxIdString, TxIdString), TriEscrowError> {
        match (
            self.trade.buyer_deposit_tx_id(),
            self.trade.seller_deposit_tx_id(),
        ) {
            (Some(buyer), Some(seller)) => Ok((buyer, seller)),
            _ => Err(TriEscrowError::Simple(format!(
                "Trade w/ TradeUUID {} does not know both deposit tx ids",
                self.trade.uid()
            ))),
        }
    }

    async fn send_message(
        &self,
        to: XOnlyPublicKey,
        message: TradeMessage,
    ) -> Result<(), TriEscrowError> {
        let envelope = TradeMessageEnvelope {
            sender_pubkey: self.own_pubkey,
            trade_id: self.trade.id(),
            msg_uid: Uuid::new_v4(),
            message,
        };
        self.comms.send_trade_message(to, envelope).await
    }

    async fn send_ack(
        &self,
        to_slot: PeerSlot,
        source_msg_type: &str,
        source_msg_uid: Uuid,
        success: bool,
        error_message: Option<String>,
    ) {
        let pubkey = match self.trade.data().peer(to_slot).pubkey {
            Some(pubkey) => pubkey,
            None => return,
        };
        let ack = AckMessage {
            source_msg_type: source_msg_type.to_string(),
            source_msg_uid,
            success,
            error_message,
        };
        if let Some(error) = self
            .send_message(pubkey, TradeMessage::Ack(ack))
            .await
            .err()
        {
            error!(
                "Protocol w/ TradeUUID {} failed sending ack to {} - {}",
                self.trade.uid(),
                to_slot,
                error
            );
        }
    }

    fn sign_hash(&self, hash_hex: &str) -> Result<String, TriEscrowError> {
        let digest = hex::decode(hash_hex)
            .map_err(|error| TriEscrowError::Simple(format!("bad hash hex - {}", error)))?;
        let message = Message::from_slice(&digest)
            .map_err(|error| TriEscrowError::Simple(format!("bad hash digest - {}", error)))?;
        let secp = Secp256k1::new();
        let signature = secp.sign_schnorr(&message, &self.keypair);
        Ok(signature.to_string())
    }

    fn verify_hash_signature(
        &self,
        hash_hex: &str,
        signature: &str,
        pubkey: &XOnlyPublicKey,
    ) -> bool {
        let digest = match hex::decode(hash_hex) {
            Ok(digest) => digest,
            Err(_) => return false,
        };
        let message = match Message::from_slice(&digest) {
            Ok(message) => message,
            Err(_) => return false,
        };
        let signature = match signature.parse::<schnorr::Signature>() {
            Ok(signature) => signature,
            Err(_) => return false,
        };
        let secp = Secp256k1::new();
        secp.verify_schnorr(&signature, &message, pubkey).is_ok()
    }

    async fn notify(&self, notif: ProtocolNotif) {
        if let Some(tx) = &self.notif_tx {
            if let Some(error) = tx.send(Ok(notif)).await.err() {
                error!(
                    "Protocol w/ TradeUUID {} failed in notifying user - {}",
                    self.trade.uid(),
                    error
                );
            }
        } else {
            debug!(
                "Protocol w/ TradeUUID {} do not have notif_tx registered",
                self.trade.uid()
            );
        }
    }
}
