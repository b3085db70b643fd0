use tracing::{debug, info, warn};

use crate::{
    common::{
        config::EngineConfig,
        error::{PayoutRejectReason, TriEscrowError},
        types::TxIdString,
    },
    contract::Contract,
    wallet::{CreatedTx, EscrowWallet, TransferDestination},
};

/// Both parties' escrow deposits, read back from the shared escrow wallet
/// rather than trusted from any message.
#[derive(Clone, Copy, Debug)]
pub struct PayoutDeposits {
    pub buyer_deposit: u64,
    pub seller_deposit: u64,
}

impl PayoutDeposits {
    pub fn read(
        wallet: &dyn EscrowWallet,
        buyer_deposit_tx_id: &TxIdString,
        seller_deposit_tx_id: &TxIdString,
    ) -> Result<Self, TriEscrowError> {
        let buyer_deposit = wallet.incoming_amount(buyer_deposit_tx_id)?;
        let seller_deposit = wallet.incoming_amount(seller_deposit_tx_id)?;
        Ok(Self {
            buyer_deposit,
            seller_deposit,
        })
    }
}

/// Gross payout per side before the fee split. The buyer receives their
/// deposit plus the trade amount, the seller their deposit minus it.
pub fn payout_amounts(
    deposits: PayoutDeposits,
    trade_amount: u64,
) -> Result<(u64, u64), TriEscrowError> {
    let seller_payout = deposits
        .seller_deposit
        .checked_sub(trade_amount)
        .ok_or_else(|| {
            TriEscrowError::Simple(format!(
                "seller deposit {} does not cover trade amount {}",
                deposits.seller_deposit, trade_amount
            ))
        })?;
    let buyer_payout = deposits.buyer_deposit + trade_amount;
    Ok((buyer_payout, seller_payout))
}

/// Builds the two-destination payout transaction. A trial (non-relayed)
/// build at a fraction of each payout probes the network fee; the real
/// build then subtracts half the fee from each side and retries with a
/// bumped estimate until the wallet accepts it or the attempt cap runs
/// out. Construction failures below the cap are retried, not fatal.
pub fn create_payout_tx(
    wallet: &dyn EscrowWallet,
    config: &EngineConfig,
    contract: &Contract,
    deposits: PayoutDeposits,
) -> Result<CreatedTx, TriEscrowError> {
    let (buyer_payout, seller_payout) = payout_amounts(deposits, contract.trade_amount)?;

    let trial_destinations = vec![
        TransferDestination {
            address: contract.buyer_payout_address().to_owned(),
            amount: buyer_payout * config.payout_trial_percent / 100,
        },
        TransferDestination {
            address: contract.seller_payout_address().to_owned(),
            amount: seller_payout * config.payout_trial_percent / 100,
        },
    ];

    let mut fee_estimate = match wallet.create_tx(trial_destinations) {
        Ok(trial_tx) => trial_tx.fee,
        Err(error) => {
            debug!(
                "Trial payout build failed, falling back to wallet fee estimate - {}",
                error
            );
            wallet.fee_estimate()?
        }
    };

    for attempt in 1..=config.payout_fee_attempt_cap {
        let half_fee = fee_estimate / 2;
        if half_fee >= buyer_payout || half_fee >= seller_payout {
            return Err(TriEscrowError::PayoutConstruction(format!(
                "fee estimate {} exceeds payout amounts {}/{}",
                fee_estimate, buyer_payout, seller_payout
            )));
        }

        let destinations = vec![
            TransferDestination {
                address: contract.buyer_payout_address().to_owned(),
                amount: buyer_payout - half_fee,
            },
            TransferDestination {
                address: contract.seller_payout_address().to_owned(),
                amount: seller_payout - half_fee,
            },
        ];

        match wallet.create_tx(destinations) {
            Ok(payout_tx) => {
                info!(
                    "Payout tx {} built on attempt {} with fee estimate {}",
                    payout_tx.tx_id, attempt, fee_estimate
                );
                return Ok(payout_tx);
            }
            Err(error) => {
                debug!(
                    "Payout build attempt {} failed with fee estimate {}, bumping - {}",
                    attempt, fee_estimate, error
                );
                fee_estimate += (fee_estimate * config.payout_fee_bump_percent / 100).max(1);
            }
        }
    }

    Err(TriEscrowError::PayoutConstruction(format!(
        "no valid payout tx within {} attempts",
        config.payout_fee_attempt_cap
    )))
}

/// Result of a successful payout verification. `tx_id` reflects the
/// signed transaction when signing was instructed.
#[derive(Clone, Debug)]
pub struct VerifiedPayout {
    pub tx_id: TxIdString,
    pub tx_hex: String,
    pub fee: u64,
    pub tx_cost: u64,
    pub buyer_amount: u64,
    pub seller_amount: u64,
    pub published: bool,
}

/// Independently re-verifies a peer-proposed payout transaction against
/// the contract and the deposits this wallet has itself observed. Only
/// after every check passes is the transaction signed (if instructed) and
/// submitted (if instructed). Any failure rejects with a specific reason
/// and leaves nothing signed, submitted or mutated.
pub fn verify_payout_tx(
    wallet: &dyn EscrowWallet,
    contract: &Contract,
    deposits: PayoutDeposits,
    tx_hex: &str,
    sign: bool,
    publish: bool,
) -> Result<VerifiedPayout, TriEscrowError> {
    let description = wallet.describe_tx(tx_hex).map_err(|error| {
        PayoutRejectReason::UndecodableTransaction(error.to_string())
    })?;

    if description.num_transfers != 1 {
        return Err(PayoutRejectReason::WrongTransferCount {
            expected: 1,
            actual: description.num_transfers,
        }
        .into());
    }

    if description.destinations.len() != 2 {
        return Err(PayoutRejectReason::WrongDestinationCount {
            expected: 2,
            actual: description.destinations.len(),
        }
        .into());
    }

    // The peer does not guarantee destination order; match by address.
    let buyer_address = contract.buyer_payout_address();
    let seller_address = contract.seller_payout_address();

    let buyer_destination = description
        .destinations
        .iter()
        .find(|destination| &destination.address == buyer_address)
        .ok_or_else(|| PayoutRejectReason::BuyerAddressMissing(buyer_address.to_owned()))?;

    let seller_destination = description
        .destinations
        .iter()
        .find(|destination| &destination.address == seller_address)
        .ok_or_else(|| PayoutRejectReason::SellerAddressMissing(seller_address.to_owned()))?;

    // Change anywhere but back into the escrow wallet is fund diversion.
    if description.change_amount > 0 {
        let escrow_address = wallet.primary_address();
        match description.change_address.as_ref() {
            Some(change_address) if change_address == &escrow_address => {}
            Some(change_address) => {
                return Err(
                    PayoutRejectReason::ForeignChangeAddress(change_address.to_owned()).into(),
                );
            }
            None => {
                return Err(
                    PayoutRejectReason::ForeignChangeAddress("<unknown>".to_string()).into(),
                );
            }
        }
    }

    let destination_sum = buyer_destination.amount + seller_destination.amount;
    let expected_output_sum = destination_sum + description.change_amount;
    if description.output_sum != expected_output_sum {
        return Err(PayoutRejectReason::OutputSumMismatch {
            outputs: description.output_sum,
            expected: expected_output_sum,
        }
        .into());
    }

    let (buyer_payout, seller_payout) = payout_amounts(deposits, contract.trade_amount)?;
    let tx_cost = description.fee + description.change_amount;
    let half_cost = tx_cost / 2;

    let expected_buyer = buyer_payout.saturating_sub(half_cost);
    if buyer_destination.amount != expected_buyer {
        return Err(PayoutRejectReason::BuyerAmountMismatch {
            expected: expected_buyer,
            actual: buyer_destination.amount,
        }
        .into());
    }

    let expected_seller = seller_payout.saturating_sub(half_cost);
    if seller_destination.amount != expected_seller {
        return Err(PayoutRejectReason::SellerAmountMismatch {
            expected: expected_seller,
            actual: seller_destination.amount,
        }
        .into());
    }

    let buyer_amount = buyer_destination.amount;
    let seller_amount = seller_destination.amount;

    let (tx_id, tx_hex) = if sign {
        let signed = wallet.sign_tx(tx_hex)?;
        (signed.tx_id, signed.tx_hex)
    } else {
        // No authoritative id until the tx is signed
        (String::new(), tx_hex.to_string())
    };

    let published = if publish {
        let submitted_id = wallet.submit_tx(&tx_hex)?;
        if !tx_id.is_empty() && submitted_id != tx_id {
            warn!(
                "Submitted payout tx id {} differs from signed id {}",
                submitted_id, tx_id
            );
        }
        true
    } else {
        false
    };

    Ok(VerifiedPayout {
        tx_id,
        tx_hex,
        fee: description.fee,
        tx_cost,
        buyer_amount,
        seller_amount,
        published,
    })
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use iso_currency::Currency;
    use secp256k1::{KeyPair, Secp256k1, SecretKey, XOnlyPublicKey};
    use uuid::Uuid;

    use crate::{
        common::{error::TriEscrowError, types::FiatPaymentMethod},
        contract::ContractBuilder,
        wallet::{MockEscrowWallet, SignedTx, TxDescription},
    };

    use super::*;

    const BUYER_DEPOSIT: u64 = 150_000;
    const SELLER_DEPOSIT: u64 = 1_150_000;
    const TRADE_AMOUNT: u64 = 1_000_000;

    fn some_pubkey(fill: u8) -> XOnlyPublicKey {
        let secp = Secp256k1::new();
        let keypair = KeyPair::from_secret_key(&secp, &SecretKey::from_slice(&[fill; 32]).unwrap());
        XOnlyPublicKey::from_keypair(&keypair).0
    }

    fn some_contract() -> Contract {
        ContractBuilder::new()
            .trade_id(Uuid::from_str("20c38e4e-37a8-4ab2-954b-8a7f56904185").unwrap())
            .trade_amount(TRADE_AMOUNT)
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
            .maker_payout_address("buyer-payout-addr")
            .taker_payout_address("seller-payout-addr")
            .lock_time(10)
            .build()
            .unwrap()
    }

    fn deposits() -> PayoutDeposits {
        PayoutDeposits {
            buyer_deposit: BUYER_DEPOSIT,
            seller_deposit: SELLER_DEPOSIT,
        }
    }

    /// Well-formed description for fee `fee` with no change.
    fn valid_description(fee: u64) -> TxDescription {
        let half = fee / 2;
        let buyer_amount = BUYER_DEPOSIT + TRADE_AMOUNT - half;
        let seller_amount = SELLER_DEPOSIT - TRADE_AMOUNT - half;
        TxDescription {
            num_transfers: 1,
            destinations: vec![
                TransferDestination {
                    address: "seller-payout-addr".to_string(),
                    amount: seller_amount,
                },
                TransferDestination {
                    address: "buyer-payout-addr".to_string(),
                    amount: buyer_amount,
                },
            ],
            change_address: None,
            change_amount: 0,
            fee,
            output_sum: buyer_amount + seller_amount,
        }
    }

    #[test]
    fn payout_amounts_conserve_deposits() {
        let (buyer, seller) = payout_amounts(deposits(), TRADE_AMOUNT).unwrap();
        assert_eq!(buyer, BUYER_DEPOSIT + TRADE_AMOUNT);
        assert_eq!(seller, SELLER_DEPOSIT - TRADE_AMOUNT);
        assert_eq!(buyer + seller, BUYER_DEPOSIT + SELLER_DEPOSIT);
    }

    #[test]
    fn payout_amounts_reject_insufficient_seller_deposit() {
        let result = payout_amounts(
            PayoutDeposits {
                buyer_deposit: BUYER_DEPOSIT,
                seller_deposit: TRADE_AMOUNT - 1,
            },
            TRADE_AMOUNT,
        );
        assert!(result.is_err());
    }

    #[test]
    fn create_retries_with_bumped_fee_until_success() {
        let contract = some_contract();
        let config = EngineConfig::default();

        let mut wallet = MockEscrowWallet::new();
        // Trial build reports a fee of 1000
        let mut calls = 0;
        wallet.expect_create_tx().returning(move |destinations| {
            calls += 1;
            match calls {
                // Trial
                1 => Ok(CreatedTx {
                    tx_id: "trial".to_string(),
                    tx_hex: "trial-hex".to_string(),
                    fee: 1000,
                    destinations,
                    change_amount: 0,
                }),
                // First two real attempts fail on insufficient fee
                2 | 3 => Err(TriEscrowError::Wallet("fee too low".to_string())),
                _ => Ok(CreatedTx {
                    tx_id: "payout".to_string(),
                    tx_hex: "payout-hex".to_string(),
                    fee: 1210,
                    destinations,
                    change_amount: 0,
                }),
            }
        });

        let payout = create_payout_tx(&wallet, &config, &contract, deposits()).unwrap();
        assert_eq!(payout.tx_id, "payout");
        // 1000 bumped 10% twice: 1000 -> 1100 -> 1210, half-fee 605
        let (buyer_payout, seller_payout) = payout_amounts(deposits(), TRADE_AMOUNT).unwrap();
        assert_eq!(payout.destinations[0].amount, buyer_payout - 605);
        assert_eq!(payout.destinations[1].amount, seller_payout - 605);
    }

    #[test]
    fn create_fails_after_attempt_cap() {
        let contract = some_contract();
        let mut config = EngineConfig::default();
        config.payout_fee_attempt_cap = 5;

        let mut wallet = MockEscrowWallet::new();
        let mut calls = 0;
        wallet.expect_create_tx().returning(move |destinations| {
            calls += 1;
            if calls == 1 {
                Ok(CreatedTx {
                    tx_id: "trial".to_string(),
                    tx_hex: "trial-hex".to_string(),
                    fee: 1000,
                    destinations,
                    change_amount: 0,
                })
            } else {
                Err(TriEscrowError::Wallet("fee too low".to_string()))
            }
        });

        let result = create_payout_tx(&wallet, &config, &contract, deposits());
        match result {
            Err(TriEscrowError::PayoutConstruction(msg)) => {
                assert!(msg.contains("5 attempts"), "{}", msg)
            }
            other => panic!("expected PayoutConstruction error, got {:?}", other.err()),
        }
    }

    #[test]
    fn create_falls_back_to_fee_estimate_when_trial_fails() {
        let contract = some_contract();
        let config = EngineConfig::default();

        let mut wallet = MockEscrowWallet::new();
        let mut calls = 0;
        wallet.expect_create_tx().returning(move |destinations| {
            calls += 1;
            if calls == 1 {
                Err(TriEscrowError::Wallet("trial failed".to_string()))
            } else {
                Ok(CreatedTx {
                    tx_id: "payout".to_string(),
                    tx_hex: "payout-hex".to_string(),
                    fee: 800,
                    destinations,
                    change_amount: 0,
                })
            }
        });
        wallet.expect_fee_estimate().returning(|| Ok(800));

        let payout = create_payout_tx(&wallet, &config, &contract, deposits()).unwrap();
        assert_eq!(payout.tx_id, "payout");
    }

    #[test]
    fn verify_accepts_well_formed_payout_and_conserves_amounts() {
        let contract = some_contract();
        let description = valid_description(1000);

        let mut wallet = MockEscrowWallet::new();
        let desc = description.clone();
        wallet.expect_describe_tx().returning(move |_| Ok(desc.clone()));

        let verified =
            verify_payout_tx(&wallet, &contract, deposits(), "payout-hex", false, false).unwrap();

        assert!(!verified.published);
        assert_eq!(
            verified.buyer_amount + verified.seller_amount + verified.fee,
            BUYER_DEPOSIT + SELLER_DEPOSIT
        );
    }

    #[test]
    fn verify_signs_and_submits_only_when_instructed() {
        let contract = some_contract();
        let description = valid_description(1000);

        let mut wallet = MockEscrowWallet::new();
        let desc = description.clone();
        wallet.expect_describe_tx().returning(move |_| Ok(desc.clone()));
        wallet.expect_sign_tx().times(1).returning(|_| {
            Ok(SignedTx {
                tx_id: "signed-id".to_string(),
                tx_hex: "signed-hex".to_string(),
            })
        });
        wallet
            .expect_submit_tx()
            .times(1)
            .returning(|_| Ok("signed-id".to_string()));

        let verified =
            verify_payout_tx(&wallet, &contract, deposits(), "payout-hex", true, true).unwrap();
        assert_eq!(verified.tx_id, "signed-id");
        assert!(verified.published);
    }

    #[test]
    fn verify_rejects_seller_amount_tampered_by_one_unit() {
        let contract = some_contract();
        let mut description = valid_description(1000);
        // Peer shaves one unit off the seller and hides it in the fee
        description.destinations[0].amount -= 1;
        description.output_sum -= 1;
        description.fee += 1;

        let mut wallet = MockEscrowWallet::new();
        let desc = description.clone();
        wallet.expect_describe_tx().returning(move |_| Ok(desc.clone()));
        // No sign/submit expectations: any signing attempt panics the mock

        let result = verify_payout_tx(&wallet, &contract, deposits(), "payout-hex", true, true);
        match result {
            Err(TriEscrowError::PayoutRejected(PayoutRejectReason::SellerAmountMismatch {
                ..
            })) => {}
            other => panic!("expected SellerAmountMismatch, got {:?}", other.err()),
        }
    }

    #[test]
    fn verify_rejects_substituted_counterparty_address() {
        let contract = some_contract();
        let mut description = valid_description(1000);
        // Peer swaps the buyer payout address for its own
        description.destinations[1].address = "attacker-addr".to_string();

        let mut wallet = MockEscrowWallet::new();
        let desc = description.clone();
        wallet.expect_describe_tx().returning(move |_| Ok(desc.clone()));

        let result = verify_payout_tx(&wallet, &contract, deposits(), "payout-hex", true, true);
        match result {
            Err(TriEscrowError::PayoutRejected(PayoutRejectReason::BuyerAddressMissing(_))) => {}
            other => panic!("expected BuyerAddressMissing, got {:?}", other.err()),
        }
    }

    #[test]
    fn verify_rejects_change_to_foreign_address() {
        let contract = some_contract();
        let mut description = valid_description(1000);
        description.change_amount = 500;
        description.change_address = Some("attacker-addr".to_string());
        description.output_sum += 500;

        let mut wallet = MockEscrowWallet::new();
        let desc = description.clone();
        wallet.expect_describe_tx().returning(move |_| Ok(desc.clone()));
        wallet
            .expect_primary_address()
            .returning(|| "escrow-primary-addr".to_string());

        let result = verify_payout_tx(&wallet, &contract, deposits(), "payout-hex", false, false);
        match result {
            Err(TriEscrowError::PayoutRejected(PayoutRejectReason::ForeignChangeAddress(addr))) => {
                assert_eq!(addr, "attacker-addr")
            }
            other => panic!("expected ForeignChangeAddress, got {:?}", other.err()),
        }
    }

    #[test]
    fn verify_accepts_change_back_to_escrow_and_counts_it_as_cost() {
        let contract = some_contract();
        let change = 500;
        let fee = 1000;
        let tx_cost = fee + change;
        let half = tx_cost / 2;
        let buyer_amount = BUYER_DEPOSIT + TRADE_AMOUNT - half;
        let seller_amount = SELLER_DEPOSIT - TRADE_AMOUNT - half;
        let description = TxDescription {
            num_transfers: 1,
            destinations: vec![
                TransferDestination {
                    address: "buyer-payout-addr".to_string(),
                    amount: buyer_amount,
                },
                TransferDestination {
                    address: "seller-payout-addr".to_string(),
                    amount: seller_amount,
                },
            ],
            change_address: Some("escrow-primary-addr".to_string()),
            change_amount: change,
            fee,
            output_sum: buyer_amount + seller_amount + change,
        };

        let mut wallet = MockEscrowWallet::new();
        let desc = description.clone();
        wallet.expect_describe_tx().returning(move |_| Ok(desc.clone()));
        wallet
            .expect_primary_address()
            .returning(|| "escrow-primary-addr".to_string());

        let verified =
            verify_payout_tx(&wallet, &contract, deposits(), "payout-hex", false, false).unwrap();
        assert_eq!(verified.tx_cost, tx_cost);
    }

    #[test]
    fn verify_rejects_output_sum_mismatch() {
        let contract = some_contract();
        let mut description = valid_description(1000);
        description.output_sum += 7;

        let mut wallet = MockEscrowWallet::new();
        let desc = description.clone();
        wallet.expect_describe_tx().returning(move |_| Ok(desc.clone()));

        let result = verify_payout_tx(&wallet, &contract, deposits(), "payout-hex", false, false);
        match result {
            Err(TriEscrowError::PayoutRejected(PayoutRejectReason::OutputSumMismatch {
                ..
            })) => {}
            other => panic!("expected OutputSumMismatch, got {:?}", other.err()),
        }
    }

    #[test]
    fn verify_rejects_extra_destination() {
        let contract = some_contract();
        let mut description = valid_description(1000);
        description.destinations.push(TransferDestination {
            address: "third-addr".to_string(),
            amount: 1,
        });

        let mut wallet = MockEscrowWallet::new();
        let desc = description.clone();
        wallet.expect_describe_tx().returning(move |_| Ok(desc.clone()));

        let result = verify_payout_tx(&wallet, &contract, deposits(), "payout-hex", false, false);
        match result {
            Err(TriEscrowError::PayoutRejected(PayoutRejectReason::WrongDestinationCount {
                expected: 2,
                actual: 3,
            })) => {}
            other => panic!("expected WrongDestinationCount, got {:?}", other.err()),
        }
    }

    #[test]
    fn verify_rejects_multiple_transfers() {
        let contract = some_contract();
        let mut description = valid_description(1000);
        description.num_transfers = 2;

        let mut wallet = MockEscrowWallet::new();
        let desc = description.clone();
        wallet.expect_describe_tx().returning(move |_| Ok(desc.clone()));

        let result = verify_payout_tx(&wallet, &contract, deposits(), "payout-hex", false, false);
        match result {
            Err(TriEscrowError::PayoutRejected(PayoutRejectReason::WrongTransferCount {
                ..
            })) => {}
            other => panic!("expected WrongTransferCount, got {:?}", other.err()),
        }
    }

    #[test]
    fn verify_rejects_undecodable_hex() {
        let contract = some_contract();
        let mut wallet = MockEscrowWallet::new();
        wallet
            .expect_describe_tx()
            .returning(|_| Err(TriEscrowError::Wallet("garbage".to_string())));

        let result = verify_payout_tx(&wallet, &contract, deposits(), "not-hex", false, false);
        match result {
            Err(TriEscrowError::PayoutRejected(
                PayoutRejectReason::UndecodableTransaction(_),
            )) => {}
            other => panic!("expected UndecodableTransaction, got {:?}", other.err()),
        }
    }
}
