use std::{error::Error, fmt};

use serde::{Deserialize, Serialize};

/// Reason a peer-proposed payout transaction was refused before signing.
/// Every rejection is specific so operators can tell a buggy peer from a
/// malicious one out of the logs alone.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayoutRejectReason {
    UndecodableTransaction(String),
    WrongTransferCount { expected: usize, actual: usize },
    WrongDestinationCount { expected: usize, actual: usize },
    BuyerAddressMissing(String),
    SellerAddressMissing(String),
    ForeignChangeAddress(String),
    OutputSumMismatch { outputs: u64, expected: u64 },
    BuyerAmountMismatch { expected: u64, actual: u64 },
    SellerAmountMismatch { expected: u64, actual: u64 },
}

impl fmt::Display for PayoutRejectReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let reason_string = match self {
            PayoutRejectReason::UndecodableTransaction(msg) => {
                format!("payout tx hex could not be decoded - {}", msg)
            }
            PayoutRejectReason::WrongTransferCount { expected, actual } => {
                format!(
                    "payout tx must contain exactly {} outgoing transfer, found {}",
                    expected, actual
                )
            }
            PayoutRejectReason::WrongDestinationCount { expected, actual } => {
                format!(
                    "payout tx must pay exactly {} destinations, found {}",
                    expected, actual
                )
            }
            PayoutRejectReason::BuyerAddressMissing(address) => {
                format!("no destination pays the buyer payout address {}", address)
            }
            PayoutRejectReason::SellerAddressMissing(address) => {
                format!("no destination pays the seller payout address {}", address)
            }
            PayoutRejectReason::ForeignChangeAddress(address) => {
                format!(
                    "change returns to {} instead of the escrow wallet primary address",
                    address
                )
            }
            PayoutRejectReason::OutputSumMismatch { outputs, expected } => {
                format!(
                    "sum of outputs {} != destinations + change {}",
                    outputs, expected
                )
            }
            PayoutRejectReason::BuyerAmountMismatch { expected, actual } => {
                format!("buyer destination {} != expected {}", actual, expected)
            }
            PayoutRejectReason::SellerAmountMismatch { expected, actual } => {
                format!("seller destination {} != expected {}", actual, expected)
            }
        };
        write!(f, "{}", reason_string)
    }
}

#[derive(Debug)]
pub enum TriEscrowError {
    Simple(String),
    Protocol(String),
    PayoutRejected(PayoutRejectReason),
    PayoutConstruction(String),
    Wallet(String),
    StrumParsing(strum::ParseError),
    SerdesJson(serde_json::Error),
    Io(std::io::Error),
    MpscSend(String),
    OneshotRecv(tokio::sync::oneshot::error::RecvError),
}

impl Error for TriEscrowError {}

impl fmt::Display for TriEscrowError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let error_string = match self {
            TriEscrowError::Simple(msg) => format!("TriEscrow-Error | Other - {}", msg),
            TriEscrowError::Protocol(msg) => {
                format!("TriEscrow-Error | Protocol - {}", msg)
            }
            TriEscrowError::PayoutRejected(reason) => {
                format!("TriEscrow-Error | PayoutRejected - {}", reason)
            }
            TriEscrowError::PayoutConstruction(msg) => {
                format!("TriEscrow-Error | PayoutConstruction - {}", msg)
            }
            TriEscrowError::Wallet(msg) => format!("TriEscrow-Error | Wallet - {}", msg),
            TriEscrowError::StrumParsing(err) => {
                format!("TriEscrow-Error | StrumParseError - {}", err)
            }
            TriEscrowError::SerdesJson(err) => {
                format!("TriEscrow-Error | SerdesJsonError - {}", err)
            }
            TriEscrowError::Io(err) => format!("TriEscrow-Error | IoError - {}", err),
            TriEscrowError::MpscSend(msg) => {
                format!("TriEscrow-Error | MpscSendError - {}", msg)
            }
            TriEscrowError::OneshotRecv(err) => {
                format!("TriEscrow-Error | OneshotRecvError - {}", err)
            }
        };
        write!(f, "{}", error_string)
    }
}

impl From<strum::ParseError> for TriEscrowError {
    fn from(e: strum::ParseError) -> TriEscrowError {
        TriEscrowError::StrumParsing(e)
    }
}

impl From<serde_json::Error> for TriEscrowError {
    fn from(e: serde_json::Error) -> TriEscrowError {
        TriEscrowError::SerdesJson(e)
    }
}

impl From<std::io::Error> for TriEscrowError {
    fn from(e: std::io::Error) -> TriEscrowError {
        TriEscrowError::Io(e)
    }
}

impl From<PayoutRejectReason> for TriEscrowError {
    fn from(reason: PayoutRejectReason) -> TriEscrowError {
        TriEscrowError::PayoutRejected(reason)
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for TriEscrowError {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> TriEscrowError {
        TriEscrowError::MpscSend(e.to_string())
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for TriEscrowError {
    fn from(e: tokio::sync::oneshot::error::RecvError) -> TriEscrowError {
        TriEscrowError::OneshotRecv(e)
    }
}
