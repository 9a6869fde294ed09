use std::error::Error;
use std::fmt::{Display, Formatter, Result};

use bitcoin::Amount;

use crate::{common::TradeId, task::FailureKind};

#[derive(Debug)]
pub enum FiatSwapError {
    Simple {
        description: String,
    },
    UnknownTrade {
        trade_id: TradeId,
    },
    OutOfPhase {
        trade_id: TradeId,
        description: String,
    },
    ContractViolation {
        description: String,
    },
    TaskFailed {
        trade_id: TradeId,
        kind: FailureKind,
        reason: String,
    },
    InsufficientFunds {
        needed: Amount,
        available: Amount,
    },
    InvalidAddress {
        address: String,
        description: String,
    },
    Transport {
        description: String,
    },
    ChannelClosed {
        description: String,
    },
    SerdesJson {
        error: serde_json::Error,
    },
    Io {
        error: std::io::Error,
    },
    Secp256k1 {
        error: secp256k1::Error,
    },
}

impl Error for FiatSwapError {}

impl Display for FiatSwapError {
    fn fmt(&self, f: &mut Formatter) -> Result {
        let error_string: String = match self {
            FiatSwapError::Simple { description } => {
                format!("FiatSwap-Error | Simple - {}", description)
            }
            FiatSwapError::UnknownTrade { trade_id } => {
                format!("FiatSwap-Error | UnknownTrade - No pending trade w/ TradeID {}", trade_id)
            }
            FiatSwapError::OutOfPhase {
                trade_id,
                description,
            } => format!(
                "FiatSwap-Error | OutOfPhase - Trade w/ TradeID {} - {}",
                trade_id, description
            ),
            FiatSwapError::ContractViolation { description } => {
                format!("FiatSwap-Error | ContractViolation - {}", description)
            }
            FiatSwapError::TaskFailed {
                trade_id,
                kind,
                reason,
            } => format!(
                "FiatSwap-Error | TaskFailed - Trade w/ TradeID {} - {:?} failure - {}",
                trade_id, kind, reason
            ),
            FiatSwapError::InsufficientFunds { needed, available } => format!(
                "FiatSwap-Error | InsufficientFunds - needed {} but only {} available",
                needed, available
            ),
            FiatSwapError::InvalidAddress {
                address,
                description,
            } => format!(
                "FiatSwap-Error | InvalidAddress - {:?} - {}",
                address, description
            ),
            FiatSwapError::Transport { description } => {
                format!("FiatSwap-Error | Transport - {}", description)
            }
            FiatSwapError::ChannelClosed { description } => {
                format!("FiatSwap-Error | ChannelClosed - {}", description)
            }
            FiatSwapError::SerdesJson { error } => {
                format!("FiatSwap-Error | serde_json - {}", error)
            }
            FiatSwapError::Io { error } => format!("FiatSwap-Error | io - {}", error),
            FiatSwapError::Secp256k1 { error } => {
                format!("FiatSwap-Error | secp256k1 - {}", error)
            }
        };
        write!(f, "{}", error_string)
    }
}

impl FiatSwapError {
    pub(crate) fn simple(description: impl Into<String>) -> Self {
        FiatSwapError::Simple {
            description: description.into(),
        }
    }

    pub(crate) fn contract(description: impl Into<String>) -> Self {
        FiatSwapError::ContractViolation {
            description: description.into(),
        }
    }
}

impl From<serde_json::Error> for FiatSwapError {
    fn from(e: serde_json::Error) -> FiatSwapError {
        FiatSwapError::SerdesJson { error: e }
    }
}

impl From<std::io::Error> for FiatSwapError {
    fn from(e: std::io::Error) -> FiatSwapError {
        FiatSwapError::Io { error: e }
    }
}

impl From<secp256k1::Error> for FiatSwapError {
    fn from(e: secp256k1::Error) -> FiatSwapError {
        FiatSwapError::Secp256k1 { error: e }
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for FiatSwapError {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> FiatSwapError {
        FiatSwapError::ChannelClosed {
            description: e.to_string(),
        }
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for FiatSwapError {
    fn from(e: tokio::sync::oneshot::error::RecvError) -> FiatSwapError {
        FiatSwapError::ChannelClosed {
            description: e.to_string(),
        }
    }
}
