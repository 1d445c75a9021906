use axum::http::StatusCode;
use ethers::types::{Address, U256};
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AtnError>;

#[derive(Error, Debug)]
pub enum AtnError {
    #[error("Insufficient funds: {required} required, {available} available")]
    InsufficientFunds { required: U256, available: U256 },

    #[error("No open channel with {receiver:?}")]
    ChannelNotOpen { receiver: Address },

    #[error("Insufficient channel balance: {required} required, {remaining} remaining")]
    InsufficientChannelBalance { required: U256, remaining: U256 },

    #[error("Ledger transaction failed: {reason}")]
    LedgerTransaction { reason: String },

    #[error("DBot did not sync channel with {receiver:?} within {waited:?}")]
    SyncTimeout { receiver: Address, waited: Duration },

    #[error("Invalid balance proof: {reason}")]
    InvalidBalanceProof { reason: String },

    #[error("Channel with {receiver:?} is waiting for the DBot to sync")]
    AwaitingProviderSync { receiver: Address },

    #[error("Channel with {receiver:?} is not closed")]
    ChannelNotClosed { receiver: Address },

    #[error("Settle period active, {remaining_blocks} blocks remaining")]
    SettlePeriodActive { remaining_blocks: u64 },

    #[error("No such endpoint: {method} {uri}")]
    EndpointNotFound { uri: String, method: String },

    #[error("DBot refused to sign a cooperative close: {reason}")]
    CloseDenied { reason: String },

    #[error("No DBot registered at {address:?}")]
    DbotNotFound { address: Address },

    #[error("DBot returned {status}: {message}")]
    Provider { status: u16, message: String },

    #[error("Signing failed: {0}")]
    Signing(#[from] ethers::signers::WalletError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl AtnError {
    pub fn ledger(reason: impl Into<String>) -> Self {
        Self::LedgerTransaction {
            reason: reason.into(),
        }
    }

    pub fn invalid_proof(reason: impl Into<String>) -> Self {
        Self::InvalidBalanceProof {
            reason: reason.into(),
        }
    }

    pub fn close_denied(reason: impl Into<String>) -> Self {
        Self::CloseDenied {
            reason: reason.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// A timed-out request may still have reached the DBot, so it does not
    /// count as a decisive failure.
    pub fn is_timeout(&self) -> bool {
        matches!(self, AtnError::Http(e) if e.is_timeout())
    }
}

/// Reasons a DBot refuses a balance proof.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProofError {
    #[error("Missing balance proof")]
    Missing,
    #[error("Malformed balance proof: {0}")]
    Malformed(String),
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Proof addressed to another contract or receiver")]
    WrongChannel,
    #[error("Unknown payment channel")]
    UnknownChannel,
    #[error("Balance proof already redeemed")]
    Replayed,
    #[error("Stale nonce: held {held}, received {received}")]
    StaleNonce { held: u64, received: u64 },
    #[error("Insufficient payment channel balance")]
    InsufficientBalance,
    #[error("Balance increment below price")]
    Underpaid,
    #[error("DBot does not sign cooperative closes")]
    CloseUnsupported,
}

impl From<ProofError> for StatusCode {
    fn from(error: ProofError) -> Self {
        match error {
            ProofError::Missing | ProofError::InvalidSignature => StatusCode::UNAUTHORIZED,
            ProofError::Malformed(_) | ProofError::WrongChannel => StatusCode::BAD_REQUEST,
            ProofError::InsufficientBalance | ProofError::Underpaid => StatusCode::PAYMENT_REQUIRED,
            ProofError::UnknownChannel | ProofError::Replayed | ProofError::StaleNonce { .. } => {
                StatusCode::CONFLICT
            }
            ProofError::CloseUnsupported => StatusCode::FORBIDDEN,
        }
    }
}

impl From<ProofError> for AtnError {
    fn from(error: ProofError) -> Self {
        AtnError::invalid_proof(error.to_string())
    }
}
