//! Error types for the bridge relayer

use crate::events::ChainId;

use std::fmt;
use thiserror::Error;

/// Why a destination chain refused a submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectionReason {
    /// Signer is not the relayer configured on the bridge
    Unauthorized,
    /// Destination bridge has no registration for the token
    UnregisteredToken,
    /// Relayer cannot pay for the transaction
    InsufficientBalance,
    /// Nonce or blockhash race with another submission
    NonceRace,
    Other(String),
}

impl RejectionReason {
    /// Classify an RPC or program error message
    pub fn classify(message: &str) -> Self {
        let msg = message.to_lowercase();
        let compact = msg.replace(' ', "");

        if msg.contains("unauthorized")
            || msg.contains("not the relayer")
            || compact.contains("invalidrelayer")
            || msg.contains("constraintaddress")
            || msg.contains("ownableunauthorizedaccount")
        {
            RejectionReason::Unauthorized
        } else if msg.contains("not registered")
            || msg.contains("unregistered")
            || msg.contains("accountnotinitialized")
        {
            RejectionReason::UnregisteredToken
        } else if msg.contains("insufficient funds")
            || msg.contains("insufficient balance")
            || msg.contains("insufficient lamports")
        {
            RejectionReason::InsufficientBalance
        } else if msg.contains("nonce too low")
            || msg.contains("replacement transaction underpriced")
            || msg.contains("blockhash not found")
            || msg.contains("already been processed")
        {
            RejectionReason::NonceRace
        } else {
            RejectionReason::Other(message.to_string())
        }
    }

    /// Rejections that will fail the same way no matter how often they are retried
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RejectionReason::Unauthorized | RejectionReason::UnregisteredToken
        )
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectionReason::Unauthorized => write!(f, "unauthorized relayer"),
            RejectionReason::UnregisteredToken => write!(f, "unregistered token"),
            RejectionReason::InsufficientBalance => write!(f, "insufficient balance"),
            RejectionReason::NonceRace => write!(f, "nonce/sequencing race"),
            RejectionReason::Other(msg) => write!(f, "{}", msg),
        }
    }
}

/// Main error type for the relayer
#[derive(Error, Debug)]
pub enum RelayerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Transient network error on {chain}: {message}")]
    TransientNetwork { chain: ChainId, message: String },

    #[error("Malformed event on {chain}: {message}")]
    MalformedEvent { chain: ChainId, message: String },

    #[error("Submission rejected on {chain}: {reason}")]
    SubmissionRejected {
        chain: ChainId,
        reason: RejectionReason,
    },

    #[error("Reorg detected on {chain} at position {position}")]
    ReorgDetected { chain: ChainId, position: u64 },

    #[error("Transaction {tx} on {chain} was dropped or reorged out")]
    Dropped { chain: ChainId, tx: String },

    #[error("Exhausted {attempts} attempts: {last_error}")]
    ExhaustedRetries { attempts: u32, last_error: String },

    #[error("Token mapping error: {0}")]
    Mapping(String),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Another relayer instance holds the leadership lock for {namespace}")]
    LeadershipUnavailable { namespace: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayerError {
    /// Build a rejection error from a raw RPC/program message
    pub fn rejected(chain: ChainId, message: &str) -> Self {
        RelayerError::SubmissionRejected {
            chain,
            reason: RejectionReason::classify(message),
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            RelayerError::TransientNetwork { .. }
            | RelayerError::Timeout { .. }
            | RelayerError::ReorgDetected { .. }
            | RelayerError::Dropped { .. }
            | RelayerError::Database(_) => true,
            RelayerError::SubmissionRejected { reason, .. } => !reason.is_fatal(),
            _ => false,
        }
    }

    /// Errors that end the life of a single action without retry
    pub fn is_fatal_for_action(&self) -> bool {
        match self {
            RelayerError::SubmissionRejected { reason, .. } => reason.is_fatal(),
            RelayerError::Mapping(_) | RelayerError::MalformedEvent { .. } => true,
            _ => false,
        }
    }

    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            RelayerError::ExhaustedRetries { .. }
                | RelayerError::ReorgDetected { .. }
                | RelayerError::Wallet(_)
                | RelayerError::SubmissionRejected {
                    reason: RejectionReason::Unauthorized | RejectionReason::InsufficientBalance,
                    ..
                }
        )
    }
}

/// Result type for relayer operations
pub type RelayerResult<T> = Result<T, RelayerError>;
