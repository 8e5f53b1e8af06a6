//! Error types for the swap deputy

use crate::chain::{ChainKind, SwapId};
use crate::store::TxIntent;

use thiserror::Error;

/// Main error type for the deputy
#[derive(Error, Debug)]
pub enum DeputyError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Chain connection error for {chain}: {message}")]
    ChainConnection { chain: ChainKind, message: String },

    #[error("Submission to {chain} rejected: {message}")]
    Submission { chain: ChainKind, message: String },

    #[error("Transaction {tx_hash} failed on {chain}: {reason}")]
    TransactionFailed {
        chain: ChainKind,
        tx_hash: String,
        reason: String,
    },

    #[error("Duplicate {intent} submission for swap {swap_id}")]
    DuplicateSubmission { intent: TxIntent, swap_id: SwapId },

    #[error("Swap {swap_id} expired before the secret could be relayed")]
    ClaimWindowMissed { swap_id: SwapId },

    #[error("Invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Invalid swap: {0}")]
    InvalidSwap(String),

    #[error("Unsupported conversion ratio: {0}")]
    UnsupportedRatio(String),

    #[error("Insufficient balance on {chain}: have {have}, need {need}")]
    InsufficientBalance {
        chain: ChainKind,
        have: u128,
        need: u128,
    },

    #[error("Transaction {tx_hash} not found")]
    TransactionNotFound { tx_hash: String },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Chain {chain} not found")]
    ChainNotFound { chain: ChainKind },

    #[error("Encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DeputyError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, DeputyError::ChainConnection { .. })
    }

    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            DeputyError::TransactionFailed { .. }
                | DeputyError::InsufficientBalance { .. }
                | DeputyError::DuplicateSubmission { .. }
                | DeputyError::UnsupportedRatio(_)
                | DeputyError::ClaimWindowMissed { .. }
        )
    }

    /// Short label for escalation metrics
    pub fn kind(&self) -> &'static str {
        match self {
            DeputyError::Config(_) => "config",
            DeputyError::Database(_) => "database",
            DeputyError::ChainConnection { .. } => "chain_connection",
            DeputyError::Submission { .. } => "submission",
            DeputyError::TransactionFailed { .. } => "transaction_failed",
            DeputyError::DuplicateSubmission { .. } => "duplicate_submission",
            DeputyError::ClaimWindowMissed { .. } => "claim_window_missed",
            DeputyError::InvalidAddress { .. } => "invalid_address",
            DeputyError::InvalidSwap(_) => "invalid_swap",
            DeputyError::UnsupportedRatio(_) => "unsupported_ratio",
            DeputyError::InsufficientBalance { .. } => "insufficient_balance",
            DeputyError::TransactionNotFound { .. } => "transaction_not_found",
            DeputyError::InvalidStateTransition { .. } => "invalid_state_transition",
            DeputyError::ChainNotFound { .. } => "chain_not_found",
            DeputyError::Encoding(_) => "encoding",
            DeputyError::Internal(_) => "internal",
        }
    }
}

/// Result type for deputy operations
pub type DeputyResult<T> = Result<T, DeputyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_chain_reads_are_retryable() {
        let read = DeputyError::ChainConnection {
            chain: ChainKind::Kava,
            message: "connection refused".to_string(),
        };
        let submit = DeputyError::Submission {
            chain: ChainKind::Kava,
            message: "bad sequence".to_string(),
        };
        assert!(read.is_retryable());
        assert!(!submit.is_retryable());
        assert!(!submit.should_alert());
    }

    #[test]
    fn failed_transactions_alert() {
        let err = DeputyError::TransactionFailed {
            chain: ChainKind::Bnb,
            tx_hash: "ABCD".to_string(),
            reason: "out of gas".to_string(),
        };
        assert!(err.should_alert());
        assert_eq!(
            err.to_string(),
            "Transaction ABCD failed on bnb: out of gas"
        );
    }
}
