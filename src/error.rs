//! Error types for the transaction watcher

use thiserror::Error;

/// Main error type for the watcher
#[derive(Error, Debug)]
pub enum WatcherError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Chain connection error for network {network}: {message}")]
    ChainConnection { network: String, message: String },

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Invalid signed payload: {0}")]
    InvalidPayload(String),

    #[error("Call {pallet_index}:{call_index} is not known to the type registry")]
    UnknownCall { pallet_index: u8, call_index: u8 },

    #[error("Payload signed for network {actual} submitted to network {expected}")]
    NetworkMismatch { expected: String, actual: String },

    #[error("Network {network} not found")]
    NetworkNotFound { network: String },

    #[error("Transaction {hash} not found")]
    TransactionNotFound { hash: String },

    #[error("Transaction {hash} already recorded")]
    DuplicateTransaction { hash: String },

    #[error("Subscription error: {0}")]
    Subscription(String),

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl WatcherError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WatcherError::ChainConnection { .. }
                | WatcherError::Timeout { .. }
                | WatcherError::Subscription(_)
        )
    }

    /// Check if error should be forwarded to the error reporter
    pub fn should_report(&self) -> bool {
        !matches!(
            self,
            WatcherError::TransactionNotFound { .. } | WatcherError::DuplicateTransaction { .. }
        )
    }

    /// Whether the error came from the submitted payload rather than the service
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            WatcherError::InvalidPayload(_)
                | WatcherError::Decode(_)
                | WatcherError::UnknownCall { .. }
                | WatcherError::NetworkMismatch { .. }
                | WatcherError::NetworkNotFound { .. }
                | WatcherError::DuplicateTransaction { .. }
        )
    }
}

impl From<parity_scale_codec::Error> for WatcherError {
    fn from(e: parity_scale_codec::Error) -> Self {
        WatcherError::Decode(e.to_string())
    }
}

impl From<hex::FromHexError> for WatcherError {
    fn from(e: hex::FromHexError) -> Self {
        WatcherError::Decode(format!("invalid hex: {}", e))
    }
}

/// Result type for watcher operations
pub type WatcherResult<T> = Result<T, WatcherError>;
