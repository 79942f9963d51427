//! Error types for the transaction client

use docstore_common::TransactionId;
use thiserror::Error;

/// Client error types
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Transaction not found: {0}")]
    TransactionNotFound(TransactionId),

    #[error("Invalid transaction state: {0}")]
    InvalidState(String),

    #[error("Transaction {0} expired")]
    Expired(TransactionId),

    #[error("Transaction {0} aborted")]
    Aborted(TransactionId),

    #[error("Tablet not found: {0}")]
    TabletNotFound(String),

    #[error("Storage error: {0}")]
    Storage(#[from] docstore_docdb::Error),

    #[error("RPC failed: {0}")]
    Rpc(String),

    #[error("Background task failed: {0}")]
    TaskFailed(#[from] tokio::task::JoinError),
}

impl ClientError {
    /// True if retrying the whole transaction may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Aborted(_) | ClientError::Expired(_) => true,
            ClientError::Storage(e) => e.is_try_again(),
            _ => false,
        }
    }
}

/// Result type for client operations
pub type Result<T> = std::result::Result<T, ClientError>;
