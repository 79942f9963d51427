//! Transaction client for the document store
//!
//! This crate provides:
//! - A status tablet that owns transaction records, assigns commit times
//!   and expires transactions that stop heartbeating
//! - The client-side transaction state machine with its heartbeat task
//! - The RPC contract between the two, with an in-process implementation
//!
//! Data tablets registered with a status tablet resolve foreign intents
//! through it, and have intents applied or removed when the transaction
//! finishes.

pub mod config;
pub mod error;
pub mod manager;
pub mod rpc;
pub mod status_tablet;
pub mod transaction;

pub use config::TransactionConfig;
pub use error::{ClientError, Result};
pub use manager::TransactionManager;
pub use rpc::{
    AbortTransactionRequest, LocalTransactionRpc, TransactionRpc, TransactionStatusResponse,
    UpdateTransactionRequest,
};
pub use status_tablet::StatusTablet;
pub use transaction::{Transaction, TransactionState};
