//! Common types for the document store
//!
//! This crate defines:
//! - Transaction IDs (UUIDv7-based)
//! - Raft op ids stamped into every applied write batch
//! - Isolation levels, transaction statuses and transaction metadata

mod isolation;
mod metadata;
mod op_id;
mod transaction_id;

pub use isolation::IsolationLevel;
pub use metadata::{TransactionMetadata, TransactionStatus};
pub use op_id::OpId;
pub use transaction_id::TransactionId;
