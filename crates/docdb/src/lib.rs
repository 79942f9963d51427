//! Transactional multi-version document storage core.
//!
//! A tablet keeps committed data in a regular store and provisional
//! transaction writes (intents) in a separate intents store, both fjall
//! keyspaces. Every record key carries a descending `DocHybridTime`, so the
//! newest version of a path sorts first.
//!
//! # Architecture
//!
//! - `encoding`, `primitive_value`, `doc_key`, `value`, `intent`: the
//!   byte-comparable key and value formats
//! - `engine`: the two-store wrapper with consensus frontiers, flush
//!   ordering, compaction passes and snapshots
//! - `mvcc`: pending write tracking and safe time
//! - `retention` and `compaction_filter`: history garbage collection
//! - `intent_aware_iterator` and `doc_reader`: reads that merge both stores
//!   at a read time, resolving foreign intents through transaction status
//! - `lock_manager`, `conflict_resolution`, `doc_operation`,
//!   `doc_write_batch`: the write pipeline
//! - `participant` and `tablet`: the data tablet side of transactions and
//!   the façade tying it all together

pub mod compaction_filter;
pub mod config;
pub mod conflict_resolution;
pub mod doc_key;
pub mod doc_operation;
pub mod doc_reader;
pub mod doc_write_batch;
pub mod encoding;
pub mod engine;
pub mod error;
pub mod frontier;
pub mod intent;
pub mod intent_aware_iterator;
pub mod lock_manager;
pub mod mvcc;
pub mod participant;
pub mod primitive_value;
pub mod read_time;
pub mod replication;
pub mod retention;
pub mod store_iterator;
pub mod sub_document;
pub mod tablet;
pub mod transaction_status;
pub mod value;
pub mod value_type;
pub mod write_batch;

// Re-export main types
pub use compaction_filter::{
    CompactionFilter, CompactionKind, DocDbCompactionFilter, DocDbCompactionFilterFactory,
    FilterDecision, IntentsCleanupFilter,
};
pub use config::{DocDbConfig, StorageConfig};
pub use doc_key::{DocKey, SubDocKey};
pub use doc_operation::{DocOperation, OperationResult};
pub use doc_reader::{DocReader, ReadContext};
pub use doc_write_batch::DocWriteBatch;
pub use encoding::{Decode, Encode};
pub use engine::{
    CompactionStats, DocDb, FlushOutcome, FlushTarget, FrontierModificationMode, StoreType,
};
pub use error::{Error, ErrorKind, Result};
pub use frontier::ConsensusFrontier;
pub use intent::{IntentType, IntentTypeSet};
pub use intent_aware_iterator::IntentAwareIterator;
pub use lock_manager::{LockBatch, LockBatchEntry, SharedLockManager};
pub use mvcc::MvccManager;
pub use participant::TransactionParticipant;
pub use primitive_value::PrimitiveValue;
pub use read_time::ReadHybridTime;
pub use replication::{LocalReplicationLog, ReplicationLog};
pub use retention::{HistoryRetentionDirective, HistoryRetentionPolicy, TabletRetentionPolicy};
pub use sub_document::SubDocument;
pub use tablet::{ReadOptions, ReadResponse, Tablet, WriteRequest, WriteResponse};
pub use transaction_status::{
    TransactionStatusCache, TransactionStatusManager, TransactionStatusResolver,
    TransactionStatusResult,
};
pub use value::Value;
pub use value_type::ValueType;
pub use write_batch::{WriteBatch, WriteOp};
