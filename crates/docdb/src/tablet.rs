//! A tablet: the two stores of one shard together with the MVCC manager,
//! lock manager, retention policy and transaction participant that guard
//! them.
//!
//! Every mutation goes through `replicate`, which takes a pending hybrid
//! time, appends a log entry and applies the batch under the resulting
//! frontier. Writes are serialized there, so pending times are replicated
//! in the order they were handed out.

use crate::compaction_filter::{CompactionKind, DocDbCompactionFilterFactory, IntentsCleanupFilter};
use crate::config::{DocDbConfig, StorageConfig};
use crate::conflict_resolution::{resolve_operation_conflicts, resolve_transaction_conflicts};
use crate::doc_key::SubDocKey;
use crate::doc_operation::{DocOperation, OperationResult};
use crate::doc_reader::ReadContext;
use crate::doc_write_batch::DocWriteBatch;
use crate::engine::{CompactionStats, DocDb, FlushOutcome, FlushTarget, StoreType};
use crate::error::{Error, Result};
use crate::frontier::ConsensusFrontier;
use crate::intent::{IntentType, IntentTypeSet};
use crate::lock_manager::{SharedLockManager, path_lock_entries};
use crate::mvcc::MvccManager;
use crate::participant::TransactionParticipant;
use crate::read_time::ReadHybridTime;
use crate::replication::{LocalReplicationLog, ReplicationLog};
use crate::retention::{HistoryRetentionPolicy, ReaderGuard, TabletRetentionPolicy};
use crate::sub_document::SubDocument;
use crate::transaction_status::TransactionStatusManager;
use docstore_common::{IsolationLevel, OpId, TransactionId, TransactionMetadata};
use docstore_hlc::{HybridTime, SharedHlcClock};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

/// A batch of document operations applied atomically.
#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub operations: Vec<DocOperation>,
    /// Writes intents for this transaction instead of committed records.
    pub transaction: Option<TransactionMetadata>,
    /// Pinned read time for operations that read. Without one the tablet
    /// picks a safe time and may restart locally.
    pub read_time: Option<HybridTime>,
    /// Paths read by a serializable transaction outside this request.
    pub read_paths: Vec<SubDocKey>,
    pub deadline: Instant,
}

impl WriteRequest {
    pub fn new(operations: Vec<DocOperation>, deadline: Instant) -> Self {
        Self {
            operations,
            transaction: None,
            read_time: None,
            read_paths: Vec::new(),
            deadline,
        }
    }

    pub fn in_transaction(mut self, metadata: TransactionMetadata) -> Self {
        self.transaction = Some(metadata);
        self
    }

    pub fn with_read_time(mut self, read_time: HybridTime) -> Self {
        self.read_time = Some(read_time);
        self
    }

    pub fn with_read_paths(mut self, read_paths: Vec<SubDocKey>) -> Self {
        self.read_paths = read_paths;
        self
    }

    fn isolation(&self) -> IsolationLevel {
        self.transaction
            .as_ref()
            .map_or(IsolationLevel::NonTransactional, |metadata| metadata.isolation)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteResponse {
    /// Hybrid time the batch was written at.
    pub hybrid_time: HybridTime,
    pub op_id: OpId,
    /// One result per operation, in request order.
    pub results: Vec<OperationResult>,
    /// Local read restarts the request went through.
    pub restarts: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct ReadOptions {
    pub read_time: Option<HybridTime>,
    /// Reads this transaction's own intents.
    pub transaction_id: Option<TransactionId>,
    pub deadline: Instant,
}

impl ReadOptions {
    pub fn new(deadline: Instant) -> Self {
        Self {
            read_time: None,
            transaction_id: None,
            deadline,
        }
    }

    pub fn at(mut self, read_time: HybridTime) -> Self {
        self.read_time = Some(read_time);
        self
    }

    pub fn in_transaction(mut self, transaction_id: TransactionId) -> Self {
        self.transaction_id = Some(transaction_id);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadResponse {
    pub document: Option<SubDocument>,
    /// Time the returned document is consistent at.
    pub read_time: HybridTime,
    pub restarts: usize,
}

pub struct Tablet {
    config: DocDbConfig,
    db: Arc<DocDb>,
    clock: SharedHlcClock,
    mvcc: MvccManager,
    retention: Arc<TabletRetentionPolicy>,
    lock_manager: Arc<SharedLockManager>,
    participant: Arc<TransactionParticipant>,
    log: Arc<dyn ReplicationLog>,
    apply_mutex: Mutex<()>,
}

impl Tablet {
    pub fn open(
        storage: StorageConfig,
        config: DocDbConfig,
        clock: SharedHlcClock,
        log: Arc<dyn ReplicationLog>,
    ) -> Result<Self> {
        Self::with_db(DocDb::open(storage)?, config, clock, log)
    }

    /// Open with an in-process log that continues after whatever the stores
    /// have already applied.
    pub fn open_local(storage: StorageConfig, config: DocDbConfig, clock: SharedHlcClock) -> Result<Self> {
        let db = DocDb::open(storage)?;
        let last = Self::last_applied(&db).map_or(OpId::new(1, 0), |frontier| frontier.op_id);
        Self::with_db(db, config, clock, Arc::new(LocalReplicationLog::starting_after(last)))
    }

    fn with_db(
        db: DocDb,
        config: DocDbConfig,
        clock: SharedHlcClock,
        log: Arc<dyn ReplicationLog>,
    ) -> Result<Self> {
        if let Some(applied) = Self::last_applied(&db) {
            if log.last_op_id() < applied.op_id {
                return Err(Error::illegal_state(format!(
                    "Log ends at {} but stores have applied {}",
                    log.last_op_id(),
                    applied.op_id
                )));
            }
            clock.update(applied.hybrid_time);
        }

        let db = Arc::new(db);
        let participant = Arc::new(TransactionParticipant::new(db.clone()));
        let recovered = participant.transactions_with_intents()?;
        if !recovered.is_empty() {
            tracing::info!("Tablet has intents of {} unresolved transactions", recovered.len());
        }

        Ok(Self {
            retention: Arc::new(TabletRetentionPolicy::new(clock.clone(), &config)),
            mvcc: MvccManager::new(clock.clone()),
            lock_manager: SharedLockManager::new(),
            participant,
            config,
            db,
            clock,
            log,
            apply_mutex: Mutex::new(()),
        })
    }

    fn last_applied(db: &DocDb) -> Option<ConsensusFrontier> {
        [StoreType::Regular, StoreType::Intents]
            .into_iter()
            .filter_map(|store| db.applied_frontier(store))
            .max_by_key(|frontier| frontier.op_id)
    }

    pub fn db(&self) -> &Arc<DocDb> {
        &self.db
    }

    pub fn clock(&self) -> &SharedHlcClock {
        &self.clock
    }

    pub fn mvcc(&self) -> &MvccManager {
        &self.mvcc
    }

    pub fn retention(&self) -> &Arc<TabletRetentionPolicy> {
        &self.retention
    }

    pub fn lock_manager(&self) -> &Arc<SharedLockManager> {
        &self.lock_manager
    }

    pub fn participant(&self) -> &Arc<TransactionParticipant> {
        &self.participant
    }

    pub fn config(&self) -> &DocDbConfig {
        &self.config
    }

    pub fn safe_time(&self) -> HybridTime {
        self.mvcc.current_safe_time()
    }

    fn status_manager(&self) -> Arc<dyn TransactionStatusManager> {
        self.participant.clone()
    }

    fn wait_safe_time(&self, min_allowed: HybridTime, deadline: Instant) -> Result<HybridTime> {
        let safe_time = self.mvcc.safe_time(min_allowed, deadline, None);
        if !safe_time.is_valid() {
            return Err(Error::TimedOut(format!(
                "Waiting for safe time {}",
                min_allowed
            )));
        }
        Ok(safe_time)
    }

    /// Lock, resolve conflicts, run the operations and write the result as
    /// one batch: committed records for plain writes, intents for
    /// transactional ones. Locks are held until the batch is applied.
    pub fn write(&self, request: WriteRequest) -> Result<WriteResponse> {
        let isolation = request.isolation();
        if request.transaction.is_some() && !isolation.is_transactional() {
            return Err(Error::illegal_state(
                "Transactional write with non-transactional isolation",
            ));
        }
        if request.operations.is_empty() && request.read_paths.is_empty() {
            return Err(Error::InvalidArgument("Empty write request".into()));
        }
        if !request.read_paths.is_empty() && isolation != IsolationLevel::Serializable {
            return Err(Error::InvalidArgument(
                "Read paths require serializable isolation".into(),
            ));
        }

        let mut entries = Vec::new();
        for operation in &request.operations {
            entries.extend(operation.lock_entries()?);
        }
        let strong_read = IntentTypeSet::single(IntentType::StrongRead);
        for path in &request.read_paths {
            entries.extend(path_lock_entries(path, strong_read)?);
        }
        let lock_deadline = request
            .deadline
            .min(Instant::now() + self.config.lock_wait_timeout);
        let locks = self.lock_manager.lock(entries, lock_deadline)?;

        match &request.transaction {
            None => resolve_operation_conflicts(
                &self.db,
                locks.entries(),
                self.clock.now(),
                self.participant.as_ref(),
            )?,
            Some(metadata) => resolve_transaction_conflicts(
                &self.db,
                locks.entries(),
                metadata.transaction_id,
                metadata.isolation,
                request.read_time.unwrap_or(metadata.start_time),
                self.participant.as_ref(),
            )?,
        }

        let (results, doc_batch, restarts) = self.execute_operations(&request)?;

        let (hybrid_time, op_id) = if doc_batch.is_empty() {
            // Nothing to write, e.g. every conditional operation was skipped.
            (self.clock.now(), self.log.last_op_id())
        } else {
            self.replicate(|frontier| {
                let (mut batch, store) = match &request.transaction {
                    None => (doc_batch.to_regular_batch(frontier.hybrid_time)?, StoreType::Regular),
                    Some(metadata) => {
                        let count = doc_batch.intent_count()?;
                        let first_write_id = self
                            .participant
                            .reserve_write_ids(metadata.transaction_id, count)?;
                        let (batch, _) =
                            doc_batch.to_intents_batch(metadata, frontier.hybrid_time, first_write_id)?;
                        (batch, StoreType::Intents)
                    }
                };
                batch.set_frontier(frontier);
                if !self.db.write(&batch, store) {
                    tracing::debug!("Batch at {} already applied to {} store", frontier, store);
                }
                Ok((frontier.hybrid_time, frontier.op_id))
            })?
        };
        drop(locks);

        Ok(WriteResponse {
            hybrid_time,
            op_id,
            results,
            restarts,
        })
    }

    /// Run the operations at one read time. A read that meets a record
    /// inside its uncertainty window throws away the partial batch and
    /// starts over above that record.
    fn execute_operations(
        &self,
        request: &WriteRequest,
    ) -> Result<(Vec<OperationResult>, DocWriteBatch, usize)> {
        let needs_read = request.operations.iter().any(DocOperation::requires_read);
        let read_time = match request.read_time {
            Some(ht) => ReadHybridTime::single_time(ht),
            None if needs_read => {
                let safe_time = self.wait_safe_time(HybridTime::MIN, request.deadline)?;
                ReadHybridTime::from_read_and_skew(safe_time, self.config.max_clock_skew)
            }
            None => ReadHybridTime::single_time(self.clock.peek()),
        };
        let _reader: Option<ReaderGuard> = if needs_read {
            Some(self.retention.register_reader(read_time.read)?)
        } else {
            None
        };

        let mut context = self.read_context(
            read_time,
            request.transaction.as_ref().map(|metadata| metadata.transaction_id),
            request.deadline,
        );
        let mut restarts = 0;
        loop {
            let mut batch = DocWriteBatch::new();
            let mut results = Vec::with_capacity(request.operations.len());
            for operation in &request.operations {
                results.push(operation.apply(&mut context, &mut batch)?);
            }
            let Some(restart_ht) = context.restart_time() else {
                for path in &request.read_paths {
                    batch.add_read_path(path.clone());
                }
                return Ok((results, batch, restarts));
            };
            if restarts >= self.config.max_read_restarts {
                return Err(Error::try_again(format!(
                    "Read restart required at {} after {} restarts",
                    restart_ht, restarts
                )));
            }
            restarts += 1;
            self.wait_safe_time(restart_ht, request.deadline)?;
            context.restart(restart_ht);
        }
    }

    fn read_context(
        &self,
        read_time: ReadHybridTime,
        transaction_id: Option<TransactionId>,
        deadline: Instant,
    ) -> ReadContext<'_> {
        ReadContext::new(&self.db, self.status_manager(), read_time, deadline)
            .with_transaction(transaction_id)
            .with_table_ttl(self.retention.table_ttl())
            .with_status_retry(self.config.status_retry_limit, self.config.status_retry_backoff)
    }

    /// Read the sub-document at `key`.
    pub fn read(&self, key: &SubDocKey, options: ReadOptions) -> Result<ReadResponse> {
        let read_time = match options.read_time {
            Some(ht) => {
                self.clock.update(ht);
                self.wait_safe_time(ht, options.deadline)?;
                ReadHybridTime::single_time(ht)
            }
            None => {
                let safe_time = self.wait_safe_time(HybridTime::MIN, options.deadline)?;
                ReadHybridTime::from_read_and_skew(safe_time, self.config.max_clock_skew)
            }
        };
        let _reader = self.retention.register_reader(read_time.read)?;

        let mut context = self.read_context(read_time, options.transaction_id, options.deadline);
        let mut restarts = 0;
        loop {
            let document = context.get_sub_document(key)?;
            let Some(restart_ht) = context.restart_time() else {
                return Ok(ReadResponse {
                    document,
                    read_time: context.read_time().read,
                    restarts,
                });
            };
            if restarts >= self.config.max_read_restarts {
                return Err(Error::try_again(format!(
                    "Read of {} needs a restart at {} after {} restarts",
                    key, restart_ht, restarts
                )));
            }
            restarts += 1;
            self.wait_safe_time(restart_ht, options.deadline)?;
            context.restart(restart_ht);
        }
    }

    /// Apply `apply` as one replicated write: a pending hybrid time, a log
    /// entry, then the store writes stamped with the resulting frontier.
    fn replicate<T>(&self, apply: impl FnOnce(ConsensusFrontier) -> Result<T>) -> Result<T> {
        let _apply = self.apply_mutex.lock();
        let ht = self.mvcc.new_pending_write();
        let result = self
            .log
            .append(ht)
            .and_then(|op_id| apply(ConsensusFrontier::new(op_id, ht)));
        match result {
            Ok(value) => {
                self.mvcc.replicated(ht)?;
                Ok(value)
            }
            Err(e) => {
                if let Err(abort_error) = self.mvcc.aborted(ht) {
                    tracing::error!("Failed to abort pending write at {}: {}", ht, abort_error);
                }
                Err(e)
            }
        }
    }

    /// Move a committed transaction's intents into the regular store at
    /// `commit_ht`.
    pub fn apply_transaction(&self, transaction_id: TransactionId, commit_ht: HybridTime) -> Result<usize> {
        self.clock.update(commit_ht);
        self.replicate(|frontier| {
            self.participant
                .apply_transaction(transaction_id, commit_ht, frontier)
        })
    }

    /// Drop every intent of an aborted transaction.
    pub fn remove_transaction_intents(&self, transaction_id: TransactionId) -> Result<usize> {
        self.replicate(|frontier| self.participant.remove_intents(transaction_id, frontier))
    }

    /// Garbage collect history of the regular store below the retention
    /// cutoff.
    pub fn compact(&self, kind: CompactionKind) -> Result<CompactionStats> {
        let policy: Arc<dyn HistoryRetentionPolicy> = self.retention.clone();
        let mut filter = DocDbCompactionFilterFactory::new(policy).create(kind.into());
        self.db.compact(StoreType::Regular, &mut filter)
    }

    /// Drop leftover intents of transactions already applied or aborted.
    pub fn compact_intents(&self) -> Result<CompactionStats> {
        let mut filter = IntentsCleanupFilter::new(self.participant.finished_transactions());
        self.db.compact(StoreType::Intents, &mut filter)
    }

    pub fn flush(&self, target: FlushTarget) -> Result<FlushOutcome> {
        self.db.flush(target)
    }

    pub fn create_snapshot(&self, snapshot_id: &str) -> Result<PathBuf> {
        let _apply = self.apply_mutex.lock();
        self.db.create_snapshot(snapshot_id)
    }

    pub fn restore_snapshot(&self, snapshot_id: &str) -> Result<()> {
        let _apply = self.apply_mutex.lock();
        self.db.restore_snapshot(snapshot_id)
    }

    pub fn delete_snapshot(&self, snapshot_id: &str) -> Result<()> {
        self.db.delete_snapshot(snapshot_id)
    }

    pub fn list_snapshots(&self) -> Result<Vec<String>> {
        self.db.list_snapshots()
    }
}
