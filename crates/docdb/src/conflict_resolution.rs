//! Conflict detection for writes against provisional records of other
//! transactions and, under snapshot isolation, against committed records
//! newer than the transaction's read time.
//!
//! Every write leaves weak intents on the ancestors of its path, so checking
//! the exact keys of a lock request is enough to find conflicts anywhere in
//! the affected subtrees.

use crate::doc_key::split_doc_ht;
use crate::encoding::Decode;
use crate::engine::{DocDb, StoreType};
use crate::error::{Error, Result};
use crate::intent::{IntentTypeSet, IntentValue, decode_intent_key, intent_prefix};
use crate::lock_manager::LockBatchEntry;
use crate::transaction_status::TransactionStatusManager;
use crate::value_type::ValueType;
use docstore_common::{IsolationLevel, TransactionId, TransactionStatus};
use docstore_hlc::HybridTime;
use std::collections::HashMap;

/// Resolved state of a conflicting transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConflictingStatus {
    Aborted,
    Committed(HybridTime),
    Pending,
}

struct ConflictResolver<'a> {
    db: &'a DocDb,
    status_manager: &'a dyn TransactionStatusManager,
    resolution_ht: HybridTime,
    own_transaction: Option<TransactionId>,
    statuses: HashMap<TransactionId, ConflictingStatus>,
}

impl<'a> ConflictResolver<'a> {
    fn status_of(&mut self, transaction_id: TransactionId) -> Result<ConflictingStatus> {
        if let Some(status) = self.statuses.get(&transaction_id) {
            return Ok(*status);
        }
        let local = self.status_manager.local_commit_time(transaction_id);
        let status = if local == HybridTime::MIN {
            ConflictingStatus::Aborted
        } else if local.is_valid() {
            ConflictingStatus::Committed(local)
        } else {
            let result = self
                .status_manager
                .request_status_at(transaction_id, self.resolution_ht)?;
            match result.status {
                TransactionStatus::Aborted => ConflictingStatus::Aborted,
                TransactionStatus::Committed => ConflictingStatus::Committed(result.status_time),
                TransactionStatus::Created | TransactionStatus::Pending => ConflictingStatus::Pending,
            }
        };
        self.statuses.insert(transaction_id, status);
        Ok(status)
    }

    /// Transactions holding intents on `entry.key` that conflict with it.
    fn conflicting_transactions(&self, entry: &LockBatchEntry) -> Result<Vec<TransactionId>> {
        let mut group_prefix = intent_prefix(&entry.key);
        group_prefix.push(ValueType::IntentTypeSet.as_byte());

        let mut found = Vec::new();
        let mut iter = self.db.new_iterator(StoreType::Intents);
        iter.seek(&group_prefix)?;
        while iter.valid() && iter.key().starts_with(&group_prefix) {
            let decoded = decode_intent_key(iter.key())?;
            if decoded.types.conflicts_with(entry.intent_types) {
                let intent = IntentValue::decode(iter.value())?;
                if Some(intent.transaction_id) != self.own_transaction
                    && !found.contains(&intent.transaction_id)
                {
                    found.push(intent.transaction_id);
                }
            }
            iter.next()?;
        }
        Ok(found)
    }

    /// Fails with `TryAgain` on a pending conflicting transaction, or on a
    /// committed one if `read_ht` is given and it committed after it.
    fn check_intents(&mut self, entries: &[LockBatchEntry], read_ht: Option<HybridTime>) -> Result<()> {
        for entry in entries {
            for transaction_id in self.conflicting_transactions(entry)? {
                match self.status_of(transaction_id)? {
                    ConflictingStatus::Aborted => {}
                    ConflictingStatus::Pending => {
                        tracing::debug!(
                            "Conflict with pending transaction {} on {:02x?}",
                            transaction_id,
                            entry.key
                        );
                        return Err(Error::try_again(format!(
                            "Conflicts with pending transaction {}",
                            transaction_id
                        )));
                    }
                    ConflictingStatus::Committed(commit_ht) => {
                        if let Some(read_ht) = read_ht
                            && commit_ht > read_ht
                        {
                            return Err(Error::try_again(format!(
                                "Conflicts with transaction {} committed at {} after read time {}",
                                transaction_id, commit_ht, read_ht
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Committed records at or below a strongly written path newer than
    /// `read_ht`.
    fn check_regular(&self, entries: &[LockBatchEntry], read_ht: HybridTime) -> Result<()> {
        let mut iter = self.db.new_iterator(StoreType::Regular);
        for entry in entries.iter().filter(|e| is_strong_write(e.intent_types)) {
            iter.seek(&entry.key)?;
            while iter.valid() && iter.key().starts_with(&entry.key) {
                let (_, doc_ht) = split_doc_ht(iter.key())?;
                if doc_ht.hybrid_time > read_ht {
                    return Err(Error::try_again(format!(
                        "Value write after transaction start: {} > {}",
                        doc_ht.hybrid_time, read_ht
                    )));
                }
                iter.next()?;
            }
        }
        Ok(())
    }
}

fn is_strong_write(types: IntentTypeSet) -> bool {
    types.has_strong_write()
}

/// Conflicts of a non-transactional write. Any pending transaction holding
/// a conflicting intent makes the write retry.
pub fn resolve_operation_conflicts(
    db: &DocDb,
    entries: &[LockBatchEntry],
    resolution_ht: HybridTime,
    status_manager: &dyn TransactionStatusManager,
) -> Result<()> {
    let mut resolver = ConflictResolver {
        db,
        status_manager,
        resolution_ht,
        own_transaction: None,
        statuses: HashMap::new(),
    };
    resolver.check_intents(entries, None)
}

/// Conflicts of a transactional write. Under snapshot isolation a write
/// also conflicts with anything committed after the transaction's read
/// time; serializable transactions lock their reads instead.
pub fn resolve_transaction_conflicts(
    db: &DocDb,
    entries: &[LockBatchEntry],
    transaction_id: TransactionId,
    isolation: IsolationLevel,
    read_ht: HybridTime,
    status_manager: &dyn TransactionStatusManager,
) -> Result<()> {
    if !isolation.is_transactional() {
        return Err(Error::illegal_state(format!(
            "Transaction {} has non-transactional isolation {}",
            transaction_id, isolation
        )));
    }
    let mut resolver = ConflictResolver {
        db,
        status_manager,
        resolution_ht: read_ht,
        own_transaction: Some(transaction_id),
        statuses: HashMap::new(),
    };
    match isolation {
        IsolationLevel::Snapshot => {
            resolver.check_intents(entries, Some(read_ht))?;
            resolver.check_regular(entries, read_ht)
        }
        _ => resolver.check_intents(entries, None),
    }
}
