//! Data tablet side of distributed transactions.
//!
//! The participant knows which transactions wrote intents here, what their
//! status is when it has been told, and how to turn a committed
//! transaction's intents into regular records.

use crate::doc_key::append_doc_ht;
use crate::encoding::Decode;
use crate::engine::{DocDb, StoreType};
use crate::error::{Error, Result};
use crate::frontier::ConsensusFrontier;
use crate::intent::{
    IntentValue, TransactionKey, decode_intent_key, decode_transaction_key,
    transaction_metadata_key,
};
use crate::transaction_status::{
    TransactionStatusManager, TransactionStatusResolver, TransactionStatusResult,
};
use crate::value_type::ValueType;
use crate::write_batch::WriteBatch;
use docstore_common::{TransactionId, TransactionMetadata};
use docstore_hlc::{DocHybridTime, HybridTime};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LocalStatus {
    Committed(HybridTime),
    Aborted,
}

#[derive(Debug, Default)]
struct ParticipantState {
    statuses: HashMap<TransactionId, LocalStatus>,
    /// Transactions whose intents were applied or removed.
    finished: HashSet<TransactionId>,
    next_write_ids: HashMap<TransactionId, u32>,
}

pub struct TransactionParticipant {
    db: Arc<DocDb>,
    resolver: RwLock<Option<Arc<dyn TransactionStatusResolver>>>,
    state: Mutex<ParticipantState>,
}

/// Intents of one transaction, found through its reverse index.
struct TransactionIntents {
    /// `(reverse index key, intent key, intent value)`.
    entries: Vec<(Vec<u8>, Vec<u8>, Option<Vec<u8>>)>,
    has_metadata: bool,
}

impl TransactionParticipant {
    pub fn new(db: Arc<DocDb>) -> Self {
        Self {
            db,
            resolver: RwLock::new(None),
            state: Mutex::new(ParticipantState::default()),
        }
    }

    pub fn with_resolver(self, resolver: Arc<dyn TransactionStatusResolver>) -> Self {
        *self.resolver.write() = Some(resolver);
        self
    }

    pub fn set_resolver(&self, resolver: Arc<dyn TransactionStatusResolver>) {
        *self.resolver.write() = Some(resolver);
    }

    /// Record a commit learned from the status tablet.
    pub fn notify_committed(&self, transaction_id: TransactionId, commit_ht: HybridTime) {
        self.state
            .lock()
            .statuses
            .insert(transaction_id, LocalStatus::Committed(commit_ht));
    }

    pub fn notify_aborted(&self, transaction_id: TransactionId) {
        self.state
            .lock()
            .statuses
            .insert(transaction_id, LocalStatus::Aborted);
    }

    /// Reserve `count` consecutive write ids for `transaction_id`. Write ids
    /// are unique per transaction on this tablet so that applied records of
    /// one transaction never collide.
    pub fn reserve_write_ids(&self, transaction_id: TransactionId, count: u32) -> Result<u32> {
        let mut state = self.state.lock();
        let first = match state.next_write_ids.get(&transaction_id) {
            Some(next) => *next,
            None => self.recover_next_write_id(transaction_id)?,
        };
        let next = first
            .checked_add(count)
            .ok_or_else(|| Error::InvalidArgument("Write id space exhausted".into()))?;
        state.next_write_ids.insert(transaction_id, next);
        Ok(first)
    }

    /// Next write id after those already stored, for a transaction not seen
    /// since the tablet opened.
    fn recover_next_write_id(&self, transaction_id: TransactionId) -> Result<u32> {
        let intents = self.load_intents(transaction_id, false)?;
        let mut next = 0;
        for (reverse_key, _, _) in &intents.entries {
            if let TransactionKey::ReverseIndex(_, doc_ht) = decode_transaction_key(reverse_key)? {
                next = next.max(doc_ht.write_id.saturating_add(1));
            }
        }
        Ok(next)
    }

    fn load_intents(&self, transaction_id: TransactionId, with_values: bool) -> Result<TransactionIntents> {
        let prefix = transaction_metadata_key(transaction_id);
        let mut entries = Vec::new();
        let mut has_metadata = false;

        let mut iter = self.db.new_iterator(StoreType::Intents);
        iter.seek(&prefix)?;
        while iter.valid() && iter.key().starts_with(&prefix) {
            match decode_transaction_key(iter.key())? {
                TransactionKey::Metadata(_) => has_metadata = true,
                TransactionKey::ReverseIndex(..) => {
                    entries.push((iter.key().to_vec(), iter.value().to_vec(), None));
                }
            }
            iter.next()?;
        }

        if with_values {
            for (_, intent_key, value) in entries.iter_mut() {
                *value = self.db.get(StoreType::Intents, intent_key)?;
            }
        }
        Ok(TransactionIntents {
            entries,
            has_metadata,
        })
    }

    pub fn load_metadata(&self, transaction_id: TransactionId) -> Result<Option<TransactionMetadata>> {
        self.db
            .get(StoreType::Intents, &transaction_metadata_key(transaction_id))?
            .map(|bytes| TransactionMetadata::from_bytes(&bytes).map_err(Error::Corruption))
            .transpose()
    }

    /// Transactions with a metadata record in the intents store.
    pub fn transactions_with_intents(&self) -> Result<Vec<TransactionId>> {
        let mut found = Vec::new();
        let mut iter = self.db.new_iterator(StoreType::Intents);
        iter.seek(&[ValueType::TransactionId.as_byte()])?;
        while iter.valid() && iter.key().first() == Some(&ValueType::TransactionId.as_byte()) {
            if let TransactionKey::Metadata(id) = decode_transaction_key(iter.key())? {
                found.push(id);
            }
            iter.next()?;
        }
        Ok(found)
    }

    /// Move the strong write intents of a committed transaction into the
    /// regular store at `commit_ht`, then delete all of its intents. Returns
    /// the number of records written.
    pub fn apply_transaction(
        &self,
        transaction_id: TransactionId,
        commit_ht: HybridTime,
        frontier: ConsensusFrontier,
    ) -> Result<usize> {
        self.notify_committed(transaction_id, commit_ht);
        let intents = self.load_intents(transaction_id, true)?;

        let mut regular = WriteBatch::new();
        for (_, intent_key, value) in &intents.entries {
            let Some(value) = value else {
                continue;
            };
            let decoded = decode_intent_key(intent_key)?;
            if !decoded.types.has_strong_write() {
                continue;
            }
            let intent = IntentValue::decode(value)?;
            if intent.transaction_id != transaction_id {
                return Err(Error::corruption(format!(
                    "Intent of {} indexed under {}",
                    intent.transaction_id, transaction_id
                )));
            }
            let mut key = decoded.path.to_vec();
            append_doc_ht(&mut key, DocHybridTime::new(commit_ht, intent.write_id));
            regular.put(key, intent.value);
        }
        let applied = regular.len();
        regular.set_frontier(frontier);
        self.db.write(&regular, StoreType::Regular);

        // Both batches carry the same frontier. After a crash between them,
        // replaying this op skips the regular batch, whose applied frontier
        // already covers it, and rewrites the intent deletions, whose frontier
        // does not.
        self.delete_intents(transaction_id, &intents, frontier);
        tracing::debug!(
            "Applied {} records of transaction {} at {}",
            applied,
            transaction_id,
            commit_ht
        );
        Ok(applied)
    }

    /// Delete every intent of an aborted transaction.
    pub fn remove_intents(&self, transaction_id: TransactionId, frontier: ConsensusFrontier) -> Result<usize> {
        self.notify_aborted(transaction_id);
        let intents = self.load_intents(transaction_id, false)?;
        let removed = intents.entries.len();
        self.delete_intents(transaction_id, &intents, frontier);
        tracing::debug!("Removed {} intents of aborted transaction {}", removed, transaction_id);
        Ok(removed)
    }

    fn delete_intents(
        &self,
        transaction_id: TransactionId,
        intents: &TransactionIntents,
        frontier: ConsensusFrontier,
    ) {
        let mut batch = WriteBatch::new();
        for (reverse_key, intent_key, _) in &intents.entries {
            batch.delete(intent_key.clone());
            batch.delete(reverse_key.clone());
        }
        if intents.has_metadata {
            batch.delete(transaction_metadata_key(transaction_id));
        }
        batch.set_frontier(frontier);
        self.db.write(&batch, StoreType::Intents);

        let mut state = self.state.lock();
        state.finished.insert(transaction_id);
        state.next_write_ids.remove(&transaction_id);
    }

    /// Transactions whose leftover intents a cleanup compaction may drop.
    pub fn finished_transactions(&self) -> HashSet<TransactionId> {
        let state = self.state.lock();
        let mut finished = state.finished.clone();
        finished.extend(
            state
                .statuses
                .iter()
                .filter(|(_, status)| **status == LocalStatus::Aborted)
                .map(|(id, _)| *id),
        );
        finished
    }
}

impl TransactionStatusManager for TransactionParticipant {
    fn local_commit_time(&self, transaction_id: TransactionId) -> HybridTime {
        match self.state.lock().statuses.get(&transaction_id) {
            Some(LocalStatus::Committed(commit_ht)) => *commit_ht,
            Some(LocalStatus::Aborted) => HybridTime::MIN,
            None => HybridTime::INVALID,
        }
    }

    fn request_status_at(
        &self,
        transaction_id: TransactionId,
        read_ht: HybridTime,
    ) -> Result<TransactionStatusResult> {
        let resolver = self.resolver.read().clone();
        let Some(resolver) = resolver else {
            return Err(Error::illegal_state(format!(
                "No status resolver for transaction {}",
                transaction_id
            )));
        };
        let result = resolver.get_status(transaction_id, read_ht)?;
        match result.status {
            docstore_common::TransactionStatus::Committed => {
                self.notify_committed(transaction_id, result.status_time)
            }
            docstore_common::TransactionStatus::Aborted => self.notify_aborted(transaction_id),
            _ => {}
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::doc_key::{DocKey, SubDocKey};
    use crate::doc_write_batch::DocWriteBatch;
    use crate::encoding::Encode;
    use crate::primitive_value::PrimitiveValue;
    use crate::value::Value;
    use docstore_common::{IsolationLevel, OpId};
    use tempfile::TempDir;

    fn setup() -> (TempDir, Arc<DocDb>, TransactionParticipant) {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(DocDb::open(StorageConfig::new(dir.path().join("t"))).unwrap());
        let participant = TransactionParticipant::new(db.clone());
        (dir, db, participant)
    }

    fn field(name: &str) -> SubDocKey {
        SubDocKey::new(
            DocKey::from_range(vec![PrimitiveValue::string("k")]),
            vec![PrimitiveValue::string(name)],
        )
    }

    fn frontier(index: u64, micros: u64) -> ConsensusFrontier {
        ConsensusFrontier::new(OpId::new(1, index), HybridTime::from_micros(micros))
    }

    fn write_transaction(db: &DocDb, participant: &TransactionParticipant, txn: TransactionId) {
        let metadata = TransactionMetadata::new(
            txn,
            IsolationLevel::Snapshot,
            "status",
            0,
            HybridTime::from_micros(1),
        );
        let mut batch = DocWriteBatch::new();
        batch.set_value(field("a"), Value::new(PrimitiveValue::Int64(1)));
        batch.set_value(field("b"), Value::new(PrimitiveValue::Int64(2)));
        let first = participant.reserve_write_ids(txn, 3).unwrap();
        let (mut intents, _) = batch
            .to_intents_batch(&metadata, HybridTime::from_micros(30), first)
            .unwrap();
        intents.set_frontier(frontier(1, 30));
        db.write(&intents, StoreType::Intents);
    }

    fn count(db: &DocDb, store: StoreType) -> usize {
        let mut iter = db.new_iterator(store);
        iter.seek_to_first().unwrap();
        let mut n = 0;
        while iter.valid() {
            n += 1;
            iter.next().unwrap();
        }
        n
    }

    #[test]
    fn test_apply_moves_intents_to_commit_time() {
        let (_dir, db, participant) = setup();
        let txn = TransactionId::new();
        write_transaction(&db, &participant, txn);
        assert!(participant.load_metadata(txn).unwrap().is_some());
        assert_eq!(participant.transactions_with_intents().unwrap(), vec![txn]);

        let applied = participant
            .apply_transaction(txn, HybridTime::from_micros(32), frontier(2, 32))
            .unwrap();
        assert_eq!(applied, 2);
        assert_eq!(count(&db, StoreType::Intents), 0);
        assert_eq!(count(&db, StoreType::Regular), 2);

        let key = field("a")
            .with_ht(DocHybridTime::new(HybridTime::from_micros(32), 0))
            .encode()
            .unwrap();
        let value = db.get(StoreType::Regular, &key).unwrap().unwrap();
        assert_eq!(Value::decode(&value).unwrap(), Value::new(PrimitiveValue::Int64(1)));

        assert_eq!(participant.local_commit_time(txn), HybridTime::from_micros(32));
        assert!(participant.finished_transactions().contains(&txn));
    }

    #[test]
    fn test_replayed_apply_finishes_interrupted_intent_cleanup() {
        let txn = TransactionId::new();
        let (_done_dir, done_db, done) = setup();
        write_transaction(&done_db, &done, txn);
        done.apply_transaction(txn, HybridTime::from_micros(32), frontier(2, 32))
            .unwrap();

        // Regular batch landed, intents batch lost in a crash.
        let (_dir, db, participant) = setup();
        write_transaction(&db, &participant, txn);
        let mut regular = WriteBatch::new();
        let mut iter = done_db.new_iterator(StoreType::Regular);
        iter.seek_to_first().unwrap();
        while iter.valid() {
            regular.put(iter.key().to_vec(), iter.value().to_vec());
            iter.next().unwrap();
        }
        regular.set_frontier(frontier(2, 32));
        assert!(db.write(&regular, StoreType::Regular));
        drop(participant);

        let restarted = TransactionParticipant::new(db.clone());
        assert_eq!(restarted.transactions_with_intents().unwrap(), vec![txn]);
        restarted
            .apply_transaction(txn, HybridTime::from_micros(32), frontier(2, 32))
            .unwrap();
        assert_eq!(count(&db, StoreType::Intents), 0);
        assert_eq!(count(&db, StoreType::Regular), 2);
        assert_eq!(
            db.applied_frontier(StoreType::Intents).map(|f| f.op_id),
            Some(OpId::new(1, 2))
        );
        assert!(restarted.finished_transactions().contains(&txn));
    }

    #[test]
    fn test_remove_intents_of_aborted_transaction() {
        let (_dir, db, participant) = setup();
        let txn = TransactionId::new();
        write_transaction(&db, &participant, txn);

        // Two strong intents and one weak intent on the document.
        assert_eq!(participant.remove_intents(txn, frontier(2, 40)).unwrap(), 3);
        assert_eq!(count(&db, StoreType::Intents), 0);
        assert_eq!(count(&db, StoreType::Regular), 0);
        assert_eq!(participant.local_commit_time(txn), HybridTime::MIN);
    }

    #[test]
    fn test_write_ids_recovered_after_restart() {
        let (_dir, db, participant) = setup();
        let txn = TransactionId::new();
        write_transaction(&db, &participant, txn);

        let reopened = TransactionParticipant::new(db);
        assert_eq!(reopened.reserve_write_ids(txn, 1).unwrap(), 3);
        assert_eq!(reopened.reserve_write_ids(txn, 1).unwrap(), 4);
    }

    #[test]
    fn test_status_request_without_resolver_fails() {
        let (_dir, _db, participant) = setup();
        let err = participant
            .request_status_at(TransactionId::new(), HybridTime::from_micros(1))
            .unwrap_err();
        assert!(matches!(err, Error::IllegalState(_)));
    }
}
