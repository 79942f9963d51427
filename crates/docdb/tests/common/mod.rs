//! Common test utilities for integration tests

#![allow(dead_code)]

use docstore_common::TransactionId;
use docstore_docdb::{
    DocDb, DocKey, DocWriteBatch, PrimitiveValue, ReadContext, ReadHybridTime, Result,
    StorageConfig, StoreType, SubDocKey, SubDocument, TransactionStatusManager,
    TransactionStatusResolver, TransactionStatusResult, Value,
};
use docstore_hlc::HybridTime;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Transaction statuses set by hand. Unknown transactions report as
/// pending as of the read time, so their intents are invisible.
#[derive(Default)]
pub struct StatusTable {
    commits: Mutex<HashMap<TransactionId, HybridTime>>,
}

impl StatusTable {
    pub fn commit(&self, transaction_id: TransactionId, commit_ht: HybridTime) {
        self.commits.lock().insert(transaction_id, commit_ht);
    }

    pub fn abort(&self, transaction_id: TransactionId) {
        self.commits.lock().insert(transaction_id, HybridTime::MIN);
    }
}

impl TransactionStatusManager for StatusTable {
    fn local_commit_time(&self, transaction_id: TransactionId) -> HybridTime {
        self.commits
            .lock()
            .get(&transaction_id)
            .copied()
            .unwrap_or(HybridTime::INVALID)
    }

    fn request_status_at(
        &self,
        _transaction_id: TransactionId,
        read_ht: HybridTime,
    ) -> Result<TransactionStatusResult> {
        Ok(TransactionStatusResult::pending(read_ht))
    }
}

/// Remote status tablet that never learns an outcome.
pub struct AlwaysPending;

impl TransactionStatusResolver for AlwaysPending {
    fn get_status(
        &self,
        _transaction_id: TransactionId,
        read_ht: HybridTime,
    ) -> Result<TransactionStatusResult> {
        Ok(TransactionStatusResult::pending(read_ht))
    }
}

/// A `DocDb` in a temporary directory, written at explicit hybrid times.
pub struct TestStore {
    pub dir: TempDir,
    pub db: Arc<DocDb>,
    pub statuses: Arc<StatusTable>,
}

impl TestStore {
    pub fn open() -> Self {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(DocDb::open(StorageConfig::new(dir.path().join("tablet"))).unwrap());
        Self {
            dir,
            db,
            statuses: Arc::new(StatusTable::default()),
        }
    }

    /// Close and reopen the stores, as after a restart.
    pub fn reopen(self) -> Self {
        let Self { dir, db, statuses } = self;
        drop(db);
        let db = Arc::new(DocDb::open(StorageConfig::new(dir.path().join("tablet"))).unwrap());
        Self { dir, db, statuses }
    }

    pub fn put(&self, key: &SubDocKey, value: Value, micros: u64) {
        let mut batch = DocWriteBatch::new();
        batch.set_value(key.clone(), value);
        self.db
            .write(&batch.to_regular_batch(ht(micros)).unwrap(), StoreType::Regular);
    }

    pub fn delete(&self, key: &SubDocKey, micros: u64) {
        let mut batch = DocWriteBatch::new();
        batch.delete(key.clone());
        self.db
            .write(&batch.to_regular_batch(ht(micros)).unwrap(), StoreType::Regular);
    }

    pub fn read_in(
        &self,
        key: &SubDocKey,
        micros: u64,
        transaction_id: Option<TransactionId>,
    ) -> Option<SubDocument> {
        let mut context = ReadContext::new(
            &self.db,
            self.statuses.clone(),
            ReadHybridTime::single_time(ht(micros)),
            deadline(),
        )
        .with_transaction(transaction_id);
        context.get_sub_document(key).unwrap()
    }

    pub fn read(&self, key: &SubDocKey, micros: u64) -> Option<SubDocument> {
        self.read_in(key, micros, None)
    }

    /// Every record of a store in key order.
    pub fn records(&self, store: StoreType) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut iter = self.db.new_iterator(store);
        iter.seek_to_first().unwrap();
        let mut records = Vec::new();
        while iter.valid() {
            records.push((iter.key().to_vec(), iter.value().to_vec()));
            iter.next().unwrap();
        }
        records
    }
}

pub fn ht(micros: u64) -> HybridTime {
    HybridTime::from_micros(micros)
}

pub fn deadline() -> Instant {
    Instant::now() + Duration::from_secs(5)
}

pub fn doc(name: &str) -> SubDocKey {
    SubDocKey::doc_only(DocKey::from_range(vec![PrimitiveValue::string(name)]))
}

pub fn field(doc: &str, name: &str) -> SubDocKey {
    SubDocKey::new(
        DocKey::from_range(vec![PrimitiveValue::string(doc)]),
        vec![PrimitiveValue::string(name)],
    )
}

pub fn int(value: i64) -> Value {
    Value::new(PrimitiveValue::Int64(value))
}

pub fn int_doc(value: i64) -> Option<SubDocument> {
    Some(SubDocument::Primitive(PrimitiveValue::Int64(value)))
}
