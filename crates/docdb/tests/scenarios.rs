//! End-to-end read, intent and compaction scenarios over one `DocDb`.

mod common;

use common::{TestStore, doc, field, ht, int, int_doc};
use docstore_common::{IsolationLevel, OpId, TransactionId, TransactionMetadata};
use docstore_docdb::{
    ConsensusFrontier, DocDbCompactionFilter, DocWriteBatch, HistoryRetentionDirective, PrimitiveValue,
    StoreType, SubDocument, TransactionParticipant, Value,
};

fn compact(store: &TestStore, cutoff_micros: u64, is_major: bool) {
    let mut filter =
        DocDbCompactionFilter::new(HistoryRetentionDirective::new(ht(cutoff_micros)), is_major);
    store.db.compact(StoreType::Regular, &mut filter).unwrap();
}

#[test]
fn test_versions_survive_compaction_at_cutoff() {
    let store = TestStore::open();
    let col1 = field("k1", "col1");
    store.put(&col1, int(100), 10);
    store.put(&col1, int(200), 20);

    assert_eq!(store.read(&col1, 15), int_doc(100));
    assert_eq!(store.read(&col1, 25), int_doc(200));

    compact(&store, 20, false);

    assert_eq!(store.records(StoreType::Regular).len(), 1);
    assert_eq!(store.read(&col1, 25), int_doc(200));
    assert_eq!(store.read(&col1, 20), int_doc(200));
}

#[test]
fn test_intent_visible_only_after_commit() {
    let store = TestStore::open();
    let key = field("k2", "a");
    let tx1 = TransactionId::new();
    let metadata = TransactionMetadata::new(tx1, IsolationLevel::Snapshot, "status", 1, ht(25));

    let mut batch = DocWriteBatch::new();
    batch.set_value(key.clone(), int(1));
    let (intents, _) = batch.to_intents_batch(&metadata, ht(30), 0).unwrap();
    store.db.write(&intents, StoreType::Intents);

    assert_eq!(store.read(&key, 35), None);
    assert_eq!(store.read_in(&key, 35, Some(tx1)), int_doc(1));

    store.statuses.commit(tx1, ht(32));
    assert_eq!(store.read(&key, 35), int_doc(1));
    assert_eq!(store.read(&key, 31), None);

    // Applying moves the record to the regular store at the commit time.
    let participant = TransactionParticipant::new(store.db.clone());
    let applied = participant
        .apply_transaction(tx1, ht(32), ConsensusFrontier::new(OpId::new(1, 1), ht(40)))
        .unwrap();
    assert_eq!(applied, 1);
    assert!(store.records(StoreType::Intents).is_empty());
    assert_eq!(store.read(&key, 35), int_doc(1));
    assert_eq!(store.read(&key, 31), None);
}

#[test]
fn test_aborted_intents_stay_invisible() {
    let store = TestStore::open();
    let key = field("k", "a");
    let txn = TransactionId::new();
    let metadata = TransactionMetadata::new(txn, IsolationLevel::Snapshot, "status", 1, ht(5));
    store.put(&key, int(7), 5);

    let mut batch = DocWriteBatch::new();
    batch.set_value(key.clone(), int(8));
    let (intents, _) = batch.to_intents_batch(&metadata, ht(10), 0).unwrap();
    store.db.write(&intents, StoreType::Intents);
    store.statuses.abort(txn);

    assert_eq!(store.read(&key, 20), int_doc(7));
}

#[test]
fn test_tombstone_kept_by_minor_compaction() {
    let store = TestStore::open();
    let k3 = doc("k3");
    let x = field("k3", "x");

    let mut batch = DocWriteBatch::new();
    batch.set_value(k3.clone(), Value::object());
    batch.set_value(x.clone(), int(1));
    store
        .db
        .write(&batch.to_regular_batch(ht(30)).unwrap(), StoreType::Regular);
    assert!(matches!(store.read(&k3, 35), Some(SubDocument::Object(_))));

    store.delete(&k3, 40);
    assert_eq!(store.read(&k3, 45), None);
    assert_eq!(store.read(&x, 45), None);

    compact(&store, 50, false);
    let remaining = store.records(StoreType::Regular);
    assert_eq!(remaining.len(), 1);
    assert_eq!(store.read(&k3, 55), None);

    compact(&store, 50, true);
    assert!(store.records(StoreType::Regular).is_empty());
    assert_eq!(store.read(&k3, 55), None);
}

#[test]
fn test_document_read_assembles_fields() {
    let store = TestStore::open();
    let user = doc("user");
    store.put(&user, Value::object(), 5);
    store.put(&field("user", "age"), int(30), 10);
    store.put(&field("user", "name"), Value::new(PrimitiveValue::string("ann")), 12);
    store.put(&field("user", "age"), int(31), 20);

    let at_15 = store.read(&user, 15).unwrap();
    assert_eq!(at_15.leaf_count(), 2);
    assert_eq!(
        at_15.get(&PrimitiveValue::string("age")),
        int_doc(30).as_ref()
    );

    let at_25 = store.read(&user, 25).unwrap();
    assert_eq!(
        at_25.get(&PrimitiveValue::string("age")),
        int_doc(31).as_ref()
    );
}
