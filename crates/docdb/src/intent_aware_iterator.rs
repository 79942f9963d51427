//! Merged read cursor over the regular and intents stores.
//!
//! The regular side yields committed records whose write time is at or
//! below the read time. The intents side yields, for each path, the single
//! best visible strong write intent: one from the reader's own transaction
//! (always preferred) or one from a foreign transaction committed at or
//! before the read time. A resolved intent is presented under the key it
//! would have after being applied, `path # commit time`, so both sides can
//! be merged by plain key order. Own intents are presented at
//! `DocHybridTime::MAX` and therefore sort ahead of every committed version
//! of their path.
//!
//! Positioning is lazy: seeks only move the underlying cursors, and the
//! work of skipping future records and resolving intents runs on the next
//! call to `valid`.

use crate::doc_key::{append_doc_ht, out_of_sub_doc_target, past_sub_key_target, split_doc_ht};
use crate::encoding::Decode;
use crate::error::Result;
use crate::intent::{IntentValue, decode_intent_key, intent_prefix, is_intent_key};
use crate::read_time::ReadHybridTime;
use crate::store_iterator::StoreIterator;
use crate::transaction_status::TransactionStatusCache;
use crate::value_type::ValueType;
use docstore_common::TransactionId;
use docstore_hlc::{DocHybridTime, HybridTime};
use std::cmp::Ordering;

/// Key and write time of the current entry.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedEntry {
    /// Encoded sub-document path, without hybrid time.
    pub path: Vec<u8>,
    /// Own intents report their own write time, foreign intents their
    /// commit time.
    pub write_time: DocHybridTime,
    pub same_transaction: bool,
}

#[derive(Debug, Clone)]
struct ResolvedIntent {
    path: Vec<u8>,
    /// `path # sort_ht`, the position of the intent in merged order.
    sort_key: Vec<u8>,
    sort_ht: DocHybridTime,
    write_time: DocHybridTime,
    same_transaction: bool,
    value: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Regular,
    Intent,
    /// Same key on both sides: an applied intent still present in the
    /// intents snapshot. The regular record wins.
    Both,
}

pub struct IntentAwareIterator {
    read_time: ReadHybridTime,
    transaction_id: Option<TransactionId>,
    regular: StoreIterator,
    intents: Option<StoreIterator>,
    status_cache: TransactionStatusCache,
    resolved: Option<ResolvedIntent>,
    prefix_stack: Vec<Vec<u8>>,
    skip_future_records_needed: bool,
    skip_future_intents_needed: bool,
    max_seen_ht: HybridTime,
}

impl IntentAwareIterator {
    /// `intents` is `None` for non-transactional tables. When both cursors
    /// are given, the intents snapshot must have been taken first so that
    /// an intent applied in between is seen on at least one side.
    pub fn new(
        regular: StoreIterator,
        intents: Option<StoreIterator>,
        read_time: ReadHybridTime,
        transaction_id: Option<TransactionId>,
        status_cache: TransactionStatusCache,
    ) -> Self {
        Self {
            read_time,
            transaction_id,
            regular,
            intents,
            status_cache,
            resolved: None,
            prefix_stack: Vec::new(),
            skip_future_records_needed: false,
            skip_future_intents_needed: false,
            max_seen_ht: HybridTime::MIN,
        }
    }

    pub fn read_time(&self) -> &ReadHybridTime {
        &self.read_time
    }

    /// Largest write or commit time in `(read, global_limit]` met so far.
    /// If above the read time, the read must restart at this time.
    pub fn max_seen_ht(&self) -> HybridTime {
        self.max_seen_ht
    }

    /// Position at the first entry with path `>= key`.
    pub fn seek(&mut self, key: &[u8]) -> Result<()> {
        self.regular.seek(key)?;
        self.skip_future_records_needed = true;
        if let Some(intents) = self.intents.as_mut() {
            intents.seek(&intent_prefix(key))?;
            self.resolved = None;
            self.skip_future_intents_needed = true;
        }
        Ok(())
    }

    /// Like `seek`, but never moves backwards.
    pub fn seek_forward(&mut self, key: &[u8]) -> Result<()> {
        self.regular.seek_forward(key)?;
        self.skip_future_records_needed = true;
        if let Some(intents) = self.intents.as_mut() {
            if let Some(resolved) = &self.resolved
                && resolved.sort_key.as_slice() >= key
            {
                return Ok(());
            }
            intents.seek_forward(&intent_prefix(key))?;
            self.resolved = None;
            self.skip_future_intents_needed = true;
        }
        Ok(())
    }

    /// Skip the remaining versions of `path`, stopping at its children.
    pub fn seek_past_sub_key(&mut self, path: &[u8]) -> Result<()> {
        self.seek_forward(&past_sub_key_target(path))
    }

    /// Skip `path` and everything nested below it.
    pub fn seek_out_of_sub_doc(&mut self, path: &[u8]) -> Result<()> {
        self.seek_forward(&out_of_sub_doc_target(path))
    }

    /// Restrict the iterator to entries whose path starts with `prefix`.
    pub fn push_prefix(&mut self, prefix: &[u8]) {
        self.prefix_stack.push(prefix.to_vec());
    }

    pub fn pop_prefix(&mut self) {
        self.prefix_stack.pop();
        self.skip_future_records_needed = true;
        if self.intents.is_some() && self.resolved.is_none() {
            self.skip_future_intents_needed = true;
        }
    }

    fn within_prefix(&self, key: &[u8]) -> bool {
        self.prefix_stack
            .last()
            .is_none_or(|prefix| key.starts_with(prefix))
    }

    pub fn valid(&mut self) -> Result<bool> {
        self.resolve_pending()?;
        Ok(self.current_source().is_some())
    }

    fn resolve_pending(&mut self) -> Result<()> {
        if self.skip_future_records_needed {
            self.skip_future_records()?;
            self.skip_future_records_needed = false;
        }
        if self.skip_future_intents_needed {
            self.seek_to_suitable_intent()?;
            self.skip_future_intents_needed = false;
        }
        Ok(())
    }

    fn regular_in_range(&self) -> bool {
        self.regular.valid() && self.within_prefix(self.regular.key())
    }

    fn current_source(&self) -> Option<Source> {
        let regular = self.regular_in_range();
        let resolved = self
            .resolved
            .as_ref()
            .filter(|intent| self.within_prefix(&intent.path));
        match (regular, resolved) {
            (false, None) => None,
            (true, None) => Some(Source::Regular),
            (false, Some(_)) => Some(Source::Intent),
            (true, Some(intent)) => match self.regular.key().cmp(intent.sort_key.as_slice()) {
                Ordering::Less => Some(Source::Regular),
                Ordering::Greater => Some(Source::Intent),
                Ordering::Equal => Some(Source::Both),
            },
        }
    }

    /// Skip regular records written after the read time, remembering those
    /// inside the uncertainty window.
    fn skip_future_records(&mut self) -> Result<()> {
        while self.regular_in_range() {
            let (_, doc_ht) = split_doc_ht(self.regular.key())?;
            if doc_ht.hybrid_time <= self.read_time.read {
                break;
            }
            if doc_ht.hybrid_time <= self.read_time.global_limit {
                self.max_seen_ht = self.max_seen_ht.max(doc_ht.hybrid_time);
            }
            self.regular.next()?;
        }
        Ok(())
    }

    /// Advance the intents cursor to the first path group that has a
    /// visible strong write intent and resolve it.
    fn seek_to_suitable_intent(&mut self) -> Result<()> {
        self.resolved = None;
        loop {
            let Some(intents) = self.intents.as_ref() else {
                return Ok(());
            };
            if !intents.valid() || !is_intent_key(intents.key()) {
                return Ok(());
            }
            let path = decode_intent_key(intents.key())?.path.to_vec();
            if !self.within_prefix(&path) {
                return Ok(());
            }
            if let Some(resolved) = self.resolve_group(&path)? {
                self.resolved = Some(resolved);
                return Ok(());
            }
        }
    }

    /// Consume all intents of exactly `path` and return the best visible one.
    fn resolve_group(&mut self, path: &[u8]) -> Result<Option<ResolvedIntent>> {
        let Some(intents) = self.intents.as_mut() else {
            return Ok(None);
        };
        let mut group_prefix = intent_prefix(path);
        group_prefix.push(ValueType::IntentTypeSet.as_byte());

        let mut best: Option<ResolvedIntent> = None;
        while intents.valid() && intents.key().starts_with(&group_prefix) {
            let decoded = decode_intent_key(intents.key())?;
            if decoded.types.has_strong_write() {
                let intent = IntentValue::decode(intents.value())?;
                let candidate = evaluate_intent(
                    &self.read_time,
                    self.transaction_id,
                    &mut self.status_cache,
                    &mut self.max_seen_ht,
                    decoded.doc_ht,
                    &intent,
                )?;
                if let Some((sort_ht, write_time, same_transaction)) = candidate {
                    let better = best.as_ref().is_none_or(|b| {
                        (sort_ht, write_time) > (b.sort_ht, b.write_time)
                    });
                    if better {
                        let mut sort_key = path.to_vec();
                        append_doc_ht(&mut sort_key, sort_ht);
                        best = Some(ResolvedIntent {
                            path: path.to_vec(),
                            sort_key,
                            sort_ht,
                            write_time,
                            same_transaction,
                            value: intent.value,
                        });
                    }
                }
            }
            intents.next()?;
        }
        Ok(best)
    }

    /// Key and time of the current entry. Only call when `valid`.
    pub fn fetch_key(&mut self) -> Result<Option<FetchedEntry>> {
        self.resolve_pending()?;
        let entry = match self.current_source() {
            None => None,
            Some(Source::Intent) => self.resolved.as_ref().map(|intent| FetchedEntry {
                path: intent.path.clone(),
                write_time: intent.write_time,
                same_transaction: intent.same_transaction,
            }),
            Some(Source::Regular) | Some(Source::Both) => {
                let (path, doc_ht) = split_doc_ht(self.regular.key())?;
                Some(FetchedEntry {
                    path: path.to_vec(),
                    write_time: doc_ht,
                    same_transaction: false,
                })
            }
        };
        Ok(entry)
    }

    /// Encoded value of the current entry.
    pub fn value(&self) -> &[u8] {
        match self.current_source() {
            Some(Source::Intent) => self
                .resolved
                .as_ref()
                .map(|intent| intent.value.as_slice())
                .unwrap_or_default(),
            Some(Source::Regular) | Some(Source::Both) => self.regular.value(),
            None => &[],
        }
    }

    /// Move to the next entry in merged order.
    pub fn next(&mut self) -> Result<()> {
        self.resolve_pending()?;
        match self.current_source() {
            None => {}
            Some(Source::Regular) => self.advance_regular()?,
            Some(Source::Intent) => self.advance_intent(),
            Some(Source::Both) => {
                self.advance_regular()?;
                self.advance_intent();
            }
        }
        Ok(())
    }

    fn advance_regular(&mut self) -> Result<()> {
        self.regular.next()?;
        self.skip_future_records_needed = true;
        Ok(())
    }

    /// The intents cursor already sits past the resolved group.
    fn advance_intent(&mut self) {
        self.resolved = None;
        self.skip_future_intents_needed = true;
    }

    /// Latest write to exactly `path` visible to this reader, if newer than
    /// `newer_than`. Looks at own and committed foreign intents as well as
    /// regular records; an own intent always wins. Leaves the iterator
    /// unpositioned.
    pub fn find_last_write_time(
        &mut self,
        path: &[u8],
        newer_than: DocHybridTime,
    ) -> Result<Option<LastWrite>> {
        let mut best: Option<LastWrite> = None;

        if let Some(intents) = self.intents.as_mut() {
            intents.seek(&intent_prefix(path))?;
            if let Some(intent) = self.resolve_group(path)? {
                best = Some(LastWrite {
                    write_time: intent.write_time,
                    same_transaction: intent.same_transaction,
                    value: intent.value,
                });
            }
        }

        let own_intent = best.as_ref().is_some_and(|w| w.same_transaction);
        if !own_intent {
            self.regular.seek(path)?;
            self.skip_future_records()?;
            if self.regular.valid() {
                let (found_path, doc_ht) = split_doc_ht(self.regular.key())?;
                if found_path == path && best.as_ref().is_none_or(|w| doc_ht > w.write_time) {
                    best = Some(LastWrite {
                        write_time: doc_ht,
                        same_transaction: false,
                        value: self.regular.value().to_vec(),
                    });
                }
            }
        }

        self.resolved = None;
        self.skip_future_intents_needed = self.intents.is_some();
        self.skip_future_records_needed = true;
        Ok(best.filter(|w| w.same_transaction || w.write_time > newer_than))
    }
}

/// Result of [`IntentAwareIterator::find_last_write_time`].
#[derive(Debug, Clone, PartialEq)]
pub struct LastWrite {
    pub write_time: DocHybridTime,
    pub same_transaction: bool,
    /// Encoded [`crate::value::Value`].
    pub value: Vec<u8>,
}

/// Visibility of one strong write intent. Returns `(sort time, reported
/// write time, same transaction)` if visible.
fn evaluate_intent(
    read_time: &ReadHybridTime,
    own_transaction: Option<TransactionId>,
    status_cache: &mut TransactionStatusCache,
    max_seen_ht: &mut HybridTime,
    intent_ht: DocHybridTime,
    intent: &IntentValue,
) -> Result<Option<(DocHybridTime, DocHybridTime, bool)>> {
    if own_transaction == Some(intent.transaction_id) {
        if intent_ht.hybrid_time > read_time.in_txn_limit {
            return Ok(None);
        }
        return Ok(Some((DocHybridTime::MAX, intent_ht, true)));
    }

    let commit_ht = status_cache.get_commit_time(intent.transaction_id)?;
    if commit_ht == HybridTime::MIN || commit_ht == HybridTime::MAX || !commit_ht.is_valid() {
        return Ok(None);
    }
    if commit_ht > read_time.read {
        if commit_ht <= read_time.global_limit {
            *max_seen_ht = (*max_seen_ht).max(commit_ht);
        }
        return Ok(None);
    }
    let commit_time = DocHybridTime::new(commit_ht, intent.write_id);
    Ok(Some((commit_time, commit_time, false)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::doc_key::{DocKey, SubDocKey};
    use crate::encoding::Encode;
    use crate::engine::{DocDb, StoreType};
    use crate::intent::{IntentType, IntentTypeSet, encode_intent_key};
    use crate::primitive_value::PrimitiveValue;
    use crate::transaction_status::{TransactionStatusManager, TransactionStatusResult};
    use crate::value::Value;
    use crate::write_batch::WriteBatch;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    /// Commit times set by hand; everything else is pending forever.
    #[derive(Default)]
    struct CommitTimes(Mutex<HashMap<TransactionId, HybridTime>>);

    impl TransactionStatusManager for CommitTimes {
        fn local_commit_time(&self, id: TransactionId) -> HybridTime {
            self.0.lock().get(&id).copied().unwrap_or(HybridTime::INVALID)
        }

        fn request_status_at(&self, _: TransactionId, _: HybridTime) -> Result<TransactionStatusResult> {
            Ok(TransactionStatusResult::pending(HybridTime::MAX))
        }
    }

    struct Fixture {
        _dir: TempDir,
        db: DocDb,
        statuses: Arc<CommitTimes>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let db = DocDb::open(StorageConfig::new(dir.path().join("tablet"))).unwrap();
        Fixture {
            _dir: dir,
            db,
            statuses: Arc::new(CommitTimes::default()),
        }
    }

    fn micros(m: u64) -> HybridTime {
        HybridTime::from_micros(m)
    }

    fn ht(m: u64) -> DocHybridTime {
        DocHybridTime::new(micros(m), 0)
    }

    fn doc(name: &str) -> SubDocKey {
        SubDocKey::doc_only(DocKey::from_range(vec![PrimitiveValue::string(name)]))
    }

    fn field(name: &str, subkey: &str) -> SubDocKey {
        doc(name).child(PrimitiveValue::string(subkey))
    }

    fn path(key: &SubDocKey) -> Vec<u8> {
        key.encode_without_ht().unwrap()
    }

    fn int(value: i64) -> Vec<u8> {
        Value::new(PrimitiveValue::Int64(value)).encode().unwrap()
    }

    impl Fixture {
        fn put(&self, key: &SubDocKey, m: u64, value: i64) {
            let mut batch = WriteBatch::new();
            batch.put(key.clone().with_ht(ht(m)).encode().unwrap(), int(value));
            self.db.write(&batch, StoreType::Regular);
        }

        fn put_intent(&self, key: &SubDocKey, txn: TransactionId, m: u64, value: i64) {
            let intent = IntentValue {
                transaction_id: txn,
                write_id: 0,
                value: int(value),
            };
            let mut batch = WriteBatch::new();
            batch.put(
                encode_intent_key(&path(key), IntentTypeSet::single(IntentType::StrongWrite), ht(m)),
                intent.encode().unwrap(),
            );
            self.db.write(&batch, StoreType::Intents);
        }

        fn commit(&self, txn: TransactionId, m: u64) {
            self.statuses.0.lock().insert(txn, micros(m));
        }

        fn iter_at(&self, read_time: ReadHybridTime, txn: Option<TransactionId>) -> IntentAwareIterator {
            let intents = self.db.new_iterator(StoreType::Intents);
            let regular = self.db.new_iterator(StoreType::Regular);
            let cache = TransactionStatusCache::new(
                self.statuses.clone(),
                read_time.read,
                Instant::now() + Duration::from_secs(5),
            );
            IntentAwareIterator::new(regular, Some(intents), read_time, txn, cache)
        }

        fn iter(&self, m: u64, txn: Option<TransactionId>) -> IntentAwareIterator {
            self.iter_at(ReadHybridTime::single_time(micros(m)), txn)
        }
    }

    /// Remaining entries as (path, write time, own intent).
    fn drain(iter: &mut IntentAwareIterator) -> Vec<(Vec<u8>, DocHybridTime, bool)> {
        let mut entries = Vec::new();
        while iter.valid().unwrap() {
            let entry = iter.fetch_key().unwrap().unwrap();
            entries.push((entry.path, entry.write_time, entry.same_transaction));
            iter.next().unwrap();
        }
        entries
    }

    fn current_path(iter: &mut IntentAwareIterator) -> Option<Vec<u8>> {
        iter.fetch_key().unwrap().map(|entry| entry.path)
    }

    #[test]
    fn test_skips_records_after_read_time() {
        let f = fixture();
        let a = field("d", "a");
        let b = field("d", "b");
        f.put(&a, 10, 1);
        f.put(&a, 20, 2);
        f.put(&b, 30, 3);

        let mut iter = f.iter(25, None);
        iter.seek(&path(&doc("d"))).unwrap();
        assert_eq!(
            drain(&mut iter),
            vec![(path(&a), ht(20), false), (path(&a), ht(10), false)]
        );
        assert_eq!(iter.max_seen_ht(), HybridTime::MIN);

        let window = ReadHybridTime::from_read_and_skew(micros(25), Duration::from_micros(10));
        let mut iter = f.iter_at(window, None);
        iter.seek(&path(&doc("d"))).unwrap();
        assert_eq!(drain(&mut iter).len(), 2);
        assert_eq!(iter.max_seen_ht(), micros(30));
    }

    #[test]
    fn test_own_intent_sorts_ahead_of_committed_versions() {
        let f = fixture();
        let a = field("d", "a");
        let txn = TransactionId::new();
        f.put(&a, 10, 1);
        f.put(&a, 40, 4);
        f.put_intent(&a, txn, 20, 2);

        let mut iter = f.iter(50, Some(txn));
        iter.seek(&path(&a)).unwrap();
        assert!(iter.valid().unwrap());
        assert_eq!(iter.value(), int(2).as_slice());
        assert_eq!(
            drain(&mut iter),
            vec![
                (path(&a), ht(20), true),
                (path(&a), ht(40), false),
                (path(&a), ht(10), false),
            ]
        );

        // Other readers do not see the pending intent.
        let mut iter = f.iter(50, None);
        iter.seek(&path(&a)).unwrap();
        assert_eq!(drain(&mut iter).len(), 2);
    }

    #[test]
    fn test_foreign_intent_appears_at_commit_time() {
        let f = fixture();
        let a = field("d", "a");
        let committed = TransactionId::new();
        let aborted = TransactionId::new();
        f.put(&a, 10, 1);
        f.put_intent(&a, committed, 20, 2);
        f.put_intent(&field("d", "b"), aborted, 20, 3);
        f.commit(committed, 30);
        f.statuses.0.lock().insert(aborted, HybridTime::MIN);

        let mut iter = f.iter(35, None);
        iter.seek(&path(&doc("d"))).unwrap();
        assert_eq!(
            drain(&mut iter),
            vec![(path(&a), ht(30), false), (path(&a), ht(10), false)]
        );

        // Committed after the read time, inside the uncertainty window.
        let window = ReadHybridTime::from_read_and_skew(micros(25), Duration::from_micros(10));
        let mut iter = f.iter_at(window, None);
        iter.seek(&path(&doc("d"))).unwrap();
        assert_eq!(drain(&mut iter), vec![(path(&a), ht(10), false)]);
        assert_eq!(iter.max_seen_ht(), micros(30));
    }

    #[test]
    fn test_applied_intent_still_in_snapshot_is_read_once() {
        let f = fixture();
        let a = field("d", "a");
        let txn = TransactionId::new();
        f.put_intent(&a, txn, 20, 2);
        f.commit(txn, 30);
        // The applied copy in the regular store, same key as the resolved intent.
        f.put(&a, 30, 1);

        let mut iter = f.iter(35, None);
        iter.seek(&path(&a)).unwrap();
        assert!(iter.valid().unwrap());
        assert_eq!(iter.value(), int(1).as_slice());
        assert_eq!(drain(&mut iter), vec![(path(&a), ht(30), false)]);
    }

    #[test]
    fn test_seek_past_sub_key_and_out_of_sub_doc() {
        let f = fixture();
        let d = doc("d");
        let a = field("d", "a");
        let b = field("d", "b");
        let c = field("d", "c");
        let x = field("e", "x");
        let txn = TransactionId::new();
        f.put(&d, 5, 0);
        f.put(&a, 10, 1);
        f.put(&a, 20, 2);
        f.put(&b, 10, 3);
        f.put_intent(&c, txn, 15, 4);
        f.put(&x, 10, 5);

        let mut iter = f.iter(50, Some(txn));
        iter.seek(&path(&d)).unwrap();
        assert_eq!(current_path(&mut iter), Some(path(&d)));

        iter.seek_past_sub_key(&path(&d)).unwrap();
        let entry = iter.fetch_key().unwrap().unwrap();
        assert_eq!((entry.path, entry.write_time), (path(&a), ht(20)));

        iter.seek_past_sub_key(&path(&a)).unwrap();
        assert_eq!(current_path(&mut iter), Some(path(&b)));

        iter.seek_past_sub_key(&path(&b)).unwrap();
        let entry = iter.fetch_key().unwrap().unwrap();
        assert_eq!(entry.path, path(&c));
        assert!(entry.same_transaction);

        iter.seek(&path(&d)).unwrap();
        iter.seek_out_of_sub_doc(&path(&d)).unwrap();
        assert_eq!(current_path(&mut iter), Some(path(&x)));
    }

    #[test]
    fn test_seek_forward_does_not_move_back() {
        let f = fixture();
        let a = field("d", "a");
        let b = field("d", "b");
        f.put(&a, 10, 1);
        f.put(&b, 10, 2);

        let mut iter = f.iter(20, None);
        iter.seek(&path(&b)).unwrap();
        iter.seek_forward(&path(&a)).unwrap();
        assert_eq!(current_path(&mut iter), Some(path(&b)));

        iter.seek(&path(&a)).unwrap();
        assert_eq!(current_path(&mut iter), Some(path(&a)));
    }

    #[test]
    fn test_prefix_bounds_iteration() {
        let f = fixture();
        f.put(&field("d", "a"), 10, 1);
        f.put(&field("e", "a"), 10, 2);

        let mut iter = f.iter(20, None);
        iter.push_prefix(&path(&doc("d")));
        iter.seek(&path(&doc("d"))).unwrap();
        assert_eq!(drain(&mut iter).len(), 1);
        iter.pop_prefix();
        assert!(iter.valid().unwrap());
        assert_eq!(current_path(&mut iter), Some(path(&field("e", "a"))));
    }

    #[test]
    fn test_find_last_write_time() {
        let f = fixture();
        let a = field("d", "a");
        let b = field("d", "b");
        f.put(&a, 10, 1);
        f.put(&a, 20, 2);

        let mut iter = f.iter(25, None);
        let last = iter.find_last_write_time(&path(&a), DocHybridTime::MIN).unwrap().unwrap();
        assert_eq!(last.write_time, ht(20));
        assert_eq!(last.value, int(2));
        assert!(!last.same_transaction);
        assert_eq!(iter.find_last_write_time(&path(&a), ht(20)).unwrap(), None);

        let mut iter = f.iter(15, None);
        let last = iter.find_last_write_time(&path(&a), DocHybridTime::MIN).unwrap().unwrap();
        assert_eq!(last.write_time, ht(10));

        // A committed foreign intent newer than the regular record wins.
        let foreign = TransactionId::new();
        f.put(&b, 18, 3);
        f.put_intent(&b, foreign, 12, 4);
        f.commit(foreign, 22);
        let mut iter = f.iter(25, None);
        let last = iter.find_last_write_time(&path(&b), DocHybridTime::MIN).unwrap().unwrap();
        assert_eq!(last.write_time, ht(22));
        assert_eq!(last.value, int(4));

        // An own intent is reported even below `newer_than`.
        let own = TransactionId::new();
        f.put_intent(&a, own, 30, 5);
        let mut iter = f.iter(25, Some(own));
        let last = iter.find_last_write_time(&path(&a), ht(40)).unwrap().unwrap();
        assert!(last.same_transaction);
        assert_eq!(last.write_time, ht(30));

        // The iterator can be positioned again afterwards.
        iter.seek(&path(&a)).unwrap();
        assert_eq!(current_path(&mut iter), Some(path(&a)));
    }
}
