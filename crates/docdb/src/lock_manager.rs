//! In-memory lock table shared by all write operations of a tablet.
//!
//! A lock is an [`IntentTypeSet`] on an encoded path. A write locks its
//! target path strongly and every ancestor weakly, so writers of sibling
//! fields proceed together while a whole-document delete excludes them.
//! Locks are held only while one operation runs, so there is no owner
//! tracking and no re-entrancy: duplicate keys in one request are merged
//! before acquisition.

use crate::doc_key::SubDocKey;
use crate::error::{Error, Result};
use crate::intent::{IntentType, IntentTypeSet};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

/// One key of a lock request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockBatchEntry {
    pub key: Vec<u8>,
    pub intent_types: IntentTypeSet,
}

/// Holder counts per intent type, indexed by the type's bit position.
#[derive(Debug, Default, Clone, Copy)]
struct LockedState {
    counts: [u32; 4],
}

impl LockedState {
    fn slot(intent_type: IntentType) -> usize {
        (intent_type as u8).trailing_zeros() as usize
    }

    fn held(&self) -> IntentTypeSet {
        let mut held = IntentTypeSet::EMPTY;
        for intent_type in IntentType::ALL {
            if self.counts[Self::slot(intent_type)] > 0 {
                held.insert(intent_type);
            }
        }
        held
    }

    fn add(&mut self, types: IntentTypeSet) {
        for intent_type in types.iter() {
            self.counts[Self::slot(intent_type)] += 1;
        }
    }

    fn remove(&mut self, types: IntentTypeSet) {
        for intent_type in types.iter() {
            let count = &mut self.counts[Self::slot(intent_type)];
            *count = count.saturating_sub(1);
        }
    }

    fn is_free(&self) -> bool {
        self.counts.iter().all(|count| *count == 0)
    }
}

#[derive(Default)]
pub struct SharedLockManager {
    locks: Mutex<HashMap<Vec<u8>, LockedState>>,
    released: Condvar,
}

impl SharedLockManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Acquire all `entries`, in key order, waiting for conflicting holders
    /// until `deadline`. On timeout, nothing stays locked.
    pub fn lock(
        self: &Arc<Self>,
        entries: Vec<LockBatchEntry>,
        deadline: Instant,
    ) -> Result<LockBatch> {
        let entries = merge_entries(entries);
        let mut locks = self.locks.lock();

        for (acquired, entry) in entries.iter().enumerate() {
            loop {
                let held = locks
                    .get(&entry.key)
                    .map(LockedState::held)
                    .unwrap_or(IntentTypeSet::EMPTY);
                if !held.conflicts_with(entry.intent_types) {
                    locks.entry(entry.key.clone()).or_default().add(entry.intent_types);
                    break;
                }
                if self.released.wait_until(&mut locks, deadline).timed_out() {
                    let held = locks
                        .get(&entry.key)
                        .map(LockedState::held)
                        .unwrap_or(IntentTypeSet::EMPTY);
                    if !held.conflicts_with(entry.intent_types) {
                        locks.entry(entry.key.clone()).or_default().add(entry.intent_types);
                        break;
                    }
                    Self::release_entries(&mut locks, &entries[..acquired]);
                    drop(locks);
                    self.released.notify_all();
                    tracing::debug!(
                        "Lock wait timed out on key {:02x?} ({:?} requested, {:?} held)",
                        entry.key,
                        entry.intent_types,
                        held
                    );
                    return Err(Error::TimedOut(format!(
                        "Failed to obtain locks on {} keys until deadline",
                        entries.len()
                    )));
                }
            }
        }

        Ok(LockBatch {
            manager: Arc::clone(self),
            entries,
        })
    }

    fn release_entries(locks: &mut HashMap<Vec<u8>, LockedState>, entries: &[LockBatchEntry]) {
        for entry in entries {
            if let Some(state) = locks.get_mut(&entry.key) {
                state.remove(entry.intent_types);
                if state.is_free() {
                    locks.remove(&entry.key);
                }
            }
        }
    }

    fn unlock(&self, entries: &[LockBatchEntry]) {
        Self::release_entries(&mut self.locks.lock(), entries);
        self.released.notify_all();
    }

    /// Number of keys with at least one holder.
    pub fn locked_key_count(&self) -> usize {
        self.locks.lock().len()
    }
}

/// Locks held by one operation, released on drop.
#[must_use]
pub struct LockBatch {
    manager: Arc<SharedLockManager>,
    entries: Vec<LockBatchEntry>,
}

impl LockBatch {
    pub fn entries(&self) -> &[LockBatchEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Drop for LockBatch {
    fn drop(&mut self) {
        self.manager.unlock(&self.entries);
    }
}

impl std::fmt::Debug for LockBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockBatch").field("entries", &self.entries).finish()
    }
}

fn merge_entries(entries: Vec<LockBatchEntry>) -> Vec<LockBatchEntry> {
    let mut merged: BTreeMap<Vec<u8>, IntentTypeSet> = BTreeMap::new();
    for entry in entries {
        let types = merged.entry(entry.key).or_insert(IntentTypeSet::EMPTY);
        *types = types.union(entry.intent_types);
    }
    merged
        .into_iter()
        .map(|(key, intent_types)| LockBatchEntry { key, intent_types })
        .collect()
}

/// Lock entries for `key`: `strong` on the path itself and the weak
/// counterpart on each ancestor.
pub fn path_lock_entries(key: &SubDocKey, strong: IntentTypeSet) -> Result<Vec<LockBatchEntry>> {
    let weak = strong.to_weak();
    let mut entries: Vec<LockBatchEntry> = key
        .encoded_ancestors()?
        .into_iter()
        .map(|ancestor| LockBatchEntry {
            key: ancestor,
            intent_types: weak,
        })
        .collect();
    entries.push(LockBatchEntry {
        key: key.encode_without_ht()?,
        intent_types: strong,
    });
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc_key::DocKey;
    use crate::primitive_value::PrimitiveValue;
    use std::thread;
    use std::time::Duration;

    fn field(doc: &str, name: &str) -> SubDocKey {
        SubDocKey::new(
            DocKey::from_range(vec![PrimitiveValue::string(doc)]),
            vec![PrimitiveValue::string(name)],
        )
    }

    fn write_locks(key: &SubDocKey) -> Vec<LockBatchEntry> {
        path_lock_entries(key, IntentTypeSet::single(IntentType::StrongWrite)).unwrap()
    }

    fn soon() -> Instant {
        Instant::now() + Duration::from_millis(20)
    }

    #[test]
    fn test_sibling_writes_do_not_conflict() {
        let manager = SharedLockManager::new();
        let a = manager.lock(write_locks(&field("d", "a")), soon()).unwrap();
        let b = manager.lock(write_locks(&field("d", "b")), soon()).unwrap();
        // Document key shared, one key per field.
        assert_eq!(manager.locked_key_count(), 3);
        drop(a);
        drop(b);
        assert_eq!(manager.locked_key_count(), 0);
    }

    #[test]
    fn test_same_path_times_out_without_leaking() {
        let manager = SharedLockManager::new();
        let held = manager.lock(write_locks(&field("d", "a")), soon()).unwrap();

        let mut request = write_locks(&field("d", "a"));
        request.extend(write_locks(&field("other", "x")));
        let err = manager.lock(request, soon()).unwrap_err();
        assert!(matches!(err, Error::TimedOut(_)));
        assert_eq!(manager.locked_key_count(), 2);
        drop(held);
        assert_eq!(manager.locked_key_count(), 0);
    }

    #[test]
    fn test_document_delete_excludes_field_write() {
        let manager = SharedLockManager::new();
        let doc = SubDocKey::doc_only(DocKey::from_range(vec![PrimitiveValue::string("d")]));
        let _delete = manager.lock(write_locks(&doc), soon()).unwrap();
        assert!(manager.lock(write_locks(&field("d", "a")), soon()).is_err());
    }

    #[test]
    fn test_waiter_proceeds_after_release() {
        let manager = SharedLockManager::new();
        let held = manager.lock(write_locks(&field("d", "a")), soon()).unwrap();

        let waiter = {
            let manager = manager.clone();
            thread::spawn(move || {
                manager
                    .lock(
                        write_locks(&field("d", "a")),
                        Instant::now() + Duration::from_secs(5),
                    )
                    .map(|batch| batch.entries().len())
            })
        };
        thread::sleep(Duration::from_millis(20));
        drop(held);
        assert_eq!(waiter.join().unwrap().unwrap(), 2);
    }

    #[test]
    fn test_duplicate_entries_are_merged() {
        let mut entries = write_locks(&field("d", "a"));
        entries.extend(path_lock_entries(
            &field("d", "a"),
            IntentTypeSet::single(IntentType::StrongRead),
        ).unwrap());
        let merged = merge_entries(entries);
        assert_eq!(merged.len(), 2);
        assert!(merged[1].intent_types.contains(IntentType::StrongRead));
        assert!(merged[1].intent_types.contains(IntentType::StrongWrite));
    }
}
