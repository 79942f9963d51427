//! Reads a document, or a sub-document of one, at a read time.
//!
//! Records of a document arrive from the iterator in key order, so a node's
//! own versions (newest first) are followed by its children. A record hides
//! everything under its path that was written before it: tombstones delete
//! the subtree, object markers and primitives replace it. The reader carries
//! that overwrite time down the tree as a lower bound, starting from the
//! latest writes to the ancestors of the requested path.

use crate::doc_key::SubDocKey;
use crate::encoding::Decode;
use crate::engine::{DocDb, StoreType};
use crate::error::{Error, Result};
use crate::intent_aware_iterator::{FetchedEntry, IntentAwareIterator};
use crate::primitive_value::PrimitiveValue;
use crate::read_time::ReadHybridTime;
use crate::sub_document::SubDocument;
use crate::transaction_status::{TransactionStatusCache, TransactionStatusManager};
use crate::value::Value;
use docstore_common::TransactionId;
use docstore_hlc::{DocHybridTime, HybridTime};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Order in which writes overwrite each other: own intents after every
/// other record, then by write time.
type VisibleTime = (bool, DocHybridTime);

const NOTHING_VISIBLE: VisibleTime = (false, DocHybridTime::MIN);

fn visible_time(entry: &FetchedEntry) -> VisibleTime {
    (entry.same_transaction, entry.write_time)
}

pub struct DocReader<'a> {
    iter: &'a mut IntentAwareIterator,
    table_ttl: Option<Duration>,
}

impl<'a> DocReader<'a> {
    pub fn new(iter: &'a mut IntentAwareIterator, table_ttl: Option<Duration>) -> Self {
        Self { iter, table_ttl }
    }

    /// The sub-document at `key`, or `None` if nothing is visible there.
    pub fn get_sub_document(&mut self, key: &SubDocKey) -> Result<Option<SubDocument>> {
        let path = key.encode_without_ht()?;

        let mut bound = NOTHING_VISIBLE;
        for ancestor in key.encoded_ancestors()? {
            if let Some(write) = self.iter.find_last_write_time(&ancestor, DocHybridTime::MIN)? {
                bound = bound.max((write.same_transaction, write.write_time));
            }
        }

        self.iter.seek(&path)?;
        self.read_subtree(&path, bound)
    }

    /// The primitive at `key`, if the visible sub-document there is one.
    pub fn get_primitive(&mut self, key: &SubDocKey) -> Result<Option<PrimitiveValue>> {
        Ok(match self.get_sub_document(key)? {
            Some(SubDocument::Primitive(value)) => Some(value),
            _ => None,
        })
    }

    /// Expects the iterator at the first entry at or after `path`. Leaves it
    /// past everything under `path`.
    fn read_subtree(&mut self, path: &[u8], bound: VisibleTime) -> Result<Option<SubDocument>> {
        let mut own_value = None;
        let mut children_bound = bound;

        if let Some(entry) = self.iter.fetch_key()?
            && entry.path == path
        {
            let time = visible_time(&entry);
            if time > bound {
                own_value = Some(self.read_versions(path, &entry, bound)?);
                children_bound = time;
            }
            self.iter.seek_past_sub_key(path)?;
        }

        self.iter.push_prefix(path);
        let mut children = Vec::new();
        let result = self.read_children(path, children_bound, &mut children);
        self.iter.pop_prefix();
        result?;

        if !children.is_empty() {
            return Ok(Some(SubDocument::Object(children)));
        }
        Ok(match own_value {
            None => None,
            Some(value) if value.is_tombstone() => None,
            Some(value) if matches!(value.primitive, PrimitiveValue::Object) => {
                Some(SubDocument::empty_object())
            }
            Some(value) => Some(SubDocument::Primitive(value.primitive)),
        })
    }

    fn read_children(
        &mut self,
        parent: &[u8],
        bound: VisibleTime,
        children: &mut Vec<(PrimitiveValue, SubDocument)>,
    ) -> Result<()> {
        while let Some(entry) = self.iter.fetch_key()? {
            let (subkey, child_len) = child_component(parent, &entry.path)?;
            let child_path = entry.path[..child_len].to_vec();
            if let Some(child) = self.read_subtree(&child_path, bound)? {
                children.push((subkey, child));
            }
        }
        Ok(())
    }

    /// Value of `path` as of its newest visible version `first`, folding in
    /// older versions below a merge record.
    fn read_versions(
        &mut self,
        path: &[u8],
        first: &FetchedEntry,
        bound: VisibleTime,
    ) -> Result<Value> {
        let value = self.expire(Value::decode(self.iter.value())?, first.write_time);
        if !value.is_merge_record() {
            return Ok(value);
        }

        let mut total = increment_delta(&value)?;
        self.iter.next()?;
        while let Some(entry) = self.iter.fetch_key()? {
            if entry.path != path || visible_time(&entry) <= bound {
                break;
            }
            let older = self.expire(Value::decode(self.iter.value())?, entry.write_time);
            if older.is_merge_record() {
                total = total.wrapping_add(increment_delta(&older)?);
                self.iter.next()?;
                continue;
            }
            if !older.is_tombstone() {
                let base = older.primitive.as_i64().ok_or_else(|| {
                    Error::illegal_state(format!("Increment applied to {}", older.primitive))
                })?;
                total = total.wrapping_add(base);
            }
            break;
        }
        Ok(Value::new(PrimitiveValue::Int64(total)))
    }

    /// Expired records read as tombstones.
    fn expire(&self, value: Value, write_time: DocHybridTime) -> Value {
        if !value.is_merge_record()
            && value.has_expired(write_time.hybrid_time, self.table_ttl, self.iter.read_time().read)
        {
            return Value::tombstone();
        }
        value
    }
}

fn increment_delta(value: &Value) -> Result<i64> {
    value
        .primitive
        .as_i64()
        .ok_or_else(|| Error::corruption(format!("Non-integer increment {}", value.primitive)))
}

/// First sub key of `path` below `parent` and the length of the child path.
fn child_component(parent: &[u8], path: &[u8]) -> Result<(PrimitiveValue, usize)> {
    let Some(rest) = path.strip_prefix(parent).filter(|rest| !rest.is_empty()) else {
        return Err(Error::corruption(format!(
            "Record {:02x?} is not below {:02x?}",
            path, parent
        )));
    };
    let mut input = rest;
    let subkey = PrimitiveValue::decode_key_from(&mut input)?;
    Ok((subkey, path.len() - input.len()))
}

/// One logical read: fixed read time, transaction and deadline, shared by
/// every iterator it opens. Remembers the largest write time met inside the
/// uncertainty window so the caller can restart above it.
pub struct ReadContext<'a> {
    db: &'a DocDb,
    status_manager: Arc<dyn TransactionStatusManager>,
    read_time: ReadHybridTime,
    transaction_id: Option<TransactionId>,
    deadline: Instant,
    table_ttl: Option<Duration>,
    status_retry: (usize, Duration),
    restart_ht: HybridTime,
}

impl<'a> ReadContext<'a> {
    pub fn new(
        db: &'a DocDb,
        status_manager: Arc<dyn TransactionStatusManager>,
        read_time: ReadHybridTime,
        deadline: Instant,
    ) -> Self {
        Self {
            db,
            status_manager,
            read_time,
            transaction_id: None,
            deadline,
            table_ttl: None,
            status_retry: (10, Duration::from_millis(2)),
            restart_ht: HybridTime::MIN,
        }
    }

    pub fn with_transaction(mut self, transaction_id: Option<TransactionId>) -> Self {
        self.transaction_id = transaction_id;
        self
    }

    pub fn with_table_ttl(mut self, table_ttl: Option<Duration>) -> Self {
        self.table_ttl = table_ttl;
        self
    }

    pub fn with_status_retry(mut self, limit: usize, backoff: Duration) -> Self {
        self.status_retry = (limit, backoff);
        self
    }

    pub fn read_time(&self) -> &ReadHybridTime {
        &self.read_time
    }

    pub fn db(&self) -> &DocDb {
        self.db
    }

    /// Open an iterator at this read time. The intents snapshot is taken
    /// before the regular one, so an intent applied in between is seen in
    /// at least one of them.
    pub fn create_iterator(&self) -> IntentAwareIterator {
        let intents = self.db.new_iterator(StoreType::Intents);
        let regular = self.db.new_iterator(StoreType::Regular);
        let status_cache = TransactionStatusCache::new(
            self.status_manager.clone(),
            self.read_time.read,
            self.deadline,
        )
        .with_retry(self.status_retry.0, self.status_retry.1);
        IntentAwareIterator::new(
            regular,
            Some(intents),
            self.read_time,
            self.transaction_id,
            status_cache,
        )
    }

    pub fn get_sub_document(&mut self, key: &SubDocKey) -> Result<Option<SubDocument>> {
        let mut iter = self.create_iterator();
        let result = DocReader::new(&mut iter, self.table_ttl).get_sub_document(key);
        self.restart_ht = self.restart_ht.max(iter.max_seen_ht());
        result
    }

    /// Time to restart at, if a record inside the uncertainty window was
    /// met. Results read through this context are then unreliable.
    pub fn restart_time(&self) -> Option<HybridTime> {
        (self.restart_ht > self.read_time.read).then_some(self.restart_ht)
    }

    /// Move to a new read time after a restart.
    pub fn restart(&mut self, restart_ht: HybridTime) {
        tracing::debug!(
            "Restarting read at {} after seeing a record at {}",
            self.read_time.read,
            restart_ht
        );
        self.read_time = self.read_time.restarted(restart_ht);
        self.restart_ht = HybridTime::MIN;
    }
}
