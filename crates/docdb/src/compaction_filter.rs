//! Compaction filters for the regular and intents stores.
//!
//! The regular store filter garbage collects versions that no read at or
//! above the history cutoff can observe. Keys arrive in sorted order, so for
//! one document the filter sees the document's own versions newest first,
//! then every nested path. `overwrite_ht[i]` holds, for the component at
//! depth `i` of the current key, the newest time at or below the cutoff at
//! which that subtree was fully overwritten or deleted.

use crate::doc_key::{component_ends, first_subkey, split_doc_ht};
use crate::encoding::{Decode, Encode};
use crate::error::Result;
use crate::intent::{decode_intent_key, decode_transaction_key, intent_value_transaction, is_intent_key};
use crate::primitive_value::PrimitiveValue;
use crate::retention::{HistoryRetentionDirective, HistoryRetentionPolicy};
use crate::value::Value;
use docstore_common::TransactionId;
use docstore_hlc::{DocHybridTime, HybridTime};
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterDecision {
    Keep,
    Discard,
    /// Keep the key with a new value.
    ChangeValue(Vec<u8>),
}

/// Called once per record, in key order, during one compaction pass.
pub trait CompactionFilter {
    fn filter(&mut self, key: &[u8], value: &[u8]) -> Result<FilterDecision>;

    /// History cutoff this pass ran with, recorded in the store frontier.
    fn history_cutoff(&self) -> Option<HybridTime> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionKind {
    /// Partial compaction. Tombstones must survive it.
    Minor,
    /// Full compaction over every file of the store.
    Major,
}

#[derive(Debug, Clone, Copy)]
pub struct CompactionContext {
    pub is_full_compaction: bool,
}

impl From<CompactionKind> for CompactionContext {
    fn from(kind: CompactionKind) -> Self {
        Self {
            is_full_compaction: kind == CompactionKind::Major,
        }
    }
}

/// Creates one regular store filter per compaction, each with a fresh
/// retention directive.
pub struct DocDbCompactionFilterFactory {
    retention_policy: Arc<dyn HistoryRetentionPolicy>,
}

impl DocDbCompactionFilterFactory {
    pub fn new(retention_policy: Arc<dyn HistoryRetentionPolicy>) -> Self {
        Self { retention_policy }
    }

    pub fn create(&self, context: CompactionContext) -> DocDbCompactionFilter {
        DocDbCompactionFilter::new(
            self.retention_policy.retention_directive(),
            context.is_full_compaction,
        )
    }
}

pub struct DocDbCompactionFilter {
    directive: HistoryRetentionDirective,
    is_major: bool,
    overwrite_ht: Vec<DocHybridTime>,
    prev_path: Vec<u8>,
    prev_ends: Vec<usize>,
}

impl DocDbCompactionFilter {
    pub fn new(directive: HistoryRetentionDirective, is_major: bool) -> Self {
        tracing::debug!(
            "Starting {} compaction with history cutoff {}",
            if is_major { "major" } else { "minor" },
            directive.history_cutoff
        );
        Self {
            directive,
            is_major,
            overwrite_ht: Vec::new(),
            prev_path: Vec::new(),
            prev_ends: Vec::new(),
        }
    }

    fn shared_components(&self, path: &[u8], ends: &[usize]) -> usize {
        self.prev_ends
            .iter()
            .zip(ends)
            .take_while(|(prev_end, end)| {
                prev_end == end && self.prev_path[..**prev_end] == path[..**end]
            })
            .count()
    }

    fn do_filter(&mut self, key: &[u8], value: &[u8]) -> Result<FilterDecision> {
        let cutoff = self.directive.history_cutoff;
        let (path, doc_ht) = split_doc_ht(key)?;
        let ends = component_ends(path)?;

        let shared = self.shared_components(path, &ends);
        self.overwrite_ht.truncate(shared);
        let prev_overwrite_ht = self
            .overwrite_ht
            .last()
            .copied()
            .unwrap_or(DocHybridTime::MIN);
        self.prev_path.clear();
        self.prev_path.extend_from_slice(path);
        self.prev_ends = ends;

        if doc_ht < prev_overwrite_ht {
            return Ok(FilterDecision::Discard);
        }

        let value = Value::decode(value)?;

        // Ancestor levels between the shared prefix and this key inherit the
        // nearest known overwrite time.
        let depth = self.prev_ends.len();
        self.overwrite_ht.resize(depth - 1, prev_overwrite_ht);
        let overwrite_ht = if doc_ht.hybrid_time <= cutoff && !value.is_merge_record() {
            prev_overwrite_ht.max(doc_ht)
        } else {
            prev_overwrite_ht
        };
        self.overwrite_ht.push(overwrite_ht);

        if depth > 1
            && !self.directive.deleted_columns.is_empty()
            && let Some(PrimitiveValue::ColumnId(column_id)) = first_subkey(path)?
            && self.directive.deleted_columns.contains(&column_id)
        {
            return Ok(FilterDecision::Discard);
        }

        if doc_ht.hybrid_time <= cutoff
            && value.has_expired(doc_ht.hybrid_time, self.directive.table_ttl, cutoff)
        {
            if self.is_major {
                return Ok(FilterDecision::Discard);
            }
            if !value.is_tombstone() {
                return Ok(FilterDecision::ChangeValue(Value::tombstone().encode()?));
            }
        }

        if value.is_tombstone() && doc_ht.hybrid_time <= cutoff && self.is_major {
            return Ok(FilterDecision::Discard);
        }

        Ok(FilterDecision::Keep)
    }
}

impl CompactionFilter for DocDbCompactionFilter {
    fn filter(&mut self, key: &[u8], value: &[u8]) -> Result<FilterDecision> {
        match self.do_filter(key, value) {
            Ok(decision) => Ok(decision),
            Err(e) => {
                // Continuing over a corrupt key space could drop live data.
                tracing::error!("Corrupt record during compaction, key {:02x?}: {}", key, e);
                panic!("Corrupt record during compaction: {}", e);
            }
        }
    }

    fn history_cutoff(&self) -> Option<HybridTime> {
        Some(self.directive.history_cutoff)
    }
}

/// Drops every record of transactions that are known to be finished:
/// aborted, or committed and already applied to the regular store.
pub struct IntentsCleanupFilter {
    finished: HashSet<TransactionId>,
    discarded: usize,
}

impl IntentsCleanupFilter {
    pub fn new(finished: HashSet<TransactionId>) -> Self {
        Self {
            finished,
            discarded: 0,
        }
    }

    pub fn discarded(&self) -> usize {
        self.discarded
    }

    fn owner(key: &[u8], value: &[u8]) -> Result<TransactionId> {
        if is_intent_key(key) {
            decode_intent_key(key)?;
            intent_value_transaction(value)
        } else {
            Ok(decode_transaction_key(key)?.transaction_id())
        }
    }
}

impl CompactionFilter for IntentsCleanupFilter {
    fn filter(&mut self, key: &[u8], value: &[u8]) -> Result<FilterDecision> {
        let owner = match Self::owner(key, value) {
            Ok(owner) => owner,
            Err(e) => {
                tracing::error!("Corrupt intents record during compaction, key {:02x?}: {}", key, e);
                panic!("Corrupt intents record during compaction: {}", e);
            }
        };
        if self.finished.contains(&owner) {
            self.discarded += 1;
            Ok(FilterDecision::Discard)
        } else {
            Ok(FilterDecision::Keep)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc_key::{DocKey, SubDocKey};
    use std::time::Duration;

    fn ht(micros: u64) -> HybridTime {
        HybridTime::from_micros(micros)
    }

    fn key(doc: &str, subkeys: &[PrimitiveValue], micros: u64) -> Vec<u8> {
        SubDocKey::new(
            DocKey::from_range(vec![PrimitiveValue::string(doc)]),
            subkeys.to_vec(),
        )
        .with_ht(DocHybridTime::new(ht(micros), 0))
        .encode()
        .unwrap()
    }

    fn int(v: i64) -> Vec<u8> {
        Value::new(PrimitiveValue::Int64(v)).encode().unwrap()
    }

    fn tombstone() -> Vec<u8> {
        Value::tombstone().encode().unwrap()
    }

    /// Run the filter over records sorted the way the store would hand them.
    fn run(
        mut records: Vec<(Vec<u8>, Vec<u8>)>,
        directive: HistoryRetentionDirective,
        is_major: bool,
    ) -> Vec<FilterDecision> {
        records.sort();
        let mut filter = DocDbCompactionFilter::new(directive, is_major);
        records
            .iter()
            .map(|(k, v)| filter.filter(k, v).unwrap())
            .collect()
    }

    #[test]
    fn test_overwritten_versions_are_dropped() {
        let col = [PrimitiveValue::string("col1")];
        let decisions = run(
            vec![(key("k1", &col, 10), int(100)), (key("k1", &col, 20), int(200))],
            HistoryRetentionDirective::new(ht(20)),
            false,
        );
        // Newest first.
        assert_eq!(decisions, vec![FilterDecision::Keep, FilterDecision::Discard]);
    }

    #[test]
    fn test_versions_above_cutoff_protect_older_ones() {
        let col = [PrimitiveValue::string("col1")];
        let decisions = run(
            vec![
                (key("k1", &col, 10), int(1)),
                (key("k1", &col, 20), int(2)),
                (key("k1", &col, 30), int(3)),
            ],
            HistoryRetentionDirective::new(ht(25)),
            true,
        );
        // 30 is above the cutoff, 20 is the version visible at 25, 10 is dead.
        assert_eq!(
            decisions,
            vec![
                FilterDecision::Keep,
                FilterDecision::Keep,
                FilterDecision::Discard
            ]
        );
    }

    #[test]
    fn test_document_overwrite_drops_older_children() {
        let decisions = run(
            vec![
                (key("k1", &[], 15), Value::object().encode().unwrap()),
                (key("k1", &[PrimitiveValue::string("a")], 10), int(1)),
                (key("k1", &[PrimitiveValue::string("b")], 20), int(2)),
                (key("k2", &[PrimitiveValue::string("a")], 5), int(3)),
            ],
            HistoryRetentionDirective::new(ht(50)),
            false,
        );
        assert_eq!(
            decisions,
            vec![
                FilterDecision::Keep,
                FilterDecision::Discard,
                FilterDecision::Keep,
                FilterDecision::Keep
            ]
        );
    }

    #[test]
    fn test_tombstones_only_dropped_by_major_compaction() {
        let records = vec![(key("k3", &[], 30), int(1)), (key("k3", &[], 40), tombstone())];
        let directive = HistoryRetentionDirective::new(ht(50));

        let minor = run(records.clone(), directive.clone(), false);
        assert_eq!(minor, vec![FilterDecision::Keep, FilterDecision::Discard]);

        let major = run(records, directive, true);
        assert_eq!(major, vec![FilterDecision::Discard, FilterDecision::Discard]);
    }

    #[test]
    fn test_expired_values() {
        let col = [PrimitiveValue::string("c")];
        let expiring = Value::new(PrimitiveValue::Int64(1))
            .with_ttl(Duration::from_micros(5))
            .encode()
            .unwrap();
        let records = vec![(key("k", &col, 10), expiring)];
        let directive = HistoryRetentionDirective::new(ht(20));

        assert_eq!(
            run(records.clone(), directive.clone(), false),
            vec![FilterDecision::ChangeValue(tombstone())]
        );
        assert_eq!(run(records, directive, true), vec![FilterDecision::Discard]);
    }

    #[test]
    fn test_table_ttl_applies_without_value_ttl() {
        let mut directive = HistoryRetentionDirective::new(ht(1_000));
        directive.table_ttl = Some(Duration::from_micros(100));
        let decisions = run(vec![(key("k", &[], 10), int(1))], directive, true);
        assert_eq!(decisions, vec![FilterDecision::Discard]);
    }

    #[test]
    fn test_deleted_columns_dropped_regardless_of_time() {
        let mut directive = HistoryRetentionDirective::new(ht(1));
        directive.deleted_columns.insert(7);
        let decisions = run(
            vec![
                (key("k", &[PrimitiveValue::ColumnId(7)], 100), int(1)),
                (key("k", &[PrimitiveValue::ColumnId(8)], 100), int(2)),
            ],
            directive,
            false,
        );
        assert_eq!(decisions, vec![FilterDecision::Discard, FilterDecision::Keep]);
    }

    #[test]
    fn test_merge_records_do_not_shadow_older_versions() {
        let col = [PrimitiveValue::string("n")];
        let decisions = run(
            vec![
                (key("k", &col, 10), int(5)),
                (key("k", &col, 20), Value::increment(1).encode().unwrap()),
            ],
            HistoryRetentionDirective::new(ht(30)),
            true,
        );
        assert_eq!(decisions, vec![FilterDecision::Keep, FilterDecision::Keep]);
    }

    #[test]
    #[should_panic(expected = "Corrupt record during compaction")]
    fn test_corrupt_key_is_fatal() {
        let mut filter = DocDbCompactionFilter::new(HistoryRetentionDirective::new(ht(1)), true);
        let _ = filter.filter(b"garbage", &int(1));
    }

    #[test]
    fn test_intents_cleanup_filter() {
        use crate::intent::{IntentType, IntentValue, encode_intent_key, reverse_index_key, transaction_metadata_key};

        let finished = TransactionId::new();
        let live = TransactionId::new();
        let dht = DocHybridTime::new(ht(5), 0);
        let intent_key = encode_intent_key(b"S\0\0!", IntentType::StrongWrite.into(), dht);
        let intent_value = |id| {
            IntentValue {
                transaction_id: id,
                write_id: 0,
                value: int(1),
            }
            .encode()
            .unwrap()
        };

        let mut filter = IntentsCleanupFilter::new(HashSet::from([finished]));
        assert_eq!(
            filter.filter(&intent_key, &intent_value(finished)).unwrap(),
            FilterDecision::Discard
        );
        assert_eq!(
            filter.filter(&intent_key, &intent_value(live)).unwrap(),
            FilterDecision::Keep
        );
        assert_eq!(
            filter
                .filter(&reverse_index_key(finished, dht), &intent_key)
                .unwrap(),
            FilterDecision::Discard
        );
        assert_eq!(
            filter.filter(&transaction_metadata_key(live), b"").unwrap(),
            FilterDecision::Keep
        );
        assert_eq!(filter.discarded(), 2);
    }
}
