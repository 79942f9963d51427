//! History retention: how far back reads may go, and therefore which old
//! versions compaction may drop.

use crate::config::DocDbConfig;
use crate::error::{Error, Result};
use docstore_hlc::{HybridTime, SharedHlcClock};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// Retention state captured once per compaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRetentionDirective {
    /// Versions overwritten at or below this time are not needed by any read.
    pub history_cutoff: HybridTime,
    /// Column ids dropped from the schema.
    pub deleted_columns: HashSet<u32>,
    pub table_ttl: Option<Duration>,
}

impl HistoryRetentionDirective {
    pub fn new(history_cutoff: HybridTime) -> Self {
        Self {
            history_cutoff,
            deleted_columns: HashSet::new(),
            table_ttl: None,
        }
    }
}

/// Source of retention directives for compaction filters.
pub trait HistoryRetentionPolicy: Send + Sync {
    fn retention_directive(&self) -> HistoryRetentionDirective;
}

/// A directive that never changes. Useful for offline tools and tests.
impl HistoryRetentionPolicy for HistoryRetentionDirective {
    fn retention_directive(&self) -> HistoryRetentionDirective {
        self.clone()
    }
}

#[derive(Debug, Default)]
struct RetentionState {
    /// Largest cutoff handed to a compaction. Never decreases.
    committed_cutoff: HybridTime,
    /// Read time -> number of registered readers at that time.
    active_readers: BTreeMap<HybridTime, usize>,
    deleted_columns: HashSet<u32>,
    table_ttl: Option<Duration>,
}

/// Per-tablet policy: keep `history_retention_interval` of history, and
/// never cut below the oldest active reader.
pub struct TabletRetentionPolicy {
    clock: SharedHlcClock,
    retention_interval: Duration,
    state: Mutex<RetentionState>,
}

impl TabletRetentionPolicy {
    pub fn new(clock: SharedHlcClock, config: &DocDbConfig) -> Self {
        Self {
            clock,
            retention_interval: config.history_retention_interval,
            state: Mutex::new(RetentionState {
                committed_cutoff: HybridTime::MIN,
                table_ttl: config.table_ttl,
                ..Default::default()
            }),
        }
    }

    /// Register a read at `read_ht`. Fails with `SnapshotTooOld` if history
    /// at that time may already have been compacted away.
    pub fn register_reader(self: &Arc<Self>, read_ht: HybridTime) -> Result<ReaderGuard> {
        let mut state = self.state.lock();
        if read_ht < state.committed_cutoff {
            return Err(Error::SnapshotTooOld(format!(
                "Read time {} is below history cutoff {}",
                read_ht, state.committed_cutoff
            )));
        }
        *state.active_readers.entry(read_ht).or_insert(0) += 1;
        Ok(ReaderGuard {
            policy: Arc::clone(self),
            read_ht,
        })
    }

    fn unregister_reader(&self, read_ht: HybridTime) {
        let mut state = self.state.lock();
        if let Some(count) = state.active_readers.get_mut(&read_ht) {
            *count -= 1;
            if *count == 0 {
                state.active_readers.remove(&read_ht);
            }
        }
    }

    pub fn oldest_reader(&self) -> Option<HybridTime> {
        self.state.lock().active_readers.keys().next().copied()
    }

    pub fn active_reader_count(&self) -> usize {
        self.state.lock().active_readers.values().sum()
    }

    /// Cutoff for the next compaction: `now - retention`, lowered to the
    /// oldest active reader, but never below a cutoff already handed out.
    pub fn history_cutoff_for_compaction(&self) -> HybridTime {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let mut proposed = now.sub_duration(self.retention_interval);
        if let Some(oldest) = state.active_readers.keys().next() {
            proposed = proposed.min(*oldest);
        }
        let cutoff = proposed.max(state.committed_cutoff);
        state.committed_cutoff = cutoff;
        cutoff
    }

    pub fn committed_history_cutoff(&self) -> HybridTime {
        self.state.lock().committed_cutoff
    }

    pub fn mark_column_deleted(&self, column_id: u32) {
        self.state.lock().deleted_columns.insert(column_id);
    }

    pub fn set_table_ttl(&self, ttl: Option<Duration>) {
        self.state.lock().table_ttl = ttl;
    }

    pub fn table_ttl(&self) -> Option<Duration> {
        self.state.lock().table_ttl
    }
}

impl HistoryRetentionPolicy for TabletRetentionPolicy {
    fn retention_directive(&self) -> HistoryRetentionDirective {
        let history_cutoff = self.history_cutoff_for_compaction();
        let state = self.state.lock();
        HistoryRetentionDirective {
            history_cutoff,
            deleted_columns: state.deleted_columns.clone(),
            table_ttl: state.table_ttl,
        }
    }
}

/// Keeps a read time registered until dropped.
#[must_use]
pub struct ReaderGuard {
    policy: Arc<TabletRetentionPolicy>,
    read_ht: HybridTime,
}

impl ReaderGuard {
    pub fn read_ht(&self) -> HybridTime {
        self.read_ht
    }
}

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        self.policy.unregister_reader(self.read_ht);
    }
}
