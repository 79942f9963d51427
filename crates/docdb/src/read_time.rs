use docstore_hlc::HybridTime;
use std::fmt;
use std::time::Duration;

/// Time bounds of one read.
///
/// Records at or below `read` are visible. Records in `(read, global_limit]`
/// may have been written before the read started on a replica with a
/// slightly faster clock, so a read that meets one must restart at a later
/// time. Own transaction intents are visible up to `in_txn_limit`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ReadHybridTime {
    pub read: HybridTime,
    pub global_limit: HybridTime,
    pub in_txn_limit: HybridTime,
}

impl ReadHybridTime {
    /// Read at exactly `ht`, with no uncertainty window.
    pub fn single_time(ht: HybridTime) -> Self {
        Self {
            read: ht,
            global_limit: ht,
            in_txn_limit: HybridTime::MAX,
        }
    }

    /// Read at `read` with an uncertainty window of `max_clock_skew`.
    pub fn from_read_and_skew(read: HybridTime, max_clock_skew: Duration) -> Self {
        Self {
            read,
            global_limit: read.add_duration(max_clock_skew),
            in_txn_limit: HybridTime::MAX,
        }
    }

    pub fn with_in_txn_limit(mut self, in_txn_limit: HybridTime) -> Self {
        self.in_txn_limit = in_txn_limit;
        self
    }

    /// Bounds for a restart after a record was seen at `restart_ht`.
    pub fn restarted(&self, restart_ht: HybridTime) -> Self {
        let read = self.read.max(restart_ht);
        Self {
            read,
            global_limit: self.global_limit.max(read),
            in_txn_limit: self.in_txn_limit,
        }
    }
}

impl fmt::Debug for ReadHybridTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{ read: {} global_limit: {} in_txn_limit: {} }}",
            self.read, self.global_limit, self.in_txn_limit
        )
    }
}
