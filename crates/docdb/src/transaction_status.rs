//! Transaction status lookups used when reading foreign intents.

use crate::error::{Error, Result};
use docstore_common::{TransactionId, TransactionStatus};
use docstore_hlc::HybridTime;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Answer of a status tablet about one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionStatusResult {
    pub status: TransactionStatus,
    /// Commit time for committed transactions. For pending transactions, a
    /// time below which the transaction is known not to have committed.
    pub status_time: HybridTime,
}

impl TransactionStatusResult {
    pub fn committed(commit_ht: HybridTime) -> Self {
        Self {
            status: TransactionStatus::Committed,
            status_time: commit_ht,
        }
    }

    pub fn pending(status_time: HybridTime) -> Self {
        Self {
            status: TransactionStatus::Pending,
            status_time,
        }
    }

    pub fn aborted() -> Self {
        Self {
            status: TransactionStatus::Aborted,
            status_time: HybridTime::MIN,
        }
    }
}

/// Remote side of status resolution: the tablet that owns a transaction's
/// status record. May block.
pub trait TransactionStatusResolver: Send + Sync {
    fn get_status(
        &self,
        transaction_id: TransactionId,
        read_ht: HybridTime,
    ) -> Result<TransactionStatusResult>;
}

/// What a data tablet knows about transactions touching it.
pub trait TransactionStatusManager: Send + Sync {
    /// Non-blocking answer from local state. `HybridTime::MIN` if the
    /// transaction is known aborted, its commit time if known committed,
    /// `HybridTime::INVALID` otherwise.
    fn local_commit_time(&self, transaction_id: TransactionId) -> HybridTime;

    /// Ask the owning status tablet. May block and may fail with `TryAgain`.
    fn request_status_at(
        &self,
        transaction_id: TransactionId,
        read_ht: HybridTime,
    ) -> Result<TransactionStatusResult>;
}

/// Per-read memo of transaction commit times.
///
/// `get_commit_time` returns the commit time of a committed transaction,
/// `HybridTime::MIN` for an aborted one, and `HybridTime::MAX` for one that
/// cannot have committed at or before the read time. Entries never change
/// once resolved.
///
/// Resolving a remote status retries `TryAgain` answers with a sleeping
/// backoff capped by the deadline, so the cache blocks its thread. Async
/// callers must drive reads through `tokio::task::spawn_blocking`.
pub struct TransactionStatusCache {
    manager: Arc<dyn TransactionStatusManager>,
    read_ht: HybridTime,
    deadline: Instant,
    retry_limit: usize,
    backoff: Duration,
    resolved: HashMap<TransactionId, HybridTime>,
}

impl TransactionStatusCache {
    pub fn new(
        manager: Arc<dyn TransactionStatusManager>,
        read_ht: HybridTime,
        deadline: Instant,
    ) -> Self {
        Self {
            manager,
            read_ht,
            deadline,
            retry_limit: 10,
            backoff: Duration::from_millis(2),
            resolved: HashMap::new(),
        }
    }

    pub fn with_retry(mut self, retry_limit: usize, backoff: Duration) -> Self {
        self.retry_limit = retry_limit.max(1);
        self.backoff = backoff;
        self
    }

    /// Blocks for at most the remaining time to the deadline.
    pub fn get_commit_time(&mut self, transaction_id: TransactionId) -> Result<HybridTime> {
        if let Some(ht) = self.resolved.get(&transaction_id) {
            return Ok(*ht);
        }

        let local = self.manager.local_commit_time(transaction_id);
        let commit_ht = if local.is_valid() {
            local
        } else {
            self.request_with_retry(transaction_id)?
        };
        self.resolved.insert(transaction_id, commit_ht);
        Ok(commit_ht)
    }

    fn request_with_retry(&self, transaction_id: TransactionId) -> Result<HybridTime> {
        let mut backoff = self.backoff;
        let mut last_error = None;
        for attempt in 1..=self.retry_limit {
            if Instant::now() > self.deadline {
                return Err(Error::TimedOut(format!(
                    "Resolving status of transaction {}",
                    transaction_id
                )));
            }
            match self.try_resolve(transaction_id) {
                Err(e) if e.is_try_again() => {
                    tracing::debug!(
                        "Status of transaction {} not resolved (attempt {}): {}",
                        transaction_id,
                        attempt,
                        e
                    );
                    last_error = Some(e);
                    std::thread::sleep(backoff.min(self.deadline.saturating_duration_since(Instant::now())));
                    backoff = backoff.saturating_mul(2);
                }
                other => return other,
            }
        }
        Err(last_error.unwrap_or_else(|| {
            Error::try_again(format!("Status of transaction {}", transaction_id))
        }))
    }

    fn try_resolve(&self, transaction_id: TransactionId) -> Result<HybridTime> {
        let result = self.manager.request_status_at(transaction_id, self.read_ht)?;
        match result.status {
            TransactionStatus::Committed => Ok(result.status_time),
            TransactionStatus::Aborted => Ok(HybridTime::MIN),
            TransactionStatus::Pending | TransactionStatus::Created => {
                if result.status_time >= self.read_ht {
                    // It can only commit after the read time.
                    Ok(HybridTime::MAX)
                } else {
                    Err(Error::try_again(format!(
                        "Transaction {} pending as of {}, read at {}",
                        transaction_id, result.status_time, self.read_ht
                    )))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Scripted status answers, consumed one per request.
    struct Scripted {
        local: HybridTime,
        answers: Mutex<Vec<Result<TransactionStatusResult>>>,
        requests: Mutex<usize>,
    }

    impl Scripted {
        fn new(local: HybridTime, mut answers: Vec<Result<TransactionStatusResult>>) -> Arc<Self> {
            answers.reverse();
            Arc::new(Self {
                local,
                answers: Mutex::new(answers),
                requests: Mutex::new(0),
            })
        }
    }

    impl TransactionStatusManager for Scripted {
        fn local_commit_time(&self, _: TransactionId) -> HybridTime {
            self.local
        }

        fn request_status_at(&self, _: TransactionId, _: HybridTime) -> Result<TransactionStatusResult> {
            *self.requests.lock() += 1;
            self.answers
                .lock()
                .pop()
                .unwrap_or_else(|| Err(Error::illegal_state("no scripted answer")))
        }
    }

    fn cache(manager: Arc<Scripted>, read_micros: u64) -> TransactionStatusCache {
        TransactionStatusCache::new(
            manager,
            HybridTime::from_micros(read_micros),
            Instant::now() + Duration::from_secs(5),
        )
        .with_retry(5, Duration::from_micros(10))
    }

    #[test]
    fn test_local_answer_needs_no_request() {
        let manager = Scripted::new(HybridTime::from_micros(32), vec![]);
        let mut cache = cache(manager.clone(), 35);
        assert_eq!(
            cache.get_commit_time(TransactionId::new()).unwrap(),
            HybridTime::from_micros(32)
        );
        assert_eq!(*manager.requests.lock(), 0);
    }

    #[test]
    fn test_try_again_is_retried_and_result_memoized() {
        let manager = Scripted::new(
            HybridTime::INVALID,
            vec![
                Err(Error::try_again("status tablet busy")),
                Ok(TransactionStatusResult::pending(HybridTime::from_micros(10))),
                Ok(TransactionStatusResult::committed(HybridTime::from_micros(32))),
            ],
        );
        let mut cache = cache(manager.clone(), 35);
        let id = TransactionId::new();
        assert_eq!(cache.get_commit_time(id).unwrap(), HybridTime::from_micros(32));
        assert_eq!(cache.get_commit_time(id).unwrap(), HybridTime::from_micros(32));
        assert_eq!(*manager.requests.lock(), 3);
    }

    #[test]
    fn test_pending_past_read_time_is_invisible() {
        let manager = Scripted::new(
            HybridTime::INVALID,
            vec![Ok(TransactionStatusResult::pending(HybridTime::from_micros(40)))],
        );
        let mut cache = cache(manager, 35);
        assert_eq!(cache.get_commit_time(TransactionId::new()).unwrap(), HybridTime::MAX);
    }

    #[test]
    fn test_aborted_and_hard_errors() {
        let manager = Scripted::new(
            HybridTime::INVALID,
            vec![
                Ok(TransactionStatusResult::aborted()),
                Err(Error::NotFound("unknown transaction".into())),
            ],
        );
        let mut cache = cache(manager, 35);
        assert_eq!(cache.get_commit_time(TransactionId::new()).unwrap(), HybridTime::MIN);
        assert!(matches!(
            cache.get_commit_time(TransactionId::new()),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_retry_budget_exhausted() {
        let answers = (0..5).map(|_| Err(Error::try_again("busy"))).collect();
        let manager = Scripted::new(HybridTime::INVALID, answers);
        let mut cache = cache(manager, 35);
        assert!(cache.get_commit_time(TransactionId::new()).unwrap_err().is_try_again());
    }

    #[test]
    fn test_backoff_stops_at_deadline() {
        let answers = (0..5).map(|_| Err(Error::try_again("busy"))).collect();
        let manager = Scripted::new(HybridTime::INVALID, answers);
        let started = Instant::now();
        let mut cache = TransactionStatusCache::new(
            manager.clone(),
            HybridTime::from_micros(35),
            started + Duration::from_millis(20),
        )
        .with_retry(5, Duration::from_secs(10));
        assert!(matches!(
            cache.get_commit_time(TransactionId::new()),
            Err(Error::TimedOut(_))
        ));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(*manager.requests.lock(), 1);
    }
}
