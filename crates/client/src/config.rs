//! Transaction client configuration

use docstore_common::IsolationLevel;
use std::time::Duration;

/// Default interval between heartbeats of an open transaction.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(500);

/// Default time a status tablet waits for a heartbeat before aborting.
pub const DEFAULT_EXPIRY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct TransactionConfig {
    pub heartbeat_interval: Duration,
    /// A transaction that has not heartbeated for this long is aborted, by
    /// the status tablet and by the client.
    pub expiry_timeout: Duration,
    pub isolation: IsolationLevel,
    /// Tablet holding the status records of new transactions.
    pub status_tablet: String,
    /// Fixed priority for write-write conflicts. Derived from the
    /// transaction id when unset.
    pub priority: Option<u64>,
    /// Deadline applied to each tablet operation.
    pub operation_timeout: Duration,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            expiry_timeout: DEFAULT_EXPIRY_TIMEOUT,
            isolation: IsolationLevel::Snapshot,
            status_tablet: "status".to_string(),
            priority: None,
            operation_timeout: Duration::from_secs(10),
        }
    }
}

impl TransactionConfig {
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_expiry_timeout(mut self, timeout: Duration) -> Self {
        self.expiry_timeout = timeout;
        self
    }

    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn with_status_tablet(mut self, tablet_id: impl Into<String>) -> Self {
        self.status_tablet = tablet_id.into();
        self
    }

    pub fn with_priority(mut self, priority: u64) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }
}
