//! Transaction metadata and status

use crate::{IsolationLevel, TransactionId};
use docstore_hlc::HybridTime;
use serde::{Deserialize, Serialize};

/// Status of a transaction as tracked by its status tablet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionStatus {
    Created,
    Pending,
    Committed,
    Aborted,
}

impl TransactionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionStatus::Committed | TransactionStatus::Aborted)
    }
}

/// Everything a data tablet needs to know about a transaction writing to it.
///
/// Stored once per transaction in the intents store, next to the reverse
/// index, so that intents can be resolved after a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionMetadata {
    pub transaction_id: TransactionId,
    pub isolation: IsolationLevel,
    /// Tablet tracking the status of this transaction.
    pub status_tablet: String,
    /// Larger priority wins write-write conflicts.
    pub priority: u64,
    pub start_time: HybridTime,
}

impl TransactionMetadata {
    pub fn new(
        transaction_id: TransactionId,
        isolation: IsolationLevel,
        status_tablet: impl Into<String>,
        priority: u64,
        start_time: HybridTime,
    ) -> Self {
        Self {
            transaction_id,
            isolation,
            status_tablet: status_tablet.into(),
            priority,
            start_time,
        }
    }

    /// Serialize to bytes for persistence
    pub fn to_bytes(&self) -> Result<Vec<u8>, String> {
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(self, &mut bytes)
            .map_err(|e| format!("Failed to serialize transaction metadata: {}", e))?;
        Ok(bytes)
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, String> {
        ciborium::de::from_reader(bytes)
            .map_err(|e| format!("Failed to deserialize transaction metadata: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_bytes_roundtrip() {
        let metadata = TransactionMetadata::new(
            TransactionId::new(),
            IsolationLevel::Serializable,
            "status-tablet-0",
            42,
            HybridTime::from_micros(1_000),
        );
        let bytes = metadata.to_bytes().unwrap();
        assert_eq!(TransactionMetadata::from_bytes(&bytes).unwrap(), metadata);
        assert!(TransactionMetadata::from_bytes(&bytes[..bytes.len() / 2]).is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(TransactionStatus::Committed.is_terminal());
        assert!(TransactionStatus::Aborted.is_terminal());
        assert!(!TransactionStatus::Pending.is_terminal());
        assert!(!TransactionStatus::Created.is_terminal());
    }

    #[test]
    fn test_isolation_json() {
        let json = serde_json::to_string(&IsolationLevel::Snapshot).unwrap();
        let back: IsolationLevel = serde_json::from_str(&json).unwrap();
        assert_eq!(back, IsolationLevel::Snapshot);
        assert_eq!(
            IsolationLevel::from_u8(IsolationLevel::Serializable.to_u8()),
            Some(IsolationLevel::Serializable)
        );
    }
}
