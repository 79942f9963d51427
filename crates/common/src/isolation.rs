use serde::{Deserialize, Serialize};
use std::fmt;

/// Isolation level requested by a write or read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum IsolationLevel {
    /// Single-shard write committed directly into the regular store.
    #[default]
    NonTransactional,
    /// Snapshot isolation: write-write conflicts only.
    Snapshot,
    /// Serializable: reads also take strong read intents.
    Serializable,
}

impl IsolationLevel {
    pub fn is_transactional(&self) -> bool {
        !matches!(self, IsolationLevel::NonTransactional)
    }

    pub fn to_u8(self) -> u8 {
        match self {
            IsolationLevel::NonTransactional => 0,
            IsolationLevel::Snapshot => 1,
            IsolationLevel::Serializable => 2,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(IsolationLevel::NonTransactional),
            1 => Some(IsolationLevel::Snapshot),
            2 => Some(IsolationLevel::Serializable),
            _ => None,
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IsolationLevel::NonTransactional => "NON_TRANSACTIONAL",
            IsolationLevel::Snapshot => "SNAPSHOT_ISOLATION",
            IsolationLevel::Serializable => "SERIALIZABLE_ISOLATION",
        };
        f.write_str(name)
    }
}
