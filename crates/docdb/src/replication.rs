//! The replicated log below a tablet, reduced to what the storage core needs:
//! each applied batch gets the op id of its log entry.

use crate::error::{Error, Result};
use docstore_common::OpId;
use docstore_hlc::HybridTime;
use parking_lot::Mutex;

pub trait ReplicationLog: Send + Sync {
    /// Append an entry for a write at `hybrid_time` and return its op id
    /// once it is durable.
    fn append(&self, hybrid_time: HybridTime) -> Result<OpId>;

    fn last_op_id(&self) -> OpId;
}

#[derive(Debug)]
struct LogState {
    last: OpId,
    last_hybrid_time: HybridTime,
}

/// Log of a single in-process replica: entries are durable on append.
#[derive(Debug)]
pub struct LocalReplicationLog {
    state: Mutex<LogState>,
}

impl LocalReplicationLog {
    pub fn new(term: u64) -> Self {
        Self::starting_after(OpId::new(term, 0))
    }

    /// Continue a log whose entries up to `last` were already applied.
    pub fn starting_after(last: OpId) -> Self {
        Self {
            state: Mutex::new(LogState {
                last,
                last_hybrid_time: HybridTime::MIN,
            }),
        }
    }
}

impl ReplicationLog for LocalReplicationLog {
    fn append(&self, hybrid_time: HybridTime) -> Result<OpId> {
        let mut state = self.state.lock();
        if hybrid_time < state.last_hybrid_time {
            return Err(Error::illegal_state(format!(
                "Log entry at {} after entry at {}",
                hybrid_time, state.last_hybrid_time
            )));
        }
        state.last = OpId::new(state.last.term, state.last.index + 1);
        state.last_hybrid_time = hybrid_time;
        Ok(state.last)
    }

    fn last_op_id(&self) -> OpId {
        self.state.lock().last
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_ids_are_sequential() {
        let log = LocalReplicationLog::new(3);
        assert_eq!(log.append(HybridTime::from_micros(5)).unwrap(), OpId::new(3, 1));
        assert_eq!(log.append(HybridTime::from_micros(5)).unwrap(), OpId::new(3, 2));
        assert_eq!(log.last_op_id(), OpId::new(3, 2));
        assert!(log.append(HybridTime::from_micros(4)).is_err());

        let resumed = LocalReplicationLog::starting_after(OpId::new(3, 2));
        assert_eq!(resumed.append(HybridTime::from_micros(6)).unwrap(), OpId::new(3, 3));
    }
}
