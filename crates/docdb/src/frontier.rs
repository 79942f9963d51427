//! Consensus frontier: the durable watermark of a store.

use crate::encoding::{Decode, Encode, take_u64_be};
use crate::error::Result;
use docstore_common::OpId;
use docstore_hlc::HybridTime;
use std::fmt;

/// Highest op id, hybrid time and history cutoff applied to a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsensusFrontier {
    pub op_id: OpId,
    pub hybrid_time: HybridTime,
    /// History cutoff used by the last compaction of the store.
    pub history_cutoff: HybridTime,
}

impl ConsensusFrontier {
    pub fn new(op_id: OpId, hybrid_time: HybridTime) -> Self {
        Self {
            op_id,
            hybrid_time,
            history_cutoff: HybridTime::MIN,
        }
    }

    pub fn with_history_cutoff(mut self, cutoff: HybridTime) -> Self {
        self.history_cutoff = cutoff;
        self
    }

    /// Component-wise maximum.
    pub fn update_max(&mut self, other: &ConsensusFrontier) {
        self.op_id = self.op_id.max(other.op_id);
        self.hybrid_time = self.hybrid_time.max(other.hybrid_time);
        self.history_cutoff = self.history_cutoff.max(other.history_cutoff);
    }

    /// True if no component of `other` is below the matching component here.
    pub fn is_covered_by(&self, other: &ConsensusFrontier) -> bool {
        self.op_id <= other.op_id
            && self.hybrid_time <= other.hybrid_time
            && self.history_cutoff <= other.history_cutoff
    }
}

impl Default for ConsensusFrontier {
    fn default() -> Self {
        Self::new(OpId::MIN, HybridTime::MIN)
    }
}

impl fmt::Display for ConsensusFrontier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{ op_id: {} hybrid_time: {} history_cutoff: {} }}",
            self.op_id, self.hybrid_time, self.history_cutoff
        )
    }
}

impl Encode for ConsensusFrontier {
    fn encode_to(&self, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(&self.op_id.term.to_be_bytes());
        out.extend_from_slice(&self.op_id.index.to_be_bytes());
        out.extend_from_slice(&self.hybrid_time.to_raw().to_be_bytes());
        out.extend_from_slice(&self.history_cutoff.to_raw().to_be_bytes());
        Ok(())
    }
}

impl Decode for ConsensusFrontier {
    fn decode_from(input: &mut &[u8]) -> Result<Self> {
        let term = take_u64_be(input)?;
        let index = take_u64_be(input)?;
        let hybrid_time = HybridTime::from_raw(take_u64_be(input)?);
        let history_cutoff = HybridTime::from_raw(take_u64_be(input)?);
        Ok(Self {
            op_id: OpId::new(term, index),
            hybrid_time,
            history_cutoff,
        })
    }
}
