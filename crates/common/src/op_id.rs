use serde::{Deserialize, Serialize};
use std::fmt;

/// Position of an entry in the replicated log: `(term, index)`.
///
/// Ordered by term, then index. The storage core never creates op ids, it
/// only stamps the ones handed to it and persists them in frontiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct OpId {
    pub term: u64,
    pub index: u64,
}

impl OpId {
    pub const MIN: OpId = OpId::new(0, 0);

    pub const fn new(term: u64, index: u64) -> Self {
        Self { term, index }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::MIN
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.term, self.index)
    }
}
