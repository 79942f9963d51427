//! Stored values: a primitive plus optional TTL and merge flags.
//!
//! ```text
//! [t <ttl micros:u64>] [k <merge flags:u64>] <tag> <payload>
//! ```

use crate::encoding::{Decode, Encode, take_byte, take_u64_be};
use crate::error::Result;
use crate::primitive_value::PrimitiveValue;
use crate::value_type::ValueType;
use docstore_hlc::HybridTime;
use std::time::Duration;

/// The record adds its integer payload to the value below it instead of
/// replacing it.
pub const MERGE_FLAG_INCREMENT: u64 = 1;

#[derive(Debug, Clone, PartialEq)]
pub struct Value {
    pub primitive: PrimitiveValue,
    pub ttl: Option<Duration>,
    pub merge_flags: u64,
}

impl Value {
    pub fn new(primitive: PrimitiveValue) -> Self {
        Self {
            primitive,
            ttl: None,
            merge_flags: 0,
        }
    }

    pub fn tombstone() -> Self {
        Self::new(PrimitiveValue::Tombstone)
    }

    pub fn object() -> Self {
        Self::new(PrimitiveValue::Object)
    }

    pub fn increment(delta: i64) -> Self {
        Self {
            primitive: PrimitiveValue::Int64(delta),
            ttl: None,
            merge_flags: MERGE_FLAG_INCREMENT,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn is_tombstone(&self) -> bool {
        self.primitive.is_tombstone()
    }

    pub fn is_merge_record(&self) -> bool {
        self.merge_flags & MERGE_FLAG_INCREMENT != 0
    }

    /// Whether a record written at `write_ht` with this value's TTL (or
    /// `table_ttl` when it has none) is expired at `read_ht`.
    pub fn has_expired(
        &self,
        write_ht: HybridTime,
        table_ttl: Option<Duration>,
        read_ht: HybridTime,
    ) -> bool {
        match self.ttl.or(table_ttl) {
            Some(ttl) => has_expired_ttl(write_ht, ttl, read_ht),
            None => false,
        }
    }
}

pub fn has_expired_ttl(write_ht: HybridTime, ttl: Duration, read_ht: HybridTime) -> bool {
    write_ht.add_duration(ttl) <= read_ht
}

impl Encode for Value {
    fn encode_to(&self, out: &mut Vec<u8>) -> Result<()> {
        if let Some(ttl) = self.ttl {
            out.push(ValueType::Ttl.as_byte());
            out.extend_from_slice(&(ttl.as_micros() as u64).to_be_bytes());
        }
        if self.merge_flags != 0 {
            out.push(ValueType::MergeFlags.as_byte());
            out.extend_from_slice(&self.merge_flags.to_be_bytes());
        }
        self.primitive.encode_value_to(out);
        Ok(())
    }
}

impl Decode for Value {
    fn decode_from(input: &mut &[u8]) -> Result<Self> {
        let mut ttl = None;
        let mut merge_flags = 0;
        if input.first() == Some(&ValueType::Ttl.as_byte()) {
            take_byte(input)?;
            ttl = Some(Duration::from_micros(take_u64_be(input)?));
        }
        if input.first() == Some(&ValueType::MergeFlags.as_byte()) {
            take_byte(input)?;
            merge_flags = take_u64_be(input)?;
        }
        let primitive = PrimitiveValue::decode_value(input)?;
        *input = &[];
        Ok(Self {
            primitive,
            ttl,
            merge_flags,
        })
    }
}

impl From<PrimitiveValue> for Value {
    fn from(primitive: PrimitiveValue) -> Self {
        Value::new(primitive)
    }
}
