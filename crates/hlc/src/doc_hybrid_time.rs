use crate::HybridTime;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A hybrid time plus the id of the write inside its transaction or batch.
///
/// Total ordering: hybrid time first, then write id.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocHybridTime {
    pub hybrid_time: HybridTime,
    pub write_id: u32,
}

impl DocHybridTime {
    pub const MIN: DocHybridTime = DocHybridTime::new(HybridTime::MIN, 0);
    pub const MAX: DocHybridTime = DocHybridTime::new(HybridTime::MAX, u32::MAX);
    pub const INVALID: DocHybridTime = DocHybridTime::new(HybridTime::INVALID, 0);

    /// Size of the descending key encoding.
    pub const ENCODED_SIZE: usize = 12;

    pub const fn new(hybrid_time: HybridTime, write_id: u32) -> Self {
        Self {
            hybrid_time,
            write_id,
        }
    }

    /// The latest doc hybrid time that is still visible at `ht`.
    pub const fn max_at(ht: HybridTime) -> Self {
        Self::new(ht, u32::MAX)
    }

    pub fn is_valid(&self) -> bool {
        self.hybrid_time.is_valid()
    }

    /// Append the descending encoding: bit-inverted big-endian hybrid time
    /// followed by the bit-inverted big-endian write id. Under plain byte
    /// order a larger doc hybrid time sorts first.
    pub fn append_encoded_desc(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(!self.hybrid_time.to_raw()).to_be_bytes());
        out.extend_from_slice(&(!self.write_id).to_be_bytes());
    }

    pub fn encoded_desc(&self) -> [u8; Self::ENCODED_SIZE] {
        let mut buf = [0u8; Self::ENCODED_SIZE];
        buf[..8].copy_from_slice(&(!self.hybrid_time.to_raw()).to_be_bytes());
        buf[8..].copy_from_slice(&(!self.write_id).to_be_bytes());
        buf
    }

    /// Decode exactly `ENCODED_SIZE` bytes produced by `append_encoded_desc`.
    pub fn decode_desc(bytes: &[u8]) -> Result<Self, String> {
        if bytes.len() != Self::ENCODED_SIZE {
            return Err(format!(
                "Expected {} bytes for doc hybrid time, got {}",
                Self::ENCODED_SIZE,
                bytes.len()
            ));
        }
        let mut ht = [0u8; 8];
        ht.copy_from_slice(&bytes[..8]);
        let mut write_id = [0u8; 4];
        write_id.copy_from_slice(&bytes[8..]);
        Ok(Self::new(
            HybridTime::from_raw(!u64::from_be_bytes(ht)),
            !u32::from_be_bytes(write_id),
        ))
    }
}

impl Default for DocHybridTime {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Display for DocHybridTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.write_id == 0 {
            write!(f, "{}", self.hybrid_time)
        } else {
            write!(f, "{} w: {}", self.hybrid_time, self.write_id)
        }
    }
}

impl fmt::Debug for DocHybridTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocHT({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dht(micros: u64, write_id: u32) -> DocHybridTime {
        DocHybridTime::new(HybridTime::from_micros(micros), write_id)
    }

    #[test]
    fn test_ordering() {
        assert!(dht(10, 5) < dht(11, 0));
        assert!(dht(10, 0) < dht(10, 1));
        assert!(DocHybridTime::MIN < dht(0, 1));
        assert!(dht(u64::MAX >> 13, 0) < DocHybridTime::MAX);
    }

    #[test]
    fn test_descending_encoding_reverses_order() {
        let older = dht(100, 0);
        let newer = dht(200, 0);
        let same_time_later_write = dht(100, 3);

        assert!(newer.encoded_desc() < older.encoded_desc());
        assert!(same_time_later_write.encoded_desc() < older.encoded_desc());
        assert_eq!(DocHybridTime::decode_desc(&newer.encoded_desc()).unwrap(), newer);
    }

    #[test]
    fn test_decode_rejects_wrong_length() {
        assert!(DocHybridTime::decode_desc(&[0u8; 11]).is_err());
    }
}
