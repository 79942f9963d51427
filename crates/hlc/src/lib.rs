//! Hybrid time for MVCC ordering.
//!
//! This crate provides:
//! - `HybridTime`: a physical (microseconds) + logical counter timestamp
//!   packed into a single `u64`
//! - `DocHybridTime`: a hybrid time plus an intra-transaction write id, the
//!   unit of MVCC ordering inside the document store
//! - `HlcClock`: a hybrid logical clock producing monotonic hybrid times

mod clock;
mod doc_hybrid_time;

pub use clock::{HlcClock, ManualClock, PhysicalClock, SharedHlcClock, SystemClock};
pub use doc_hybrid_time::DocHybridTime;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Number of low bits of a hybrid time reserved for the logical counter.
pub const BITS_FOR_LOGICAL: u32 = 12;

const LOGICAL_MASK: u64 = (1 << BITS_FOR_LOGICAL) - 1;

/// Immutable hybrid timestamp with total ordering.
///
/// The physical component (microseconds since the Unix epoch) lives in the
/// high bits and the logical counter in the low `BITS_FOR_LOGICAL` bits, so
/// comparing the raw `u64` compares physical time first, then the counter.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HybridTime(u64);

impl HybridTime {
    /// Smallest possible hybrid time. Also used as the "aborted" commit time.
    pub const MIN: HybridTime = HybridTime(0);
    /// First hybrid time that can be handed out by a clock.
    pub const INITIAL: HybridTime = HybridTime(1);
    /// Largest possible hybrid time.
    pub const MAX: HybridTime = HybridTime(u64::MAX);
    /// Sentinel for "no hybrid time".
    pub const INVALID: HybridTime = HybridTime(u64::MAX - 1);

    pub const fn from_raw(raw: u64) -> Self {
        HybridTime(raw)
    }

    pub const fn to_raw(self) -> u64 {
        self.0
    }

    /// Create a hybrid time from a physical time with a zero logical counter.
    pub const fn from_micros(micros: u64) -> Self {
        HybridTime(micros << BITS_FOR_LOGICAL)
    }

    pub const fn from_micros_and_logical(micros: u64, logical: u32) -> Self {
        HybridTime((micros << BITS_FOR_LOGICAL) | (logical as u64 & LOGICAL_MASK))
    }

    pub const fn physical_micros(self) -> u64 {
        self.0 >> BITS_FOR_LOGICAL
    }

    pub const fn logical(self) -> u32 {
        (self.0 & LOGICAL_MASK) as u32
    }

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    /// Returns `None` for the invalid sentinel, `Some(self)` otherwise.
    pub fn to_option(self) -> Option<HybridTime> {
        self.is_valid().then_some(self)
    }

    /// Add a physical offset, saturating below the special values.
    pub fn add_micros(self, micros: u64) -> Self {
        if !self.is_valid() || self == Self::MAX {
            return self;
        }
        let physical = self.physical_micros().saturating_add(micros);
        let shifted = Self::from_micros_and_logical(physical, self.logical());
        if shifted.physical_micros() != physical || shifted >= Self::INVALID {
            Self::INVALID.decremented()
        } else {
            shifted
        }
    }

    pub fn add_duration(self, duration: Duration) -> Self {
        self.add_micros(duration.as_micros() as u64)
    }

    /// Subtract a physical offset, saturating at `MIN`.
    pub fn sub_duration(self, duration: Duration) -> Self {
        let micros = duration.as_micros() as u64;
        Self::from_micros_and_logical(self.physical_micros().saturating_sub(micros), self.logical())
    }

    pub fn decremented(self) -> Self {
        HybridTime(self.0.saturating_sub(1))
    }

    pub fn incremented(self) -> Self {
        HybridTime(self.0.saturating_add(1))
    }

    /// Parse the `physical.logical` form produced by `Display`.
    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "<min>" => return Ok(Self::MIN),
            "<max>" => return Ok(Self::MAX),
            "<invalid>" => return Ok(Self::INVALID),
            _ => {}
        }
        let (physical, logical) = s
            .split_once('.')
            .ok_or_else(|| format!("Invalid hybrid time format: {} (expected physical.logical)", s))?;
        let physical = physical
            .parse()
            .map_err(|_| format!("Invalid physical component: {}", physical))?;
        let logical: u32 = logical
            .parse()
            .map_err(|_| format!("Invalid logical component: {}", logical))?;
        if logical as u64 > LOGICAL_MASK {
            return Err(format!("Logical component out of range: {}", logical));
        }
        Ok(Self::from_micros_and_logical(physical, logical))
    }
}

impl Default for HybridTime {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Display for HybridTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::MIN => write!(f, "<min>"),
            Self::MAX => write!(f, "<max>"),
            Self::INVALID => write!(f, "<invalid>"),
            ht => write!(f, "{}.{}", ht.physical_micros(), ht.logical()),
        }
    }
}

impl fmt::Debug for HybridTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HT({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_physical_dominates_logical() {
        let ht1 = HybridTime::from_micros_and_logical(100, 5);
        let ht2 = HybridTime::from_micros_and_logical(101, 0);
        let ht3 = HybridTime::from_micros_and_logical(100, 6);

        assert!(ht1 < ht2);
        assert!(ht1 < ht3);
        assert!(ht3 < ht2);
        assert_eq!(ht1.physical_micros(), 100);
        assert_eq!(ht1.logical(), 5);
    }

    #[test]
    fn test_special_values() {
        assert!(HybridTime::MIN < HybridTime::INITIAL);
        assert!(HybridTime::INVALID < HybridTime::MAX);
        assert!(!HybridTime::INVALID.is_valid());
        assert!(HybridTime::MAX.is_valid());
        assert_eq!(HybridTime::INVALID.to_option(), None);
        assert_eq!(HybridTime::default(), HybridTime::INVALID);
    }

    #[test]
    fn test_string_roundtrip() {
        let ht = HybridTime::from_micros_and_logical(123_456_789, 10);
        let parsed = HybridTime::parse(&ht.to_string()).unwrap();
        assert_eq!(ht, parsed);
        assert_eq!(HybridTime::parse("<max>").unwrap(), HybridTime::MAX);
        assert!(HybridTime::parse("12").is_err());
        assert!(HybridTime::parse("12.99999").is_err());
    }

    #[test]
    fn test_duration_arithmetic() {
        let ht = HybridTime::from_micros_and_logical(1_000_000, 3);
        let later = ht.add_duration(Duration::from_millis(5));
        assert_eq!(later.physical_micros(), 1_005_000);
        assert_eq!(later.logical(), 3);
        assert_eq!(later.sub_duration(Duration::from_millis(5)), ht);
        assert_eq!(
            HybridTime::from_micros(10).sub_duration(Duration::from_secs(1)),
            HybridTime::MIN
        );
        assert_eq!(HybridTime::MAX.add_micros(10), HybridTime::MAX);
    }

    #[test]
    fn test_serde_roundtrip() {
        let ht = HybridTime::from_micros(42);
        let json = serde_json::to_string(&ht).unwrap();
        let back: HybridTime = serde_json::from_str(&json).unwrap();
        assert_eq!(ht, back);
    }
}
