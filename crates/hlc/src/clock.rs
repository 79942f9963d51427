//! Hybrid logical clock.

use crate::HybridTime;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of physical time in microseconds since the Unix epoch.
pub trait PhysicalClock: Send + Sync {
    fn now_micros(&self) -> u64;
}

/// Wall clock backed physical time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl PhysicalClock for SystemClock {
    fn now_micros(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0)
    }
}

/// Physical clock that only moves when told to. Used by tests and by
/// replay, where time must be deterministic.
#[derive(Debug, Default)]
pub struct ManualClock {
    micros: AtomicU64,
}

impl ManualClock {
    pub fn new(micros: u64) -> Self {
        Self {
            micros: AtomicU64::new(micros),
        }
    }

    pub fn set(&self, micros: u64) {
        self.micros.store(micros, Ordering::SeqCst);
    }

    pub fn advance(&self, micros: u64) {
        self.micros.fetch_add(micros, Ordering::SeqCst);
    }
}

impl PhysicalClock for ManualClock {
    fn now_micros(&self) -> u64 {
        self.micros.load(Ordering::SeqCst)
    }
}

/// HLC clock for generating hybrid times.
///
/// Every call to `now` returns a hybrid time strictly greater than any time
/// previously returned by `now` or observed through `update`.
pub struct HlcClock {
    physical: Arc<dyn PhysicalClock>,
    last: AtomicU64,
}

impl HlcClock {
    pub fn new(physical: Arc<dyn PhysicalClock>) -> Self {
        Self {
            physical,
            last: AtomicU64::new(HybridTime::MIN.to_raw()),
        }
    }

    /// Clock driven by the system wall clock.
    pub fn system() -> Self {
        Self::new(Arc::new(SystemClock))
    }

    /// Generate a new hybrid time.
    pub fn now(&self) -> HybridTime {
        let physical = HybridTime::from_micros(self.physical.now_micros()).to_raw();
        let mut last = self.last.load(Ordering::SeqCst);
        loop {
            // New physical time resets the logical counter, otherwise bump it.
            let next = physical.max(last + 1);
            match self
                .last
                .compare_exchange_weak(last, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return HybridTime::from_raw(next),
                Err(current) => last = current,
            }
        }
    }

    /// Update the clock based on a received hybrid time, so that later calls
    /// to `now` return something greater than `received`.
    pub fn update(&self, received: HybridTime) {
        if received.is_valid() && received != HybridTime::MAX {
            self.last.fetch_max(received.to_raw(), Ordering::SeqCst);
        }
    }

    /// Latest hybrid time handed out or observed, without advancing.
    pub fn peek(&self) -> HybridTime {
        HybridTime::from_raw(self.last.load(Ordering::SeqCst))
    }
}

/// Thread-safe HLC clock that can be shared across threads.
pub type SharedHlcClock = Arc<HlcClock>;
