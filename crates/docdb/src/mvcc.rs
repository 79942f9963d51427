//! MVCC manager: tracks hybrid times of in-flight writes and computes the
//! safe time, the largest hybrid time at which a read sees a stable state.
//!
//! Each pending write moves `Pending -> Replicated` or `Pending -> Aborted`.
//! Pending times are handed out in increasing order and replicated in the
//! same order, so the front of the queue bounds the safe time.

use crate::error::{Error, Result};
use docstore_hlc::{HybridTime, SharedHlcClock};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeSet, VecDeque};
use std::time::Instant;

#[derive(Debug)]
struct MvccState {
    /// Pending write times, in increasing order.
    queue: VecDeque<HybridTime>,
    /// Pending times aborted while not at the front of the queue.
    aborted: BTreeSet<HybridTime>,
    last_replicated: HybridTime,
    max_safe_time_returned: HybridTime,
    /// Safe time propagated from the leader, used on followers.
    propagated_safe_time: HybridTime,
}

pub struct MvccManager {
    clock: SharedHlcClock,
    state: Mutex<MvccState>,
    cond: Condvar,
}

impl MvccManager {
    pub fn new(clock: SharedHlcClock) -> Self {
        Self {
            clock,
            state: Mutex::new(MvccState {
                queue: VecDeque::new(),
                aborted: BTreeSet::new(),
                last_replicated: HybridTime::MIN,
                max_safe_time_returned: HybridTime::MIN,
                propagated_safe_time: HybridTime::MIN,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn clock(&self) -> &SharedHlcClock {
        &self.clock
    }

    /// Take a hybrid time from the clock and register it as pending, under
    /// one lock so that registration order matches time order.
    pub fn new_pending_write(&self) -> HybridTime {
        let mut state = self.state.lock();
        let mut ht = self.clock.now();
        let floor = state
            .queue
            .back()
            .copied()
            .unwrap_or(HybridTime::MIN)
            .max(state.max_safe_time_returned);
        if ht <= floor {
            self.clock.update(floor);
            ht = self.clock.now();
        }
        state.queue.push_back(ht);
        ht
    }

    /// Register an externally chosen pending write time, e.g. one replayed
    /// from the log.
    pub fn add_pending(&self, ht: HybridTime) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(last) = state.queue.back()
            && ht <= *last
        {
            return Err(Error::illegal_state(format!(
                "Pending write {} is not after the last pending write {}",
                ht, last
            )));
        }
        if ht <= state.max_safe_time_returned {
            return Err(Error::illegal_state(format!(
                "Pending write {} is not after already returned safe time {}",
                ht, state.max_safe_time_returned
            )));
        }
        self.clock.update(ht);
        state.queue.push_back(ht);
        Ok(())
    }

    /// The write at `ht` is durable. It must be the oldest pending write.
    pub fn replicated(&self, ht: HybridTime) -> Result<()> {
        let mut state = self.state.lock();
        match state.queue.front() {
            Some(front) if *front == ht => {}
            other => {
                return Err(Error::illegal_state(format!(
                    "Replicated {} but oldest pending write is {:?}",
                    ht, other
                )));
            }
        }
        state.queue.pop_front();
        state.last_replicated = ht;
        Self::pop_aborted(&mut state);
        drop(state);
        self.cond.notify_all();
        Ok(())
    }

    /// The write at `ht` will never be applied.
    pub fn aborted(&self, ht: HybridTime) -> Result<()> {
        let mut state = self.state.lock();
        if state.queue.front() == Some(&ht) {
            state.queue.pop_front();
            Self::pop_aborted(&mut state);
        } else if state.queue.contains(&ht) {
            state.aborted.insert(ht);
        } else {
            return Err(Error::illegal_state(format!(
                "Aborted {} which is not pending",
                ht
            )));
        }
        drop(state);
        self.cond.notify_all();
        Ok(())
    }

    fn pop_aborted(state: &mut MvccState) {
        while let Some(front) = state.queue.front().copied() {
            if !state.aborted.remove(&front) {
                break;
            }
            state.queue.pop_front();
        }
    }

    fn candidate_safe_time(&self, state: &MvccState, min_allowed: HybridTime, ht_lease: Option<HybridTime>) -> HybridTime {
        let candidate = match state.queue.front() {
            Some(front) => front.decremented(),
            None => {
                let now = self.clock.now();
                if now < min_allowed && ht_lease.is_none_or(|lease| min_allowed <= lease) {
                    self.clock.update(min_allowed);
                    min_allowed
                } else {
                    now
                }
            }
        };
        let candidate = match ht_lease {
            Some(lease) => candidate.min(lease),
            None => candidate,
        };
        candidate.max(state.max_safe_time_returned)
    }

    /// Wait until a safe time of at least `min_allowed` is available, or
    /// until `deadline`. Returns `HybridTime::INVALID` on timeout.
    ///
    /// No write at or below the returned time is still pending, and the
    /// result never decreases across calls.
    pub fn safe_time(
        &self,
        min_allowed: HybridTime,
        deadline: Instant,
        ht_lease: Option<HybridTime>,
    ) -> HybridTime {
        let mut state = self.state.lock();
        loop {
            let candidate = self.candidate_safe_time(&state, min_allowed, ht_lease);
            if candidate >= min_allowed {
                state.max_safe_time_returned = candidate;
                return candidate;
            }
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                let candidate = self.candidate_safe_time(&state, min_allowed, ht_lease);
                if candidate >= min_allowed {
                    state.max_safe_time_returned = candidate;
                    return candidate;
                }
                tracing::debug!(
                    "Timed out waiting for safe time {}, oldest pending write {:?}",
                    min_allowed,
                    state.queue.front()
                );
                return HybridTime::INVALID;
            }
        }
    }

    /// Safe time with no minimum requirement.
    pub fn current_safe_time(&self) -> HybridTime {
        self.safe_time(HybridTime::MIN, Instant::now(), None)
    }

    /// Followers learn the leader's safe time through the replicated log.
    pub fn set_propagated_safe_time(&self, ht: HybridTime) {
        let mut state = self.state.lock();
        if ht > state.propagated_safe_time {
            state.propagated_safe_time = ht;
            drop(state);
            self.cond.notify_all();
        }
    }

    /// Safe time on a follower: the propagated safe time, capped below any
    /// write this replica has seen but not yet replicated.
    pub fn safe_time_for_follower(&self, min_allowed: HybridTime, deadline: Instant) -> HybridTime {
        let mut state = self.state.lock();
        loop {
            let mut candidate = state.propagated_safe_time;
            if let Some(front) = state.queue.front() {
                candidate = candidate.min(front.decremented());
            }
            if candidate >= min_allowed {
                return candidate;
            }
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                return HybridTime::INVALID;
            }
        }
    }

    pub fn last_replicated_hybrid_time(&self) -> HybridTime {
        self.state.lock().last_replicated
    }

    pub fn pending_count(&self) -> usize {
        let state = self.state.lock();
        state.queue.len() - state.aborted.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docstore_hlc::{HlcClock, ManualClock};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn manager(micros: u64) -> (Arc<ManualClock>, Arc<MvccManager>) {
        let physical = Arc::new(ManualClock::new(micros));
        let clock = Arc::new(HlcClock::new(physical.clone()));
        (physical, Arc::new(MvccManager::new(clock)))
    }

    fn soon() -> Instant {
        Instant::now() + Duration::from_millis(20)
    }

    #[test]
    fn test_safe_time_stays_below_pending_writes() {
        let (_, mvcc) = manager(1_000);
        let ht1 = mvcc.new_pending_write();
        let ht2 = mvcc.new_pending_write();
        assert!(ht1 < ht2);

        assert_eq!(mvcc.current_safe_time(), ht1.decremented());
        mvcc.replicated(ht1).unwrap();
        assert_eq!(mvcc.current_safe_time(), ht2.decremented());
        mvcc.replicated(ht2).unwrap();
        assert!(mvcc.current_safe_time() >= ht2);
        assert_eq!(mvcc.last_replicated_hybrid_time(), ht2);
    }

    #[test]
    fn test_out_of_order_abort() {
        let (_, mvcc) = manager(1_000);
        let ht1 = mvcc.new_pending_write();
        let ht2 = mvcc.new_pending_write();
        let ht3 = mvcc.new_pending_write();

        mvcc.aborted(ht2).unwrap();
        assert_eq!(mvcc.pending_count(), 2);
        mvcc.replicated(ht1).unwrap();
        // ht2 is gone as soon as ht1 leaves the front.
        assert_eq!(mvcc.current_safe_time(), ht3.decremented());
        assert!(mvcc.aborted(ht2).is_err());
    }

    #[test]
    fn test_replication_must_be_in_order() {
        let (_, mvcc) = manager(1_000);
        let _ht1 = mvcc.new_pending_write();
        let ht2 = mvcc.new_pending_write();
        assert!(matches!(mvcc.replicated(ht2), Err(Error::IllegalState(_))));
    }

    #[test]
    fn test_safe_time_is_monotonic() {
        let (physical, mvcc) = manager(5_000);
        let first = mvcc.current_safe_time();
        physical.set(1_000);
        assert!(mvcc.current_safe_time() >= first);

        // A pending write may not be registered at or below a returned safe time.
        assert!(mvcc.add_pending(first).is_err());
    }

    #[test]
    fn test_safe_time_times_out_with_invalid() {
        let (_, mvcc) = manager(1_000);
        let ht = mvcc.new_pending_write();
        assert_eq!(mvcc.safe_time(ht, soon(), None), HybridTime::INVALID);
        mvcc.aborted(ht).unwrap();
        assert!(mvcc.safe_time(ht, soon(), None) >= ht);
    }

    #[test]
    fn test_safe_time_waits_for_replication() {
        let (_, mvcc) = manager(1_000);
        let ht = mvcc.new_pending_write();

        let waiter = {
            let mvcc = mvcc.clone();
            thread::spawn(move || mvcc.safe_time(ht, Instant::now() + Duration::from_secs(5), None))
        };
        thread::sleep(Duration::from_millis(20));
        mvcc.replicated(ht).unwrap();
        assert!(waiter.join().unwrap() >= ht);
    }

    #[test]
    fn test_lease_caps_safe_time() {
        let (_, mvcc) = manager(10_000);
        let lease = HybridTime::from_micros(9_000);
        assert_eq!(mvcc.safe_time(HybridTime::MIN, soon(), Some(lease)), lease);
    }

    #[test]
    fn test_follower_safe_time_uses_propagated_value() {
        let (_, mvcc) = manager(1_000);
        let target = HybridTime::from_micros(2_000);
        assert_eq!(
            mvcc.safe_time_for_follower(target, soon()),
            HybridTime::INVALID
        );
        mvcc.set_propagated_safe_time(target);
        assert_eq!(mvcc.safe_time_for_follower(target, soon()), target);
        // Stale propagation never moves it back.
        mvcc.set_propagated_safe_time(HybridTime::from_micros(10));
        assert_eq!(mvcc.safe_time_for_follower(HybridTime::MIN, soon()), target);
    }
}
