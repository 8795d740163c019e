//! Write time assignment and snapshot safety.
//!
//! Every write batch gets a hybrid time from `start_write` and stays in flight
//! until `commit`. The safe time is the newest time at which no write can still
//! appear: below every in-flight write, and no later than the clock. Snapshots
//! are taken at the safe time, so a reader never sees a write that becomes
//! visible after its snapshot was taken.
//!
//! Taking a snapshot at clock time `t` also bumps the last assigned time to
//! `t`, so every later write is assigned a time after `t`.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex};

use crate::clock::SharedClock;
use crate::error::Result;
use crate::hybrid_time::HybridTime;
use crate::Error;

/// The boundary a reader uses to decide which writes are visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MvccSnapshot {
    read_time: HybridTime,
}

impl MvccSnapshot {
    pub(crate) fn new(read_time: HybridTime) -> Self {
        Self { read_time }
    }

    pub fn read_time(&self) -> HybridTime {
        self.read_time
    }

    pub fn is_visible(&self, write_time: HybridTime) -> bool {
        write_time <= self.read_time
    }
}

impl fmt::Display for MvccSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MvccSnapshot({})", self.read_time)
    }
}

#[derive(Debug)]
struct MvccState {
    last_assigned: HybridTime,
    in_flight: BTreeSet<HybridTime>,
    safe_time: HybridTime,
    /// Read time -> number of readers at it.
    read_points: BTreeMap<HybridTime, usize>,
}

pub struct MvccManager {
    clock: SharedClock,
    state: Mutex<MvccState>,
    applied: Condvar,
}

impl MvccManager {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            state: Mutex::new(MvccState {
                last_assigned: HybridTime::MIN,
                in_flight: BTreeSet::new(),
                safe_time: HybridTime::MIN,
                read_points: BTreeMap::new(),
            }),
            applied: Condvar::new(),
        }
    }

    /// Assigns a write time greater than every time assigned or handed to
    /// readers so far and marks it in flight.
    pub fn start_write(&self) -> Result<HybridTime> {
        let now = self.clock.now();
        let mut state = self.state.lock()?;
        let ht = now.max(state.last_assigned.incremented());
        if ht >= HybridTime::MAX {
            return Err(Error::IllegalState("hybrid time exhausted".into()));
        }
        state.last_assigned = ht;
        state.in_flight.insert(ht);
        Ok(ht)
    }

    /// Marks the write at `ht` applied.
    pub fn commit(&self, ht: HybridTime) -> Result<()> {
        self.finish(ht, "commit")
    }

    /// Drops a write that was never applied.
    pub fn abort(&self, ht: HybridTime) -> Result<()> {
        self.finish(ht, "abort")
    }

    fn finish(&self, ht: HybridTime, what: &str) -> Result<()> {
        let mut state = self.state.lock()?;
        if !state.in_flight.remove(&ht) {
            return Err(Error::IllegalState(format!(
                "cannot {} write at {}: not in flight",
                what, ht
            )));
        }
        drop(state);
        self.applied.notify_all();
        Ok(())
    }

    pub fn safe_time(&self) -> Result<HybridTime> {
        let now = self.clock.now();
        let mut state = self.state.lock()?;
        Ok(Self::update_safe_time(&mut state, now))
    }

    fn update_safe_time(state: &mut MvccState, now: HybridTime) -> HybridTime {
        let candidate = match state.in_flight.first() {
            Some(oldest) => oldest.decremented(),
            None => {
                state.last_assigned = state.last_assigned.max(now);
                state.last_assigned
            }
        };
        state.safe_time = state.safe_time.max(candidate);
        state.safe_time
    }

    /// A snapshot at the current safe time.
    pub fn take_snapshot(&self) -> Result<MvccSnapshot> {
        Ok(MvccSnapshot::new(self.safe_time()?))
    }

    /// A snapshot at an explicit time in the past. Times past the safe time
    /// could still gain writes and are rejected.
    pub fn snapshot_at(&self, ht: HybridTime) -> Result<MvccSnapshot> {
        let safe = self.safe_time()?;
        if ht > safe {
            return Err(Error::InvalidArgument(format!(
                "snapshot time {} is past the safe time {}",
                ht, safe
            )));
        }
        Ok(MvccSnapshot::new(ht))
    }

    /// Blocks until every write with a time at or before `ht` is applied.
    pub fn wait_for_applying_before(&self, ht: HybridTime) -> Result<()> {
        let mut state = self.state.lock()?;
        while state.in_flight.first().is_some_and(|oldest| *oldest <= ht) {
            state = self.applied.wait(state)?;
        }
        Ok(())
    }

    /// Newest time assigned to a write or snapshot so far.
    pub fn last_assigned(&self) -> Result<HybridTime> {
        Ok(self.state.lock()?.last_assigned)
    }

    pub fn num_in_flight(&self) -> Result<usize> {
        Ok(self.state.lock()?.in_flight.len())
    }

    /// Registers a reader at `read_time` until the guard drops.
    pub fn register_read_point(self: &Arc<Self>, read_time: HybridTime) -> Result<ScopedReadPoint> {
        let mut state = self.state.lock()?;
        *state.read_points.entry(read_time).or_insert(0) += 1;
        Ok(ScopedReadPoint {
            mvcc: self.clone(),
            read_time,
        })
    }

    /// Oldest time any reader may still read at: the oldest registered read
    /// point, or the safe time if there is none.
    pub fn oldest_read_point(&self) -> Result<HybridTime> {
        let now = self.clock.now();
        let mut state = self.state.lock()?;
        let safe = Self::update_safe_time(&mut state, now);
        Ok(state
            .read_points
            .keys()
            .next()
            .map_or(safe, |oldest| (*oldest).min(safe)))
    }

    fn unregister_read_point(&self, read_time: HybridTime) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(count) = state.read_points.get_mut(&read_time) {
            *count -= 1;
            if *count == 0 {
                state.read_points.remove(&read_time);
            }
        }
    }
}

/// Keeps history at a read time from being garbage-collected.
pub struct ScopedReadPoint {
    mvcc: Arc<MvccManager>,
    read_time: HybridTime,
}

impl ScopedReadPoint {
    pub fn read_time(&self) -> HybridTime {
        self.read_time
    }
}

impl Drop for ScopedReadPoint {
    fn drop(&mut self) {
        self.mvcc.unregister_read_point(self.read_time);
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::clock::ManualClock;

    fn ht(micros: u64) -> HybridTime {
        HybridTime::from_micros(micros)
    }

    fn manager(start: u64) -> (Arc<ManualClock>, Arc<MvccManager>) {
        let clock = Arc::new(ManualClock::new(ht(start)));
        let mvcc = Arc::new(MvccManager::new(clock.clone()));
        (clock, mvcc)
    }

    #[test]
    fn test_write_times_strictly_increase() {
        let (_clock, mvcc) = manager(10);
        let a = mvcc.start_write().unwrap();
        let b = mvcc.start_write().unwrap();
        assert_eq!(a, ht(10));
        assert!(b > a);
    }

    #[test]
    fn test_safe_time_stays_below_in_flight_writes() {
        let (clock, mvcc) = manager(10);
        let a = mvcc.start_write().unwrap();
        clock.set(ht(50));
        assert_eq!(mvcc.safe_time().unwrap(), a.decremented());

        mvcc.commit(a).unwrap();
        assert_eq!(mvcc.safe_time().unwrap(), ht(50));
        // A write started after the snapshot lands after it.
        assert!(mvcc.start_write().unwrap() > ht(50));
    }

    #[test]
    fn test_snapshot_at_rejects_future_times() {
        let (_clock, mvcc) = manager(10);
        assert!(mvcc.snapshot_at(ht(5)).is_ok());
        assert!(matches!(
            mvcc.snapshot_at(ht(11)),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_commit_unknown_write_fails() {
        let (_clock, mvcc) = manager(10);
        assert!(matches!(mvcc.commit(ht(3)), Err(Error::IllegalState(_))));
    }

    #[test]
    fn test_wait_for_applying_before() {
        let (_clock, mvcc) = manager(10);
        let a = mvcc.start_write().unwrap();
        let waiter = {
            let mvcc = mvcc.clone();
            thread::spawn(move || mvcc.wait_for_applying_before(a).unwrap())
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());
        mvcc.commit(a).unwrap();
        waiter.join().unwrap();
    }

    #[test]
    fn test_read_points_bound_history() {
        let (clock, mvcc) = manager(10);
        let point = mvcc.register_read_point(ht(7)).unwrap();
        clock.set(ht(100));
        assert_eq!(mvcc.oldest_read_point().unwrap(), ht(7));
        assert_eq!(point.read_time(), ht(7));
        drop(point);
        assert_eq!(mvcc.oldest_read_point().unwrap(), ht(100));
    }
}
