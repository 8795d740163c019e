use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::hybrid_time::HybridTime;

/// Source of hybrid times for write assignment and snapshots.
pub trait Clock: Send + Sync {
    /// Returns a time not smaller than any previously returned one.
    fn now(&self) -> HybridTime;
}

pub type SharedClock = Arc<dyn Clock>;

/// Hybrid logical clock driven by the system wall clock.
///
/// The physical part follows wall time in microseconds. When wall time stalls or
/// goes backwards the logical part is bumped instead, so readings are strictly
/// increasing.
#[derive(Debug, Default)]
pub struct HybridClock {
    last: AtomicU64,
}

impl HybridClock {
    pub fn new() -> Self {
        Self {
            last: AtomicU64::new(HybridTime::MIN.to_raw()),
        }
    }

    fn physical_now() -> HybridTime {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        HybridTime::from_micros(micros)
    }
}

impl Clock for HybridClock {
    fn now(&self) -> HybridTime {
        let physical = Self::physical_now().to_raw();
        let mut last = self.last.load(Ordering::SeqCst);
        loop {
            let next = if physical > last { physical } else { last + 1 };
            match self
                .last
                .compare_exchange_weak(last, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return HybridTime::from_raw(next),
                Err(current) => last = current,
            }
        }
    }
}

/// Clock that only moves when told to. Used for deterministic reads and tests.
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start: HybridTime) -> Self {
        Self {
            now: AtomicU64::new(start.to_raw()),
        }
    }

    /// Moves the clock to `ht`. Moving backwards is ignored.
    pub fn set(&self, ht: HybridTime) {
        self.now.fetch_max(ht.to_raw(), Ordering::SeqCst);
    }

    pub fn advance_micros(&self, micros: u64) {
        let delta = HybridTime::from_micros(micros).to_raw();
        self.now.fetch_add(delta, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> HybridTime {
        HybridTime::from_raw(self.now.load(Ordering::SeqCst))
    }
}
