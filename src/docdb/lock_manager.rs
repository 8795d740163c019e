//! Exclusive per-key locks for writers.
//!
//! A batch acquires the locks of every path it writes before it is given a
//! write time, so two writers to the same key are ordered by lock acquisition.
//! Acquisition is all-or-nothing: a batch waits until every one of its keys is
//! free and then takes them together, so batches never hold a partial set and
//! cannot deadlock on each other.

use std::collections::HashSet;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use super::KeyBytes;
use crate::error::Result;
use crate::Error;

#[derive(Default)]
pub struct LockManager {
    locked: Mutex<HashSet<KeyBytes>>,
    released: Condvar,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until every key in `keys` is free, then locks them all.
    pub fn lock(&self, keys: Vec<KeyBytes>) -> Result<LockBatch<'_>> {
        self.lock_inner(keys, None)
    }

    /// Like `lock`, but gives up with `Aborted` after `timeout`.
    pub fn lock_with_timeout(&self, keys: Vec<KeyBytes>, timeout: Duration) -> Result<LockBatch<'_>> {
        self.lock_inner(keys, Some(Instant::now() + timeout))
    }

    fn lock_inner(&self, mut keys: Vec<KeyBytes>, deadline: Option<Instant>) -> Result<LockBatch<'_>> {
        keys.sort();
        keys.dedup();

        let mut locked = self.locked.lock()?;
        while keys.iter().any(|k| locked.contains(k)) {
            locked = match deadline {
                None => self.released.wait(locked)?,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::Aborted(format!(
                            "timed out waiting for {} key locks",
                            keys.len()
                        )));
                    }
                    self.released.wait_timeout(locked, deadline - now)?.0
                }
            };
        }
        locked.extend(keys.iter().cloned());

        Ok(LockBatch {
            manager: self,
            keys,
        })
    }

    /// Number of keys currently locked.
    #[cfg(test)]
    pub fn num_locked(&self) -> usize {
        self.locked.lock().map(|l| l.len()).unwrap_or(0)
    }

    fn release(&self, keys: &[KeyBytes]) {
        // A poisoned set still has to give its keys back.
        let mut locked = match self.locked.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for key in keys {
            locked.remove(key);
        }
        drop(locked);
        self.released.notify_all();
    }
}

/// Locks held by one batch, released on drop.
pub struct LockBatch<'a> {
    manager: &'a LockManager,
    keys: Vec<KeyBytes>,
}

impl LockBatch<'_> {
    pub fn keys(&self) -> &[KeyBytes] {
        &self.keys
    }
}

impl Drop for LockBatch<'_> {
    fn drop(&mut self) {
        self.manager.release(&self.keys);
    }
}
