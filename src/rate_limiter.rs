//! Token bucket shared by flush and compaction writers.
//!
//! Every block written by background work asks for as many tokens as it has
//! bytes. Tokens refill at the configured rate up to one second's worth, so a
//! short burst goes through immediately and sustained output is held to the
//! rate. A rate of zero disables limiting.

use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Bucket {
    tokens: u64,
    last_refill: Instant,
}

#[derive(Debug)]
pub struct RateLimiter {
    bytes_per_sec: u64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(bytes_per_sec: u64) -> Self {
        Self {
            bytes_per_sec,
            bucket: Mutex::new(Bucket {
                tokens: bytes_per_sec,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0)
    }

    pub fn is_enabled(&self) -> bool {
        self.bytes_per_sec > 0
    }

    /// Blocks until `bytes` may be written. Returns how long it waited.
    ///
    /// Requests larger than the bucket are granted once the bucket is full,
    /// leaving it in debt.
    pub fn request(&self, bytes: u64) -> Duration {
        if !self.is_enabled() || bytes == 0 {
            return Duration::ZERO;
        }

        let mut waited = Duration::ZERO;
        loop {
            let wait = {
                let mut bucket = match self.bucket.lock() {
                    Ok(bucket) => bucket,
                    Err(poisoned) => poisoned.into_inner(),
                };
                self.refill(&mut bucket);
                let needed = bytes.min(self.bytes_per_sec);
                if bucket.tokens >= needed {
                    bucket.tokens -= needed;
                    return waited;
                }
                let missing = needed - bucket.tokens;
                Duration::from_micros(
                    (missing as u128 * 1_000_000 / self.bytes_per_sec as u128).max(1) as u64,
                )
            };
            thread::sleep(wait);
            waited += wait;
        }
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill);
        let added = (elapsed.as_micros() * self.bytes_per_sec as u128 / 1_000_000) as u64;
        if added > 0 {
            bucket.tokens = bucket.tokens.saturating_add(added).min(self.bytes_per_sec);
            bucket.last_refill = now;
        }
    }
}
