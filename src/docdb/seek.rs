//! Forward iteration over stored keys and the seek optimizer.
//!
//! Seeking an on-disk run costs an index lookup plus a block load, while `next`
//! on a positioned cursor is a comparison or two. When a scan moves forward by
//! a small distance it is cheaper to step than to seek, but stepping over a
//! long run of keys degrades into a linear scan. The optimizer steps at most
//! `max_nexts` times and then falls back to a real seek.

use crate::error::Result;

use super::doc_key::{encode_past_versions_key, encode_subkey_boundary, is_valid_seek_key};
use super::format_key;

/// A cursor over stored key/value pairs in ascending key order.
pub trait KvIterator: Send {
    fn valid(&self) -> bool;

    /// Current key. Only meaningful while `valid()`.
    fn key(&self) -> &[u8];

    /// Current value. Only meaningful while `valid()`.
    fn value(&self) -> &[u8];

    fn seek_to_first(&mut self) -> Result<()>;

    /// Positions at the first key `>= target`.
    fn seek(&mut self, target: &[u8]) -> Result<()>;

    fn next(&mut self) -> Result<()>;
}

impl<T: KvIterator + ?Sized> KvIterator for Box<T> {
    fn valid(&self) -> bool {
        (**self).valid()
    }

    fn key(&self) -> &[u8] {
        (**self).key()
    }

    fn value(&self) -> &[u8] {
        (**self).value()
    }

    fn seek_to_first(&mut self) -> Result<()> {
        (**self).seek_to_first()
    }

    fn seek(&mut self, target: &[u8]) -> Result<()> {
        (**self).seek(target)
    }

    fn next(&mut self) -> Result<()> {
        (**self).next()
    }
}

/// How a single optimized seek was carried out.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SeekStats {
    pub nexts: usize,
    pub seeks: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct SeekOptimizer {
    max_nexts: usize,
    trace: bool,
}

impl Default for SeekOptimizer {
    fn default() -> Self {
        Self::new(8, false)
    }
}

impl SeekOptimizer {
    pub fn new(max_nexts: usize, trace: bool) -> Self {
        Self { max_nexts, trace }
    }

    pub fn max_nexts(&self) -> usize {
        self.max_nexts
    }

    /// Positions `iter` at the first key `>= target`. An empty target means
    /// the first key.
    pub fn seek<I: KvIterator + ?Sized>(&self, iter: &mut I, target: &[u8]) -> Result<SeekStats> {
        debug_assert!(
            is_valid_seek_key(target),
            "seek key {} carries a hybrid time that is neither max write id nor min",
            format_key(target)
        );

        let mut stats = SeekStats::default();
        if target.is_empty() {
            iter.seek_to_first()?;
            stats.seeks += 1;
            self.trace(target, stats);
            return Ok(stats);
        }

        if !iter.valid() || iter.key() > target {
            iter.seek(target)?;
            stats.seeks += 1;
            self.trace(target, stats);
            return Ok(stats);
        }

        loop {
            if !iter.valid() || iter.key() >= target {
                break;
            }
            if stats.nexts < self.max_nexts {
                iter.next()?;
                stats.nexts += 1;
            } else {
                iter.seek(target)?;
                stats.seeks += 1;
                break;
            }
        }
        self.trace(target, stats);
        Ok(stats)
    }

    /// Seeks to `target` only if the iterator is still behind it.
    pub fn seek_forward<I: KvIterator + ?Sized>(
        &self,
        iter: &mut I,
        target: &[u8],
    ) -> Result<SeekStats> {
        if iter.valid() && iter.key() >= target {
            return Ok(SeekStats::default());
        }
        self.seek(iter, target)
    }

    /// Skips every version and descendant of `key`.
    pub fn seek_past_subdoc<I: KvIterator + ?Sized>(
        &self,
        iter: &mut I,
        key: &[u8],
    ) -> Result<SeekStats> {
        self.seek_forward(iter, &encode_subkey_boundary(key))
    }

    /// Skips every version of `key`, landing on its first descendant if any.
    pub fn seek_past_versions<I: KvIterator + ?Sized>(
        &self,
        iter: &mut I,
        key: &[u8],
    ) -> Result<SeekStats> {
        self.seek_forward(iter, &encode_past_versions_key(key))
    }

    fn trace(&self, target: &[u8], stats: SeekStats) {
        if self.trace {
            tracing::trace!(
                target_key = %format_key(target),
                nexts = stats.nexts,
                seeks = stats.seeks,
                "Optimized seek"
            );
        }
    }
}
