//! Fault injection points in flush and compaction.
//!
//! Every hook defaults to a no-op. Tests install implementations that fail or
//! block at a chosen step to exercise recovery paths. A hook error aborts the
//! operation at that step exactly as an I/O error there would.

use crate::error::Result;

pub trait FlushFaultHooks: Send + Sync {
    /// After a fresh memrowset replaced the one being flushed.
    fn post_swap_new_memrowset(&self) -> Result<()> {
        Ok(())
    }
}

pub trait CompactionFaultHooks: Send + Sync {
    /// After the input rowsets were selected and claimed.
    fn post_select_iterators(&self) -> Result<()> {
        Ok(())
    }
}

pub trait FlushCompactCommonHooks: Send + Sync {
    /// After the snapshot the output is written at was taken.
    fn post_take_mvcc_snapshot(&self) -> Result<()> {
        Ok(())
    }

    /// After the output blocks were written, before metadata is committed.
    fn post_write_snapshot(&self) -> Result<()> {
        Ok(())
    }

    /// After the new rowsets are visible to readers.
    fn post_swap_new_rowset(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct NoopHooks;

impl FlushFaultHooks for NoopHooks {}
impl CompactionFaultHooks for NoopHooks {}
impl FlushCompactCommonHooks for NoopHooks {}
