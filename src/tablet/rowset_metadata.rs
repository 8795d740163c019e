//! In-memory owner of one rowset's block set.
//!
//! Every change to a rowset's blocks goes through `commit_update`, which
//! validates the change, makes it durable in the tablet metadata and only then
//! installs it. Blocks the change stops referencing are handed to the tablet
//! metadata as orphans; nothing is deleted here.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::metadata::{ColumnId, MetadataEdit, RowSetRecord, TabletMetadata};
use crate::block::BlockId;
use crate::error::Result;
use crate::Error;

pub struct RowSetMetadata {
    id: u64,
    tablet: Arc<TabletMetadata>,
    record: Mutex<RowSetRecord>,
    claimed: AtomicBool,
}

impl RowSetMetadata {
    pub fn new(tablet: Arc<TabletMetadata>, record: RowSetRecord) -> Self {
        Self {
            id: record.id,
            tablet,
            record: Mutex::new(record),
            claimed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn record(&self) -> Result<RowSetRecord> {
        Ok(self.record.lock()?.clone())
    }

    /// Claims the rowset for a flush or compaction. Returns `None` if someone
    /// else holds it.
    pub fn try_claim(self: &Arc<Self>) -> Option<RowSetClaim> {
        if self
            .claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            Some(RowSetClaim {
                rowset: self.clone(),
            })
        } else {
            None
        }
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    /// Applies `update` atomically. On any failure the rowset keeps its
    /// previous blocks.
    pub fn commit_update(&self, update: &RowSetMetadataUpdate) -> Result<RowSetRecord> {
        let mut record = self.record.lock()?;
        let (next, orphaned) = update.apply_to(&record)?;

        self.tablet.commit(MetadataEdit::UpdateRowSet {
            rowset: next.clone(),
            orphaned_blocks: orphaned.clone(),
        })?;

        tracing::debug!(
            rowset = self.id,
            orphaned = orphaned.len(),
            "Committed rowset update"
        );
        *record = next.clone();
        Ok(next)
    }

    /// Appends a redo delta block flushed from delta memstore `dms_id`.
    pub fn commit_redo_delta_data_block(&self, dms_id: u64, block: BlockId) -> Result<RowSetRecord> {
        let mut record = self.record.lock()?;
        let next = Self::with_redo_delta(&record, dms_id, block)?;
        self.tablet.commit(MetadataEdit::UpdateRowSet {
            rowset: next.clone(),
            orphaned_blocks: vec![],
        })?;
        *record = next.clone();
        Ok(next)
    }

    /// The record with `block` appended to the redo deltas, without
    /// committing it. Used when several rowsets change in one edit.
    pub(crate) fn prepare_redo_delta(&self, dms_id: u64, block: BlockId) -> Result<RowSetRecord> {
        let record = self.record.lock()?;
        Self::with_redo_delta(&record, dms_id, block)
    }

    /// Installs a record that was made durable by the caller.
    pub(crate) fn install(&self, next: RowSetRecord) -> Result<()> {
        if next.id != self.id {
            return Err(Error::InvalidArgument(format!(
                "record for rowset {} installed into rowset {}",
                next.id, self.id
            )));
        }
        *self.record.lock()? = next;
        Ok(())
    }

    fn with_redo_delta(record: &RowSetRecord, dms_id: u64, block: BlockId) -> Result<RowSetRecord> {
        if dms_id <= record.last_durable_redo_dms_id && !record.redo_delta_blocks.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "delta memstore {} is not newer than the last durable one ({}) of rowset {}",
                dms_id, record.last_durable_redo_dms_id, record.id
            )));
        }
        let mut next = record.clone();
        next.redo_delta_blocks.push(block);
        next.last_durable_redo_dms_id = dms_id;
        Ok(next)
    }
}

/// Exclusive right to flush into or compact a rowset. Released on drop.
pub struct RowSetClaim {
    rowset: Arc<RowSetMetadata>,
}

impl RowSetClaim {
    pub fn rowset(&self) -> &Arc<RowSetMetadata> {
        &self.rowset
    }
}

impl Drop for RowSetClaim {
    fn drop(&mut self) {
        self.rowset.claimed.store(false, Ordering::Release);
    }
}

/// A batch of block changes applied to a rowset in one commit.
#[derive(Debug, Default, Clone)]
pub struct RowSetMetadataUpdate {
    redo_replacements: Vec<(Vec<BlockId>, Vec<BlockId>)>,
    cols_to_replace: BTreeMap<ColumnId, BlockId>,
    cols_to_remove: Vec<ColumnId>,
    new_undo_block: Option<BlockId>,
    new_bloom_block: Option<BlockId>,
    remove_bloom_block: bool,
}

impl RowSetMetadataUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces `to_remove`, which must be a contiguous run of the rowset's
    /// redo blocks, with `to_add` in the same position.
    pub fn replace_redo_delta_blocks(mut self, to_remove: Vec<BlockId>, to_add: Vec<BlockId>) -> Self {
        self.redo_replacements.push((to_remove, to_add));
        self
    }

    pub fn replace_column_id(mut self, column: ColumnId, block: BlockId) -> Self {
        self.cols_to_replace.insert(column, block);
        self
    }

    pub fn remove_column_id(mut self, column: ColumnId) -> Self {
        self.cols_to_remove.push(column);
        self
    }

    pub fn set_new_undo_block(mut self, block: BlockId) -> Self {
        self.new_undo_block = Some(block);
        self
    }

    /// Replaces the rowset's bloom filter, built over its new base data.
    pub fn set_bloom_block(mut self, block: BlockId) -> Self {
        self.new_bloom_block = Some(block);
        self
    }

    /// Drops the rowset's bloom filter, for base data written without one.
    pub fn remove_bloom_block(mut self) -> Self {
        self.remove_bloom_block = true;
        self
    }

    /// The record after this update and the blocks it orphans.
    pub fn apply_to(&self, record: &RowSetRecord) -> Result<(RowSetRecord, Vec<BlockId>)> {
        let mut next = record.clone();
        let mut orphaned = Vec::new();

        for (to_remove, to_add) in &self.redo_replacements {
            let start = find_contiguous(&next.redo_delta_blocks, to_remove).ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "redo blocks {:?} are not a contiguous run of rowset {} redo blocks {:?}",
                    to_remove, record.id, next.redo_delta_blocks
                ))
            })?;
            next.redo_delta_blocks
                .splice(start..start + to_remove.len(), to_add.iter().copied());
            orphaned.extend(to_remove.iter().copied());
        }

        for (column, block) in &self.cols_to_replace {
            if let Some(old) = next.columns.insert(*column, *block) {
                orphaned.push(old);
            }
        }

        for column in &self.cols_to_remove {
            match next.columns.remove(column) {
                Some(old) => orphaned.push(old),
                None => {
                    return Err(Error::InvalidArgument(format!(
                        "rowset {} has no column {}",
                        record.id, column
                    )))
                }
            }
        }

        if let Some(block) = self.new_undo_block {
            next.undo_delta_blocks.insert(0, block);
        }

        if let Some(block) = self.new_bloom_block {
            if let Some(old) = next.bloom_block.replace(block) {
                orphaned.push(old);
            }
        } else if self.remove_bloom_block {
            orphaned.extend(next.bloom_block.take());
        }

        Ok((next, orphaned))
    }
}

fn find_contiguous(blocks: &[BlockId], run: &[BlockId]) -> Option<usize> {
    if run.is_empty() {
        return None;
    }
    blocks.windows(run.len()).position(|window| window == run)
}
