//! Moving memrowsets to disk.
//!
//! A flush has two halves. Freezing swaps a fresh memrowset in under the
//! exclusive component lock; the frozen one keeps serving reads. Writing then
//! waits for every write that captured the frozen memrowset, routes its
//! entries and commits the result in a single metadata edit before swapping
//! the new rowsets in and dropping the frozen memrowset.
//!
//! Entries of documents that fall inside an existing rowset's key range go to
//! a redo delta block of that rowset, so the rowset tree does not fill with
//! overlapping rowsets. Rowsets busy with a compaction are left alone and
//! their documents go to the new rowset instead.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::components::{RowSetTree, TabletComponents};
use super::diskrowset::DiskRowSet;
use super::memrowset::MemRowSet;
use super::metadata::{MetadataEdit, RowSetRecord};
use super::rowset_metadata::{RowSetClaim, RowSetMetadata};
use super::rowset_writer::{write_delta_block, RowSetWriter};
use super::Tablet;
use crate::block::BlockId;
use crate::docdb::{DocKey, KvIterator};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Freeze the memrowset and write it out before returning.
    Sync,
    /// Freeze the memrowset and leave writing it to the background flush task.
    Async,
}

/// Where the entries of one document go.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Target {
    NewRowSet,
    Redo(u64),
}

/// Redo entries for one existing rowset, written under its claim.
struct RedoTarget {
    claim: RowSetClaim,
    entries: Vec<(Vec<u8>, Vec<u8>)>,
}

impl Tablet {
    pub fn flush(&self, mode: FlushMode) -> Result<()> {
        let _op = self.start_op()?;
        self.freeze_memrowset()?;
        match mode {
            FlushMode::Sync => {
                self.flush_frozen_memrowsets()?;
            }
            FlushMode::Async => {}
        }
        Ok(())
    }

    /// Flushes if the active memrowset has outgrown its limit. Returns whether
    /// it did.
    pub fn flush_if_needed(&self) -> Result<bool> {
        if self.memrowset_size()? < self.config.max_memrowset_size {
            return Ok(false);
        }
        self.flush(FlushMode::Sync)?;
        Ok(true)
    }

    /// Whether frozen memrowsets are waiting to be written.
    pub fn has_frozen_memrowsets(&self) -> Result<bool> {
        Ok(!self.components()?.frozen.is_empty())
    }

    /// Swaps an empty memrowset in. Returns `false` if the active one was
    /// already empty.
    fn freeze_memrowset(&self) -> Result<bool> {
        let frozen_id = {
            let mut components = self.components.write()?;
            if components.memrowset.is_empty() {
                return Ok(false);
            }
            let id = self.next_memrowset_id.fetch_add(1, Ordering::SeqCst);
            let mut frozen = components.frozen.clone();
            frozen.push(components.memrowset.clone());
            let frozen_id = components.memrowset.id();
            *components = Arc::new(TabletComponents {
                memrowset: Arc::new(MemRowSet::new(id)),
                frozen,
                rowsets: components.rowsets.clone(),
            });
            frozen_id
        };

        tracing::debug!(memrowset = frozen_id, "Froze memrowset");
        self.flush_hooks()?.post_swap_new_memrowset()?;
        Ok(true)
    }

    /// Writes every frozen memrowset, oldest first. Returns how many were
    /// written. A failure leaves the failed memrowset frozen for a retry.
    pub fn flush_frozen_memrowsets(&self) -> Result<usize> {
        let _op = self.start_op()?;
        let _flush = self.flush_lock.lock()?;

        let mut flushed = 0;
        while let Some(memrowset) = self.components()?.frozen.first().cloned() {
            self.flush_memrowset(&memrowset)?;
            flushed += 1;
        }
        Ok(flushed)
    }

    fn flush_memrowset(&self, memrowset: &Arc<MemRowSet>) -> Result<()> {
        let storage = self.storage()?;
        let common_hooks = self.common_hooks()?;

        // Every write that captured this memrowset got a time no later than
        // the last one assigned now.
        let boundary = self.mvcc.last_assigned()?;
        self.mvcc.wait_for_applying_before(boundary)?;
        common_hooks.post_take_mvcc_snapshot()?;

        let components = self.components()?;
        let mut redo: BTreeMap<u64, RedoTarget> = BTreeMap::new();
        let mut writer = RowSetWriter::new(&storage.blocks, &self.config)?;

        let mut iter = memrowset.iter();
        iter.seek_to_first()?;
        let mut current: Option<(Vec<u8>, Target)> = None;
        while iter.valid() {
            let key = iter.key();
            let doc_key_len = DocKey::encoded_len(key)?;
            let target = match &current {
                Some((doc_key, target)) if doc_key.as_slice() == &key[..doc_key_len] => *target,
                _ => {
                    let doc_key = key[..doc_key_len].to_vec();
                    let target = self.route(&components.rowsets, &doc_key, &mut redo)?;
                    current = Some((doc_key, target));
                    target
                }
            };
            match target {
                Target::NewRowSet => writer.add(key, iter.value())?,
                Target::Redo(id) => {
                    if let Some(redo) = redo.get_mut(&id) {
                        redo.entries.push((key.to_vec(), iter.value().to_vec()));
                    }
                }
            }
            iter.next()?;
        }

        let mut written_blocks: Vec<BlockId> = Vec::new();
        let result = self.write_and_install(memrowset, &storage, writer, &mut redo, &mut written_blocks);
        if let Err(e) = result {
            for id in written_blocks {
                if let Err(cleanup) = storage.blocks.delete_block(id) {
                    tracing::warn!(block = %id, error = %cleanup, "Failed to remove unused block");
                }
            }
            tracing::warn!(memrowset = memrowset.id(), error = %e, "Flush failed");
            return Err(e);
        }
        Ok(())
    }

    /// Picks the rowset a document's entries go to, claiming it on first use.
    fn route(
        &self,
        rowsets: &RowSetTree,
        doc_key: &[u8],
        redo: &mut BTreeMap<u64, RedoTarget>,
    ) -> Result<Target> {
        if !self.config.flush_to_redo_deltas {
            return Ok(Target::NewRowSet);
        }
        // Newest covering rowset first.
        for rowset in rowsets.covering(doc_key).collect::<Vec<_>>().into_iter().rev() {
            if redo.contains_key(&rowset.id()) {
                return Ok(Target::Redo(rowset.id()));
            }
            if let Some((claim, _)) = self.claim_current(rowset)? {
                redo.insert(
                    rowset.id(),
                    RedoTarget {
                        claim,
                        entries: Vec::new(),
                    },
                );
                return Ok(Target::Redo(rowset.id()));
            }
        }
        Ok(Target::NewRowSet)
    }

    fn write_and_install(
        &self,
        memrowset: &Arc<MemRowSet>,
        storage: &super::TabletStorage,
        writer: RowSetWriter<'_>,
        redo: &mut BTreeMap<u64, RedoTarget>,
        written_blocks: &mut Vec<BlockId>,
    ) -> Result<()> {
        let common_hooks = self.common_hooks()?;
        let blocks = &storage.blocks;

        let new_rowset = writer.finish()?;
        if let Some(written) = &new_rowset {
            written_blocks.extend(written.block_ids());
        }

        let mut updated: Vec<(Arc<RowSetMetadata>, RowSetRecord, Arc<DiskRowSet>)> = Vec::new();
        for target in redo.values_mut() {
            let entries = std::mem::take(&mut target.entries);
            let Some(run) = write_delta_block(blocks, self.config.block_size, entries)? else {
                continue;
            };
            written_blocks.push(run.id);
            let metadata = target.claim.rowset().clone();
            let record = metadata.prepare_redo_delta(memrowset.id(), run.id)?;
            let reopened = DiskRowSet::open_record(metadata.clone(), record.clone(), blocks)?;
            updated.push((metadata, record, Arc::new(reopened)));
        }
        common_hooks.post_write_snapshot()?;

        let new_record = match new_rowset {
            Some(written) => Some(written.into_record(storage.metadata.allocate_rowset_id()?)),
            None => None,
        };
        let new_disk = match &new_record {
            Some(record) => {
                let metadata = Arc::new(RowSetMetadata::new(storage.metadata.clone(), record.clone()));
                Some(Arc::new(DiskRowSet::open(metadata, blocks)?))
            }
            None => None,
        };

        storage.metadata.commit(MetadataEdit::Flush {
            new_rowset: new_record,
            updated_rowsets: updated.iter().map(|(_, record, _)| record.clone()).collect(),
        })?;
        // Durable from here on: the blocks must not be cleaned up any more.
        written_blocks.clear();
        for (metadata, record, _) in &updated {
            metadata.install(record.clone())?;
        }

        let replaced: Vec<u64> = updated.iter().map(|(metadata, _, _)| metadata.id()).collect();
        let mut added: Vec<Arc<DiskRowSet>> = updated.into_iter().map(|(_, _, disk)| disk).collect();
        let new_id = new_disk.as_ref().map(|disk| disk.id());
        added.extend(new_disk);

        self.swap_components(|current| {
            Ok(TabletComponents {
                memrowset: current.memrowset.clone(),
                frozen: current
                    .frozen
                    .iter()
                    .filter(|m| m.id() != memrowset.id())
                    .cloned()
                    .collect(),
                rowsets: Arc::new(current.rowsets.replace(&replaced, added)?),
            })
        })?;
        common_hooks.post_swap_new_rowset()?;

        tracing::info!(
            memrowset = memrowset.id(),
            entries = memrowset.len(),
            new_rowset = ?new_id,
            redo_rowsets = ?replaced,
            "Flushed memrowset"
        );
        Ok(())
    }
}
