//! Rowset selection and history garbage collection for compactions.
//!
//! # Selection
//!
//! Merge compactions follow a universal, size-ratio strategy. Rowsets are
//! considered newest first; a run of rowsets is worth merging when each next
//! rowset is no larger than the sum of those already picked plus `size_ratio`
//! percent. This keeps rewrites proportional to the data they save and lets
//! small flushes coalesce before they are merged into larger rowsets.
//!
//! The policy only runs once `file_num_compaction_trigger` rowsets exist. If no
//! run satisfies the size ratio, the newest rowsets are merged until the count
//! drops back below the trigger, so reads never fan out without bound.
//!
//! # History GC
//!
//! Compaction output keeps every version a reader at or after the history
//! cutoff could observe. A version is dropped when, at the cutoff, a newer
//! version of the same key or a newer overwrite of one of its ancestors
//! shadows it. Tombstones themselves are only dropped when the whole tablet
//! is compacted, since a partial compaction cannot know whether older
//! versions survive in rowsets it did not read.

use std::ops::BitOr;
use std::sync::Arc;

use super::components::TabletComponents;
use super::diskrowset::DiskRowSet;
use super::iterator::MergingIterator;
use super::metadata::{MetadataEdit, DOCUMENT_COLUMN};
use super::rowset_metadata::{RowSetClaim, RowSetMetadata, RowSetMetadataUpdate};
use super::rowset_writer::{write_delta_block, RowSetWriter, WrittenRowSet};
use super::{Tablet, TabletStorage};
use crate::block::BlockId;
use crate::config::CompactionConfig;
use crate::docdb::{KvIterator, Value};
use crate::error::Result;
use crate::hybrid_time::{DocHybridTime, HybridTime};

/// Options for `Tablet::compact`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactFlags(u32);

impl CompactFlags {
    pub const NONE: CompactFlags = CompactFlags(0);
    /// Merge every rowset regardless of the policy.
    pub const FORCE_COMPACT_ALL: CompactFlags = CompactFlags(1);

    pub fn contains(self, other: CompactFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for CompactFlags {
    type Output = CompactFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        CompactFlags(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaCompactionType {
    /// Merge every redo block of a rowset into one.
    Minor,
    /// Fold redo blocks into the base data, moving shadowed history into a
    /// new undo block.
    Major,
}

/// What the policy sees of a rowset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowSetInfo {
    pub id: u64,
    pub size: u64,
}

/// Chooses the rowsets a merge compaction rewrites.
pub trait CompactionPolicy: Send + Sync {
    /// Ids of the rowsets to merge, or an empty list if none are worth it.
    /// `candidates` are unclaimed rowsets ordered oldest first.
    fn pick(&self, candidates: &[RowSetInfo], config: &CompactionConfig) -> Vec<u64>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct UniversalCompactionPolicy;

impl UniversalCompactionPolicy {
    fn pick_by_size_ratio(newest_first: &[RowSetInfo], config: &CompactionConfig) -> Vec<u64> {
        let min_width = config.min_merge_width.max(2);
        let max_width = config.max_merge_width.max(min_width);

        let mut start = 0;
        while start < newest_first.len() {
            if newest_first[start].size > config.max_file_size_for_compaction {
                start += 1;
                continue;
            }

            let mut picked = vec![newest_first[start].id];
            let mut total = newest_first[start].size;
            for next in &newest_first[start + 1..] {
                if picked.len() >= max_width
                    || next.size > config.max_file_size_for_compaction
                    || next.size as u128 > total as u128 * (100 + config.size_ratio as u128) / 100
                {
                    break;
                }
                picked.push(next.id);
                total += next.size;
            }

            if picked.len() >= min_width {
                return picked;
            }
            start += 1;
        }
        Vec::new()
    }

    fn pick_to_reduce_count(newest_first: &[RowSetInfo], config: &CompactionConfig) -> Vec<u64> {
        let excess = newest_first.len() + 2 - config.file_num_compaction_trigger.max(1);
        let width = excess.max(2).min(config.max_merge_width.max(2));
        let picked: Vec<u64> = newest_first
            .iter()
            .filter(|r| r.size <= config.max_file_size_for_compaction)
            .take(width)
            .map(|r| r.id)
            .collect();
        if picked.len() >= 2 {
            picked
        } else {
            Vec::new()
        }
    }
}

impl CompactionPolicy for UniversalCompactionPolicy {
    fn pick(&self, candidates: &[RowSetInfo], config: &CompactionConfig) -> Vec<u64> {
        if config.disable_compactions || candidates.len() < config.file_num_compaction_trigger.max(2) {
            return Vec::new();
        }
        let newest_first: Vec<RowSetInfo> = candidates.iter().rev().copied().collect();

        let picked = Self::pick_by_size_ratio(&newest_first, config);
        if !picked.is_empty() {
            return picked;
        }
        Self::pick_to_reduce_count(&newest_first, config)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDecision {
    Keep,
    Drop,
}

/// Decides which versions survive a compaction.
///
/// Entries must be fed in stored key order. The filter keeps, for every
/// ancestor of the current key, the time of its version visible at the
/// cutoff: a version older than any of those is invisible at every time a
/// reader may still use.
pub struct HistoryGcFilter {
    cutoff: HybridTime,
    drop_tombstones: bool,
    /// Key without hybrid time and the time its visible version overwrites
    /// descendants at.
    overwrites: Vec<(Vec<u8>, DocHybridTime)>,
    dropped: u64,
}

impl HistoryGcFilter {
    pub fn new(cutoff: HybridTime, drop_tombstones: bool) -> Self {
        Self {
            cutoff,
            drop_tombstones,
            overwrites: Vec::new(),
            dropped: 0,
        }
    }

    pub fn cutoff(&self) -> HybridTime {
        self.cutoff
    }

    pub fn num_dropped(&self) -> u64 {
        self.dropped
    }

    pub fn filter(&mut self, key: &[u8], value: &[u8]) -> Result<FilterDecision> {
        let decision = self.decide(key, value)?;
        if decision == FilterDecision::Drop {
            self.dropped += 1;
        }
        Ok(decision)
    }

    fn decide(&mut self, key: &[u8], value: &[u8]) -> Result<FilterDecision> {
        let dht = DocHybridTime::decode_from_end(key)?;
        let key_without_ht = &key[..key.len() - DocHybridTime::ENCODED_SIZE];

        while let Some((top, _)) = self.overwrites.last() {
            if key_without_ht.starts_with(top) {
                break;
            }
            self.overwrites.pop();
        }

        if dht.hybrid_time() > self.cutoff {
            return Ok(FilterDecision::Keep);
        }

        let shadowed_at = self
            .overwrites
            .iter()
            .map(|(_, at)| *at)
            .max()
            .unwrap_or(DocHybridTime::MIN);
        let same_key_seen = self
            .overwrites
            .last()
            .is_some_and(|(top, _)| top.as_slice() == key_without_ht);
        if same_key_seen || dht < shadowed_at {
            return Ok(FilterDecision::Drop);
        }

        // The version visible at the cutoff.
        let value = Value::decode(value)?;
        let (overwrite_at, deleted) = match value.expiry(dht.hybrid_time()) {
            Some(expiry) if self.cutoff > expiry => (DocHybridTime::new(expiry, 0), true),
            _ => (dht, value.is_tombstone()),
        };
        self.overwrites.push((key_without_ht.to_vec(), overwrite_at));

        if deleted && self.drop_tombstones {
            Ok(FilterDecision::Drop)
        } else {
            Ok(FilterDecision::Keep)
        }
    }
}

/// Rowsets claimed for one compaction, released on drop.
struct CompactionInputs {
    _claims: Vec<RowSetClaim>,
    rowsets: Vec<Arc<DiskRowSet>>,
}

impl CompactionInputs {
    fn ids(&self) -> Vec<u64> {
        self.rowsets.iter().map(|r| r.id()).collect()
    }

    fn blocks(&self) -> Vec<BlockId> {
        self.rowsets.iter().flat_map(|r| r.record().blocks()).collect()
    }
}

impl Tablet {
    /// Merges rowsets picked by the compaction policy, or every rowset with
    /// `FORCE_COMPACT_ALL`. Returns how many rowsets were merged.
    pub fn compact(&self, flags: CompactFlags) -> Result<usize> {
        let _op = self.start_op()?;
        let force = flags.contains(CompactFlags::FORCE_COMPACT_ALL);

        let Some((inputs, whole_tablet)) = self.select_rowsets(force)? else {
            return Ok(0);
        };
        self.compaction_hooks()?.post_select_iterators()?;

        let num_inputs = inputs.rowsets.len();
        self.merge_rowsets(&inputs, whole_tablet)?;
        drop(inputs);
        Ok(num_inputs)
    }

    /// Claims the rowsets to merge. The selection lock keeps two compactions
    /// from racing for the same rowsets.
    fn select_rowsets(&self, force: bool) -> Result<Option<(CompactionInputs, bool)>> {
        let _select = self.compact_select_lock.lock()?;
        let components = self.components()?;

        let candidates: Vec<RowSetInfo> = components
            .rowsets
            .rowsets()
            .iter()
            .filter(|r| !r.metadata().is_claimed())
            .map(|r| RowSetInfo {
                id: r.id(),
                size: r.size(),
            })
            .collect();
        let picked = if force {
            candidates.iter().map(|c| c.id).collect()
        } else {
            self.policy.pick(&candidates, &self.config.compaction)
        };

        let mut inputs = CompactionInputs {
            _claims: Vec::new(),
            rowsets: Vec::new(),
        };
        for id in picked {
            let Some(rowset) = components.rowsets.get(id) else {
                continue;
            };
            if let Some((claim, current)) = self.claim_current(rowset)? {
                inputs._claims.push(claim);
                inputs.rowsets.push(current);
            }
        }

        let min_inputs = if force { 1 } else { 2 };
        if inputs.rowsets.len() < min_inputs {
            return Ok(None);
        }
        let whole_tablet = inputs.rowsets.len() == components.rowsets.len();
        Ok(Some((inputs, whole_tablet)))
    }

    fn merge_rowsets(&self, inputs: &CompactionInputs, whole_tablet: bool) -> Result<()> {
        let storage = self.storage()?;
        let common_hooks = self.common_hooks()?;
        let input_ids = inputs.ids();

        // Memrowsets only hold writes newer than anything on disk, so
        // tombstones can go once every rowset takes part.
        let cutoff = self.advance_history_cutoff()?;
        let mut filter = HistoryGcFilter::new(cutoff, whole_tablet);
        common_hooks.post_take_mvcc_snapshot()?;

        tracing::info!(
            rowsets = ?input_ids,
            whole_tablet,
            %cutoff,
            "Starting rowset compaction"
        );

        let children: Vec<Box<dyn KvIterator>> = inputs
            .rowsets
            .iter()
            .map(|r| Box::new(r.new_iterator()) as Box<dyn KvIterator>)
            .collect();
        let mut iter = MergingIterator::new(children);
        let mut writer = RowSetWriter::new(&storage.blocks, &self.config)?;
        let mut entries = 0u64;

        iter.seek_to_first()?;
        while iter.valid() {
            entries += 1;
            if filter.filter(iter.key(), iter.value())? == FilterDecision::Keep {
                writer.add(iter.key(), iter.value())?;
            }
            iter.next()?;
        }
        let written = writer.finish()?;
        let written_blocks = written.as_ref().map(|w| w.block_ids()).unwrap_or_default();

        let result = self.install_merged(inputs, written, &storage);
        if let Err(e) = result {
            for id in written_blocks {
                if let Err(cleanup) = storage.blocks.delete_block(id) {
                    tracing::warn!(block = %id, error = %cleanup, "Failed to remove unused block");
                }
            }
            tracing::warn!(rowsets = ?input_ids, error = %e, "Rowset compaction failed");
            return Err(e);
        }

        tracing::info!(
            rowsets = ?input_ids,
            entries,
            dropped = filter.num_dropped(),
            "Completed rowset compaction"
        );
        Ok(())
    }

    fn install_merged(
        &self,
        inputs: &CompactionInputs,
        written: Option<WrittenRowSet>,
        storage: &TabletStorage,
    ) -> Result<()> {
        let common_hooks = self.common_hooks()?;
        common_hooks.post_write_snapshot()?;

        let input_ids = inputs.ids();
        // The output takes the oldest input's id and with it its place in
        // the age order the policy relies on.
        let output = match (written, input_ids.iter().min()) {
            (Some(written), Some(id)) => {
                let record = written.into_record(*id);
                let metadata = Arc::new(RowSetMetadata::new(storage.metadata.clone(), record.clone()));
                Some((record, Arc::new(DiskRowSet::open(metadata, &storage.blocks)?)))
            }
            _ => None,
        };

        storage.metadata.commit(MetadataEdit::Compaction {
            removed_rowsets: input_ids.clone(),
            added_rowsets: output.iter().map(|(record, _)| record.clone()).collect(),
            orphaned_blocks: inputs.blocks(),
        })?;

        let added: Vec<Arc<DiskRowSet>> = output.into_iter().map(|(_, disk)| disk).collect();
        self.swap_components(|current| {
            Ok(TabletComponents {
                memrowset: current.memrowset.clone(),
                frozen: current.frozen.clone(),
                rowsets: Arc::new(current.rowsets.replace(&input_ids, added)?),
            })
        })?;
        common_hooks.post_swap_new_rowset()
    }

    /// Compacts the deltas of the rowset that benefits most. Returns the id
    /// of the compacted rowset, if any needed it.
    pub fn compact_worst_deltas(&self, kind: DeltaCompactionType) -> Result<Option<u64>> {
        let _op = self.start_op()?;
        let min_blocks = match kind {
            DeltaCompactionType::Minor => 2,
            DeltaCompactionType::Major => 1,
        };

        let (claim, rowset) = {
            let _select = self.compact_select_lock.lock()?;
            let components = self.components()?;
            let mut worst: Option<(RowSetClaim, Arc<DiskRowSet>)> = None;
            let mut by_redo: Vec<&Arc<DiskRowSet>> = components
                .rowsets
                .rowsets()
                .iter()
                .filter(|r| r.num_redo_blocks() >= min_blocks)
                .collect();
            by_redo.sort_by_key(|r| std::cmp::Reverse((r.num_redo_blocks(), r.redo_size())));
            for rowset in by_redo {
                if let Some(claimed) = self.claim_current(rowset)? {
                    worst = Some(claimed);
                    break;
                }
            }
            match worst {
                Some(worst) => worst,
                None => return Ok(None),
            }
        };
        self.compaction_hooks()?.post_select_iterators()?;

        let result = match kind {
            DeltaCompactionType::Minor => self.minor_delta_compaction(&rowset),
            DeltaCompactionType::Major => self.major_delta_compaction(&rowset),
        };
        drop(claim);
        result.map(|()| Some(rowset.id()))
    }

    fn minor_delta_compaction(&self, rowset: &Arc<DiskRowSet>) -> Result<()> {
        let storage = self.storage()?;
        let common_hooks = self.common_hooks()?;
        common_hooks.post_take_mvcc_snapshot()?;

        let mut iter = rowset.new_redo_iterator();
        let mut run = storage.blocks.create_run(self.config.block_size)?;
        iter.seek_to_first()?;
        while iter.valid() {
            run.add(iter.key(), iter.value())?;
            iter.next()?;
        }
        let merged = run.finish()?;

        let redo_blocks = rowset.record().redo_delta_blocks.clone();
        let update = RowSetMetadataUpdate::new().replace_redo_delta_blocks(redo_blocks.clone(), vec![merged.id]);
        let result = self.install_delta_update(rowset, &update, &storage);
        if let Err(e) = result {
            if let Err(cleanup) = storage.blocks.delete_block(merged.id) {
                tracing::warn!(block = %merged.id, error = %cleanup, "Failed to remove unused block");
            }
            tracing::warn!(rowset = rowset.id(), error = %e, "Minor delta compaction failed");
            return Err(e);
        }

        tracing::info!(
            rowset = rowset.id(),
            redo_blocks = redo_blocks.len(),
            entries = merged.num_entries,
            "Completed minor delta compaction"
        );
        Ok(())
    }

    fn major_delta_compaction(&self, rowset: &Arc<DiskRowSet>) -> Result<()> {
        let storage = self.storage()?;
        let common_hooks = self.common_hooks()?;
        let cutoff = self.advance_history_cutoff()?;
        let mut filter = HistoryGcFilter::new(cutoff, false);
        common_hooks.post_take_mvcc_snapshot()?;

        let mut iter = rowset.new_redo_and_base_iterator();
        let mut writer = RowSetWriter::new(&storage.blocks, &self.config)?;
        let mut undo = Vec::new();
        iter.seek_to_first()?;
        while iter.valid() {
            match filter.filter(iter.key(), iter.value())? {
                FilterDecision::Keep => writer.add(iter.key(), iter.value())?,
                FilterDecision::Drop => undo.push((iter.key().to_vec(), iter.value().to_vec())),
            }
            iter.next()?;
        }
        let base = writer.finish()?;
        let mut written_blocks = base.as_ref().map(|b| b.block_ids()).unwrap_or_default();
        let undo_run = match write_delta_block(&storage.blocks, self.config.block_size, undo) {
            Ok(run) => run,
            Err(e) => {
                for id in written_blocks {
                    if let Err(cleanup) = storage.blocks.delete_block(id) {
                        tracing::warn!(block = %id, error = %cleanup, "Failed to remove unused block");
                    }
                }
                return Err(e);
            }
        };
        written_blocks.extend(undo_run.as_ref().map(|run| run.id));

        let record = rowset.record();
        let mut update =
            RowSetMetadataUpdate::new().replace_redo_delta_blocks(record.redo_delta_blocks.clone(), vec![]);
        update = match &base {
            Some(base) => {
                let update = update.replace_column_id(DOCUMENT_COLUMN, base.data.id);
                match base.bloom_block {
                    Some(bloom) => update.set_bloom_block(bloom),
                    None => update.remove_bloom_block(),
                }
            }
            None if record.columns.contains_key(&DOCUMENT_COLUMN) => {
                update.remove_column_id(DOCUMENT_COLUMN).remove_bloom_block()
            }
            None => update.remove_bloom_block(),
        };
        if let Some(run) = &undo_run {
            update = update.set_new_undo_block(run.id);
        }

        let result = self.install_delta_update(rowset, &update, &storage);
        if let Err(e) = result {
            for id in written_blocks {
                if let Err(cleanup) = storage.blocks.delete_block(id) {
                    tracing::warn!(block = %id, error = %cleanup, "Failed to remove unused block");
                }
            }
            tracing::warn!(rowset = rowset.id(), error = %e, "Major delta compaction failed");
            return Err(e);
        }

        tracing::info!(
            rowset = rowset.id(),
            redo_blocks = record.redo_delta_blocks.len(),
            moved_to_undo = filter.num_dropped(),
            %cutoff,
            "Completed major delta compaction"
        );
        Ok(())
    }

    /// Commits `update` to a claimed rowset and swaps the reopened rowset in.
    fn install_delta_update(
        &self,
        rowset: &Arc<DiskRowSet>,
        update: &RowSetMetadataUpdate,
        storage: &TabletStorage,
    ) -> Result<()> {
        let common_hooks = self.common_hooks()?;
        common_hooks.post_write_snapshot()?;

        let metadata = rowset.metadata().clone();
        let (preview, _) = update.apply_to(&metadata.record()?)?;
        let reopened = Arc::new(DiskRowSet::open_record(metadata.clone(), preview, &storage.blocks)?);
        metadata.commit_update(update)?;

        self.swap_components(|current| {
            Ok(TabletComponents {
                memrowset: current.memrowset.clone(),
                frozen: current.frozen.clone(),
                rowsets: Arc::new(current.rowsets.replace(&[rowset.id()], vec![reopened])?),
            })
        })?;
        common_hooks.post_swap_new_rowset()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::docdb::{DocKey, SubDocKey};

    fn infos(sizes: &[u64]) -> Vec<RowSetInfo> {
        sizes
            .iter()
            .enumerate()
            .map(|(i, size)| RowSetInfo {
                id: i as u64,
                size: *size,
            })
            .collect()
    }

    #[test]
    fn test_policy_waits_for_trigger() {
        let config = CompactionConfig::default();
        let policy = UniversalCompactionPolicy;
        assert!(policy.pick(&infos(&[10, 10, 10, 10]), &config).is_empty());
        assert_eq!(policy.pick(&infos(&[10, 10, 10, 10, 10]), &config).len(), 5);
    }

    #[test]
    fn test_policy_skips_large_old_rowset() {
        let config = CompactionConfig::default();
        // Newest first: 10, 10, 11, 12, then 1000 is far above the ratio.
        let picked = UniversalCompactionPolicy.pick(&infos(&[1000, 12, 11, 10, 10]), &config);
        assert_eq!(picked, vec![4, 3, 2, 1]);
    }

    #[test]
    fn test_policy_falls_back_to_count() {
        let config = CompactionConfig::default().min_merge_width(4);
        // Every rowset is much larger than the newer ones combined.
        let picked = UniversalCompactionPolicy.pick(&infos(&[100000, 10000, 1000, 100, 10]), &config);
        assert_eq!(picked, vec![4, 3]);
    }

    #[test]
    fn test_policy_respects_limits() {
        let config = CompactionConfig::default()
            .max_merge_width(4)
            .max_file_size_for_compaction(50);
        let picked = UniversalCompactionPolicy.pick(&infos(&[10, 10, 10, 10, 10, 10]), &config);
        assert_eq!(picked, vec![5, 4, 3, 2]);

        let disabled = CompactionConfig::default().disable_compactions(true);
        assert!(UniversalCompactionPolicy
            .pick(&infos(&[10, 10, 10, 10, 10]), &disabled)
            .is_empty());
    }

    #[test]
    fn test_compact_flags() {
        let flags = CompactFlags::NONE | CompactFlags::FORCE_COMPACT_ALL;
        assert!(flags.contains(CompactFlags::FORCE_COMPACT_ALL));
        assert!(!CompactFlags::NONE.contains(CompactFlags::FORCE_COMPACT_ALL));
    }

    fn key(path: &[&str], micros: u64) -> Vec<u8> {
        let subkeys = path[1..].iter().map(|s| (*s).into()).collect();
        SubDocKey::new(DocKey::from_components([path[0]]), subkeys)
            .with_hybrid_time(DocHybridTime::new(HybridTime::from_micros(micros), 0))
            .encode()
            .into_vec()
    }

    fn run(filter: &mut HistoryGcFilter, entries: Vec<(Vec<u8>, Value)>) -> Vec<FilterDecision> {
        let mut entries: Vec<(Vec<u8>, Vec<u8>)> = entries
            .into_iter()
            .map(|(k, v)| (k, v.encode().unwrap()))
            .collect();
        entries.sort();
        entries
            .iter()
            .map(|(k, v)| filter.filter(k, v).unwrap())
            .collect()
    }

    #[test]
    fn test_drops_versions_shadowed_at_cutoff() {
        use FilterDecision::*;
        let mut filter = HistoryGcFilter::new(HybridTime::from_micros(20), false);
        let decisions = run(
            &mut filter,
            vec![
                (key(&["r", "a"], 30), Value::new(3i64)),
                (key(&["r", "a"], 15), Value::new(2i64)),
                (key(&["r", "a"], 5), Value::new(1i64)),
                (key(&["r", "b"], 5), Value::new(1i64)),
            ],
        );
        // Sorted newest first within a key: a@30, a@15, a@5, b@5.
        assert_eq!(decisions, vec![Keep, Keep, Drop, Keep]);
        assert_eq!(filter.num_dropped(), 1);
    }

    #[test]
    fn test_ancestor_overwrite_shadows_children() {
        use FilterDecision::*;
        let mut filter = HistoryGcFilter::new(HybridTime::from_micros(20), false);
        let decisions = run(
            &mut filter,
            vec![
                (key(&["r"], 10), Value::tombstone()),
                (key(&["r", "a"], 5), Value::new(1i64)),
                (key(&["r", "a"], 12), Value::new(2i64)),
                (key(&["r", "b"], 25), Value::new(3i64)),
            ],
        );
        // r@10, then r.a@12, r.a@5, r.b@25.
        assert_eq!(decisions, vec![Keep, Keep, Drop, Keep]);
    }

    #[test]
    fn test_tombstones_dropped_only_when_requested() {
        use FilterDecision::*;
        let entries = || {
            vec![
                (key(&["r", "a"], 10), Value::tombstone()),
                (key(&["r", "a"], 5), Value::new(1i64)),
            ]
        };
        let mut partial = HistoryGcFilter::new(HybridTime::from_micros(20), false);
        assert_eq!(run(&mut partial, entries()), vec![Keep, Drop]);

        let mut full = HistoryGcFilter::new(HybridTime::from_micros(20), true);
        assert_eq!(run(&mut full, entries()), vec![Drop, Drop]);
    }

    #[test]
    fn test_expired_value_acts_as_tombstone_at_expiry() {
        use FilterDecision::*;
        let mut filter = HistoryGcFilter::new(HybridTime::from_micros(30), true);
        let decisions = run(
            &mut filter,
            vec![
                (key(&["r"], 10), Value::object().with_ttl(Duration::from_micros(5))),
                (key(&["r", "a"], 12), Value::new(1i64)),
                (key(&["r", "b"], 20), Value::new(2i64)),
            ],
        );
        // The object expired at 15: r.a written before that is gone, r.b is not.
        assert_eq!(decisions, vec![Drop, Drop, Keep]);
    }
}
