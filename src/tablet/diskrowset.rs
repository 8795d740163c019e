//! Immutable view of an on-disk rowset.
//!
//! A `DiskRowSet` is opened from a snapshot of its `RowSetMetadata`. When the
//! rowset's blocks change (a redo delta is flushed into it, or a delta
//! compaction rewrites it) a new `DiskRowSet` is opened and swapped into the
//! tablet components; readers holding the old one keep reading the blocks it
//! opened.

use std::fmt;
use std::sync::Arc;

use super::iterator::MergingIterator;
use super::metadata::RowSetRecord;
use super::rowset_metadata::RowSetMetadata;
use crate::block::{BlockManager, BloomFilter, RunReader};
use crate::docdb::KvIterator;
use crate::error::Result;

pub struct DiskRowSet {
    metadata: Arc<RowSetMetadata>,
    record: RowSetRecord,
    base: Vec<Arc<RunReader>>,
    /// Oldest first.
    redo: Vec<Arc<RunReader>>,
    undo: Vec<Arc<RunReader>>,
    bloom: Option<BloomFilter>,
}

impl DiskRowSet {
    pub fn open(metadata: Arc<RowSetMetadata>, blocks: &BlockManager) -> Result<Self> {
        let record = metadata.record()?;
        Self::open_record(metadata, record, blocks)
    }

    /// Opens the blocks of `record`, a state of `metadata` that may not be
    /// committed yet.
    pub fn open_record(
        metadata: Arc<RowSetMetadata>,
        record: RowSetRecord,
        blocks: &BlockManager,
    ) -> Result<Self> {
        let base = record
            .columns
            .values()
            .map(|id| blocks.open_run(*id))
            .collect::<Result<Vec<_>>>()?;
        let redo = record
            .redo_delta_blocks
            .iter()
            .map(|id| blocks.open_run(*id))
            .collect::<Result<Vec<_>>>()?;
        let undo = record
            .undo_delta_blocks
            .iter()
            .map(|id| blocks.open_run(*id))
            .collect::<Result<Vec<_>>>()?;
        let bloom = match record.bloom_block {
            Some(id) => Some(blocks.read_bloom(id)?),
            None => None,
        };

        Ok(Self {
            metadata,
            record,
            base,
            redo,
            undo,
            bloom,
        })
    }

    pub fn id(&self) -> u64 {
        self.record.id
    }

    pub fn metadata(&self) -> &Arc<RowSetMetadata> {
        &self.metadata
    }

    pub fn record(&self) -> &RowSetRecord {
        &self.record
    }

    /// Bytes on disk across every block.
    pub fn size(&self) -> u64 {
        self.base
            .iter()
            .chain(&self.redo)
            .chain(&self.undo)
            .map(|run| run.size())
            .sum()
    }

    pub fn base_size(&self) -> u64 {
        self.base.iter().map(|run| run.size()).sum()
    }

    pub fn redo_size(&self) -> u64 {
        self.redo.iter().map(|run| run.size()).sum()
    }

    pub fn num_redo_blocks(&self) -> usize {
        self.redo.len()
    }

    pub fn num_undo_blocks(&self) -> usize {
        self.undo.len()
    }

    /// Whether `doc_key` falls inside this rowset's key range.
    pub fn covers(&self, doc_key: &[u8]) -> bool {
        self.record.contains_doc_key(doc_key)
    }

    /// Whether this rowset may hold entries for `doc_key`. The bloom filter only
    /// covers the base data, so a rowset with redo deltas is always checked.
    pub fn may_contain(&self, doc_key: &[u8]) -> bool {
        if !self.covers(doc_key) {
            return false;
        }
        match &self.bloom {
            Some(bloom) if self.redo.is_empty() => bloom.may_contain(doc_key),
            _ => true,
        }
    }

    /// Every entry of the rowset: redo deltas, base data and undo deltas.
    pub fn new_iterator(&self) -> MergingIterator {
        let children = self
            .redo
            .iter()
            .rev()
            .chain(&self.base)
            .chain(&self.undo)
            .map(|run| Box::new(run.iter()) as Box<dyn KvIterator>)
            .collect();
        MergingIterator::new(children)
    }

    /// Redo deltas and base data, without undo history.
    pub fn new_redo_and_base_iterator(&self) -> MergingIterator {
        let children = self
            .redo
            .iter()
            .rev()
            .chain(&self.base)
            .map(|run| Box::new(run.iter()) as Box<dyn KvIterator>)
            .collect();
        MergingIterator::new(children)
    }

    /// Redo deltas only.
    pub fn new_redo_iterator(&self) -> MergingIterator {
        let children = self
            .redo
            .iter()
            .rev()
            .map(|run| Box::new(run.iter()) as Box<dyn KvIterator>)
            .collect();
        MergingIterator::new(children)
    }
}

impl fmt::Debug for DiskRowSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskRowSet")
            .field("id", &self.record.id)
            .field("base", &self.base.len())
            .field("redo", &self.redo.len())
            .field("undo", &self.undo.len())
            .field("size", &self.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockId;
    use crate::rate_limiter::RateLimiter;
    use crate::tablet::metadata::{MetadataEdit, TabletMetadata, DOCUMENT_COLUMN};
    use crate::tmpfs::TempDir;

    fn write_run(blocks: &BlockManager, keys: &[&str]) -> BlockId {
        let mut writer = blocks.create_run(4096).unwrap();
        for key in keys {
            writer.add(key.as_bytes(), b"v").unwrap();
        }
        writer.finish().unwrap().id
    }

    fn keys(iter: &mut MergingIterator) -> Vec<String> {
        iter.seek_to_first().unwrap();
        let mut keys = Vec::new();
        while iter.valid() {
            keys.push(String::from_utf8(iter.key().to_vec()).unwrap());
            iter.next().unwrap();
        }
        keys
    }

    #[test]
    fn test_reads_base_and_deltas() {
        let dir = TempDir::new().unwrap();
        let blocks = BlockManager::open(dir.path(), Arc::new(RateLimiter::unlimited())).unwrap();
        let tablet = Arc::new(TabletMetadata::open(dir.path(), 100).unwrap());

        let mut record = RowSetRecord::new(0);
        record.columns.insert(DOCUMENT_COLUMN, write_run(&blocks, &["b", "d"]));
        record.redo_delta_blocks = vec![write_run(&blocks, &["c"])];
        record.undo_delta_blocks = vec![write_run(&blocks, &["a"])];
        let mut bloom = BloomFilter::new(2, 0.01);
        bloom.insert(b"b");
        bloom.insert(b"d");
        record.bloom_block = Some(blocks.write_bloom(&bloom).unwrap());
        record.min_doc_key = b"b".to_vec();
        record.max_doc_key = b"d".to_vec();
        tablet
            .commit(MetadataEdit::Flush {
                new_rowset: Some(record.clone()),
                updated_rowsets: vec![],
            })
            .unwrap();

        let metadata = Arc::new(RowSetMetadata::new(tablet, record));
        let rowset = DiskRowSet::open(metadata, &blocks).unwrap();

        assert_eq!(keys(&mut rowset.new_iterator()), vec!["a", "b", "c", "d"]);
        assert_eq!(keys(&mut rowset.new_redo_and_base_iterator()), vec!["b", "c", "d"]);
        assert_eq!(keys(&mut rowset.new_redo_iterator()), vec!["c"]);
        assert_eq!(rowset.num_redo_blocks(), 1);
        assert!(rowset.size() > 0);

        // Redo deltas make the bloom filter inconclusive.
        assert!(rowset.may_contain(b"c"));
        assert!(!rowset.may_contain(b"z"));
    }
}
