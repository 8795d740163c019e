//! Writes the blocks of a new rowset from a sorted stream of stored entries.

use super::metadata::{RowSetRecord, DOCUMENT_COLUMN};
use crate::block::{BlockId, BlockManager, BloomFilter, RunInfo, RunWriter};
use crate::config::TabletConfig;
use crate::docdb::DocKey;
use crate::error::Result;

/// Output of a finished `RowSetWriter`.
#[derive(Debug, Clone)]
pub struct WrittenRowSet {
    pub data: RunInfo,
    pub bloom_block: Option<BlockId>,
    pub min_doc_key: Vec<u8>,
    pub max_doc_key: Vec<u8>,
}

impl WrittenRowSet {
    pub fn block_ids(&self) -> Vec<BlockId> {
        let mut ids = vec![self.data.id];
        ids.extend(self.bloom_block);
        ids
    }

    pub fn into_record(self, id: u64) -> RowSetRecord {
        let mut record = RowSetRecord::new(id);
        record.columns.insert(DOCUMENT_COLUMN, self.data.id);
        record.bloom_block = self.bloom_block;
        record.min_doc_key = self.min_doc_key;
        record.max_doc_key = self.max_doc_key;
        record
    }
}

/// Base data block plus a bloom filter over the distinct document keys.
pub struct RowSetWriter<'a> {
    blocks: &'a BlockManager,
    run: RunWriter,
    doc_keys: Vec<Vec<u8>>,
    use_bloom: bool,
    bloom_fpr: f64,
}

impl<'a> RowSetWriter<'a> {
    pub fn new(blocks: &'a BlockManager, config: &TabletConfig) -> Result<Self> {
        Ok(Self {
            blocks,
            run: blocks.create_run(config.block_size)?,
            doc_keys: Vec::new(),
            use_bloom: config.use_bloom_filters,
            bloom_fpr: config.bloom_false_positive_rate,
        })
    }

    /// Adds a stored entry. Entries must arrive in key order.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let doc_key = &key[..DocKey::encoded_len(key)?];
        if self.doc_keys.last().map(|k| k.as_slice()) != Some(doc_key) {
            self.doc_keys.push(doc_key.to_vec());
        }
        self.run.add(key, value)
    }

    pub fn num_entries(&self) -> u64 {
        self.run.num_entries()
    }

    /// Finishes the rowset. An empty writer leaves nothing on disk and
    /// returns `None`.
    pub fn finish(self) -> Result<Option<WrittenRowSet>> {
        let (Some(min_doc_key), Some(max_doc_key)) =
            (self.doc_keys.first().cloned(), self.doc_keys.last().cloned())
        else {
            return Ok(None);
        };

        let data = self.run.finish()?;
        let bloom_block = if self.use_bloom {
            let mut bloom = BloomFilter::new(self.doc_keys.len(), self.bloom_fpr);
            for doc_key in &self.doc_keys {
                bloom.insert(doc_key);
            }
            match self.blocks.write_bloom(&bloom) {
                Ok(id) => Some(id),
                Err(e) => {
                    if let Err(cleanup) = self.blocks.delete_block(data.id) {
                        tracing::warn!(block = %data.id, error = %cleanup, "Failed to remove unused block");
                    }
                    return Err(e);
                }
            }
        } else {
            None
        };

        Ok(Some(WrittenRowSet {
            data,
            bloom_block,
            min_doc_key,
            max_doc_key,
        }))
    }
}

/// Writes a delta block from sorted entries. Returns `None` if there were none.
pub fn write_delta_block<I>(blocks: &BlockManager, block_size: usize, entries: I) -> Result<Option<RunInfo>>
where
    I: IntoIterator<Item = (Vec<u8>, Vec<u8>)>,
{
    let mut run = blocks.create_run(block_size)?;
    for (key, value) in entries {
        run.add(&key, &value)?;
    }
    if run.num_entries() == 0 {
        return Ok(None);
    }
    run.finish().map(Some)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::docdb::{SubDocKey, Value};
    use crate::hybrid_time::{DocHybridTime, HybridTime};
    use crate::rate_limiter::RateLimiter;
    use crate::tmpfs::TempDir;

    fn entry(row: &str, col: &str, micros: u64) -> (Vec<u8>, Vec<u8>) {
        let key = SubDocKey::new(DocKey::from_components([row]), vec![col.into()])
            .with_hybrid_time(DocHybridTime::new(HybridTime::from_micros(micros), 0));
        (key.encode().into_vec(), Value::new(1i64).encode().unwrap())
    }

    #[test]
    fn test_writes_data_and_bloom() {
        let dir = TempDir::new().unwrap();
        let blocks = BlockManager::open(dir.path(), Arc::new(RateLimiter::unlimited())).unwrap();
        let config = TabletConfig::new(dir.path());

        let mut writer = RowSetWriter::new(&blocks, &config).unwrap();
        for (key, value) in [entry("a", "x", 2), entry("a", "y", 1), entry("b", "x", 1)] {
            writer.add(&key, &value).unwrap();
        }
        assert_eq!(writer.num_entries(), 3);
        let written = writer.finish().unwrap().unwrap();

        let a = DocKey::from_components(["a"]).encode();
        let b = DocKey::from_components(["b"]).encode();
        assert_eq!(written.min_doc_key, a.as_slice());
        assert_eq!(written.max_doc_key, b.as_slice());

        let bloom = blocks.read_bloom(written.bloom_block.unwrap()).unwrap();
        assert!(bloom.may_contain(&a));
        assert!(bloom.may_contain(&b));

        let record = written.clone().into_record(7);
        assert_eq!(record.columns.get(&DOCUMENT_COLUMN), Some(&written.data.id));
        assert_eq!(record.blocks().len(), 2);
    }

    #[test]
    fn test_empty_writer_leaves_nothing() {
        let dir = TempDir::new().unwrap();
        let blocks = BlockManager::open(dir.path(), Arc::new(RateLimiter::unlimited())).unwrap();
        let config = TabletConfig::new(dir.path());

        let writer = RowSetWriter::new(&blocks, &config).unwrap();
        assert!(writer.finish().unwrap().is_none());
        assert!(write_delta_block(&blocks, 4096, Vec::new()).unwrap().is_none());
        assert!(blocks.list_blocks().unwrap().is_empty());
    }
}
