//! Sorted runs: immutable files of stored key/value pairs.
//!
//! ## Run File Layout
//!
//! ```text
//! +----------------------+
//! | Data Block 1         |
//! +----------------------+
//! | ...                  |
//! +----------------------+
//! | Data Block N         |
//! +----------------------+
//! | Index Block          |
//! +----------------------+
//! | Index Offset (u64)   |
//! | Magic (u64)          |
//! +----------------------+
//! ```
//!
//! A run is written to a temporary file and renamed into place once complete,
//! so a block id on disk always names a whole run.

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use super::data::{Block, Builder};
use super::index::Index;
use super::{sync_dir, BlockId};
use crate::docdb::{format_key, KvIterator};
use crate::error::Result;
use crate::rate_limiter::RateLimiter;
use crate::Error;

const RUN_MAGIC: u64 = 0x646f_6374_6162_6c74;
const FOOTER_SIZE: u64 = 16;

/// Summary of a finished run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunInfo {
    pub id: BlockId,
    pub num_entries: u64,
    pub size: u64,
    pub min_key: Option<Vec<u8>>,
    pub max_key: Option<Vec<u8>>,
}

/// Writes one run. Keys must be added in strictly ascending order.
pub struct RunWriter {
    id: BlockId,
    file: File,
    tmp_path: PathBuf,
    path: PathBuf,
    index: Index,
    builder: Builder,
    first_key_in_block: Option<Vec<u8>>,
    min_key: Option<Vec<u8>>,
    last_key: Option<Vec<u8>>,
    offset: u64,
    num_entries: u64,
    block_size: usize,
    rate_limiter: Arc<RateLimiter>,
    finished: bool,
}

impl RunWriter {
    pub(super) fn create(
        id: BlockId,
        path: PathBuf,
        block_size: usize,
        rate_limiter: Arc<RateLimiter>,
    ) -> Result<Self> {
        let tmp_path = path.with_extension("tmp");
        let file = File::create(&tmp_path)?;
        Ok(Self {
            id,
            file,
            tmp_path,
            path,
            index: Index::new(),
            builder: Builder::new(),
            first_key_in_block: None,
            min_key: None,
            last_key: None,
            offset: 0,
            num_entries: 0,
            block_size: block_size.max(1),
            rate_limiter,
            finished: false,
        })
    }

    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }

    /// Bytes written so far plus the pending block.
    pub fn estimated_size(&self) -> u64 {
        self.offset + self.builder.len() as u64
    }

    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if let Some(last) = &self.last_key {
            if key <= last.as_slice() {
                return Err(Error::InvalidArgument(format!(
                    "run {} keys out of order: {} after {}",
                    self.id,
                    format_key(key),
                    format_key(last)
                )));
            }
        }
        if self.first_key_in_block.is_none() {
            self.first_key_in_block = Some(key.to_vec());
        }
        if self.min_key.is_none() {
            self.min_key = Some(key.to_vec());
        }
        self.builder.add_entry(key, value);
        self.last_key = Some(key.to_vec());
        self.num_entries += 1;

        if self.builder.len() >= self.block_size {
            self.flush_block()?;
        }
        Ok(())
    }

    fn flush_block(&mut self) -> Result<()> {
        if self.builder.is_empty() {
            return Ok(());
        }
        let data = std::mem::replace(&mut self.builder, Builder::new()).finish();
        let first_key = self.first_key_in_block.take().unwrap_or_default();
        self.rate_limiter.request(data.len() as u64);
        self.file.write_all(&data)?;
        self.index.push(first_key, self.offset, data.len() as u64);
        self.offset += data.len() as u64;
        Ok(())
    }

    /// Writes the index and footer, syncs, and moves the run into place.
    pub fn finish(mut self) -> Result<RunInfo> {
        self.flush_block()?;

        let index = self.index.encode();
        let index_offset = self.offset;
        self.rate_limiter.request(index.len() as u64 + FOOTER_SIZE);
        self.file.write_all(&index)?;
        self.file.write_u64::<BigEndian>(index_offset)?;
        self.file.write_u64::<BigEndian>(RUN_MAGIC)?;
        self.file.sync_all()?;
        fs::rename(&self.tmp_path, &self.path)?;
        self.finished = true;
        if let Some(dir) = self.path.parent() {
            sync_dir(dir)?;
        }

        Ok(RunInfo {
            id: self.id,
            num_entries: self.num_entries,
            size: index_offset + index.len() as u64 + FOOTER_SIZE,
            min_key: self.min_key.take(),
            max_key: self.last_key.take(),
        })
    }
}

impl Drop for RunWriter {
    fn drop(&mut self) {
        if !self.finished {
            let _ = fs::remove_file(&self.tmp_path);
        }
    }
}

/// An open run. Data blocks are read on demand with positional reads, so
/// any number of iterators may share one reader across threads.
#[derive(Debug)]
pub struct RunReader {
    id: BlockId,
    file: File,
    index: Index,
    size: u64,
}

impl RunReader {
    pub(super) fn open(id: BlockId, path: PathBuf) -> Result<Self> {
        let mut file = File::open(&path)?;
        let size = file.metadata()?.len();
        if size < FOOTER_SIZE {
            return Err(Error::Corruption(format!(
                "run {} is {} bytes, too short for a footer",
                id, size
            )));
        }

        file.seek(SeekFrom::End(-(FOOTER_SIZE as i64)))?;
        let index_offset = file.read_u64::<BigEndian>()?;
        let magic = file.read_u64::<BigEndian>()?;
        if magic != RUN_MAGIC {
            return Err(Error::Corruption(format!("run {} has a bad magic number", id)));
        }
        if index_offset > size - FOOTER_SIZE {
            return Err(Error::Corruption(format!(
                "run {} index offset {} is past the end",
                id, index_offset
            )));
        }

        let mut index_data = vec![0u8; (size - FOOTER_SIZE - index_offset) as usize];
        file.seek(SeekFrom::Start(index_offset))?;
        file.read_exact(&mut index_data)?;
        let index = Index::decode(&index_data)?;

        Ok(Self {
            id,
            file,
            index,
            size,
        })
    }

    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn num_blocks(&self) -> usize {
        self.index.len()
    }

    fn read_block(&self, i: usize) -> Result<Block> {
        let (offset, size) = self.index.handle(i).ok_or_else(|| {
            Error::Corruption(format!("run {} has no data block {}", self.id, i))
        })?;
        let mut data = vec![0u8; size as usize];
        read_exact_at(&self.file, &mut data, offset)?;
        Block::decode(&data)
    }

    pub fn iter(self: &Arc<Self>) -> RunIterator {
        RunIterator {
            reader: self.clone(),
            block_idx: 0,
            block: None,
            pos: 0,
        }
    }
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => return Err(std::io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => {
                let rest = buf;
                buf = &mut rest[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Cursor over one run. Starts unpositioned.
pub struct RunIterator {
    reader: Arc<RunReader>,
    block_idx: usize,
    block: Option<Block>,
    pos: usize,
}

impl RunIterator {
    fn load(&mut self, i: usize) -> Result<()> {
        if self.block.is_some() && self.block_idx == i {
            return Ok(());
        }
        self.block_idx = i;
        self.block = if i < self.reader.num_blocks() {
            Some(self.reader.read_block(i)?)
        } else {
            None
        };
        Ok(())
    }

    /// Moves to the first entry of the following blocks if the current one
    /// is used up.
    fn skip_exhausted(&mut self) -> Result<()> {
        while let Some(block) = &self.block {
            if self.pos < block.len() {
                break;
            }
            let next = self.block_idx + 1;
            self.load(next)?;
            self.pos = 0;
        }
        Ok(())
    }
}

impl KvIterator for RunIterator {
    fn valid(&self) -> bool {
        matches!(&self.block, Some(block) if self.pos < block.len())
    }

    fn key(&self) -> &[u8] {
        match &self.block {
            Some(block) if self.pos < block.len() => block.entry(self.pos).0,
            _ => &[],
        }
    }

    fn value(&self) -> &[u8] {
        match &self.block {
            Some(block) if self.pos < block.len() => block.entry(self.pos).1,
            _ => &[],
        }
    }

    fn seek_to_first(&mut self) -> Result<()> {
        self.load(0)?;
        self.pos = 0;
        self.skip_exhausted()
    }

    fn seek(&mut self, target: &[u8]) -> Result<()> {
        let i = self.reader.index.find(target);
        self.load(i)?;
        self.pos = match &self.block {
            Some(block) => block.seek(target),
            None => 0,
        };
        self.skip_exhausted()
    }

    fn next(&mut self) -> Result<()> {
        if self.valid() {
            self.pos += 1;
        }
        self.skip_exhausted()
    }
}
