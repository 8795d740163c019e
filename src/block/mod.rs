//! Block storage for rowsets.
//!
//! Every on-disk artifact of a rowset (base data, redo and undo deltas, bloom
//! filters) is one immutable block file named by a `BlockId`:
//!
//! ```text
//! <tablet dir>/blocks/0000000000000042.blk
//! ```
//!
//! Blocks are never modified after they are written. Metadata decides which
//! blocks are live; blocks that fall out of the metadata are orphaned and
//! deleted only after the metadata change is durable.
//!
//! - `data`: prefix-compressed data blocks with per-block checksums.
//! - `index`: sparse index over the data blocks of a run.
//! - `run`: run files (data blocks, index, footer), their writer and iterator.
//! - `bloom`: bloom filter blocks keyed by document key.

pub mod bloom;
mod data;
mod index;
pub mod run;

use std::collections::BTreeSet;
use std::fmt;
use std::fs::{self, File};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use bloom::BloomFilter;
pub use run::{RunInfo, RunIterator, RunReader, RunWriter};

use crate::error::Result;
use crate::rate_limiter::RateLimiter;
use crate::Error;

const BLOCK_DIR: &str = "blocks";
const BLOCK_EXTENSION: &str = "blk";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId(pub u64);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016}", self.0)
    }
}

/// Allocates, opens and deletes block files under one directory.
pub struct BlockManager {
    dir: PathBuf,
    next_id: AtomicU64,
    rate_limiter: Arc<RateLimiter>,
}

impl BlockManager {
    /// Opens `<dir>/blocks`, creating it if needed. Leftover temporary files
    /// from interrupted writes are removed.
    pub fn open(dir: &Path, rate_limiter: Arc<RateLimiter>) -> Result<Self> {
        let dir = dir.join(BLOCK_DIR);
        fs::create_dir_all(&dir)?;

        let mut max_id = 0;
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            match path.extension().and_then(|e| e.to_str()) {
                Some(BLOCK_EXTENSION) => {
                    if let Some(id) = parse_block_id(&path) {
                        max_id = max_id.max(id.0);
                    }
                }
                Some("tmp") => {
                    tracing::debug!(path = %path.display(), "Removing partial block");
                    fs::remove_file(&path)?;
                }
                _ => {}
            }
        }

        Ok(Self {
            dir,
            next_id: AtomicU64::new(max_id + 1),
            rate_limiter,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn block_path(&self, id: BlockId) -> PathBuf {
        self.dir.join(format!("{}.{}", id, BLOCK_EXTENSION))
    }

    pub fn allocate_id(&self) -> BlockId {
        BlockId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Makes sure ids handed out later never collide with `id`.
    pub fn reserve_id(&self, id: BlockId) {
        self.next_id.fetch_max(id.0 + 1, Ordering::SeqCst);
    }

    pub fn create_run(&self, block_size: usize) -> Result<RunWriter> {
        let id = self.allocate_id();
        RunWriter::create(id, self.block_path(id), block_size, self.rate_limiter.clone())
    }

    pub fn open_run(&self, id: BlockId) -> Result<Arc<RunReader>> {
        let path = self.block_path(id);
        if !path.exists() {
            return Err(Error::NotFound(format!("block {}", id)));
        }
        Ok(Arc::new(RunReader::open(id, path)?))
    }

    pub fn write_bloom(&self, filter: &BloomFilter) -> Result<BlockId> {
        let id = self.allocate_id();
        let path = self.block_path(id);
        let tmp_path = path.with_extension("tmp");
        let data = filter.encode();

        self.rate_limiter.request(data.len() as u64);
        let mut file = File::create(&tmp_path)?;
        file.write_all(&data)?;
        file.sync_all()?;
        fs::rename(&tmp_path, &path)?;
        sync_dir(&self.dir)?;
        Ok(id)
    }

    pub fn read_bloom(&self, id: BlockId) -> Result<BloomFilter> {
        let mut data = Vec::new();
        match File::open(self.block_path(id)) {
            Ok(mut file) => file.read_to_end(&mut data)?,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(Error::NotFound(format!("bloom block {}", id)))
            }
            Err(err) => return Err(err.into()),
        };
        BloomFilter::decode(&data)
    }

    /// Deletes a block file. Deleting a missing block is not an error.
    pub fn delete_block(&self, id: BlockId) -> Result<()> {
        match fs::remove_file(self.block_path(id)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn list_blocks(&self) -> Result<BTreeSet<BlockId>> {
        let mut ids = BTreeSet::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some(BLOCK_EXTENSION) {
                if let Some(id) = parse_block_id(&path) {
                    ids.insert(id);
                }
            }
        }
        Ok(ids)
    }

    /// Places block `id` into `<target>/blocks`, hard-linking when the file
    /// system allows it and copying otherwise.
    pub fn link_block_into(&self, id: BlockId, target: &Path) -> Result<()> {
        let target_dir = target.join(BLOCK_DIR);
        fs::create_dir_all(&target_dir)?;
        let src = self.block_path(id);
        let dst = target_dir.join(format!("{}.{}", id, BLOCK_EXTENSION));
        if fs::hard_link(&src, &dst).is_err() {
            fs::copy(&src, &dst)?;
        }
        Ok(())
    }
}

/// Makes renames into `dir` durable.
pub(crate) fn sync_dir(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    File::open(dir)?.sync_all()?;
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}

fn parse_block_id(path: &Path) -> Option<BlockId> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .and_then(|s| s.parse::<u64>().ok())
        .map(BlockId)
}
