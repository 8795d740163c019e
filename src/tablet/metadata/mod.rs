//! Tablet metadata log.
//!
//! The metadata log is the durable record of which rowsets make up the tablet
//! and which blocks each of them references. It plays the same role for the
//! block set that a write-ahead log plays for user data: every change to the
//! set of rowsets is appended as one edit and synced before the in-memory
//! components are swapped.
//!
//! # File Format
//!
//! ```text
//! +------------------+
//! | Header (64 bytes)|
//! +------------------+
//! | Edit 1           |
//! +------------------+
//! | Edit 2           |
//! +------------------+
//! | ...              |
//! +------------------+
//! ```
//!
//! Each edit is framed as:
//!
//! ```text
//! +-----------+------------------+-----------+
//! |length:u32 | serialized_edit  |crc32:u32  |
//! +-----------+------------------+-----------+
//! ```
//!
//! # Rewrites
//!
//! After `snapshot_interval` edits the log is rewritten into a new file that
//! holds a single `Snapshot` edit, then renamed over the old one.
//!
//! # Recovery
//!
//! Opening the log replays every edit in order. A record cut short at the end
//! of the file is a write that never completed; it is dropped and the file is
//! truncated. A complete record with a bad checksum is corruption.
//!
//! Blocks that a committed edit stops referencing become orphans. They are
//! deleted later and the deletion is itself recorded, so a crash at any point
//! leaves every referenced block in place.

pub mod edit;
pub mod header;
pub mod record;

use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use byteorder::{BigEndian, ByteOrder};
use crc::{Crc, CRC_32_ISCSI};

pub use edit::{MetadataEdit, MetadataState};
pub use header::{MetadataHeader, HEADER_SIZE};
pub use record::{ColumnId, RowSetRecord, DOCUMENT_COLUMN};

use crate::block::{sync_dir, BlockId};
use crate::error::Result;
use crate::Error;

pub const METADATA_FILE_NAME: &str = "METADATA";

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

pub struct TabletMetadata {
    path: PathBuf,
    snapshot_interval: u32,
    log: Mutex<MetadataLog>,
}

struct MetadataLog {
    file: File,
    len: u64,
    next_seq: u64,
    edits_since_snapshot: u32,
    state: MetadataState,
}

struct Replayed {
    state: MetadataState,
    last_seq: u64,
    edits: u32,
    valid_len: u64,
}

impl TabletMetadata {
    /// Opens the metadata log in `dir`, creating an empty one if none exists.
    pub fn open(dir: &Path, snapshot_interval: u32) -> Result<Self> {
        let path = dir.join(METADATA_FILE_NAME);
        if !path.exists() {
            write_log(&path, 0, snapshot_interval, &MetadataState::default())?;
        }

        let replayed = replay(&path)?;
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        let file_len = file.metadata()?.len();
        if file_len > replayed.valid_len {
            tracing::warn!(
                path = %path.display(),
                dropped_bytes = file_len - replayed.valid_len,
                "Dropping incomplete metadata record"
            );
            file.set_len(replayed.valid_len)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::Start(replayed.valid_len))?;

        tracing::info!(
            path = %path.display(),
            rowsets = replayed.state.rowsets.len(),
            orphaned_blocks = replayed.state.orphaned_blocks.len(),
            edits = replayed.edits,
            "Replayed tablet metadata"
        );

        Ok(Self {
            path,
            snapshot_interval: snapshot_interval.max(1),
            log: Mutex::new(MetadataLog {
                file,
                len: replayed.valid_len,
                next_seq: replayed.last_seq + 1,
                edits_since_snapshot: replayed.edits.saturating_sub(1),
                state: replayed.state,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Durably appends `edit` and applies it to the in-memory state.
    ///
    /// The edit is validated against the current state first; an invalid edit
    /// or a failed write leaves both the file and the state unchanged.
    pub fn commit(&self, edit: MetadataEdit) -> Result<()> {
        let mut log = self.log.lock()?;

        let mut next_state = log.state.clone();
        next_state.apply(&edit)?;

        let seq = log.next_seq;
        let record = frame(&edit.encode(seq)?);
        if let Err(err) = Self::append(&mut log, &record) {
            let len = log.len;
            if let Err(truncate_err) = log.file.set_len(len) {
                tracing::warn!(error = %truncate_err, "Failed to trim metadata log after error");
            }
            return Err(err);
        }

        log.len += record.len() as u64;
        log.next_seq += 1;
        log.state = next_state;
        log.edits_since_snapshot += 1;
        tracing::debug!(seq, edit = edit.name(), "Committed metadata edit");

        if log.edits_since_snapshot >= self.snapshot_interval {
            // The edit is already durable; a failed rewrite only delays the
            // next one.
            if let Err(err) = self.rewrite(&mut log) {
                tracing::warn!(error = %err, "Failed to rewrite tablet metadata");
            }
        }
        Ok(())
    }

    fn append(log: &mut MetadataLog, record: &[u8]) -> Result<()> {
        let len = log.len;
        log.file.seek(SeekFrom::Start(len))?;
        log.file.write_all(record)?;
        log.file.sync_data()?;
        Ok(())
    }

    fn rewrite(&self, log: &mut MetadataLog) -> Result<()> {
        let seq = log.next_seq;
        let len = write_log(&self.path, seq, self.snapshot_interval, &log.state)?;

        let mut file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        file.seek(SeekFrom::Start(len))?;
        log.file = file;
        log.len = len;
        log.next_seq = seq + 1;
        log.edits_since_snapshot = 0;

        tracing::info!(
            seq,
            rowsets = log.state.rowsets.len(),
            "Rewrote tablet metadata"
        );
        Ok(())
    }

    /// Writes the current rowsets, without orphans, as a fresh metadata log in
    /// `dir`.
    pub fn write_snapshot_to(&self, dir: &Path) -> Result<MetadataState> {
        let mut state = self.state()?;
        state.orphaned_blocks.clear();
        write_log(
            &dir.join(METADATA_FILE_NAME),
            0,
            self.snapshot_interval,
            &state,
        )?;
        Ok(state)
    }

    pub fn state(&self) -> Result<MetadataState> {
        Ok(self.log.lock()?.state.clone())
    }

    pub fn rowset(&self, id: u64) -> Result<RowSetRecord> {
        self.log
            .lock()?
            .state
            .rowsets
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("rowset {}", id)))
    }

    /// Reserves an id for a rowset that is about to be written.
    pub fn allocate_rowset_id(&self) -> Result<u64> {
        let mut log = self.log.lock()?;
        let id = log.state.next_rowset_id;
        log.state.next_rowset_id += 1;
        Ok(id)
    }

    pub fn orphaned_blocks(&self) -> Result<BTreeSet<BlockId>> {
        Ok(self.log.lock()?.state.orphaned_blocks.clone())
    }

    pub fn live_blocks(&self) -> Result<BTreeSet<BlockId>> {
        Ok(self.log.lock()?.state.live_blocks())
    }

    pub fn edits_since_snapshot(&self) -> Result<u32> {
        Ok(self.log.lock()?.edits_since_snapshot)
    }
}

fn frame(payload: &[u8]) -> Vec<u8> {
    let mut record = vec![0u8; 4];
    BigEndian::write_u32(&mut record, payload.len() as u32);
    record.extend_from_slice(payload);
    let mut checksum = [0u8; 4];
    BigEndian::write_u32(&mut checksum, CRC32.checksum(payload));
    record.extend_from_slice(&checksum);
    record
}

/// Atomically replaces the log at `path` with a header and one snapshot of
/// `state`. Returns the new file length.
fn write_log(path: &Path, seq: u64, snapshot_interval: u32, state: &MetadataState) -> Result<u64> {
    let tmp_path = path.with_extension("tmp");
    let header = MetadataHeader::new(seq, snapshot_interval);
    let record = frame(&state.to_snapshot().encode(seq)?);

    let mut file = File::create(&tmp_path)?;
    file.write_all(&header.encode())?;
    file.write_all(&record)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp_path, path)?;

    if let Some(parent) = path.parent() {
        sync_dir(parent)?;
    }

    Ok((HEADER_SIZE + record.len()) as u64)
}

fn replay(path: &Path) -> Result<Replayed> {
    let data = fs::read(path)?;
    if data.len() < HEADER_SIZE {
        return Err(Error::Corruption(format!(
            "tablet metadata {} is shorter than its header",
            path.display()
        )));
    }
    let mut header_bytes = [0u8; HEADER_SIZE];
    header_bytes.copy_from_slice(&data[..HEADER_SIZE]);
    let header = MetadataHeader::decode(&header_bytes)?;

    let mut state = MetadataState::default();
    let mut last_seq: Option<u64> = None;
    let mut edits = 0u32;
    let mut offset = HEADER_SIZE;

    while offset < data.len() {
        if data.len() - offset < 4 {
            break;
        }
        let len = BigEndian::read_u32(&data[offset..offset + 4]) as usize;
        let end = offset + 4 + len + 4;
        if end > data.len() {
            break;
        }

        let payload = &data[offset + 4..offset + 4 + len];
        let stored_checksum = BigEndian::read_u32(&data[offset + 4 + len..end]);
        if CRC32.checksum(payload) != stored_checksum {
            return Err(Error::Corruption(format!(
                "checksum mismatch in tablet metadata at offset {}",
                offset
            )));
        }

        let (seq, edit) = MetadataEdit::decode(payload)?;
        let expected_min = last_seq.map_or(header.base_seq, |s| s + 1);
        if seq < expected_min {
            return Err(Error::Corruption(format!(
                "metadata edit sequence {} follows {}",
                seq,
                expected_min.saturating_sub(1)
            )));
        }
        state.apply(&edit)?;
        last_seq = Some(seq);
        edits += 1;
        offset = end;
    }

    if edits == 0 {
        return Err(Error::Corruption(format!(
            "tablet metadata {} holds no snapshot",
            path.display()
        )));
    }

    Ok(Replayed {
        state,
        last_seq: last_seq.unwrap_or(header.base_seq),
        edits,
        valid_len: offset as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    fn record(id: u64, block: u64) -> RowSetRecord {
        let mut record = RowSetRecord::new(id);
        record.columns.insert(DOCUMENT_COLUMN, BlockId(block));
        record
    }

    fn flush(id: u64, block: u64) -> MetadataEdit {
        MetadataEdit::Flush {
            new_rowset: Some(record(id, block)),
            updated_rowsets: vec![],
        }
    }

    #[test]
    fn test_state_survives_reopen() -> Result<()> {
        let dir = TempDir::new()?;
        {
            let metadata = TabletMetadata::open(dir.path(), 100)?;
            let a = metadata.allocate_rowset_id()?;
            let b = metadata.allocate_rowset_id()?;
            metadata.commit(flush(a, 1))?;
            metadata.commit(flush(b, 2))?;
            metadata.commit(MetadataEdit::Compaction {
                removed_rowsets: vec![a],
                added_rowsets: vec![],
                orphaned_blocks: vec![BlockId(1)],
            })?;
        }

        let metadata = TabletMetadata::open(dir.path(), 100)?;
        let state = metadata.state()?;
        assert_eq!(state.rowsets.keys().copied().collect::<Vec<_>>(), vec![1]);
        assert_eq!(metadata.orphaned_blocks()?, [BlockId(1)].into_iter().collect());
        assert_eq!(metadata.live_blocks()?, [BlockId(2)].into_iter().collect());
        assert_eq!(metadata.allocate_rowset_id()?, 2);
        Ok(())
    }

    #[test]
    fn test_rewrite_after_interval() -> Result<()> {
        let dir = TempDir::new()?;
        let metadata = TabletMetadata::open(dir.path(), 3)?;
        for id in 0..3 {
            metadata.commit(flush(id, id + 10))?;
        }
        assert_eq!(metadata.edits_since_snapshot()?, 0);

        metadata.commit(flush(3, 13))?;
        assert_eq!(metadata.edits_since_snapshot()?, 1);
        drop(metadata);

        let reopened = TabletMetadata::open(dir.path(), 3)?;
        assert_eq!(reopened.state()?.rowsets.len(), 4);
        assert_eq!(reopened.edits_since_snapshot()?, 1);
        Ok(())
    }

    #[test]
    fn test_invalid_edit_leaves_log_unchanged() -> Result<()> {
        let dir = TempDir::new()?;
        let metadata = TabletMetadata::open(dir.path(), 100)?;
        metadata.commit(flush(0, 1))?;
        let len = fs::metadata(metadata.path())?.len();

        let result = metadata.commit(MetadataEdit::UpdateRowSet {
            rowset: record(9, 2),
            orphaned_blocks: vec![],
        });
        assert!(matches!(result, Err(Error::Corruption(_))));
        assert_eq!(fs::metadata(metadata.path())?.len(), len);
        Ok(())
    }

    #[test]
    fn test_incomplete_tail_is_dropped() -> Result<()> {
        let dir = TempDir::new()?;
        let path = {
            let metadata = TabletMetadata::open(dir.path(), 100)?;
            metadata.commit(flush(0, 1))?;
            metadata.path().to_path_buf()
        };
        let mut file = OpenOptions::new().append(true).open(&path)?;
        file.write_all(&[0, 0, 0, 40, 1, 2, 3])?;
        drop(file);

        let metadata = TabletMetadata::open(dir.path(), 100)?;
        assert_eq!(metadata.state()?.rowsets.len(), 1);
        metadata.commit(flush(1, 2))?;
        drop(metadata);
        assert_eq!(TabletMetadata::open(dir.path(), 100)?.state()?.rowsets.len(), 2);
        Ok(())
    }

    #[test]
    fn test_checksum_mismatch_is_corruption() -> Result<()> {
        let dir = TempDir::new()?;
        let path = {
            let metadata = TabletMetadata::open(dir.path(), 100)?;
            metadata.commit(flush(0, 1))?;
            metadata.path().to_path_buf()
        };
        let mut data = fs::read(&path)?;
        let last = data.len() - 1;
        data[last] ^= 0xff;
        fs::write(&path, data)?;

        assert!(matches!(
            TabletMetadata::open(dir.path(), 100),
            Err(Error::Corruption(_))
        ));
        Ok(())
    }

    #[test]
    fn test_snapshot_to_other_dir_drops_orphans() -> Result<()> {
        let dir = TempDir::new()?;
        let target = TempDir::new()?;
        let metadata = TabletMetadata::open(dir.path(), 100)?;
        metadata.commit(flush(0, 1))?;
        metadata.commit(MetadataEdit::UpdateRowSet {
            rowset: record(0, 2),
            orphaned_blocks: vec![BlockId(1)],
        })?;

        metadata.write_snapshot_to(target.path())?;
        let copy = TabletMetadata::open(target.path(), 100)?;
        assert!(copy.orphaned_blocks()?.is_empty());
        assert_eq!(copy.live_blocks()?, [BlockId(2)].into_iter().collect());
        Ok(())
    }
}
