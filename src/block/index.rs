//! Sparse index over the data blocks of a run.
//!
//! ```text
//! +----------------+---------------------------------------------+--------+
//! | count: u32     | key_len: u32 | key | offset: u64 | size: u64 | crc32  |
//! +----------------+---------------------------------------------+--------+
//! ```
//!
//! Each entry maps the first key of a block to its location in the file.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use crate::error::Result;
use crate::Error;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

#[derive(Debug, Clone, Default)]
pub struct Index {
    /// `(first_key, block_offset, block_size)`, sorted by key.
    entries: Vec<(Vec<u8>, u64, u64)>,
}

impl Index {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, first_key: Vec<u8>, offset: u64, size: u64) {
        self.entries.push((first_key, offset, size));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Block that would hold `target`: the last block whose first key is
    /// `<= target`, or the first block if `target` precedes them all.
    pub fn find(&self, target: &[u8]) -> usize {
        self.entries
            .partition_point(|(k, _, _)| k.as_slice() <= target)
            .saturating_sub(1)
    }

    /// `(offset, size)` of the i-th block.
    pub fn handle(&self, i: usize) -> Option<(u64, u64)> {
        self.entries.get(i).map(|(_, offset, size)| (*offset, *size))
    }

    pub fn first_key(&self) -> Option<&[u8]> {
        self.entries.first().map(|(k, _, _)| k.as_slice())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        let _ = buf.write_u32::<BigEndian>(self.entries.len() as u32);
        for (key, offset, size) in &self.entries {
            let _ = buf.write_u32::<BigEndian>(key.len() as u32);
            buf.extend_from_slice(key);
            let _ = buf.write_u64::<BigEndian>(*offset);
            let _ = buf.write_u64::<BigEndian>(*size);
        }
        let checksum = CRC32.checksum(&buf);
        let _ = buf.write_u32::<BigEndian>(checksum);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 8 {
            return Err(Error::Corruption("run index is too short".into()));
        }
        let (body, mut trailer) = data.split_at(data.len() - 4);
        if trailer.read_u32::<BigEndian>()? != CRC32.checksum(body) {
            return Err(Error::Corruption("run index checksum mismatch".into()));
        }

        let truncated = |_| Error::Corruption("truncated run index".into());
        let mut cursor = body;
        let count = cursor.read_u32::<BigEndian>().map_err(truncated)? as usize;
        let mut entries = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let key_len = cursor.read_u32::<BigEndian>().map_err(truncated)? as usize;
            if cursor.len() < key_len {
                return Err(Error::Corruption("run index key out of bounds".into()));
            }
            let (key, rest) = cursor.split_at(key_len);
            cursor = rest;
            let offset = cursor.read_u64::<BigEndian>().map_err(truncated)?;
            let size = cursor.read_u64::<BigEndian>().map_err(truncated)?;
            entries.push((key.to_vec(), offset, size));
        }
        Ok(Self { entries })
    }
}
