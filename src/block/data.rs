//! Data blocks: prefix-compressed runs of sorted entries.
//!
//! ```text
//! +-----------------+-------------------+----------------+-------+-------+
//! | shared_len: u32 | unshared_len: u32 | value_len: u32 | key   | value |
//! +-----------------+-------------------+----------------+-------+-------+
//! ... one entry per key, then a CRC32 of everything before it (u32)
//! ```
//!
//! Stored keys of one document share long prefixes, so every entry stores only
//! the bytes that differ from the previous key. Blocks are small enough to be
//! decoded whole when loaded.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use crate::error::Result;
use crate::Error;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const ENTRY_HEADER_SIZE: usize = 12;
const CHECKSUM_SIZE: usize = 4;

pub struct Builder {
    buffer: Vec<u8>,
    entry_count: usize,
    last_key: Vec<u8>,
}

impl Builder {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            entry_count: 0,
            last_key: Vec::new(),
        }
    }

    pub fn add_entry(&mut self, key: &[u8], value: &[u8]) {
        let shared = shared_prefix_length(&self.last_key, key);
        let unshared = key.len() - shared;

        // Writes into a Vec cannot fail.
        let _ = self.buffer.write_u32::<BigEndian>(shared as u32);
        let _ = self.buffer.write_u32::<BigEndian>(unshared as u32);
        let _ = self.buffer.write_u32::<BigEndian>(value.len() as u32);
        self.buffer.extend_from_slice(&key[shared..]);
        self.buffer.extend_from_slice(value);

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.entry_count += 1;
    }

    pub fn finish(mut self) -> Vec<u8> {
        let checksum = CRC32.checksum(&self.buffer);
        let _ = self.buffer.write_u32::<BigEndian>(checksum);
        self.buffer
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }
}

fn shared_prefix_length(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|&(a, b)| a == b).count()
}

/// A decoded data block.
#[derive(Debug)]
pub struct Block {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
}

impl Block {
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < CHECKSUM_SIZE {
            return Err(Error::Corruption(format!(
                "data block of {} bytes is too short",
                data.len()
            )));
        }
        let (body, mut trailer) = data.split_at(data.len() - CHECKSUM_SIZE);
        let expected = trailer.read_u32::<BigEndian>()?;
        let actual = CRC32.checksum(body);
        if expected != actual {
            return Err(Error::Corruption(format!(
                "data block checksum mismatch: expected {:#010x}, found {:#010x}",
                expected, actual
            )));
        }

        let mut entries: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        let mut pos = 0;
        while pos < body.len() {
            if pos + ENTRY_HEADER_SIZE > body.len() {
                return Err(Error::Corruption("truncated block entry header".into()));
            }
            let mut header = &body[pos..pos + ENTRY_HEADER_SIZE];
            let shared = header.read_u32::<BigEndian>()? as usize;
            let unshared = header.read_u32::<BigEndian>()? as usize;
            let value_len = header.read_u32::<BigEndian>()? as usize;
            pos += ENTRY_HEADER_SIZE;

            let last_key = entries.last().map_or(&[][..], |(k, _)| k.as_slice());
            if shared > last_key.len() || pos + unshared + value_len > body.len() {
                return Err(Error::Corruption("block entry out of bounds".into()));
            }
            let mut key = Vec::with_capacity(shared + unshared);
            key.extend_from_slice(&last_key[..shared]);
            key.extend_from_slice(&body[pos..pos + unshared]);
            pos += unshared;
            let value = body[pos..pos + value_len].to_vec();
            pos += value_len;

            entries.push((key, value));
        }

        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, i: usize) -> (&[u8], &[u8]) {
        let (k, v) = &self.entries[i];
        (k, v)
    }

    /// Position of the first entry with key `>= target`, or `len()`.
    pub fn seek(&self, target: &[u8]) -> usize {
        self.entries.partition_point(|(k, _)| k.as_slice() < target)
    }

    pub fn last_key(&self) -> Option<&[u8]> {
        self.entries.last().map(|(k, _)| k.as_slice())
    }
}
