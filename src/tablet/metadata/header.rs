use byteorder::{BigEndian, ByteOrder};

use crate::error::Result;
use crate::Error;

pub const HEADER_SIZE: usize = 64;
const MAGIC: &[u8; 8] = b"DOCTBLMD";
const VERSION: u32 = 1;

/// Fixed-size header at the start of every metadata log file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataHeader {
    pub magic: [u8; 8],
    pub version: u32,
    /// Sequence number of the snapshot the file was started from.
    pub base_seq: u64,
    pub snapshot_interval: u32,
}

impl MetadataHeader {
    pub fn new(base_seq: u64, snapshot_interval: u32) -> Self {
        Self {
            magic: *MAGIC,
            version: VERSION,
            base_seq,
            snapshot_interval,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.magic != *MAGIC {
            return Err(Error::Corruption(
                "invalid tablet metadata magic number".to_string(),
            ));
        }
        if self.version != VERSION {
            return Err(Error::Corruption(format!(
                "unsupported tablet metadata version: {}",
                self.version
            )));
        }
        Ok(())
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.magic);
        BigEndian::write_u32(&mut buf[8..12], self.version);
        BigEndian::write_u64(&mut buf[12..20], self.base_seq);
        BigEndian::write_u32(&mut buf[20..24], self.snapshot_interval);
        buf
    }

    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Result<Self> {
        let mut magic = [0u8; 8];
        magic.copy_from_slice(&buf[0..8]);
        let header = Self {
            magic,
            version: BigEndian::read_u32(&buf[8..12]),
            base_seq: BigEndian::read_u64(&buf[12..20]),
            snapshot_interval: BigEndian::read_u32(&buf[20..24]),
        };
        header.validate()?;
        Ok(header)
    }
}
