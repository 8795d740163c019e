use std::collections::BTreeMap;
use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::block::BlockId;
use crate::error::Result;

pub type ColumnId = u32;

/// Column holding every document entry of a rowset.
pub const DOCUMENT_COLUMN: ColumnId = 0;

/// Persisted description of one rowset: the blocks that make it up and the
/// range of document keys it holds.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RowSetRecord {
    pub id: u64,
    pub columns: BTreeMap<ColumnId, BlockId>,
    pub bloom_block: Option<BlockId>,
    /// Oldest first.
    pub redo_delta_blocks: Vec<BlockId>,
    pub undo_delta_blocks: Vec<BlockId>,
    pub last_durable_redo_dms_id: u64,
    /// Smallest and largest encoded `DocKey` in the rowset.
    pub min_doc_key: Vec<u8>,
    pub max_doc_key: Vec<u8>,
}

impl RowSetRecord {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    /// Every block referenced by this rowset.
    pub fn blocks(&self) -> Vec<BlockId> {
        let mut blocks: Vec<BlockId> = self.columns.values().copied().collect();
        blocks.extend(self.bloom_block);
        blocks.extend(self.redo_delta_blocks.iter().copied());
        blocks.extend(self.undo_delta_blocks.iter().copied());
        blocks
    }

    pub fn contains_doc_key(&self, doc_key: &[u8]) -> bool {
        self.min_doc_key.as_slice() <= doc_key && doc_key <= self.max_doc_key.as_slice()
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.write_u64::<BigEndian>(self.id)?;

        buf.write_u32::<BigEndian>(self.columns.len() as u32)?;
        for (column, block) in &self.columns {
            buf.write_u32::<BigEndian>(*column)?;
            buf.write_u64::<BigEndian>(block.0)?;
        }

        match self.bloom_block {
            Some(block) => {
                buf.write_u8(1)?;
                buf.write_u64::<BigEndian>(block.0)?;
            }
            None => buf.write_u8(0)?,
        }

        encode_blocks(buf, &self.redo_delta_blocks)?;
        encode_blocks(buf, &self.undo_delta_blocks)?;
        buf.write_u64::<BigEndian>(self.last_durable_redo_dms_id)?;

        encode_bytes(buf, &self.min_doc_key)?;
        encode_bytes(buf, &self.max_doc_key)?;
        Ok(())
    }

    pub fn decode_from(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        let id = cursor.read_u64::<BigEndian>()?;

        let column_count = cursor.read_u32::<BigEndian>()? as usize;
        let mut columns = BTreeMap::new();
        for _ in 0..column_count {
            let column = cursor.read_u32::<BigEndian>()?;
            let block = BlockId(cursor.read_u64::<BigEndian>()?);
            columns.insert(column, block);
        }

        let bloom_block = match cursor.read_u8()? {
            0 => None,
            _ => Some(BlockId(cursor.read_u64::<BigEndian>()?)),
        };

        let redo_delta_blocks = decode_blocks(cursor)?;
        let undo_delta_blocks = decode_blocks(cursor)?;
        let last_durable_redo_dms_id = cursor.read_u64::<BigEndian>()?;

        let min_doc_key = decode_bytes(cursor)?;
        let max_doc_key = decode_bytes(cursor)?;

        Ok(Self {
            id,
            columns,
            bloom_block,
            redo_delta_blocks,
            undo_delta_blocks,
            last_durable_redo_dms_id,
            min_doc_key,
            max_doc_key,
        })
    }
}

pub(super) fn encode_blocks(buf: &mut Vec<u8>, blocks: &[BlockId]) -> Result<()> {
    buf.write_u32::<BigEndian>(blocks.len() as u32)?;
    for block in blocks {
        buf.write_u64::<BigEndian>(block.0)?;
    }
    Ok(())
}

pub(super) fn decode_blocks(cursor: &mut Cursor<&[u8]>) -> Result<Vec<BlockId>> {
    let count = cursor.read_u32::<BigEndian>()? as usize;
    let mut blocks = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        blocks.push(BlockId(cursor.read_u64::<BigEndian>()?));
    }
    Ok(blocks)
}

fn encode_bytes(buf: &mut Vec<u8>, bytes: &[u8]) -> Result<()> {
    buf.write_u32::<BigEndian>(bytes.len() as u32)?;
    buf.extend_from_slice(bytes);
    Ok(())
}

fn decode_bytes(cursor: &mut Cursor<&[u8]>) -> Result<Vec<u8>> {
    let len = cursor.read_u32::<BigEndian>()? as usize;
    let remaining = cursor.get_ref().len().saturating_sub(cursor.position() as usize);
    if len > remaining {
        return Err(crate::Error::Corruption(format!(
            "rowset record key of {} bytes exceeds the {} bytes left",
            len, remaining
        )));
    }
    let mut bytes = vec![0u8; len];
    cursor.read_exact(&mut bytes)?;
    Ok(bytes)
}
