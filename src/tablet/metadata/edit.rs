use std::collections::{BTreeMap, BTreeSet};
use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use super::record::{decode_blocks, encode_blocks, RowSetRecord};
use crate::block::BlockId;
use crate::error::Result;
use crate::Error;

const FLUSH: u8 = 0x01;
const COMPACTION: u8 = 0x02;
const UPDATE_ROWSET: u8 = 0x03;
const DELETE_ORPHANS: u8 = 0x04;
const SNAPSHOT: u8 = 0x05;

/// One atomic change to the tablet's set of rowsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataEdit {
    /// A memrowset was written out: possibly one new rowset, plus redo delta
    /// blocks appended to existing rowsets.
    Flush {
        new_rowset: Option<RowSetRecord>,
        updated_rowsets: Vec<RowSetRecord>,
    },

    /// Rowsets were merged into new ones. The blocks of the removed rowsets
    /// become orphans.
    Compaction {
        removed_rowsets: Vec<u64>,
        added_rowsets: Vec<RowSetRecord>,
        orphaned_blocks: Vec<BlockId>,
    },

    /// The block set of one rowset changed.
    UpdateRowSet {
        rowset: RowSetRecord,
        orphaned_blocks: Vec<BlockId>,
    },

    /// Orphaned blocks were physically deleted.
    DeleteOrphans { blocks: Vec<BlockId> },

    /// Complete state, written at the start of a rewritten log.
    Snapshot {
        rowsets: Vec<RowSetRecord>,
        orphaned_blocks: Vec<BlockId>,
        next_rowset_id: u64,
    },
}

impl MetadataEdit {
    pub fn name(&self) -> &'static str {
        match self {
            MetadataEdit::Flush { .. } => "flush",
            MetadataEdit::Compaction { .. } => "compaction",
            MetadataEdit::UpdateRowSet { .. } => "update-rowset",
            MetadataEdit::DeleteOrphans { .. } => "delete-orphans",
            MetadataEdit::Snapshot { .. } => "snapshot",
        }
    }

    pub fn encode(&self, seq: u64) -> Result<Vec<u8>> {
        let mut buf = Vec::new();

        match self {
            MetadataEdit::Flush {
                new_rowset,
                updated_rowsets,
            } => {
                buf.write_u8(FLUSH)?;
                buf.write_u64::<BigEndian>(seq)?;
                match new_rowset {
                    Some(record) => {
                        buf.write_u8(1)?;
                        record.encode_into(&mut buf)?;
                    }
                    None => buf.write_u8(0)?,
                }
                encode_records(&mut buf, updated_rowsets)?;
            }

            MetadataEdit::Compaction {
                removed_rowsets,
                added_rowsets,
                orphaned_blocks,
            } => {
                buf.write_u8(COMPACTION)?;
                buf.write_u64::<BigEndian>(seq)?;
                buf.write_u32::<BigEndian>(removed_rowsets.len() as u32)?;
                for id in removed_rowsets {
                    buf.write_u64::<BigEndian>(*id)?;
                }
                encode_records(&mut buf, added_rowsets)?;
                encode_blocks(&mut buf, orphaned_blocks)?;
            }

            MetadataEdit::UpdateRowSet {
                rowset,
                orphaned_blocks,
            } => {
                buf.write_u8(UPDATE_ROWSET)?;
                buf.write_u64::<BigEndian>(seq)?;
                rowset.encode_into(&mut buf)?;
                encode_blocks(&mut buf, orphaned_blocks)?;
            }

            MetadataEdit::DeleteOrphans { blocks } => {
                buf.write_u8(DELETE_ORPHANS)?;
                buf.write_u64::<BigEndian>(seq)?;
                encode_blocks(&mut buf, blocks)?;
            }

            MetadataEdit::Snapshot {
                rowsets,
                orphaned_blocks,
                next_rowset_id,
            } => {
                buf.write_u8(SNAPSHOT)?;
                buf.write_u64::<BigEndian>(seq)?;
                buf.write_u64::<BigEndian>(*next_rowset_id)?;
                encode_records(&mut buf, rowsets)?;
                encode_blocks(&mut buf, orphaned_blocks)?;
            }
        }

        Ok(buf)
    }

    /// Decodes an edit and the sequence number it was written with.
    pub fn decode(buf: &[u8]) -> Result<(u64, Self)> {
        let mut cursor = Cursor::new(buf);
        let edit_type = cursor.read_u8()?;
        let seq = cursor.read_u64::<BigEndian>()?;

        let edit = match edit_type {
            FLUSH => {
                let new_rowset = match cursor.read_u8()? {
                    0 => None,
                    _ => Some(RowSetRecord::decode_from(&mut cursor)?),
                };
                let updated_rowsets = decode_records(&mut cursor)?;
                MetadataEdit::Flush {
                    new_rowset,
                    updated_rowsets,
                }
            }

            COMPACTION => {
                let count = cursor.read_u32::<BigEndian>()? as usize;
                let mut removed_rowsets = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    removed_rowsets.push(cursor.read_u64::<BigEndian>()?);
                }
                let added_rowsets = decode_records(&mut cursor)?;
                let orphaned_blocks = decode_blocks(&mut cursor)?;
                MetadataEdit::Compaction {
                    removed_rowsets,
                    added_rowsets,
                    orphaned_blocks,
                }
            }

            UPDATE_ROWSET => {
                let rowset = RowSetRecord::decode_from(&mut cursor)?;
                let orphaned_blocks = decode_blocks(&mut cursor)?;
                MetadataEdit::UpdateRowSet {
                    rowset,
                    orphaned_blocks,
                }
            }

            DELETE_ORPHANS => MetadataEdit::DeleteOrphans {
                blocks: decode_blocks(&mut cursor)?,
            },

            SNAPSHOT => {
                let next_rowset_id = cursor.read_u64::<BigEndian>()?;
                let rowsets = decode_records(&mut cursor)?;
                let orphaned_blocks = decode_blocks(&mut cursor)?;
                MetadataEdit::Snapshot {
                    rowsets,
                    orphaned_blocks,
                    next_rowset_id,
                }
            }

            other => {
                return Err(Error::Corruption(format!(
                    "unknown metadata edit type: {}",
                    other
                )))
            }
        };

        if cursor.position() as usize != buf.len() {
            return Err(Error::Corruption(format!(
                "{} trailing bytes after {} edit",
                buf.len() - cursor.position() as usize,
                edit.name()
            )));
        }
        Ok((seq, edit))
    }
}

fn encode_records(buf: &mut Vec<u8>, records: &[RowSetRecord]) -> Result<()> {
    buf.write_u32::<BigEndian>(records.len() as u32)?;
    for record in records {
        record.encode_into(buf)?;
    }
    Ok(())
}

fn decode_records(cursor: &mut Cursor<&[u8]>) -> Result<Vec<RowSetRecord>> {
    let count = cursor.read_u32::<BigEndian>()? as usize;
    let mut records = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        records.push(RowSetRecord::decode_from(cursor)?);
    }
    Ok(records)
}

/// Rowsets and orphaned blocks after replaying a sequence of edits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataState {
    pub rowsets: BTreeMap<u64, RowSetRecord>,
    pub orphaned_blocks: BTreeSet<BlockId>,
    pub next_rowset_id: u64,
}

impl MetadataState {
    /// Applies `edit`, failing without changes if it names rowsets that do
    /// not exist or adds ones that already do.
    pub fn apply(&mut self, edit: &MetadataEdit) -> Result<()> {
        match edit {
            MetadataEdit::Flush {
                new_rowset,
                updated_rowsets,
            } => {
                for record in updated_rowsets {
                    self.check_exists(record.id)?;
                }
                if let Some(record) = new_rowset {
                    self.check_absent(record.id)?;
                }
                for record in updated_rowsets {
                    self.rowsets.insert(record.id, record.clone());
                }
                if let Some(record) = new_rowset {
                    self.add_rowset(record.clone());
                }
            }

            MetadataEdit::Compaction {
                removed_rowsets,
                added_rowsets,
                orphaned_blocks,
            } => {
                for id in removed_rowsets {
                    self.check_exists(*id)?;
                }
                // An output may take over the id of one of the inputs.
                for record in added_rowsets {
                    if !removed_rowsets.contains(&record.id) {
                        self.check_absent(record.id)?;
                    }
                }
                for id in removed_rowsets {
                    self.rowsets.remove(id);
                }
                for record in added_rowsets {
                    self.add_rowset(record.clone());
                }
                self.orphaned_blocks.extend(orphaned_blocks.iter().copied());
            }

            MetadataEdit::UpdateRowSet {
                rowset,
                orphaned_blocks,
            } => {
                self.check_exists(rowset.id)?;
                self.rowsets.insert(rowset.id, rowset.clone());
                self.orphaned_blocks.extend(orphaned_blocks.iter().copied());
            }

            MetadataEdit::DeleteOrphans { blocks } => {
                for block in blocks {
                    self.orphaned_blocks.remove(block);
                }
            }

            MetadataEdit::Snapshot {
                rowsets,
                orphaned_blocks,
                next_rowset_id,
            } => {
                self.rowsets = rowsets.iter().map(|r| (r.id, r.clone())).collect();
                self.orphaned_blocks = orphaned_blocks.iter().copied().collect();
                self.next_rowset_id = *next_rowset_id;
            }
        }
        Ok(())
    }

    /// The edit that recreates this state from nothing.
    pub fn to_snapshot(&self) -> MetadataEdit {
        MetadataEdit::Snapshot {
            rowsets: self.rowsets.values().cloned().collect(),
            orphaned_blocks: self.orphaned_blocks.iter().copied().collect(),
            next_rowset_id: self.next_rowset_id,
        }
    }

    /// Every block referenced by a live rowset.
    pub fn live_blocks(&self) -> BTreeSet<BlockId> {
        self.rowsets.values().flat_map(|r| r.blocks()).collect()
    }

    fn add_rowset(&mut self, record: RowSetRecord) {
        self.next_rowset_id = self.next_rowset_id.max(record.id + 1);
        self.rowsets.insert(record.id, record);
    }

    fn check_exists(&self, id: u64) -> Result<()> {
        if !self.rowsets.contains_key(&id) {
            return Err(Error::Corruption(format!("rowset {} does not exist", id)));
        }
        Ok(())
    }

    fn check_absent(&self, id: u64) -> Result<()> {
        if self.rowsets.contains_key(&id) {
            return Err(Error::Corruption(format!("rowset {} already exists", id)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tablet::metadata::record::DOCUMENT_COLUMN;

    fn record(id: u64, block: u64) -> RowSetRecord {
        let mut record = RowSetRecord::new(id);
        record.columns.insert(DOCUMENT_COLUMN, BlockId(block));
        record.min_doc_key = b"a".to_vec();
        record.max_doc_key = b"z".to_vec();
        record
    }

    #[test]
    fn test_edit_encoding() {
        let edits = vec![
            MetadataEdit::Flush {
                new_rowset: Some(record(1, 10)),
                updated_rowsets: vec![record(0, 5)],
            },
            MetadataEdit::Compaction {
                removed_rowsets: vec![0, 1],
                added_rowsets: vec![record(2, 11)],
                orphaned_blocks: vec![BlockId(5), BlockId(10)],
            },
            MetadataEdit::DeleteOrphans {
                blocks: vec![BlockId(5)],
            },
        ];
        for (seq, edit) in edits.into_iter().enumerate() {
            let encoded = edit.encode(seq as u64).unwrap();
            assert_eq!(MetadataEdit::decode(&encoded).unwrap(), (seq as u64, edit));
        }
    }

    #[test]
    fn test_decode_rejects_unknown_type_and_trailing_bytes() {
        assert!(matches!(
            MetadataEdit::decode(&[0x7f, 0, 0, 0, 0, 0, 0, 0, 1]),
            Err(Error::Corruption(_))
        ));

        let mut encoded = MetadataEdit::DeleteOrphans { blocks: vec![] }
            .encode(1)
            .unwrap();
        encoded.push(0);
        assert!(matches!(
            MetadataEdit::decode(&encoded),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn test_apply_compaction_orphans_blocks() {
        let mut state = MetadataState::default();
        state
            .apply(&MetadataEdit::Flush {
                new_rowset: Some(record(0, 1)),
                updated_rowsets: vec![],
            })
            .unwrap();
        state
            .apply(&MetadataEdit::Flush {
                new_rowset: Some(record(1, 2)),
                updated_rowsets: vec![],
            })
            .unwrap();
        assert_eq!(state.next_rowset_id, 2);

        state
            .apply(&MetadataEdit::Compaction {
                removed_rowsets: vec![0, 1],
                added_rowsets: vec![record(2, 3)],
                orphaned_blocks: vec![BlockId(1), BlockId(2)],
            })
            .unwrap();
        assert_eq!(state.rowsets.keys().copied().collect::<Vec<_>>(), vec![2]);
        assert_eq!(state.live_blocks(), [BlockId(3)].into_iter().collect());
        assert_eq!(state.orphaned_blocks.len(), 2);

        let mut rebuilt = MetadataState::default();
        rebuilt.apply(&state.to_snapshot()).unwrap();
        assert_eq!(rebuilt, state);
    }

    #[test]
    fn test_apply_rejects_unknown_rowset_without_changes() {
        let mut state = MetadataState::default();
        let before = state.clone();
        let result = state.apply(&MetadataEdit::Compaction {
            removed_rowsets: vec![7],
            added_rowsets: vec![record(8, 1)],
            orphaned_blocks: vec![],
        });
        assert!(matches!(result, Err(Error::Corruption(_))));
        assert_eq!(state, before);
    }
}
