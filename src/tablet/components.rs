//! The set of components a tablet reads from.
//!
//! `TabletComponents` is an immutable value: flush and compaction build a new
//! one and swap it in under the component lock. Anyone who cloned the `Arc`
//! before the swap keeps a complete, consistent view for as long as they hold
//! it.

use std::fmt;
use std::sync::Arc;

use super::diskrowset::DiskRowSet;
use super::iterator::MergingIterator;
use super::memrowset::MemRowSet;
use crate::docdb::KvIterator;
use crate::error::Result;
use crate::Error;

/// On-disk rowsets of a tablet, ordered by id.
#[derive(Default)]
pub struct RowSetTree {
    rowsets: Vec<Arc<DiskRowSet>>,
}

impl RowSetTree {
    pub fn new(mut rowsets: Vec<Arc<DiskRowSet>>) -> Self {
        rowsets.sort_by_key(|r| r.id());
        Self { rowsets }
    }

    pub fn rowsets(&self) -> &[Arc<DiskRowSet>] {
        &self.rowsets
    }

    pub fn len(&self) -> usize {
        self.rowsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rowsets.is_empty()
    }

    pub fn get(&self, id: u64) -> Option<&Arc<DiskRowSet>> {
        self.rowsets.iter().find(|r| r.id() == id)
    }

    pub fn total_size(&self) -> u64 {
        self.rowsets.iter().map(|r| r.size()).sum()
    }

    /// Rowsets whose key range includes `doc_key`.
    pub fn covering(&self, doc_key: &[u8]) -> impl Iterator<Item = &Arc<DiskRowSet>> + '_ {
        let doc_key = doc_key.to_vec();
        self.rowsets.iter().filter(move |r| r.covers(&doc_key))
    }

    /// A tree with the rowsets in `remove` replaced by `add`. Fails if a
    /// rowset to remove is not present.
    pub fn replace(&self, remove: &[u64], add: Vec<Arc<DiskRowSet>>) -> Result<RowSetTree> {
        for id in remove {
            if self.get(*id).is_none() {
                return Err(Error::IllegalState(format!(
                    "rowset {} is not part of the tablet",
                    id
                )));
            }
        }
        let mut rowsets: Vec<Arc<DiskRowSet>> = self
            .rowsets
            .iter()
            .filter(|r| !remove.contains(&r.id()))
            .cloned()
            .collect();
        rowsets.extend(add);
        Ok(RowSetTree::new(rowsets))
    }
}

pub struct TabletComponents {
    pub memrowset: Arc<MemRowSet>,
    /// Memrowsets frozen by a flush that has not completed yet, oldest first.
    pub frozen: Vec<Arc<MemRowSet>>,
    pub rowsets: Arc<RowSetTree>,
}

impl TabletComponents {
    pub fn new(memrowset: Arc<MemRowSet>, rowsets: Arc<RowSetTree>) -> Self {
        Self {
            memrowset,
            frozen: Vec::new(),
            rowsets,
        }
    }

    /// Memrowsets newest first.
    pub fn memrowsets(&self) -> impl Iterator<Item = &Arc<MemRowSet>> {
        std::iter::once(&self.memrowset).chain(self.frozen.iter().rev())
    }

    /// One sorted cursor over every component.
    pub fn new_merging_iterator(&self) -> MergingIterator {
        let mut children: Vec<Box<dyn KvIterator>> = self
            .memrowsets()
            .map(|mrs| Box::new(mrs.iter()) as Box<dyn KvIterator>)
            .collect();
        children.extend(
            self.rowsets
                .rowsets()
                .iter()
                .map(|r| Box::new(r.new_iterator()) as Box<dyn KvIterator>),
        );
        MergingIterator::new(children)
    }

    /// A cursor over the components that may hold entries of `doc_key`.
    pub fn new_point_iterator(&self, doc_key: &[u8]) -> MergingIterator {
        let mut children: Vec<Box<dyn KvIterator>> = self
            .memrowsets()
            .map(|mrs| Box::new(mrs.iter()) as Box<dyn KvIterator>)
            .collect();
        children.extend(
            self.rowsets
                .rowsets()
                .iter()
                .filter(|r| r.may_contain(doc_key))
                .map(|r| Box::new(r.new_iterator()) as Box<dyn KvIterator>),
        );
        MergingIterator::new(children)
    }

    pub fn memory_size(&self) -> usize {
        self.memrowsets().map(|mrs| mrs.size()).sum()
    }
}

impl fmt::Debug for TabletComponents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TabletComponents")
            .field("memrowset", &self.memrowset.id())
            .field(
                "frozen",
                &self.frozen.iter().map(|m| m.id()).collect::<Vec<_>>(),
            )
            .field(
                "rowsets",
                &self.rowsets.rowsets().iter().map(|r| r.id()).collect::<Vec<_>>(),
            )
            .finish()
    }
}
