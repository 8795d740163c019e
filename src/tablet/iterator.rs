//! Iterators over tablet components.
//!
//! `MergingIterator` merges the sorted cursors of several components into one
//! sorted cursor. A stored key carries the write's hybrid time and write id, so
//! two components only hold the same stored key when they hold the same
//! write (a rowset flushed while the frozen memrowset is still visible, say);
//! such duplicates are returned once.
//!
//! `RowIterator` walks the merged cursor one document at a time and assembles
//! each document as of its snapshot.

use std::sync::Arc;

use super::components::TabletComponents;
use super::mvcc::{MvccSnapshot, ScopedReadPoint};
use crate::docdb::{DocKey, DocReader, KvIterator, PrimitiveValue, SeekOptimizer, SubDocument};
use crate::error::Result;

pub struct MergingIterator {
    children: Vec<Box<dyn KvIterator>>,
    current: Option<usize>,
}

impl MergingIterator {
    /// Children earlier in the list win ties.
    pub fn new(children: Vec<Box<dyn KvIterator>>) -> Self {
        Self {
            children,
            current: None,
        }
    }

    pub fn num_children(&self) -> usize {
        self.children.len()
    }

    fn find_smallest(&mut self) {
        self.current = self
            .children
            .iter()
            .enumerate()
            .filter(|(_, child)| child.valid())
            .min_by(|(_, a), (_, b)| a.key().cmp(b.key()))
            .map(|(i, _)| i);
    }
}

impl KvIterator for MergingIterator {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn key(&self) -> &[u8] {
        self.current.map_or(&[][..], |i| self.children[i].key())
    }

    fn value(&self) -> &[u8] {
        self.current.map_or(&[][..], |i| self.children[i].value())
    }

    fn seek_to_first(&mut self) -> Result<()> {
        for child in &mut self.children {
            child.seek_to_first()?;
        }
        self.find_smallest();
        Ok(())
    }

    fn seek(&mut self, target: &[u8]) -> Result<()> {
        for child in &mut self.children {
            child.seek(target)?;
        }
        self.find_smallest();
        Ok(())
    }

    fn next(&mut self) -> Result<()> {
        let Some(current) = self.current else {
            return Ok(());
        };
        let key = self.children[current].key().to_vec();
        for child in &mut self.children {
            if child.valid() && child.key() == key.as_slice() {
                child.next()?;
            }
        }
        self.find_smallest();
        Ok(())
    }
}

/// Options for `Tablet::new_row_iterator`.
#[derive(Debug, Clone, Default)]
pub struct RowIteratorOptions {
    /// Top-level columns to read. `None` reads whole documents.
    pub projection: Option<Vec<PrimitiveValue>>,
    /// Read at this snapshot instead of the current safe time.
    pub snapshot: Option<MvccSnapshot>,
    /// Transaction the read belongs to. Only reads outside a transaction
    /// are served.
    pub transaction_id: Option<u64>,
}

impl RowIteratorOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn projection<I, V>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<PrimitiveValue>,
    {
        self.projection = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn snapshot(mut self, snapshot: MvccSnapshot) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    pub fn transaction_id(mut self, id: u64) -> Self {
        self.transaction_id = Some(id);
        self
    }
}

/// Documents visible at one snapshot, in document key order.
///
/// The iterator holds the components it was built from, so a flush or
/// compaction that swaps components while it is open does not change what it
/// returns.
pub struct RowIterator {
    iter: MergingIterator,
    optimizer: SeekOptimizer,
    snapshot: MvccSnapshot,
    projection: Option<Vec<PrimitiveValue>>,
    started: bool,
    _components: Arc<TabletComponents>,
    _read_point: ScopedReadPoint,
}

impl RowIterator {
    pub(crate) fn new(
        components: Arc<TabletComponents>,
        optimizer: SeekOptimizer,
        snapshot: MvccSnapshot,
        projection: Option<Vec<PrimitiveValue>>,
        read_point: ScopedReadPoint,
    ) -> Result<Self> {
        let iter = components.new_merging_iterator();
        Ok(Self {
            iter,
            optimizer,
            snapshot,
            projection,
            started: false,
            _components: components,
            _read_point: read_point,
        })
    }

    pub fn snapshot(&self) -> MvccSnapshot {
        self.snapshot
    }

    /// The next visible document, or `None` at the end.
    pub fn next_row(&mut self) -> Result<Option<(DocKey, SubDocument)>> {
        if !self.started {
            self.iter.seek_to_first()?;
            self.started = true;
        }

        loop {
            if !self.iter.valid() {
                return Ok(None);
            }
            let (doc_key, len) = DocKey::decode_prefix(self.iter.key())?;
            let doc_key_bytes = self.iter.key()[..len].to_vec();

            let document = DocReader::new(&mut self.iter, self.optimizer, self.snapshot.read_time())
                .read_subdocument(&doc_key_bytes, self.projection.as_deref())?;
            self.optimizer.seek_past_subdoc(&mut self.iter, &doc_key_bytes)?;

            if let Some(document) = document {
                return Ok(Some((doc_key, document)));
            }
        }
    }
}

impl Iterator for RowIterator {
    type Item = Result<(DocKey, SubDocument)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_row().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docdb::seek::testutil::VecIterator;

    fn source(keys: &[&str]) -> Box<dyn KvIterator> {
        Box::new(VecIterator::new(
            keys.iter()
                .map(|k| (k.as_bytes().to_vec(), k.to_uppercase().into_bytes()))
                .collect(),
        ))
    }

    fn collect(iter: &mut MergingIterator) -> Vec<String> {
        let mut keys = Vec::new();
        while iter.valid() {
            keys.push(String::from_utf8(iter.key().to_vec()).unwrap());
            iter.next().unwrap();
        }
        keys
    }

    #[test]
    fn test_merges_in_order_and_deduplicates() {
        let mut iter = MergingIterator::new(vec![
            source(&["b", "d", "f"]),
            source(&["a", "d", "g"]),
            source(&["c", "d"]),
        ]);
        iter.seek_to_first().unwrap();
        assert_eq!(collect(&mut iter), vec!["a", "b", "c", "d", "f", "g"]);
    }

    #[test]
    fn test_seek_and_values() {
        let mut iter = MergingIterator::new(vec![source(&["a", "e"]), source(&["c"])]);
        iter.seek(b"b").unwrap();
        assert_eq!(iter.key(), b"c");
        assert_eq!(iter.value(), b"C");
        iter.seek(b"z").unwrap();
        assert!(!iter.valid());
        assert_eq!(iter.key(), b"");
    }

    #[test]
    fn test_empty_children() {
        let mut iter = MergingIterator::new(vec![source(&[]), source(&["x"])]);
        iter.seek_to_first().unwrap();
        assert_eq!(collect(&mut iter), vec!["x"]);
        assert_eq!(iter.num_children(), 2);
    }
}
