//! In-memory rowset accepting new writes.
//!
//! A memrowset is a concurrent skip list from stored key (document key plus
//! encoded hybrid time) to encoded value. Stored keys are unique per write, so
//! an insert never replaces an existing entry. Once frozen by a flush it only
//! serves reads until the flushed rowset replaces it.

use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_skiplist::SkipMap;

use crate::docdb::KvIterator;
use crate::error::Result;

#[derive(Debug)]
pub struct MemRowSet {
    id: u64,
    data: SkipMap<Vec<u8>, Vec<u8>>,
    size: AtomicUsize,
}

impl MemRowSet {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            data: SkipMap::new(),
            size: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn insert(&self, key: Vec<u8>, value: Vec<u8>) {
        let entry_size = key.len() + value.len();
        self.data.insert(key, value);
        self.size.fetch_add(entry_size, Ordering::SeqCst);
    }

    /// Approximate bytes held.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn iter(self: &Arc<Self>) -> MemRowSetIterator {
        MemRowSetIterator {
            memrowset: self.clone(),
            current: None,
        }
    }
}

/// Cursor over a memrowset. Every step looks up a fresh range in the skip
/// list, so entries inserted behind the cursor are never seen and entries
/// ahead of it are.
pub struct MemRowSetIterator {
    memrowset: Arc<MemRowSet>,
    current: Option<(Vec<u8>, Vec<u8>)>,
}

impl MemRowSetIterator {
    fn position_at(&mut self, bound: Bound<&[u8]>) {
        let next = self
            .memrowset
            .data
            .range::<[u8], _>((bound, Bound::Unbounded))
            .next()
            .map(|entry| (entry.key().clone(), entry.value().clone()));
        self.current = next;
    }
}

impl KvIterator for MemRowSetIterator {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn key(&self) -> &[u8] {
        self.current.as_ref().map_or(&[][..], |(k, _)| k.as_slice())
    }

    fn value(&self) -> &[u8] {
        self.current.as_ref().map_or(&[][..], |(_, v)| v.as_slice())
    }

    fn seek_to_first(&mut self) -> Result<()> {
        self.position_at(Bound::Unbounded);
        Ok(())
    }

    fn seek(&mut self, target: &[u8]) -> Result<()> {
        self.position_at(Bound::Included(target));
        Ok(())
    }

    fn next(&mut self) -> Result<()> {
        if let Some((key, _)) = self.current.take() {
            self.position_at(Bound::Excluded(key.as_slice()));
        }
        Ok(())
    }
}
