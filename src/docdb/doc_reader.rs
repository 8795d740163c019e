//! Assembles documents from the versions visible at a read time.
//!
//! Every node of a document is resolved with `resolve`. A node's visible
//! version overwrites everything below it that was written earlier: a tombstone
//! deletes the older subtree, an object marker replaces it with an empty
//! object, and a primitive replaces it with a scalar. Children written later
//! than the newest overwrite of all their ancestors stay visible, so a child
//! written after its parent's primitive turns the parent back into an object.

use std::fmt;

use itertools::Itertools as _;

use super::doc_key::KeyBytes;
use super::resolver::resolve;
use super::seek::{KvIterator, SeekOptimizer};
use super::{PrimitiveValue, ValueType};
use crate::error::Result;
use crate::hybrid_time::{DocHybridTime, HybridTime};

#[derive(Debug, Clone, PartialEq)]
pub enum SubDocument {
    Primitive(PrimitiveValue),
    /// Children in key order.
    Object(Vec<(PrimitiveValue, SubDocument)>),
}

impl SubDocument {
    pub fn is_object(&self) -> bool {
        matches!(self, SubDocument::Object(_))
    }

    pub fn as_primitive(&self) -> Option<&PrimitiveValue> {
        match self {
            SubDocument::Primitive(p) => Some(p),
            SubDocument::Object(_) => None,
        }
    }

    pub fn get(&self, subkey: &PrimitiveValue) -> Option<&SubDocument> {
        match self {
            SubDocument::Object(children) => children
                .iter()
                .find(|(k, _)| k == subkey)
                .map(|(_, child)| child),
            SubDocument::Primitive(_) => None,
        }
    }

    pub fn get_path(&self, path: &[PrimitiveValue]) -> Option<&SubDocument> {
        path.iter().try_fold(self, |doc, subkey| doc.get(subkey))
    }

    pub fn num_children(&self) -> usize {
        match self {
            SubDocument::Object(children) => children.len(),
            SubDocument::Primitive(_) => 0,
        }
    }
}

impl fmt::Display for SubDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubDocument::Primitive(p) => write!(f, "{}", p),
            SubDocument::Object(children) => write!(
                f,
                "{{ {} }}",
                children
                    .iter()
                    .map(|(k, v)| format!("{}: {}", k, v))
                    .join(", ")
            ),
        }
    }
}

pub struct DocReader<'a, I: KvIterator + ?Sized> {
    iter: &'a mut I,
    optimizer: SeekOptimizer,
    read_time: HybridTime,
}

impl<'a, I: KvIterator + ?Sized> DocReader<'a, I> {
    pub fn new(iter: &'a mut I, optimizer: SeekOptimizer, read_time: HybridTime) -> Self {
        Self {
            iter,
            optimizer,
            read_time,
        }
    }

    /// Builds the subdocument rooted at the encoded key `key` (no hybrid time).
    ///
    /// With a projection only the named top-level children are read.
    pub fn read_subdocument(
        &mut self,
        key: &[u8],
        projection: Option<&[PrimitiveValue]>,
    ) -> Result<Option<SubDocument>> {
        self.build(&KeyBytes::from(key), DocHybridTime::MIN, projection)
    }

    fn build(
        &mut self,
        key: &KeyBytes,
        overwritten_at: DocHybridTime,
        projection: Option<&[PrimitiveValue]>,
    ) -> Result<Option<SubDocument>> {
        let Some(resolved) = resolve(&mut *self.iter, &self.optimizer, key, self.read_time)? else {
            return Ok(None);
        };

        let mut overwritten_at = overwritten_at;
        let mut scalar = None;
        let mut has_object_marker = false;
        if resolved.is_exact(key) && resolved.doc_hybrid_time() > overwritten_at {
            overwritten_at = resolved.doc_hybrid_time();
            match resolved.value.into_primitive() {
                PrimitiveValue::Tombstone => {}
                PrimitiveValue::Object => has_object_marker = true,
                primitive => scalar = Some(primitive),
            }
        }

        let children = match projection {
            Some(columns) => {
                let mut children = Vec::with_capacity(columns.len());
                for column in columns {
                    let mut child_key = key.clone();
                    child_key.append_primitive(column);
                    if let Some(child) = self.build(&child_key, overwritten_at, None)? {
                        children.push((column.clone(), child));
                    }
                }
                children
            }
            None => self.build_children(key, overwritten_at)?,
        };

        if !children.is_empty() {
            return Ok(Some(SubDocument::Object(children)));
        }
        if let Some(primitive) = scalar {
            return Ok(Some(SubDocument::Primitive(primitive)));
        }
        if has_object_marker {
            return Ok(Some(SubDocument::Object(Vec::new())));
        }
        Ok(None)
    }

    fn build_children(
        &mut self,
        key: &KeyBytes,
        overwritten_at: DocHybridTime,
    ) -> Result<Vec<(PrimitiveValue, SubDocument)>> {
        let mut children = Vec::new();
        self.optimizer.seek_past_versions(&mut *self.iter, key)?;

        while self.iter.valid() && self.iter.key().starts_with(key) {
            let rest = &self.iter.key()[key.len()..];
            if rest.first() == Some(&(ValueType::HybridTime as u8)) {
                self.optimizer.seek_past_versions(&mut *self.iter, key)?;
                continue;
            }

            let (subkey, used) = PrimitiveValue::decode_from_key(rest)?;
            let child_key = KeyBytes::from(&self.iter.key()[..key.len() + used]);
            if let Some(child) = self.build(&child_key, overwritten_at, None)? {
                children.push((subkey, child));
            }
            self.optimizer.seek_past_subdoc(&mut *self.iter, &child_key)?;
        }
        Ok(children)
    }
}
