use std::time::Duration;

use super::doc_key::{KeyBytes, SubDocKey};
use super::{PrimitiveValue, Value};
use crate::error::Result;
use crate::hybrid_time::{DocHybridTime, HybridTime, WriteId, MAX_WRITE_ID};
use crate::Error;

/// An ordered list of document writes applied atomically at one hybrid time.
///
/// The n-th operation is stored with write id n, so a later operation on the
/// same path wins over an earlier one.
#[derive(Debug, Clone, Default)]
pub struct DocWriteBatch {
    ops: Vec<(SubDocKey, Value)>,
}

impl DocWriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `path` to `value`, replacing whatever subtree was there.
    pub fn set(&mut self, path: SubDocKey, value: Value) -> Result<&mut Self> {
        path.validate()?;
        if path.doc_hybrid_time().is_some() {
            return Err(Error::InvalidArgument(format!(
                "write path {} must not carry a hybrid time",
                path
            )));
        }
        if self.ops.len() >= MAX_WRITE_ID as usize {
            return Err(Error::InvalidArgument(format!(
                "write batch is limited to {} operations",
                MAX_WRITE_ID
            )));
        }
        self.ops.push((path, value));
        Ok(self)
    }

    pub fn set_primitive(
        &mut self,
        path: SubDocKey,
        value: impl Into<PrimitiveValue>,
    ) -> Result<&mut Self> {
        self.set(path, Value::new(value))
    }

    /// Replaces the subtree at `path` with an empty object.
    pub fn insert_object(&mut self, path: SubDocKey) -> Result<&mut Self> {
        self.set(path, Value::object())
    }

    /// Deletes the subtree at `path`.
    pub fn delete(&mut self, path: SubDocKey) -> Result<&mut Self> {
        self.set(path, Value::tombstone())
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[(SubDocKey, Value)] {
        &self.ops
    }

    /// Encoded paths to lock before a write time is assigned. Sorted and
    /// deduplicated so every writer acquires them in the same order.
    pub fn lock_keys(&self) -> Vec<KeyBytes> {
        let mut keys: Vec<KeyBytes> = self
            .ops
            .iter()
            .map(|(path, _)| path.encode_without_hybrid_time())
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }

    /// Stored key/value pairs for a batch committed at `hybrid_time`.
    ///
    /// Values without a TTL get `default_ttl`; tombstones never expire.
    pub fn to_stored_pairs(
        &self,
        hybrid_time: HybridTime,
        default_ttl: Option<Duration>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut pairs = Vec::with_capacity(self.ops.len());
        for (write_id, (path, value)) in self.ops.iter().enumerate() {
            let mut key = path.encode_without_hybrid_time();
            key.append_doc_hybrid_time(DocHybridTime::new(hybrid_time, write_id as WriteId));

            let encoded = if value.ttl().is_none() && default_ttl.is_some() && !value.is_tombstone() {
                let mut value = value.clone();
                value.set_ttl(default_ttl);
                value.encode()?
            } else {
                value.encode()?
            };
            pairs.push((key.into_vec(), encoded));
        }
        Ok(pairs)
    }
}
