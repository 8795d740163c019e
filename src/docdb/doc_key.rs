//! Document keys and the stored-key layout.
//!
//! ```text
//! stored key = [doc key components..] '!' [subkeys..] '#' !ht !write_id
//!              \______ DocKey _______/    \_ path _/  \_ DocHybridTime _/
//! ```
//!
//! A `DocKey` names a row. A `SubDocKey` names a node inside the row's
//! document: the doc key plus a path of subkeys. Because every component is
//! prefix-free and the hybrid time marker sorts before every component tag,
//! the stored keys of one node are contiguous, newest version first, and are
//! immediately followed by the stored keys of the node's descendants.

use std::fmt;
use std::ops::Deref;

use itertools::Itertools as _;

use super::{PrimitiveValue, ValueType};
use crate::encoding::EncodingError;
use crate::error::Result;
use crate::hybrid_time::{DocHybridTime, HybridTime, WriteId, MAX_WRITE_ID};
use crate::Error;

/// An encoded key under construction or inspection.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyBytes(Vec<u8>);

impl KeyBytes {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.0
    }

    pub fn append_value_type(&mut self, value_type: ValueType) {
        self.0.push(value_type as u8);
    }

    pub fn append_primitive(&mut self, value: &PrimitiveValue) {
        value.append_to_key(&mut self.0);
    }

    pub fn append_doc_hybrid_time(&mut self, dht: DocHybridTime) {
        dht.append_encoded(&mut self.0);
    }

    pub fn truncate(&mut self, len: usize) {
        self.0.truncate(len);
    }

    /// Rewrites the trailing hybrid time in place so the key seeks to the
    /// newest version visible at `hybrid_time`.
    pub fn replace_last_hybrid_time_for_seek(&mut self, hybrid_time: HybridTime) -> Result<()> {
        if !DocHybridTime::has_suffix(&self.0) {
            return Err(Error::Corruption(format!(
                "key {} does not end with a hybrid time",
                super::format_key(&self.0)
            )));
        }
        let start = self.0.len() - DocHybridTime::ENCODED_SIZE;
        self.0.truncate(start);
        self.append_doc_hybrid_time(DocHybridTime::max_at(hybrid_time));
        Ok(())
    }
}

impl Deref for KeyBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for KeyBytes {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for KeyBytes {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl fmt::Debug for KeyBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", super::format_key(&self.0))
    }
}

/// Key of `key`'s newest version visible at `hybrid_time` with write ids up to `write_id`.
pub fn encode_seek_key(key: &[u8], hybrid_time: HybridTime, write_id: WriteId) -> KeyBytes {
    let mut out = KeyBytes::from(key);
    out.append_doc_hybrid_time(DocHybridTime::new(hybrid_time, write_id));
    out
}

/// Key just past every version of `key`, i.e. at its first descendant.
pub fn encode_past_versions_key(key: &[u8]) -> KeyBytes {
    let mut out = KeyBytes::from(key);
    out.append_doc_hybrid_time(DocHybridTime::MIN);
    out
}

/// Key just past every version and every descendant of `key`.
pub fn encode_subkey_boundary(key: &[u8]) -> KeyBytes {
    let mut out = KeyBytes::from(key);
    out.append_value_type(ValueType::Highest);
    out
}

/// Whether `key` is allowed as a seek target: no hybrid time at all, or one
/// carrying the maximum write id, or the minimum sentinel.
pub fn is_valid_seek_key(key: &[u8]) -> bool {
    // Boundary keys and raw prefixes do not decode and carry no time.
    match SubDocKey::decode(key, false) {
        Ok(decoded) => match decoded.doc_hybrid_time() {
            Some(dht) => dht.write_id() == MAX_WRITE_ID || dht == DocHybridTime::MIN,
            None => true,
        },
        Err(_) => true,
    }
}

/// Identifies a row: the ordered list of its range components.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DocKey {
    range_group: Vec<PrimitiveValue>,
}

impl DocKey {
    pub fn new(range_group: Vec<PrimitiveValue>) -> Self {
        Self { range_group }
    }

    pub fn from_components<I, V>(components: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<PrimitiveValue>,
    {
        Self::new(components.into_iter().map(Into::into).collect())
    }

    pub fn range_group(&self) -> &[PrimitiveValue] {
        &self.range_group
    }

    pub fn validate(&self) -> Result<()> {
        self.range_group
            .iter()
            .try_for_each(PrimitiveValue::check_key_component)
    }

    pub fn append_to(&self, out: &mut KeyBytes) {
        for component in &self.range_group {
            out.append_primitive(component);
        }
        out.append_value_type(ValueType::GroupEnd);
    }

    pub fn encode(&self) -> KeyBytes {
        let mut out = KeyBytes::new();
        self.append_to(&mut out);
        out
    }

    /// Decodes the doc key at the front of `bytes`, returning it with its encoded length.
    pub fn decode_prefix(bytes: &[u8]) -> Result<(DocKey, usize)> {
        let mut range_group = Vec::new();
        let mut pos = 0;
        loop {
            match bytes.get(pos) {
                None => return Err(EncodingError::TruncatedData.into()),
                Some(&b) if b == ValueType::GroupEnd as u8 => {
                    return Ok((DocKey::new(range_group), pos + 1));
                }
                Some(_) => {
                    let (component, used) = PrimitiveValue::decode_from_key(&bytes[pos..])?;
                    range_group.push(component);
                    pos += used;
                }
            }
        }
    }

    /// Length of the encoded doc key at the front of `bytes`.
    pub fn encoded_len(bytes: &[u8]) -> Result<usize> {
        Self::decode_prefix(bytes).map(|(_, len)| len)
    }
}

impl fmt::Display for DocKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocKey([{}])", self.range_group.iter().join(", "))
    }
}

/// A node inside a document, optionally pinned to one version.
#[derive(Debug, Clone, PartialEq)]
pub struct SubDocKey {
    doc_key: DocKey,
    subkeys: Vec<PrimitiveValue>,
    doc_ht: Option<DocHybridTime>,
}

impl SubDocKey {
    pub fn new(doc_key: DocKey, subkeys: Vec<PrimitiveValue>) -> Self {
        Self {
            doc_key,
            subkeys,
            doc_ht: None,
        }
    }

    pub fn with_hybrid_time(mut self, doc_ht: DocHybridTime) -> Self {
        self.doc_ht = Some(doc_ht);
        self
    }

    pub fn doc_key(&self) -> &DocKey {
        &self.doc_key
    }

    pub fn subkeys(&self) -> &[PrimitiveValue] {
        &self.subkeys
    }

    pub fn doc_hybrid_time(&self) -> Option<DocHybridTime> {
        self.doc_ht
    }

    pub fn set_hybrid_time(&mut self, doc_ht: DocHybridTime) {
        self.doc_ht = Some(doc_ht);
    }

    pub fn child(&self, subkey: impl Into<PrimitiveValue>) -> SubDocKey {
        let mut subkeys = self.subkeys.clone();
        subkeys.push(subkey.into());
        SubDocKey::new(self.doc_key.clone(), subkeys)
    }

    pub fn validate(&self) -> Result<()> {
        self.doc_key.validate()?;
        self.subkeys
            .iter()
            .try_for_each(PrimitiveValue::check_key_component)
    }

    /// Encodes the key, including the hybrid time if one is set.
    pub fn encode(&self) -> KeyBytes {
        let mut out = self.encode_without_hybrid_time();
        if let Some(dht) = self.doc_ht {
            out.append_doc_hybrid_time(dht);
        }
        out
    }

    pub fn encode_without_hybrid_time(&self) -> KeyBytes {
        let mut out = self.doc_key.encode();
        for subkey in &self.subkeys {
            out.append_primitive(subkey);
        }
        out
    }

    /// Decodes a complete stored key. The hybrid time suffix is mandatory.
    pub fn fully_decode(bytes: &[u8]) -> Result<SubDocKey> {
        Self::decode(bytes, true)
    }

    /// Decodes a key, with or without a trailing hybrid time.
    pub fn decode(bytes: &[u8], require_hybrid_time: bool) -> Result<SubDocKey> {
        let (doc_key, mut pos) = DocKey::decode_prefix(bytes)?;
        let mut subkeys = Vec::new();
        let mut doc_ht = None;
        while pos < bytes.len() {
            if bytes[pos] == ValueType::HybridTime as u8 {
                doc_ht = Some(DocHybridTime::decode(&bytes[pos..])?);
                pos = bytes.len();
                break;
            }
            let (subkey, used) = PrimitiveValue::decode_from_key(&bytes[pos..])?;
            subkeys.push(subkey);
            pos += used;
        }
        if require_hybrid_time && doc_ht.is_none() {
            return Err(Error::Corruption(format!(
                "stored key {} has no hybrid time",
                super::format_key(bytes)
            )));
        }
        Ok(SubDocKey {
            doc_key,
            subkeys,
            doc_ht,
        })
    }
}

impl fmt::Display for SubDocKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubDocKey({}, [", self.doc_key)?;
        write!(f, "{}", self.subkeys.iter().join(", "))?;
        if let Some(dht) = self.doc_ht {
            if !self.subkeys.is_empty() {
                write!(f, "; ")?;
            }
            write!(f, "{}", dht)?;
        }
        write!(f, "])")
    }
}
