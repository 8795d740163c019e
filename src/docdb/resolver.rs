use super::doc_key::{encode_seek_key, KeyBytes, SubDocKey};
use super::seek::{KvIterator, SeekOptimizer};
use super::Value;
use crate::error::Result;
use crate::hybrid_time::{DocHybridTime, HybridTime, MAX_WRITE_ID};

/// The newest version of a key, or of its first descendant, visible at a read time.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedValue {
    /// Found key carrying the resolved time: the write time, or the expiry time
    /// if the value expired before the read time.
    pub key: SubDocKey,
    /// Found key without its hybrid time.
    pub key_bytes: KeyBytes,
    /// The stored value, or a tombstone standing in for an expired one.
    pub value: Value,
}

impl ResolvedValue {
    pub fn doc_hybrid_time(&self) -> DocHybridTime {
        self.key.doc_hybrid_time().unwrap_or(DocHybridTime::INVALID)
    }

    /// True if the entry is a version of `key` itself rather than a descendant.
    pub fn is_exact(&self, key: &[u8]) -> bool {
        self.key_bytes.as_slice() == key
    }
}

/// Finds the first stored entry under `key` (the key itself or any descendant)
/// that is visible at `read_time`.
///
/// `key` is an encoded `SubDocKey` without a hybrid time. Descendants written
/// after `read_time` without a parent version are skipped one by one; each
/// re-seek moves strictly forward, so the loop ends after at most one round per
/// such descendant.
pub fn resolve<I: KvIterator + ?Sized>(
    iter: &mut I,
    optimizer: &SeekOptimizer,
    key: &[u8],
    read_time: HybridTime,
) -> Result<Option<ResolvedValue>> {
    let mut seek_key = encode_seek_key(key, read_time, MAX_WRITE_ID);
    loop {
        optimizer.seek(iter, &seek_key)?;
        if !iter.valid() || !iter.key().starts_with(key) {
            return Ok(None);
        }

        let found_ht = DocHybridTime::decode_from_end(iter.key())?;
        if found_ht.hybrid_time() <= read_time {
            break;
        }

        // A descendant written after the read time. Retry at its newest
        // version visible at the read time, which sorts after this one.
        seek_key = KeyBytes::from(iter.key());
        seek_key.replace_last_hybrid_time_for_seek(read_time)?;
    }

    let found = iter.key();
    let mut found_key = SubDocKey::fully_decode(found)?;
    let key_bytes = KeyBytes::from(&found[..found.len() - DocHybridTime::ENCODED_SIZE]);
    let value = Value::decode(iter.value())?;
    let write_time = found_key
        .doc_hybrid_time()
        .map(|dht| dht.hybrid_time())
        .unwrap_or(HybridTime::INVALID);

    if let Some(expiry) = value.expiry(write_time) {
        if read_time > expiry {
            // Report the expired value as a deletion made at its expiry time.
            found_key.set_hybrid_time(DocHybridTime::new(expiry, 0));
            return Ok(Some(ResolvedValue {
                key: found_key,
                key_bytes,
                value: Value::tombstone(),
            }));
        }
    }

    Ok(Some(ResolvedValue {
        key: found_key,
        key_bytes,
        value,
    }))
}
