//! Formats raw keys and values for logs and test failures. Handles document
//! keys, stored values and raw binary data.

use itertools::Itertools as _;

use crate::docdb::{SubDocKey, Value};

/// Formats encoded keys and values.
pub trait Formatter {
    /// Formats a key.
    fn key(key: &[u8]) -> String;

    /// Formats a value. Also takes the key to determine the kind of value.
    fn value(key: &[u8], value: &[u8]) -> String;

    /// Formats a key/value pair.
    fn key_value(key: &[u8], value: &[u8]) -> String {
        Self::key_maybe_value(key, Some(value))
    }

    /// Formats a key/value pair, where the value may not exist.
    fn key_maybe_value(key: &[u8], value: Option<&[u8]>) -> String {
        let fmtkey = Self::key(key);
        let fmtvalue = value.map_or("None".to_string(), |v| Self::value(key, v));
        format!("{fmtkey} -> {fmtvalue}")
    }
}

/// Formats raw byte slices without any decoding.
pub struct Raw;

impl Raw {
    /// Formats raw bytes as escaped ASCII strings.
    pub fn bytes(bytes: &[u8]) -> String {
        let escaped = bytes
            .iter()
            .copied()
            .flat_map(std::ascii::escape_default)
            .collect_vec();
        format!("\"{}\"", String::from_utf8_lossy(&escaped))
    }
}

impl Formatter for Raw {
    fn key(key: &[u8]) -> String {
        Self::bytes(key)
    }

    fn value(_key: &[u8], value: &[u8]) -> String {
        Self::bytes(value)
    }
}

/// Formats stored document keys and values, falling back to raw bytes for
/// anything that does not decode (seek boundaries, corrupt entries).
pub struct DocDb;

impl Formatter for DocDb {
    fn key(key: &[u8]) -> String {
        match SubDocKey::decode(key, false) {
            Ok(decoded) => decoded.to_string(),
            Err(_) => Raw::key(key),
        }
    }

    fn value(_key: &[u8], value: &[u8]) -> String {
        match Value::decode(value) {
            Ok(decoded) => decoded.to_string(),
            Err(_) => Raw::bytes(value),
        }
    }
}
