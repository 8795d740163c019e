use super::EncodingError;
use crate::error::Result;
use serde::{Deserialize, Serialize};

/// Serialize a value using bincode
pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value)
        .map_err(|e| EncodingError::InvalidFormat(format!("Serialization failed: {}", e)).into())
}

/// Deserialize a value from a byte slice using bincode.
///
/// Trailing bytes after the value are treated as corruption.
pub fn deserialize<T: for<'a> Deserialize<'a>>(bytes: &[u8]) -> Result<T> {
    let mut reader = bytes;
    let value = bincode::deserialize_from(&mut reader)
        .map_err(|e| EncodingError::InvalidFormat(format!("Deserialization failed: {}", e)))?;
    if !reader.is_empty() {
        return Err(EncodingError::InvalidFormat(format!(
            "{} trailing bytes after value",
            reader.len()
        ))
        .into());
    }
    Ok(value)
}
