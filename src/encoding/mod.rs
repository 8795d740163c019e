//! Byte-level encodings shared by keys, values and on-disk structures.
//!
//! - `keycode`: order-preserving encodings for key components, so that the
//!   byte-wise order of encoded keys matches the logical order of their parts.
//! - `bincode`: compact serialization for values, which need no ordering.
//! - `format`: human-readable rendering of encoded keys and values for logs.

pub mod bincode;
pub mod format;
pub mod keycode;

/// Error type for encoding operations
#[derive(Debug)]
pub enum EncodingError {
    InvalidFormat(String),
    UnknownValueType(u8),
    TruncatedData,
    InvalidUtf8,
}

impl std::fmt::Display for EncodingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncodingError::InvalidFormat(msg) => write!(f, "Invalid encoding format: {}", msg),
            EncodingError::UnknownValueType(b) => write!(f, "Unknown value type {:#04x}", b),
            EncodingError::TruncatedData => write!(f, "Truncated data"),
            EncodingError::InvalidUtf8 => write!(f, "Invalid UTF-8 sequence"),
        }
    }
}

impl std::error::Error for EncodingError {}

impl From<EncodingError> for crate::Error {
    fn from(err: EncodingError) -> Self {
        crate::Error::Corruption(err.to_string())
    }
}
