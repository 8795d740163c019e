use std::fmt;

use serde::{Deserialize, Serialize};

use super::ValueType;
use crate::encoding::{keycode, EncodingError};
use crate::error::Result;
use crate::Error;

/// A scalar that can be a key component, a stored value or a marker.
///
/// `Tombstone` and `Object` only appear as values: a tombstone deletes the
/// subtree below a key, an object marker overwrites it with an empty document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PrimitiveValue {
    Null,
    Bool(bool),
    Int64(i64),
    Double(f64),
    String(String),
    Tombstone,
    Object,
}

impl PrimitiveValue {
    pub fn value_type(&self) -> ValueType {
        match self {
            PrimitiveValue::Null => ValueType::Null,
            PrimitiveValue::Bool(true) => ValueType::True,
            PrimitiveValue::Bool(false) => ValueType::False,
            PrimitiveValue::Int64(_) => ValueType::Int64,
            PrimitiveValue::Double(_) => ValueType::Double,
            PrimitiveValue::String(_) => ValueType::String,
            PrimitiveValue::Tombstone => ValueType::Tombstone,
            PrimitiveValue::Object => ValueType::Object,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self, PrimitiveValue::Tombstone)
    }

    pub fn is_object(&self) -> bool {
        matches!(self, PrimitiveValue::Object)
    }

    /// Rejects values that cannot be used as a key component.
    pub fn check_key_component(&self) -> Result<()> {
        if self.value_type().is_key_component() {
            Ok(())
        } else {
            Err(Error::InvalidArgument(format!(
                "{} cannot be used as a key component",
                self
            )))
        }
    }

    /// Appends the order-preserving key encoding: type tag followed by payload.
    pub fn append_to_key(&self, buf: &mut Vec<u8>) {
        buf.push(self.value_type() as u8);
        match self {
            PrimitiveValue::Int64(i) => keycode::encode_i64(buf, *i),
            PrimitiveValue::Double(f) => keycode::encode_f64(buf, *f),
            PrimitiveValue::String(s) => keycode::encode_string(buf, s),
            PrimitiveValue::Null
            | PrimitiveValue::Bool(_)
            | PrimitiveValue::Tombstone
            | PrimitiveValue::Object => {}
        }
    }

    /// Decodes one key component from the front of `bytes`.
    pub fn decode_from_key(bytes: &[u8]) -> Result<(PrimitiveValue, usize)> {
        let tag = *bytes.first().ok_or(EncodingError::TruncatedData)?;
        let rest = &bytes[1..];
        let (value, used) = match ValueType::from_byte(tag)? {
            ValueType::Null => (PrimitiveValue::Null, 0),
            ValueType::True => (PrimitiveValue::Bool(true), 0),
            ValueType::False => (PrimitiveValue::Bool(false), 0),
            ValueType::Int64 => {
                let (i, used) = keycode::decode_i64(rest)?;
                (PrimitiveValue::Int64(i), used)
            }
            ValueType::Double => {
                let (f, used) = keycode::decode_f64(rest)?;
                (PrimitiveValue::Double(f), used)
            }
            ValueType::String => {
                let (s, used) = keycode::decode_string(rest)?;
                (PrimitiveValue::String(s), used)
            }
            other => {
                return Err(EncodingError::InvalidFormat(format!(
                    "{:?} is not a key component",
                    other
                ))
                .into())
            }
        };
        Ok((value, used + 1))
    }
}

impl fmt::Display for PrimitiveValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrimitiveValue::Null => write!(f, "null"),
            PrimitiveValue::Bool(b) => write!(f, "{}", b),
            PrimitiveValue::Int64(i) => write!(f, "{}", i),
            PrimitiveValue::Double(d) => write!(f, "{}", d),
            PrimitiveValue::String(s) => write!(f, "{:?}", s),
            PrimitiveValue::Tombstone => write!(f, "DEL"),
            PrimitiveValue::Object => write!(f, "{{}}"),
        }
    }
}

impl From<&str> for PrimitiveValue {
    fn from(s: &str) -> Self {
        PrimitiveValue::String(s.to_string())
    }
}

impl From<String> for PrimitiveValue {
    fn from(s: String) -> Self {
        PrimitiveValue::String(s)
    }
}

impl From<i64> for PrimitiveValue {
    fn from(i: i64) -> Self {
        PrimitiveValue::Int64(i)
    }
}

impl From<f64> for PrimitiveValue {
    fn from(f: f64) -> Self {
        PrimitiveValue::Double(f)
    }
}

impl From<bool> for PrimitiveValue {
    fn from(b: bool) -> Self {
        PrimitiveValue::Bool(b)
    }
}
