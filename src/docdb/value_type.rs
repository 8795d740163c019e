use crate::encoding::EncodingError;
use crate::error::Result;

/// Type tag that precedes every encoded key component and value.
///
/// The byte values define cross-type ordering inside keys. `GroupEnd` closes the
/// document key and sorts before every component type, and `HybridTime` sorts
/// before every subkey type, so all versions of a key come before any of its
/// descendants.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ValueType {
    GroupEnd = b'!',
    HybridTime = b'#',
    Null = b'$',
    Double = b'D',
    False = b'F',
    Int64 = b'I',
    String = b'S',
    True = b'T',
    Tombstone = b'X',
    Object = b'{',
    Ttl = b't',
    /// Larger than any tag, used to build keys past a whole subtree.
    Highest = 0xFF,
}

impl ValueType {
    pub fn from_byte(b: u8) -> Result<Self> {
        let value_type = match b {
            b'!' => ValueType::GroupEnd,
            b'#' => ValueType::HybridTime,
            b'$' => ValueType::Null,
            b'D' => ValueType::Double,
            b'F' => ValueType::False,
            b'I' => ValueType::Int64,
            b'S' => ValueType::String,
            b'T' => ValueType::True,
            b'X' => ValueType::Tombstone,
            b'{' => ValueType::Object,
            b't' => ValueType::Ttl,
            0xFF => ValueType::Highest,
            other => return Err(EncodingError::UnknownValueType(other).into()),
        };
        Ok(value_type)
    }

    /// Whether this tag may start a document key component or subkey.
    pub fn is_key_component(self) -> bool {
        matches!(
            self,
            ValueType::Null
                | ValueType::Double
                | ValueType::False
                | ValueType::Int64
                | ValueType::String
                | ValueType::True
        )
    }
}
