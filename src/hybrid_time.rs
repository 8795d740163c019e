//! Hybrid time and its fixed-width key suffix encoding.
//!
//! A `HybridTime` packs a physical clock reading in microseconds with a 12-bit
//! logical counter into one `u64`, so plain integer comparison orders versions.
//! `DocHybridTime` adds a write id that disambiguates several writes of one
//! batch sharing the same hybrid time.
//!
//! # Suffix Format
//!
//! Every stored key ends with the encoded `DocHybridTime`:
//!
//! ```text
//! +-----------+----------------------+-------------------------+
//! | '#' (u8)  | !hybrid_time (u64 BE)| !write_id (u32 BE)      |
//! +-----------+----------------------+-------------------------+
//! | 1 byte    | 8 bytes              | 4 bytes                 |
//! +-----------+----------------------+-------------------------+
//! ```
//!
//! Both numbers are stored bit-inverted, so a newer `(time, write_id)` encodes to
//! a smaller byte string and the versions of one key are laid out newest first.

use std::fmt;
use std::time::Duration;

use crate::docdb::ValueType;
use crate::error::Result;
use crate::Error;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HybridTime(u64);

impl HybridTime {
    pub const BITS_FOR_LOGICAL: u32 = 12;
    pub const LOGICAL_MASK: u64 = (1 << Self::BITS_FOR_LOGICAL) - 1;

    pub const MIN: HybridTime = HybridTime(0);
    pub const INITIAL: HybridTime = HybridTime(1);
    pub const MAX: HybridTime = HybridTime(u64::MAX - 1);
    pub const INVALID: HybridTime = HybridTime(u64::MAX);

    pub const fn from_raw(value: u64) -> Self {
        HybridTime(value)
    }

    pub const fn to_raw(self) -> u64 {
        self.0
    }

    pub const fn from_micros(micros: u64) -> Self {
        HybridTime(micros << Self::BITS_FOR_LOGICAL)
    }

    pub const fn from_micros_and_logical(micros: u64, logical: u64) -> Self {
        HybridTime((micros << Self::BITS_FOR_LOGICAL) | (logical & Self::LOGICAL_MASK))
    }

    pub const fn physical_micros(self) -> u64 {
        self.0 >> Self::BITS_FOR_LOGICAL
    }

    pub const fn logical(self) -> u64 {
        self.0 & Self::LOGICAL_MASK
    }

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    /// Adds `duration` to the physical component. Saturates at `MAX`.
    pub fn add_physical(self, duration: Duration) -> HybridTime {
        if !self.is_valid() {
            return self;
        }
        let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        let max_micros = Self::MAX.physical_micros();
        match self.physical_micros().checked_add(micros) {
            Some(physical) if physical < max_micros => {
                Self::from_micros_and_logical(physical, self.logical())
            }
            _ => Self::MAX,
        }
    }

    /// Subtracts `duration` from the physical component. Saturates at `MIN`.
    pub fn sub_physical(self, duration: Duration) -> HybridTime {
        let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        match self.physical_micros().checked_sub(micros) {
            Some(physical) => Self::from_micros_and_logical(physical, self.logical()),
            None => Self::MIN,
        }
    }

    pub fn incremented(self) -> HybridTime {
        HybridTime(self.0.saturating_add(1).min(Self::MAX.0))
    }

    pub fn decremented(self) -> HybridTime {
        HybridTime(self.0.saturating_sub(1))
    }
}

impl fmt::Display for HybridTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::MIN => write!(f, "<min>"),
            Self::MAX => write!(f, "<max>"),
            Self::INVALID => write!(f, "<invalid>"),
            ht if ht.logical() == 0 => write!(f, "{{ physical: {} }}", ht.physical_micros()),
            ht => write!(
                f,
                "{{ physical: {} logical: {} }}",
                ht.physical_micros(),
                ht.logical()
            ),
        }
    }
}

impl fmt::Debug for HybridTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HybridTime{}", self)
    }
}

pub type WriteId = u32;

pub const MAX_WRITE_ID: WriteId = u32::MAX;

/// Hybrid time plus the position of the write inside its batch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DocHybridTime {
    hybrid_time: HybridTime,
    write_id: WriteId,
}

impl DocHybridTime {
    /// Marker byte plus inverted time plus inverted write id.
    pub const ENCODED_SIZE: usize = 1 + 8 + 4;

    pub const MIN: DocHybridTime = DocHybridTime::new(HybridTime::MIN, 0);
    pub const MAX: DocHybridTime = DocHybridTime::new(HybridTime::MAX, MAX_WRITE_ID);
    pub const INVALID: DocHybridTime = DocHybridTime::new(HybridTime::INVALID, MAX_WRITE_ID);

    pub const fn new(hybrid_time: HybridTime, write_id: WriteId) -> Self {
        Self {
            hybrid_time,
            write_id,
        }
    }

    /// The latest possible version at `hybrid_time`, the bound used by seeks.
    pub const fn max_at(hybrid_time: HybridTime) -> Self {
        Self::new(hybrid_time, MAX_WRITE_ID)
    }

    pub fn hybrid_time(&self) -> HybridTime {
        self.hybrid_time
    }

    pub fn write_id(&self) -> WriteId {
        self.write_id
    }

    pub fn is_valid(&self) -> bool {
        self.hybrid_time.is_valid()
    }

    pub fn encode(&self) -> [u8; Self::ENCODED_SIZE] {
        let mut buf = [0u8; Self::ENCODED_SIZE];
        buf[0] = ValueType::HybridTime as u8;
        buf[1..9].copy_from_slice(&(!self.hybrid_time.to_raw()).to_be_bytes());
        buf[9..13].copy_from_slice(&(!self.write_id).to_be_bytes());
        buf
    }

    pub fn append_encoded(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.encode());
    }

    /// Decodes exactly one encoded suffix.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::ENCODED_SIZE {
            return Err(Error::Corruption(format!(
                "encoded DocHybridTime must be {} bytes, found {}",
                Self::ENCODED_SIZE,
                bytes.len()
            )));
        }
        if bytes[0] != ValueType::HybridTime as u8 {
            return Err(Error::Corruption(format!(
                "expected hybrid time marker {:#04x}, found {:#04x}",
                ValueType::HybridTime as u8,
                bytes[0]
            )));
        }

        let mut ht = [0u8; 8];
        ht.copy_from_slice(&bytes[1..9]);
        let mut write_id = [0u8; 4];
        write_id.copy_from_slice(&bytes[9..13]);

        Ok(Self::new(
            HybridTime::from_raw(!u64::from_be_bytes(ht)),
            !u32::from_be_bytes(write_id),
        ))
    }

    /// Decodes the suffix of a stored key.
    pub fn decode_from_end(key: &[u8]) -> Result<Self> {
        if key.len() < Self::ENCODED_SIZE {
            return Err(Error::Corruption(format!(
                "key of {} bytes is too short to carry a DocHybridTime",
                key.len()
            )));
        }
        Self::decode(&key[key.len() - Self::ENCODED_SIZE..])
    }

    /// Returns true if `key` ends with something shaped like a suffix.
    pub fn has_suffix(key: &[u8]) -> bool {
        key.len() >= Self::ENCODED_SIZE
            && key[key.len() - Self::ENCODED_SIZE] == ValueType::HybridTime as u8
    }
}

impl fmt::Display for DocHybridTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.write_id == 0 {
            write!(f, "{}", self.hybrid_time)
        } else {
            write!(f, "{} w: {}", self.hybrid_time, self.write_id)
        }
    }
}

impl fmt::Debug for DocHybridTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocHybridTime({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dht(micros: u64, write_id: WriteId) -> DocHybridTime {
        DocHybridTime::new(HybridTime::from_micros(micros), write_id)
    }

    #[test]
    fn test_physical_and_logical_components() {
        let ht = HybridTime::from_micros_and_logical(1_000, 7);
        assert_eq!(ht.physical_micros(), 1_000);
        assert_eq!(ht.logical(), 7);
        assert!(HybridTime::from_micros(1_000) < ht);
        assert!(ht < HybridTime::from_micros(1_001));
    }

    #[test]
    fn test_add_physical() {
        let ht = HybridTime::from_micros(10);
        assert_eq!(
            ht.add_physical(Duration::from_micros(5)),
            HybridTime::from_micros(15)
        );
        assert_eq!(HybridTime::MAX.add_physical(Duration::from_secs(1)), HybridTime::MAX);
        assert_eq!(ht.add_physical(Duration::MAX), HybridTime::MAX);
        assert_eq!(
            HybridTime::INVALID.add_physical(Duration::from_secs(1)),
            HybridTime::INVALID
        );
        assert_eq!(ht.sub_physical(Duration::from_secs(1)), HybridTime::MIN);
    }

    #[test]
    fn test_newer_times_encode_smaller() {
        let times = [
            DocHybridTime::MIN,
            dht(1, 0),
            dht(1, 1),
            dht(2, 0),
            dht(1 << 40, 3),
            DocHybridTime::new(HybridTime::from_micros_and_logical(1 << 40, 1), 0),
            DocHybridTime::MAX,
        ];
        for pair in times.windows(2) {
            assert!(pair[0] < pair[1]);
            assert!(
                pair[0].encode() > pair[1].encode(),
                "{} should encode after {}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_sentinels_decode_to_themselves() {
        for t in [DocHybridTime::MIN, DocHybridTime::MAX, dht(12345, 9)] {
            let mut key = b"doc".to_vec();
            t.append_encoded(&mut key);
            assert_eq!(DocHybridTime::decode_from_end(&key).unwrap(), t);
        }
    }

    #[test]
    fn test_decode_rejects_malformed_suffix() {
        assert!(DocHybridTime::decode_from_end(b"short")
            .unwrap_err()
            .is_corruption());

        let mut key = b"doc".to_vec();
        dht(10, 0).append_encoded(&mut key);
        let marker = key.len() - DocHybridTime::ENCODED_SIZE;
        key[marker] = b'S';
        assert!(DocHybridTime::decode_from_end(&key)
            .unwrap_err()
            .is_corruption());
        assert!(!DocHybridTime::has_suffix(&key));
    }
}
