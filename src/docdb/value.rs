use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::PrimitiveValue;
use crate::encoding::bincode;
use crate::error::Result;
use crate::hybrid_time::HybridTime;

/// A stored value: the payload plus an optional time-to-live.
///
/// A missing TTL means the value never expires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Value {
    ttl: Option<Duration>,
    primitive: PrimitiveValue,
}

impl Value {
    pub fn new(primitive: impl Into<PrimitiveValue>) -> Self {
        Self {
            ttl: None,
            primitive: primitive.into(),
        }
    }

    pub fn tombstone() -> Self {
        Self::new(PrimitiveValue::Tombstone)
    }

    pub fn object() -> Self {
        Self::new(PrimitiveValue::Object)
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    pub fn set_ttl(&mut self, ttl: Option<Duration>) {
        self.ttl = ttl;
    }

    pub fn primitive(&self) -> &PrimitiveValue {
        &self.primitive
    }

    pub fn into_primitive(self) -> PrimitiveValue {
        self.primitive
    }

    pub fn is_tombstone(&self) -> bool {
        self.primitive.is_tombstone()
    }

    /// Time at which a version written at `write_time` expires, if it ever does.
    pub fn expiry(&self, write_time: HybridTime) -> Option<HybridTime> {
        self.ttl.map(|ttl| write_time.add_physical(ttl))
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ttl {
            Some(ttl) => write!(f, "{}; ttl: {:?}", self.primitive, ttl),
            None => write!(f, "{}", self.primitive),
        }
    }
}
