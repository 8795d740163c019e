//! A multi-version document storage tablet.
//!
//! Documents are stored as ordered key/value pairs whose keys carry the hybrid
//! time of the write. Reads see a consistent snapshot at a hybrid time and
//! resolve TTL expiry on the fly. Writes go to an in-memory rowset that is
//! flushed to immutable on-disk rowsets; background compactions merge rowsets,
//! fold delta blocks and garbage collect history no reader can still see.

pub mod block;
pub mod clock;
pub mod config;
pub mod docdb;
pub mod encoding;
pub mod error;
pub mod flock;
pub mod hybrid_time;
pub mod rate_limiter;
pub mod scheduler;
pub mod tablet;

#[cfg(test)]
mod tmpfs;

pub use clock::{Clock, HybridClock, ManualClock, SharedClock};
pub use config::{CompactionConfig, SchedulerConfig, TabletConfig};
pub use docdb::{DocKey, DocWriteBatch, PrimitiveValue, SubDocKey, SubDocument, Value};
pub use error::{Error, Result};
pub use hybrid_time::{DocHybridTime, HybridTime};
pub use scheduler::Scheduler;
pub use tablet::{
    CompactFlags, DeltaCompactionType, FlushMode, MvccSnapshot, RowIteratorOptions, Tablet,
    TabletState,
};
