//! Document model on top of an ordered key/value store.
//!
//! Rows are documents. Every node of a document is stored under its own key,
//! suffixed with the hybrid time of the write, so one scan over a key prefix
//! yields every version of a node followed by its descendants.

pub mod doc_key;
pub mod doc_reader;
pub mod lock_manager;
pub mod primitive_value;
pub mod resolver;
pub mod seek;
pub mod value;
pub mod value_type;
pub mod write_batch;

pub use doc_key::{DocKey, KeyBytes, SubDocKey};
pub use doc_reader::{DocReader, SubDocument};
pub use lock_manager::{LockBatch, LockManager};
pub use primitive_value::PrimitiveValue;
pub use resolver::{resolve, ResolvedValue};
pub use seek::{KvIterator, SeekOptimizer, SeekStats};
pub use value::Value;
pub use value_type::ValueType;
pub use write_batch::DocWriteBatch;

use crate::encoding::format::{DocDb, Formatter};

/// Human-readable rendering of an encoded key for logs and assertions.
pub fn format_key(key: &[u8]) -> String {
    DocDb::key(key)
}
