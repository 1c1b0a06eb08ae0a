//! Producer-owned bucket table.
//!
//! The table maps a quantized timestamp ([`BucketKey`]) to a raw
//! accumulator record. Producers increment fields of the open bucket
//! without coordinating with the drain side; consumers only list, read,
//! and delete.

pub mod memory;
pub mod record;

use std::sync::Arc;

use thiserror::Error;

pub use self::memory::MemoryTable;
pub use self::record::{AccumulatorRecord, Counter, RecordError, RECORD_SIZE};

/// Quantized interval index: wall-clock seconds divided by the bucket interval.
pub type BucketKey = u64;

/// Errors returned by bucket table access.
#[derive(Error, Debug)]
pub enum TableError {
    #[error("listing buckets: {0}")]
    List(String),

    #[error("reading bucket {key}: {message}")]
    Lookup { key: BucketKey, message: String },

    #[error("removing bucket {key}: {message}")]
    Remove { key: BucketKey, message: String },
}

/// Consumer view of a concurrently written bucket table.
///
/// Implementations hold no lock across calls; every method is a
/// point-in-time read or a single-key delete.
pub trait BucketTable: Send + Sync {
    /// List the keys currently present, in no particular order.
    fn keys(&self) -> Result<Vec<BucketKey>, TableError>;

    /// Read the raw record for `key`, or `None` if it is absent.
    fn get(&self, key: BucketKey) -> Result<Option<Vec<u8>>, TableError>;

    /// Delete `key`. Deleting an absent key is not an error.
    fn remove(&self, key: BucketKey) -> Result<(), TableError>;
}

impl<T: BucketTable + ?Sized> BucketTable for Arc<T> {
    fn keys(&self) -> Result<Vec<BucketKey>, TableError> {
        (**self).keys()
    }

    fn get(&self, key: BucketKey) -> Result<Option<Vec<u8>>, TableError> {
        (**self).get(key)
    }

    fn remove(&self, key: BucketKey) -> Result<(), TableError> {
        (**self).remove(key)
    }
}
