use dashmap::DashMap;

use super::record::{AccumulatorRecord, Counter, RECORD_SIZE};
use super::{BucketKey, BucketTable, TableError};

/// In-process bucket table with the same byte layout as the BPF map.
///
/// Uses `DashMap` so producers on other threads can increment the open
/// bucket while the drain side lists and deletes. Each entry is
/// independently lockable, so an increment is atomic per key.
#[derive(Debug, Default)]
pub struct MemoryTable {
    buckets: DashMap<BucketKey, Vec<u8>>,
}

impl MemoryTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self {
            buckets: DashMap::with_capacity(16),
        }
    }

    /// Adds `delta` to one counter of the bucket at `key`, creating it if needed.
    ///
    /// Entries that are not [`RECORD_SIZE`] bytes long are left untouched.
    pub fn add(&self, key: BucketKey, counter: Counter, delta: u64) {
        let mut entry = self
            .buckets
            .entry(key)
            .or_insert_with(|| vec![0u8; RECORD_SIZE]);

        let value = entry.value_mut();
        if value.len() != RECORD_SIZE {
            return;
        }

        let off = counter.offset();
        if let Some(word) = value.get_mut(off..off + 8) {
            let mut current = [0u8; 8];
            current.copy_from_slice(word);
            let next = u64::from_ne_bytes(current).saturating_add(delta);
            word.copy_from_slice(&next.to_ne_bytes());
        }
    }

    /// Inserts a complete record, replacing any existing bucket.
    pub fn insert(&self, key: BucketKey, record: &AccumulatorRecord) {
        self.buckets.insert(key, record.encode().to_vec());
    }

    /// Inserts raw bytes as-is. Used to model producer/consumer layout drift.
    pub fn insert_raw(&self, key: BucketKey, raw: Vec<u8>) {
        self.buckets.insert(key, raw);
    }

    /// Returns whether a bucket exists for `key`.
    pub fn contains(&self, key: BucketKey) -> bool {
        self.buckets.contains_key(&key)
    }

    /// Returns the number of buckets present.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Returns whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Returns the present keys in ascending order.
    pub fn sorted_keys(&self) -> Vec<BucketKey> {
        let mut keys: Vec<BucketKey> = self.buckets.iter().map(|e| *e.key()).collect();
        keys.sort_unstable();
        keys
    }
}

impl BucketTable for MemoryTable {
    fn keys(&self) -> Result<Vec<BucketKey>, TableError> {
        Ok(self.buckets.iter().map(|e| *e.key()).collect())
    }

    fn get(&self, key: BucketKey) -> Result<Option<Vec<u8>>, TableError> {
        Ok(self.buckets.get(&key).map(|v| v.value().clone()))
    }

    fn remove(&self, key: BucketKey) -> Result<(), TableError> {
        self.buckets.remove(&key);
        Ok(())
    }
}
