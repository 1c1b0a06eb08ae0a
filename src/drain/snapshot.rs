use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::clock::format_datetime;
use crate::table::{AccumulatorRecord, BucketKey};

/// Immutable copy of one drained bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Key of the bucket this snapshot was decoded from.
    pub key: BucketKey,
    /// Start of the bucket's interval.
    pub timestamp: SystemTime,
    /// Node identity label.
    pub node_id: Arc<str>,
    /// Counter values.
    pub record: AccumulatorRecord,
}

impl MetricsSnapshot {
    /// Interval start as whole seconds since the Unix epoch.
    pub fn unix_seconds(&self) -> u64 {
        self.timestamp
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }

    /// JSON view used by push exporters.
    pub fn to_json(&self) -> SnapshotJson<'_> {
        SnapshotJson {
            node_id: &self.node_id,
            bucket: self.key,
            window_start: format_datetime(self.timestamp),
            window_start_unix: self.unix_seconds(),
            record: &self.record,
        }
    }
}

/// JSON schema for pushed snapshots.
#[derive(Debug, Serialize)]
pub struct SnapshotJson<'a> {
    pub node_id: &'a str,
    pub bucket: BucketKey,
    pub window_start: String,
    pub window_start_unix: u64,
    #[serde(flatten)]
    pub record: &'a AccumulatorRecord,
}
