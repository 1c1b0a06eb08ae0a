use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};

use crate::table::BucketKey;

/// Maps wall-clock instants to bucket keys and back.
///
/// A key is the number of whole `interval`s elapsed since the Unix epoch,
/// so keys are totally ordered the same way their intervals are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketCodec {
    interval_secs: u64,
}

impl BucketCodec {
    /// Create a codec for the given bucket interval.
    pub fn new(interval: Duration) -> Result<Self> {
        if interval.is_zero() {
            bail!("bucket interval must be > 0");
        }

        if interval.subsec_nanos() != 0 {
            bail!("bucket interval must be a whole number of seconds, got {interval:?}");
        }

        Ok(Self {
            interval_secs: interval.as_secs(),
        })
    }

    /// Return the configured bucket interval.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Quantize `t` to the key of its containing interval.
    ///
    /// Instants before the epoch map to key 0.
    pub fn encode(&self, t: SystemTime) -> BucketKey {
        let elapsed = t.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
        elapsed.as_secs() / self.interval_secs
    }

    /// Return the start instant of the interval identified by `key`.
    ///
    /// Returns `None` for keys whose start lies outside the range that
    /// can be represented and rendered as a UTC date.
    pub fn decode(&self, key: BucketKey) -> Option<SystemTime> {
        let secs = key.checked_mul(self.interval_secs)?;
        DateTime::<Utc>::from_timestamp(i64::try_from(secs).ok()?, 0)?;
        UNIX_EPOCH.checked_add(Duration::from_secs(secs))
    }

    /// Render the interval start for `key` as UTC `HH:MM:SS`.
    pub fn format_hms(&self, key: BucketKey) -> String {
        match self.decode(key) {
            Some(t) => format_hms(t),
            None => format!("#{key}"),
        }
    }
}

/// Converts `t` to a UTC date, or `None` if chrono cannot represent it.
fn to_utc(t: SystemTime) -> Option<DateTime<Utc>> {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => DateTime::<Utc>::from_timestamp(i64::try_from(d.as_secs()).ok()?, d.subsec_nanos()),
        Err(e) => {
            let d = e.duration();
            let secs = i64::try_from(d.as_secs()).ok()?;
            match d.subsec_nanos() {
                0 => DateTime::<Utc>::from_timestamp(-secs, 0),
                nanos => DateTime::<Utc>::from_timestamp(-secs - 1, 1_000_000_000 - nanos),
            }
        }
    }
}

/// Unix seconds of `t`, for rendering instants chrono cannot represent.
fn unix_secs_label(t: SystemTime) -> String {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => format!("@{}", d.as_secs()),
        Err(e) => format!("@-{}", e.duration().as_secs()),
    }
}

/// Render `t` as UTC `HH:MM:SS`.
pub fn format_hms(t: SystemTime) -> String {
    match to_utc(t) {
        Some(dt) => dt.format("%H:%M:%S").to_string(),
        None => unix_secs_label(t),
    }
}

/// Render `t` as UTC `YYYY-MM-DD HH:MM:SS`.
pub fn format_datetime(t: SystemTime) -> String {
    match to_utc(t) {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => unix_secs_label(t),
    }
}
