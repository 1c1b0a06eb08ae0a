//! Drain engine: consumes closed buckets from the shared table.
//!
//! Each tick lists the table, picks the newest bucket that lies behind
//! the trailing safety margin, publishes it and deletes it. The newest
//! `trailing_buckets` buckets may still be written by producers and are
//! never read.

pub mod snapshot;

use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::BucketCodec;
use crate::config::{DrainConfig, MalformedPolicy};
use crate::export::health::HealthMetrics;
use crate::report::DiagnosticReporter;
use crate::sink::MetricsSink;
use crate::table::{AccumulatorRecord, BucketKey, BucketTable, RecordError, TableError};

use self::snapshot::MetricsSnapshot;

/// Errors that abort a single tick.
#[derive(Error, Debug)]
pub enum DrainError {
    #[error("bucket table: {0}")]
    Table(#[from] TableError),
}

/// Why a selected bucket could not be turned into a snapshot.
#[derive(Error, Debug)]
enum MalformedBucket {
    #[error(transparent)]
    Record(#[from] RecordError),

    #[error("key {0} is outside the representable time range")]
    KeyRange(BucketKey),
}

/// Result of one successful tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// No bucket was safe to consume.
    Idle { buckets: usize },
    /// The bucket was published and deleted.
    Drained { key: BucketKey },
    /// Publishing failed; the bucket stays in the table for the next tick.
    PublishFailed { key: BucketKey, consecutive: u32 },
    /// The bucket's record or key could not be decoded.
    Malformed { key: BucketKey, deleted: bool },
}

/// Returns the newest key that still has `trailing` newer keys after it.
///
/// `keys` must be sorted ascending.
pub fn select_closed(keys: &[BucketKey], trailing: usize) -> Option<BucketKey> {
    let idx = keys.len().checked_sub(trailing + 1)?;
    keys.get(idx).copied()
}

/// Sole reader and deleter of the bucket table.
pub struct DrainEngine<T, S> {
    table: T,
    codec: BucketCodec,
    sink: S,
    node_id: Arc<str>,
    cfg: DrainConfig,
    reporter: Option<DiagnosticReporter>,
    health: Option<Arc<HealthMetrics>>,
    last_consumed: Option<BucketKey>,
    consecutive_failures: u32,
    degraded: bool,
}

impl<T: BucketTable, S: MetricsSink> DrainEngine<T, S> {
    /// Creates an engine draining `table` into `sink`.
    pub fn new(
        table: T,
        codec: BucketCodec,
        sink: S,
        node_id: Arc<str>,
        cfg: &DrainConfig,
    ) -> Self {
        Self {
            table,
            codec,
            sink,
            node_id,
            cfg: cfg.clone(),
            reporter: None,
            health: None,
            last_consumed: None,
            consecutive_failures: 0,
            degraded: false,
        }
    }

    /// Prints one row per drained bucket.
    pub fn with_reporter(mut self, reporter: DiagnosticReporter) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Records drain counters on the health registry.
    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    /// Key of the most recently consumed bucket.
    pub fn last_consumed(&self) -> Option<BucketKey> {
        self.last_consumed
    }

    /// Whether consecutive publish failures have reached the threshold.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Consecutive failed publish attempts.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Runs one drain pass.
    pub async fn tick(&mut self) -> Result<TickOutcome, DrainError> {
        let mut keys = self.table.keys()?;
        keys.sort_unstable();

        if let Some(health) = &self.health {
            health.table_buckets.set(keys.len() as f64);
        }

        let keys = self.prune_stale(keys);

        let Some(key) = select_closed(&keys, self.cfg.trailing_buckets) else {
            debug!(buckets = keys.len(), "no closed bucket to drain");
            self.count_idle();
            return Ok(TickOutcome::Idle {
                buckets: keys.len(),
            });
        };

        let Some(raw) = self.table.get(key)? else {
            debug!(bucket = key, "selected bucket vanished before read");
            self.count_idle();
            return Ok(TickOutcome::Idle {
                buckets: keys.len(),
            });
        };

        let record = match AccumulatorRecord::decode(&raw) {
            Ok(record) => record,
            Err(e) => return Ok(self.handle_malformed(key, e.into())),
        };

        let Some(timestamp) = self.codec.decode(key) else {
            return Ok(self.handle_malformed(key, MalformedBucket::KeyRange(key)));
        };

        let snapshot = MetricsSnapshot {
            key,
            timestamp,
            node_id: Arc::clone(&self.node_id),
            record,
        };

        if let Err(e) = self.sink.publish(&snapshot).await {
            return Ok(self.handle_publish_failure(key, &e));
        }

        self.publish_recovered();

        if let Some(reporter) = &mut self.reporter {
            reporter.report(&snapshot);
        }

        // Published: the key counts as consumed even if the delete fails.
        self.last_consumed = Some(key);

        if let Err(e) = self.table.remove(key) {
            warn!(bucket = key, error = %e, "deleting drained bucket failed");
            self.count_table_error();
        }

        if let Some(health) = &self.health {
            health.buckets_drained.inc();
            health.last_drained_bucket.set(key as f64);
        }

        debug!(bucket = key, sink = self.sink.name(), "drained bucket");

        Ok(TickOutcome::Drained { key })
    }

    /// Ticks every `poll_interval` until cancelled.
    ///
    /// The first tick fires one interval after start. Shutdown does not
    /// flush buckets.
    pub async fn run(mut self, cancel: CancellationToken) {
        let poll = self.cfg.poll_interval;
        let start = tokio::time::Instant::now() + poll;
        let mut ticker = tokio::time::interval_at(start, poll);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(
            poll_interval = ?poll,
            trailing_buckets = self.cfg.trailing_buckets,
            sink = self.sink.name(),
            "drain loop started",
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let started = Instant::now();
                    let result = self.tick().await;

                    if let Some(health) = &self.health {
                        health.ticks.inc();
                        health.tick_duration.observe(started.elapsed().as_secs_f64());
                    }

                    if let Err(e) = result {
                        error!(error = %e, "drain tick failed");
                        self.count_table_error();
                    }
                }
            }
        }

        info!(last_consumed = ?self.last_consumed, "drain loop stopped");
    }

    /// Deletes keys at or below the last consumed key and returns the rest.
    fn prune_stale(&mut self, keys: Vec<BucketKey>) -> Vec<BucketKey> {
        let Some(last) = self.last_consumed else {
            return keys;
        };

        let split = keys.partition_point(|&k| k <= last);
        if split == 0 {
            return keys;
        }

        for &key in &keys[..split] {
            match self.table.remove(key) {
                Ok(()) => {
                    warn!(bucket = key, last_consumed = last, "pruned stale bucket");
                    if let Some(health) = &self.health {
                        health.buckets_pruned.inc();
                    }
                }
                Err(e) => {
                    warn!(bucket = key, error = %e, "pruning stale bucket failed");
                    self.count_table_error();
                }
            }
        }

        keys[split..].to_vec()
    }

    fn handle_malformed(&mut self, key: BucketKey, e: MalformedBucket) -> TickOutcome {
        error!(bucket = key, error = %e, policy = ?self.cfg.malformed_policy, "malformed bucket");

        if let Some(health) = &self.health {
            health.decode_errors.inc();
        }

        let deleted = match self.cfg.malformed_policy {
            MalformedPolicy::Retain => false,
            MalformedPolicy::Delete => match self.table.remove(key) {
                Ok(()) => true,
                Err(e) => {
                    warn!(bucket = key, error = %e, "deleting malformed bucket failed");
                    self.count_table_error();
                    false
                }
            },
        };

        TickOutcome::Malformed { key, deleted }
    }

    fn handle_publish_failure(&mut self, key: BucketKey, e: &anyhow::Error) -> TickOutcome {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let consecutive = self.consecutive_failures;

        warn!(
            bucket = key,
            sink = self.sink.name(),
            consecutive,
            error = %e,
            "publish failed, bucket kept for retry",
        );

        if let Some(health) = &self.health {
            health.consecutive_publish_failures.set(f64::from(consecutive));
        }

        if !self.degraded && consecutive >= self.cfg.degraded_after {
            self.degraded = true;
            error!(
                sink = self.sink.name(),
                consecutive,
                "snapshot publishing degraded",
            );
            if let Some(health) = &self.health {
                health.sink_degraded.set(1.0);
            }
        }

        TickOutcome::PublishFailed { key, consecutive }
    }

    fn publish_recovered(&mut self) {
        if self.degraded {
            info!(
                sink = self.sink.name(),
                failures = self.consecutive_failures,
                "snapshot publishing recovered",
            );
        }

        self.consecutive_failures = 0;
        self.degraded = false;

        if let Some(health) = &self.health {
            health.consecutive_publish_failures.set(0.0);
            health.sink_degraded.set(0.0);
        }
    }

    fn count_idle(&self) {
        if let Some(health) = &self.health {
            health.idle_ticks.inc();
        }
    }

    fn count_table_error(&self) {
        if let Some(health) = &self.health {
            health.table_errors.inc();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{self, Write};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::{Duration, SystemTime};

    use anyhow::bail;
    use parking_lot::Mutex;

    use super::*;
    use crate::table::{Counter, MemoryTable};

    /// Sink that records published snapshots and can be switched to fail.
    #[derive(Default)]
    struct RecordingSink {
        published: Mutex<Vec<MetricsSnapshot>>,
        fail: AtomicBool,
    }

    impl RecordingSink {
        fn keys(&self) -> Vec<BucketKey> {
            self.published.lock().iter().map(|s| s.key).collect()
        }

        fn set_failing(&self, fail: bool) {
            self.fail.store(fail, Ordering::SeqCst);
        }
    }

    impl MetricsSink for Arc<RecordingSink> {
        fn name(&self) -> &str {
            "recording"
        }

        async fn publish(&self, snapshot: &MetricsSnapshot) -> anyhow::Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                bail!("sink unavailable");
            }
            self.published.lock().push(snapshot.clone());
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn drain_config() -> DrainConfig {
        DrainConfig {
            bucket_interval: Duration::from_secs(10),
            poll_interval: Duration::from_millis(10),
            trailing_buckets: 1,
            malformed_policy: MalformedPolicy::Delete,
            degraded_after: 3,
        }
    }

    fn engine_with(
        cfg: DrainConfig,
    ) -> (
        Arc<MemoryTable>,
        Arc<RecordingSink>,
        DrainEngine<Arc<MemoryTable>, Arc<RecordingSink>>,
    ) {
        let table = Arc::new(MemoryTable::new());
        let sink = Arc::new(RecordingSink::default());
        let codec = BucketCodec::new(cfg.bucket_interval).expect("codec");
        let engine = DrainEngine::new(
            Arc::clone(&table),
            codec,
            Arc::clone(&sink),
            Arc::from("NODE_01"),
            &cfg,
        );
        (table, sink, engine)
    }

    fn engine() -> (
        Arc<MemoryTable>,
        Arc<RecordingSink>,
        DrainEngine<Arc<MemoryTable>, Arc<RecordingSink>>,
    ) {
        engine_with(drain_config())
    }

    /// Memory table whose list and delete calls can be switched to fail.
    #[derive(Default)]
    struct FlakyTable {
        inner: MemoryTable,
        fail_keys: AtomicBool,
        fail_remove: AtomicBool,
    }

    impl BucketTable for FlakyTable {
        fn keys(&self) -> Result<Vec<BucketKey>, TableError> {
            if self.fail_keys.load(Ordering::SeqCst) {
                return Err(TableError::List("map iteration failed".to_string()));
            }
            self.inner.keys()
        }

        fn get(&self, key: BucketKey) -> Result<Option<Vec<u8>>, TableError> {
            self.inner.get(key)
        }

        fn remove(&self, key: BucketKey) -> Result<(), TableError> {
            if self.fail_remove.load(Ordering::SeqCst) {
                return Err(TableError::Remove {
                    key,
                    message: "permission denied".to_string(),
                });
            }
            self.inner.remove(key)
        }
    }

    fn flaky_engine() -> (
        Arc<FlakyTable>,
        Arc<RecordingSink>,
        Arc<HealthMetrics>,
        DrainEngine<Arc<FlakyTable>, Arc<RecordingSink>>,
    ) {
        let cfg = drain_config();
        let table = Arc::new(FlakyTable::default());
        let sink = Arc::new(RecordingSink::default());
        let health = Arc::new(HealthMetrics::new(":0").expect("health"));
        let codec = BucketCodec::new(cfg.bucket_interval).expect("codec");
        let engine = DrainEngine::new(
            Arc::clone(&table),
            codec,
            Arc::clone(&sink),
            Arc::from("NODE_01"),
            &cfg,
        )
        .with_health(Arc::clone(&health));
        (table, sink, health, engine)
    }

    fn with_mem(mem: u64) -> AccumulatorRecord {
        AccumulatorRecord {
            mem_bytes_allocated: mem,
            ..Default::default()
        }
    }

    #[test]
    fn test_select_closed() {
        assert_eq!(select_closed(&[], 1), None);
        assert_eq!(select_closed(&[7], 1), None);
        assert_eq!(select_closed(&[7, 8], 1), Some(7));
        assert_eq!(select_closed(&[7, 8, 9], 1), Some(8));
        assert_eq!(select_closed(&[7, 8, 9], 2), Some(7));
        assert_eq!(select_closed(&[7, 8], 2), None);
    }

    #[tokio::test]
    async fn test_empty_table_is_idle() {
        let (_table, sink, mut engine) = engine();

        let outcome = engine.tick().await.expect("tick");
        assert_eq!(outcome, TickOutcome::Idle { buckets: 0 });
        assert!(sink.keys().is_empty());
    }

    #[tokio::test]
    async fn test_single_bucket_no_emission_no_deletion() {
        let (table, sink, mut engine) = engine();
        table.insert(100, &with_mem(500));

        for _ in 0..3 {
            let outcome = engine.tick().await.expect("tick");
            assert_eq!(outcome, TickOutcome::Idle { buckets: 1 });
        }

        assert!(sink.keys().is_empty());
        assert!(table.contains(100));
        assert_eq!(engine.last_consumed(), None);
    }

    #[tokio::test]
    async fn test_two_buckets_consumes_older() {
        let (table, sink, mut engine) = engine();
        table.insert(100, &with_mem(500));
        table.insert(101, &with_mem(50));

        let outcome = engine.tick().await.expect("tick");
        assert_eq!(outcome, TickOutcome::Drained { key: 100 });
        assert_eq!(sink.keys(), vec![100]);
        assert_eq!(table.sorted_keys(), vec![101]);
    }

    #[tokio::test]
    async fn test_three_buckets_emits_second_newest() {
        let (table, sink, mut engine) = engine();
        table.insert(100, &with_mem(500));
        table.insert(101, &with_mem(800));
        table.insert(102, &with_mem(50));

        let outcome = engine.tick().await.expect("tick");
        assert_eq!(outcome, TickOutcome::Drained { key: 101 });

        let published = sink.published.lock().clone();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].key, 101);
        assert_eq!(published[0].record.mem_bytes_allocated, 800);
        assert_eq!(&*published[0].node_id, "NODE_01");
        assert_eq!(
            published[0].timestamp,
            SystemTime::UNIX_EPOCH + Duration::from_secs(1010)
        );

        assert_eq!(table.sorted_keys(), vec![100, 102]);
    }

    #[tokio::test]
    async fn test_stale_bucket_pruned_on_later_tick() {
        let (table, sink, mut engine) = engine();
        table.insert(100, &with_mem(500));
        table.insert(101, &with_mem(800));
        table.insert(102, &with_mem(50));

        engine.tick().await.expect("first tick");
        table.insert(103, &with_mem(1));

        let outcome = engine.tick().await.expect("second tick");
        assert_eq!(outcome, TickOutcome::Drained { key: 102 });
        assert_eq!(sink.keys(), vec![101, 102]);
        assert_eq!(table.sorted_keys(), vec![103]);
    }

    #[tokio::test]
    async fn test_publish_failure_keeps_bucket_for_retry() {
        let (table, sink, mut engine) = engine();
        table.insert(100, &with_mem(500));
        table.insert(101, &with_mem(50));

        sink.set_failing(true);
        let outcome = engine.tick().await.expect("tick");
        assert_eq!(
            outcome,
            TickOutcome::PublishFailed {
                key: 100,
                consecutive: 1
            }
        );
        assert!(table.contains(100));
        assert_eq!(engine.last_consumed(), None);

        sink.set_failing(false);
        let outcome = engine.tick().await.expect("retry");
        assert_eq!(outcome, TickOutcome::Drained { key: 100 });
        assert_eq!(sink.keys(), vec![100]);
        assert!(!table.contains(100));
        assert_eq!(engine.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn test_degraded_after_consecutive_failures() {
        let health = Arc::new(HealthMetrics::new(":0").expect("health"));
        let (table, sink, engine) = engine();
        let mut engine = engine.with_health(Arc::clone(&health));
        table.insert(100, &with_mem(500));
        table.insert(101, &with_mem(50));

        sink.set_failing(true);
        for attempt in 1..=3 {
            engine.tick().await.expect("tick");
            assert_eq!(engine.is_degraded(), attempt >= 3);
        }
        assert_eq!(health.sink_degraded.get(), 1.0);
        assert_eq!(health.consecutive_publish_failures.get(), 3.0);

        sink.set_failing(false);
        engine.tick().await.expect("recover");
        assert!(!engine.is_degraded());
        assert_eq!(health.sink_degraded.get(), 0.0);
        assert_eq!(health.buckets_drained.get(), 1.0);
        assert_eq!(health.last_drained_bucket.get(), 100.0);
    }

    #[tokio::test]
    async fn test_malformed_record_deleted() {
        let health = Arc::new(HealthMetrics::new(":0").expect("health"));
        let (table, sink, engine) = engine();
        let mut engine = engine.with_health(Arc::clone(&health));
        table.insert_raw(100, vec![0u8; 12]);
        table.insert(101, &with_mem(50));

        let outcome = engine.tick().await.expect("tick");
        assert_eq!(
            outcome,
            TickOutcome::Malformed {
                key: 100,
                deleted: true
            }
        );
        assert!(sink.keys().is_empty());
        assert_eq!(table.sorted_keys(), vec![101]);
        assert_eq!(health.decode_errors.get(), 1.0);
    }

    #[tokio::test]
    async fn test_malformed_record_retained() {
        let mut cfg = drain_config();
        cfg.malformed_policy = MalformedPolicy::Retain;
        let (table, sink, mut engine) = engine_with(cfg);
        table.insert_raw(100, vec![0u8; 12]);
        table.insert(101, &with_mem(50));

        let outcome = engine.tick().await.expect("tick");
        assert_eq!(
            outcome,
            TickOutcome::Malformed {
                key: 100,
                deleted: false
            }
        );
        assert!(sink.keys().is_empty());
        assert!(table.contains(100));
    }

    #[tokio::test]
    async fn test_trailing_margin_two() {
        let mut cfg = drain_config();
        cfg.trailing_buckets = 2;
        let (table, sink, mut engine) = engine_with(cfg);
        table.insert(100, &with_mem(1));
        table.insert(101, &with_mem(2));

        assert_eq!(
            engine.tick().await.expect("tick"),
            TickOutcome::Idle { buckets: 2 }
        );

        table.insert(102, &with_mem(3));
        assert_eq!(
            engine.tick().await.expect("tick"),
            TickOutcome::Drained { key: 100 }
        );
        assert_eq!(sink.keys(), vec![100]);
        assert_eq!(table.sorted_keys(), vec![101, 102]);
    }

    #[tokio::test]
    async fn test_strictly_increasing_emission() {
        let (table, sink, mut engine) = engine();

        for key in 200..210u64 {
            table.add(key, Counter::PageFaults, key);
            engine.tick().await.expect("tick");
        }

        let keys = sink.keys();
        assert_eq!(keys, (200..209).collect::<Vec<_>>());
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(table.sorted_keys(), vec![209]);
    }

    #[tokio::test]
    async fn test_reporter_receives_drained_rows() {
        let buf = SharedBuf::default();
        let (table, _sink, engine) = engine();
        let mut engine = engine.with_reporter(DiagnosticReporter::new(Box::new(buf.clone())));
        table.insert(101, &with_mem(800));
        table.insert(102, &with_mem(50));

        engine.tick().await.expect("tick");

        let text = String::from_utf8(buf.0.lock().clone()).expect("utf8");
        assert!(text.starts_with("00:16:50 "));
        assert!(text.contains(" 800 "));
        assert_eq!(text.lines().count(), 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let health = Arc::new(HealthMetrics::new(":0").expect("health"));
        let (table, sink, engine) = engine();
        let engine = engine.with_health(Arc::clone(&health));
        table.insert(100, &with_mem(500));
        table.insert(101, &with_mem(50));

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(engine.run(cancel.clone()));

        tokio::time::timeout(Duration::from_secs(5), async {
            while sink.keys().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("bucket drained by run loop");

        cancel.cancel();
        handle.await.expect("run task");

        assert_eq!(sink.keys(), vec![100]);
        assert!(health.ticks.get() >= 1.0);
    }

    #[tokio::test]
    async fn test_list_failure_is_table_error() {
        let (table, sink, _health, mut engine) = flaky_engine();
        table.inner.insert(100, &with_mem(1));
        table.inner.insert(101, &with_mem(2));
        table.fail_keys.store(true, Ordering::SeqCst);

        let err = engine.tick().await.expect_err("list failure");
        assert!(matches!(err, DrainError::Table(TableError::List(_))));
        assert!(sink.keys().is_empty());
        assert_eq!(table.inner.sorted_keys(), vec![100, 101]);

        table.fail_keys.store(false, Ordering::SeqCst);
        assert_eq!(
            engine.tick().await.expect("tick"),
            TickOutcome::Drained { key: 100 }
        );
    }

    #[tokio::test]
    async fn test_failed_delete_is_never_reemitted() {
        let (table, sink, health, mut engine) = flaky_engine();
        table.inner.insert(100, &with_mem(1));
        table.inner.insert(101, &with_mem(2));
        table.fail_remove.store(true, Ordering::SeqCst);

        assert_eq!(
            engine.tick().await.expect("tick"),
            TickOutcome::Drained { key: 100 }
        );
        assert!(table.inner.contains(100));
        assert_eq!(engine.last_consumed(), Some(100));
        assert_eq!(health.table_errors.get(), 1.0);

        // The undeleted key is stale: the prune fails again and nothing is emitted.
        assert_eq!(
            engine.tick().await.expect("tick"),
            TickOutcome::Idle { buckets: 1 }
        );
        assert_eq!(health.table_errors.get(), 2.0);
        assert_eq!(sink.keys(), vec![100]);

        table.fail_remove.store(false, Ordering::SeqCst);
        table.inner.insert(102, &with_mem(3));
        assert_eq!(
            engine.tick().await.expect("tick"),
            TickOutcome::Drained { key: 101 }
        );
        assert_eq!(sink.keys(), vec![100, 101]);
        assert_eq!(table.inner.sorted_keys(), vec![102]);
        assert_eq!(health.buckets_pruned.get(), 1.0);
    }

    #[tokio::test]
    async fn test_failed_prune_counts_table_error() {
        let (table, sink, health, mut engine) = flaky_engine();
        table.inner.insert(100, &with_mem(1));
        table.inner.insert(101, &with_mem(2));
        table.inner.insert(102, &with_mem(3));

        assert_eq!(
            engine.tick().await.expect("tick"),
            TickOutcome::Drained { key: 101 }
        );

        table.fail_remove.store(true, Ordering::SeqCst);
        assert_eq!(
            engine.tick().await.expect("tick"),
            TickOutcome::Idle { buckets: 1 }
        );
        assert_eq!(health.table_errors.get(), 1.0);
        assert_eq!(health.buckets_pruned.get(), 0.0);
        assert!(table.inner.contains(100));
        assert_eq!(sink.keys(), vec![101]);
    }

    #[tokio::test]
    async fn test_out_of_range_key_is_malformed() {
        let (table, sink, mut engine) = engine();
        let newest = u64::MAX / 10;
        table.insert(newest - 1, &with_mem(1));
        table.insert(newest, &with_mem(2));

        assert_eq!(
            engine.tick().await.expect("tick"),
            TickOutcome::Malformed {
                key: newest - 1,
                deleted: true
            }
        );
        assert!(sink.keys().is_empty());
        assert_eq!(table.sorted_keys(), vec![newest]);
    }

    #[tokio::test]
    async fn test_far_future_key_with_reporter_is_malformed() {
        let buf = SharedBuf::default();
        let (table, sink, engine) = engine();
        let mut engine = engine.with_reporter(DiagnosticReporter::new(Box::new(buf.clone())));
        table.insert(1_000_000_000_000, &with_mem(1));
        table.insert(1_000_000_000_001, &with_mem(2));

        assert_eq!(
            engine.tick().await.expect("tick"),
            TickOutcome::Malformed {
                key: 1_000_000_000_000,
                deleted: true
            }
        );
        assert!(sink.keys().is_empty());
        assert!(buf.0.lock().is_empty());

        // Ordinary buckets still drain afterwards.
        table.insert(100, &with_mem(3));
        table.insert(101, &with_mem(4));
        assert_eq!(
            engine.tick().await.expect("tick"),
            TickOutcome::Drained { key: 101 }
        );
        assert_eq!(sink.keys(), vec![101]);
        assert!(String::from_utf8(buf.0.lock().clone())
            .expect("utf8")
            .starts_with("00:16:50 "));
    }

    #[tokio::test]
    async fn test_retained_malformed_pruned_after_newer_drain() {
        let mut cfg = drain_config();
        cfg.malformed_policy = MalformedPolicy::Retain;
        let (table, sink, mut engine) = engine_with(cfg);
        table.insert_raw(100, vec![0u8; 12]);
        table.insert(101, &with_mem(50));

        // Reported again on every tick while it is the selected bucket.
        for _ in 0..2 {
            assert_eq!(
                engine.tick().await.expect("tick"),
                TickOutcome::Malformed {
                    key: 100,
                    deleted: false
                }
            );
        }

        table.insert(102, &with_mem(60));
        assert_eq!(
            engine.tick().await.expect("tick"),
            TickOutcome::Drained { key: 101 }
        );
        assert!(table.contains(100));

        engine.tick().await.expect("tick");
        assert_eq!(table.sorted_keys(), vec![102]);
        assert_eq!(sink.keys(), vec![101]);
    }
}
