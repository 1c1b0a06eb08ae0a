use std::sync::Arc;

use anyhow::Result;
use prometheus::{GaugeVec, Opts, Registry};

use crate::drain::snapshot::MetricsSnapshot;
use crate::table::Counter;

use super::MetricsSink;

/// Publishes snapshots as Prometheus gauges labelled by node.
///
/// Gauges carry the values of the most recently drained bucket and are
/// served by the health server's `/metrics` endpoint. Setting a gauge is
/// idempotent, so a re-published bucket leaves the same values behind.
#[derive(Clone)]
pub struct PrometheusExporter {
    inner: Arc<Gauges>,
}

struct Gauges {
    counters: Vec<GaugeVec>,
    bucket_start: GaugeVec,
}

impl PrometheusExporter {
    /// Creates the gauges and registers them on `registry`.
    pub fn new(registry: &Registry) -> Result<Self> {
        let mut counters = Vec::with_capacity(Counter::ALL.len());

        for counter in Counter::ALL {
            let gauge = GaugeVec::new(Opts::new(counter.as_str(), counter.help()), &["node_id"])?;
            registry.register(Box::new(gauge.clone()))?;
            counters.push(gauge);
        }

        let bucket_start = GaugeVec::new(
            Opts::new(
                "bucket_start_timestamp_seconds",
                "Start of the most recently published bucket.",
            ),
            &["node_id"],
        )?;
        registry.register(Box::new(bucket_start.clone()))?;

        Ok(Self {
            inner: Arc::new(Gauges {
                counters,
                bucket_start,
            }),
        })
    }

    /// Current gauge value of one counter for a node.
    pub fn value(&self, node_id: &str, counter: Counter) -> f64 {
        self.inner.counters[counter as usize]
            .with_label_values(&[node_id])
            .get()
    }
}

impl MetricsSink for PrometheusExporter {
    fn name(&self) -> &str {
        "prometheus"
    }

    async fn publish(&self, snapshot: &MetricsSnapshot) -> Result<()> {
        let labels = [snapshot.node_id.as_ref()];

        for (gauge, counter) in self.inner.counters.iter().zip(Counter::ALL) {
            gauge
                .with_label_values(&labels)
                .set(snapshot.record.get(counter) as f64);
        }

        self.inner
            .bucket_start
            .with_label_values(&labels)
            .set(snapshot.unix_seconds() as f64);

        Ok(())
    }
}
