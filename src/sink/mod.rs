pub mod http;
pub mod prometheus;

use std::sync::Arc;

use anyhow::{bail, Result};

use crate::drain::snapshot::MetricsSnapshot;
use crate::export::health::HealthMetrics;

use self::http::HttpExporter;
use self::prometheus::PrometheusExporter;

/// MetricsSink publishes drained snapshots to an external system.
///
/// Publishing the same snapshot twice must be harmless: sinks are
/// last-write-wins per node label.
pub trait MetricsSink: Send + Sync {
    /// Returns the sink's name for logging.
    fn name(&self) -> &str;

    /// Publish one snapshot.
    fn publish(
        &self,
        snapshot: &MetricsSnapshot,
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// Exporter dispatches snapshots to Prometheus or HTTP backends.
///
/// Uses enum dispatch rather than trait objects since `MetricsSink`
/// returns `impl Future` and is not object safe.
pub enum Exporter {
    Prometheus(PrometheusExporter),
    Http(HttpExporter),
}

impl MetricsSink for Exporter {
    fn name(&self) -> &str {
        match self {
            Self::Prometheus(e) => e.name(),
            Self::Http(e) => e.name(),
        }
    }

    async fn publish(&self, snapshot: &MetricsSnapshot) -> Result<()> {
        match self {
            Self::Prometheus(e) => e.publish(snapshot).await,
            Self::Http(e) => e.publish(snapshot).await,
        }
    }
}

/// Fans a snapshot out to every configured exporter.
///
/// All exporters are attempted even if an earlier one fails; the call
/// fails if any of them did. A retried publish therefore repeats writes
/// on exporters that already succeeded, which is harmless.
pub struct Exporters {
    exporters: Vec<Exporter>,
    health: Option<Arc<HealthMetrics>>,
}

impl Exporters {
    /// Creates an empty fan-out with optional error accounting.
    pub fn new(health: Option<Arc<HealthMetrics>>) -> Self {
        Self {
            exporters: Vec::with_capacity(2),
            health,
        }
    }

    /// Registers an exporter.
    pub fn add(&mut self, exporter: Exporter) {
        self.exporters.push(exporter);
    }

    /// Returns the number of registered exporters.
    pub fn len(&self) -> usize {
        self.exporters.len()
    }

    /// Returns whether no exporter is registered.
    pub fn is_empty(&self) -> bool {
        self.exporters.is_empty()
    }
}

impl MetricsSink for Exporters {
    fn name(&self) -> &str {
        "exporters"
    }

    async fn publish(&self, snapshot: &MetricsSnapshot) -> Result<()> {
        let mut failed = Vec::new();

        for exporter in &self.exporters {
            if let Err(e) = exporter.publish(snapshot).await {
                tracing::warn!(
                    exporter = exporter.name(),
                    bucket = snapshot.key,
                    error = %e,
                    "snapshot publish failed",
                );

                if let Some(health) = &self.health {
                    health
                        .export_errors
                        .with_label_values(&[exporter.name()])
                        .inc();
                }

                failed.push(exporter.name().to_string());
            }
        }

        if !failed.is_empty() {
            bail!("publish failed for: {}", failed.join(", "));
        }

        Ok(())
    }
}
