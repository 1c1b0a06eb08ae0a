use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Prometheus metrics for agent health and observability.
///
/// All metrics use the "nodeprof" namespace. The drained snapshot gauges
/// are registered on the same registry by the Prometheus exporter, so a
/// single `/metrics` scrape returns both.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Drain loop ===
    /// Total drain ticks executed.
    pub ticks: Counter,
    /// Ticks that found no bucket safe to consume.
    pub idle_ticks: Counter,
    /// Buckets published and deleted.
    pub buckets_drained: Counter,
    /// Buckets deleted because they fell behind the last drained key.
    pub buckets_pruned: Counter,
    /// Buckets whose record failed to decode.
    pub decode_errors: Counter,
    /// Bucket table list/read/delete failures.
    pub table_errors: Counter,
    /// Buckets present in the table at the last tick.
    pub table_buckets: Gauge,
    /// Key of the most recently drained bucket.
    pub last_drained_bucket: Gauge,
    /// Drain tick duration.
    pub tick_duration: Histogram,

    // === Sinks ===
    /// Publish errors by sink.
    pub export_errors: CounterVec,
    /// Consecutive failed publish attempts of the pending bucket.
    pub consecutive_publish_failures: Gauge,
    /// Whether publishing is degraded (1=yes, 0=no).
    pub sink_degraded: Gauge,

    // === Startup ===
    /// Kernel probes by program (1=attached, 0=failed).
    pub probes_attached: GaugeVec,
    /// Agent startup duration by phase.
    pub agent_start_duration: GaugeVec,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let ticks = Counter::with_opts(
            Opts::new("drain_ticks_total", "Total drain ticks executed.").namespace("nodeprof"),
        )?;
        let idle_ticks = Counter::with_opts(
            Opts::new(
                "drain_idle_ticks_total",
                "Drain ticks with no bucket safe to consume.",
            )
            .namespace("nodeprof"),
        )?;
        let buckets_drained = Counter::with_opts(
            Opts::new(
                "buckets_drained_total",
                "Total buckets published and deleted.",
            )
            .namespace("nodeprof"),
        )?;
        let buckets_pruned = Counter::with_opts(
            Opts::new(
                "buckets_pruned_total",
                "Total stale buckets deleted without publishing.",
            )
            .namespace("nodeprof"),
        )?;
        let decode_errors = Counter::with_opts(
            Opts::new(
                "decode_errors_total",
                "Total buckets whose record failed to decode.",
            )
            .namespace("nodeprof"),
        )?;
        let table_errors = Counter::with_opts(
            Opts::new(
                "table_errors_total",
                "Total bucket table access failures.",
            )
            .namespace("nodeprof"),
        )?;
        let table_buckets = Gauge::with_opts(
            Opts::new(
                "table_buckets",
                "Buckets present in the table at the last tick.",
            )
            .namespace("nodeprof"),
        )?;
        let last_drained_bucket = Gauge::with_opts(
            Opts::new(
                "last_drained_bucket",
                "Key of the most recently drained bucket.",
            )
            .namespace("nodeprof"),
        )?;
        let tick_duration = Histogram::with_opts(
            HistogramOpts::new("drain_tick_duration_seconds", "Time to run one drain tick.")
                .namespace("nodeprof")
                .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5]),
        )?;

        let export_errors = CounterVec::new(
            Opts::new("export_errors_total", "Total publish errors by sink.")
                .namespace("nodeprof"),
            &["sink"],
        )?;
        let consecutive_publish_failures = Gauge::with_opts(
            Opts::new(
                "consecutive_publish_failures",
                "Consecutive failed publish attempts.",
            )
            .namespace("nodeprof"),
        )?;
        let sink_degraded = Gauge::with_opts(
            Opts::new(
                "sink_degraded",
                "Whether snapshot publishing is degraded (1=yes, 0=no).",
            )
            .namespace("nodeprof"),
        )?;

        let probes_attached = GaugeVec::new(
            Opts::new(
                "probes_attached",
                "Kernel probe attachment state by program (1=attached, 0=failed).",
            )
            .namespace("nodeprof"),
            &["program"],
        )?;
        let agent_start_duration = GaugeVec::new(
            Opts::new(
                "agent_start_duration_seconds",
                "Duration of agent startup phases.",
            )
            .namespace("nodeprof"),
            &["phase"],
        )?;

        registry.register(Box::new(ticks.clone()))?;
        registry.register(Box::new(idle_ticks.clone()))?;
        registry.register(Box::new(buckets_drained.clone()))?;
        registry.register(Box::new(buckets_pruned.clone()))?;
        registry.register(Box::new(decode_errors.clone()))?;
        registry.register(Box::new(table_errors.clone()))?;
        registry.register(Box::new(table_buckets.clone()))?;
        registry.register(Box::new(last_drained_bucket.clone()))?;
        registry.register(Box::new(tick_duration.clone()))?;
        registry.register(Box::new(export_errors.clone()))?;
        registry.register(Box::new(consecutive_publish_failures.clone()))?;
        registry.register(Box::new(sink_degraded.clone()))?;
        registry.register(Box::new(probes_attached.clone()))?;
        registry.register(Box::new(agent_start_duration.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            ticks,
            idle_ticks,
            buckets_drained,
            buckets_pruned,
            decode_errors,
            table_errors,
            table_buckets,
            last_drained_bucket,
            tick_duration,
            export_errors,
            consecutive_publish_failures,
            sink_degraded,
            probes_attached,
            agent_start_duration,
        })
    }

    /// Returns the registry exporters register their own collectors on.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Encodes every registered metric in Prometheus text format.
    pub fn encode_text(&self) -> Result<String> {
        encode_registry(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let bind_addr = resolve_bind_addr(&self.addr);

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
            sink_degraded: self.sink_degraded.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Expands the ":port" shorthand to an all-interfaces bind address.
fn resolve_bind_addr(addr: &str) -> String {
    let addr = if addr.is_empty() { ":9090" } else { addr };

    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

pub(crate) fn encode_registry(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .context("encoding metrics")?;

    String::from_utf8(buffer).context("converting metrics to string")
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
    sink_degraded: Gauge,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - 503 while snapshot publishing is degraded.
async fn healthz_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if state.sink_degraded.get() >= 1.0 {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    } else {
        (StatusCode::OK, "ok")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_bind_addr() {
        assert_eq!(resolve_bind_addr(":9090"), "0.0.0.0:9090");
        assert_eq!(resolve_bind_addr(""), "0.0.0.0:9090");
        assert_eq!(resolve_bind_addr("127.0.0.1:9100"), "127.0.0.1:9100");
    }

    #[test]
    fn test_encode_text_contains_namespaced_metrics() {
        let health = HealthMetrics::new(":0").expect("health metrics");
        health.ticks.inc();
        health.sink_degraded.set(1.0);

        let text = health.encode_text().expect("encode");
        assert!(text.contains("nodeprof_drain_ticks_total 1"));
        assert!(text.contains("nodeprof_sink_degraded 1"));
    }

    #[tokio::test]
    async fn test_healthz_reflects_degraded_gauge() {
        let health = HealthMetrics::new(":0").expect("health metrics");
        let state = Arc::new(AppState {
            registry: health.registry().clone(),
            sink_degraded: health.sink_degraded.clone(),
        });

        let ok = healthz_handler(State(Arc::clone(&state)))
            .await
            .into_response();
        assert_eq!(ok.status(), StatusCode::OK);

        health.sink_degraded.set(1.0);
        let degraded = healthz_handler(State(state)).await.into_response();
        assert_eq!(degraded.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_start_and_stop_on_ephemeral_port() {
        let health = HealthMetrics::new("127.0.0.1:0").expect("health metrics");
        health.start().await.expect("start");
        health.stop().await.expect("stop");
    }
}
