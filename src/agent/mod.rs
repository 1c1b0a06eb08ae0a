use std::sync::Arc;
use std::time::{Instant, SystemTime};

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::clock::BucketCodec;
use crate::config::Config;
use crate::drain::DrainEngine;
use crate::export::health::HealthMetrics;
use crate::report::DiagnosticReporter;
use crate::sink::http::HttpExporter;
use crate::sink::prometheus::PrometheusExporter;
use crate::sink::{Exporter, Exporters};
use crate::table::BucketTable;

#[cfg(feature = "bpf")]
use crate::tracer::bpf::BpfTracer;

/// Agent orchestrates all components: tracer, drain loop, exporters and
/// the health server.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    #[cfg(feature = "bpf")]
    tracer: Option<BpfTracer>,
    drain_task: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Agent {
    /// Creates a new Agent, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            #[cfg(feature = "bpf")]
            tracer: None,
            drain_task: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Returns the health metrics shared by every component.
    pub fn health(&self) -> &Arc<HealthMetrics> {
        &self.health
    }

    /// Loads the kernel probes and starts draining their bucket map.
    ///
    /// Any probe that fails to attach aborts startup before the drain
    /// loop runs.
    #[cfg(feature = "bpf")]
    pub async fn start(&mut self) -> Result<()> {
        let started = Instant::now();

        let mut tracer = BpfTracer::load(self.cfg.drain.bucket_interval, &self.health)
            .context("starting BPF tracer")?;
        let table = tracer
            .bucket_table(&self.cfg.probes.map_name)
            .context("opening bucket table")?;
        self.tracer = Some(tracer);

        self.health
            .agent_start_duration
            .with_label_values(&["tracer"])
            .set(started.elapsed().as_secs_f64());

        self.start_with_table(table).await
    }

    /// Without kernel probes there is no producer to drain.
    #[cfg(not(feature = "bpf"))]
    pub async fn start(&mut self) -> Result<()> {
        anyhow::bail!("nodeprof was built without bpf support; rebuild with --features bpf")
    }

    /// Starts the health server, exporters and drain loop over `table`.
    pub async fn start_with_table<T>(&mut self, table: T) -> Result<()>
    where
        T: BucketTable + 'static,
    {
        let started = Instant::now();

        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        let codec =
            BucketCodec::new(self.cfg.drain.bucket_interval).context("creating bucket codec")?;
        let exporters = self.build_exporters()?;

        info!(
            node_id = %self.cfg.node_id,
            exporters = exporters.len(),
            bucket_interval = ?codec.interval(),
            "exporters configured",
        );

        let mut engine = DrainEngine::new(
            table,
            codec,
            exporters,
            Arc::from(self.cfg.node_id.as_str()),
            &self.cfg.drain,
        )
        .with_health(Arc::clone(&self.health));

        if self.cfg.diagnostics.enabled {
            let mut reporter = DiagnosticReporter::stdout();
            reporter.banner(SystemTime::now());
            engine = engine.with_reporter(reporter);
        }

        let cancel = self.cancel.child_token();
        self.drain_task = Some(tokio::spawn(engine.run(cancel)));

        self.health
            .agent_start_duration
            .with_label_values(&["drain"])
            .set(started.elapsed().as_secs_f64());

        info!("agent started");

        Ok(())
    }

    /// Stops the drain loop and health server. Buckets still in the table
    /// are not flushed.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        if let Some(task) = self.drain_task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "drain task ended abnormally");
            }
        }

        // Dropping the tracer detaches the probes.
        #[cfg(feature = "bpf")]
        {
            self.tracer = None;
        }

        self.health.stop().await?;

        info!("agent stopped");

        Ok(())
    }

    fn build_exporters(&self) -> Result<Exporters> {
        let mut exporters = Exporters::new(Some(Arc::clone(&self.health)));

        let prometheus = PrometheusExporter::new(self.health.registry())
            .context("registering prometheus exporter")?;
        exporters.add(Exporter::Prometheus(prometheus));

        let http = &self.cfg.sinks.http;
        if http.enabled {
            let exporter =
                HttpExporter::new(http.clone()).context("creating HTTP exporter")?;
            exporters.add(Exporter::Http(exporter));
            info!(address = %http.address, compression = %http.compression, "HTTP exporter enabled");
        }

        Ok(exporters)
    }
}
