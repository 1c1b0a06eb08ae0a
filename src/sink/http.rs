use std::io::Write;

use anyhow::{bail, Context, Result};

use crate::config::HttpSinkConfig;
use crate::drain::snapshot::MetricsSnapshot;

use super::MetricsSink;

/// HTTP JSON exporter.
///
/// POSTs each snapshot as one JSON document, optionally gzip compressed.
/// Any non-2xx response is a publish failure so the drain loop retries the
/// bucket on its next tick.
pub struct HttpExporter {
    cfg: HttpSinkConfig,
    client: reqwest::Client,
}

impl HttpExporter {
    /// Creates a new HTTP exporter with the given configuration.
    pub fn new(cfg: HttpSinkConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self { cfg, client })
    }
}

impl MetricsSink for HttpExporter {
    fn name(&self) -> &str {
        "http"
    }

    async fn publish(&self, snapshot: &MetricsSnapshot) -> Result<()> {
        let body =
            serde_json::to_vec(&snapshot.to_json()).context("serializing snapshot to JSON")?;
        let raw_len = body.len();

        let payload = compress(&body, &self.cfg.compression).context("compressing snapshot")?;

        let mut request = self
            .client
            .post(&self.cfg.address)
            .header("Content-Type", "application/json")
            .body(payload);

        if let Some(encoding) = content_encoding(&self.cfg.compression) {
            request = request.header("Content-Encoding", encoding);
        }

        for (k, v) in &self.cfg.headers {
            request = request.header(k.as_str(), v.as_str());
        }

        let resp = request
            .send()
            .await
            .context("sending HTTP export request")?;

        let status = resp.status();
        // Drain body for connection reuse.
        let _ = resp.bytes().await;

        if !status.is_success() {
            bail!("HTTP export unexpected status: {status}");
        }

        tracing::debug!(bucket = snapshot.key, bytes = raw_len, "exported snapshot via HTTP");

        Ok(())
    }
}

// --- Compression ---

fn compress(data: &[u8], algorithm: &str) -> Result<Vec<u8>> {
    match algorithm {
        "none" | "" => Ok(data.to_vec()),
        "gzip" => {
            use flate2::write::GzEncoder;
            use flate2::Compression;

            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(data).context("gzip write")?;
            encoder.finish().context("gzip finish")
        }
        other => bail!("unsupported compression: {other}"),
    }
}

fn content_encoding(algorithm: &str) -> Option<&'static str> {
    match algorithm {
        "gzip" => Some("gzip"),
        _ => None,
    }
}
