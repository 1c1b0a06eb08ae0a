use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::{fmt, EnvFilter};

use nodeprof::agent::Agent;
use nodeprof::config::Config;

/// eBPF node profiler: drains per-interval kernel counters into metrics.
#[derive(Parser)]
#[command(name = "nodeprof", about, version)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Log filter directive, e.g. `debug` or `nodeprof::drain=trace`.
    /// Overrides the config file's `log_level`.
    #[arg(long)]
    log_level: Option<String>,
}

fn init_logging(directive: &str) -> Result<()> {
    let filter =
        EnvFilter::try_new(directive).with_context(|| format!("invalid log level: {directive}"))?;
    fmt().with_env_filter(filter).with_target(true).init();
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let cfg = Config::load(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;

    init_logging(cli.log_level.as_deref().unwrap_or(&cfg.log_level))?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        node_id = %cfg.node_id,
        interval = ?cfg.drain.bucket_interval,
        "starting nodeprof",
    );

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?
        .block_on(run(cfg))
}

async fn run(cfg: Config) -> Result<()> {
    let mut agent = Agent::new(cfg)?;
    agent.start().await?;

    let signal = wait_for_shutdown().await?;
    tracing::info!(signal, "shutting down");

    agent.stop().await?;
    tracing::info!("nodeprof stopped");

    Ok(())
}

/// Resolves with the name of the first termination signal received.
async fn wait_for_shutdown() -> Result<&'static str> {
    let mut sigterm = signal(SignalKind::terminate()).context("registering SIGTERM handler")?;

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("listening for SIGINT")?;
            Ok("SIGINT")
        }
        _ = sigterm.recv() => Ok("SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_config_is_required() {
        assert!(Cli::try_parse_from(["nodeprof"]).is_err());

        let cli = Cli::try_parse_from(["nodeprof", "-c", "x.yaml", "--log-level", "debug"])
            .expect("parse");
        assert_eq!(cli.config, PathBuf::from("x.yaml"));
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn test_version_flag_exits_early() {
        let err = Cli::try_parse_from(["nodeprof", "--version"]).err().expect("version exit");
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayVersion);
        assert!(err.to_string().contains(env!("CARGO_PKG_VERSION")));
    }
}
