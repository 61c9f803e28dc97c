use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use pylon_config::PylonConfig;
use pylon_core::Master;
use pylon_metrics::ProxyMetrics;
use tracing::{error, warn};

/// Streaming HTTP/1.1 reverse proxy.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Path to the YAML configuration file.
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    utils::init_tracing();

    let cfg = PylonConfig::from_file(&cli.config)?;
    for warning in cfg.validate().warnings() {
        warn!(target: "pylon", %warning, "Config warning");
    }

    let metrics = Arc::new(ProxyMetrics::new()?);

    let metrics_listen = cfg.metrics_listen().to_string();
    let scrape_metrics = metrics.clone();
    tokio::spawn(async move {
        if let Err(err) = pylon_metrics::serve(metrics_listen, scrape_metrics).await {
            error!(target: "pylon", error = ?err, "Metrics endpoint failed");
        }
    });

    Master::new(cfg, metrics).run().await
}
