use std::sync::Arc;

use pylon_config::PylonConfig;
use pylon_metrics::ProxyMetrics;
use tokio::net::TcpListener;
use tracing::{error, info, instrument};

use crate::worker::Worker;

pub struct Master {
    cfg: Arc<PylonConfig>,
    metrics: Arc<ProxyMetrics>,
}

impl Master {
    pub fn new(cfg: PylonConfig, metrics: Arc<ProxyMetrics>) -> Self {
        Self {
            cfg: Arc::new(cfg),
            metrics,
        }
    }

    /// Bind the listening socket, prepare one upstream pool per
    /// worker, and run the accept loops. Startup fails (and the
    /// process exits non-zero) when the listener cannot be bound or
    /// any worker's pool comes up empty.
    #[instrument(skip(self), fields(
        listen = %self.cfg.listen,
        workers = %self.cfg.workers,
    ))]
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = bind_listener(&self.cfg.listen).await?;
        let listener = Arc::new(listener);

        let mut handles = Vec::with_capacity(self.cfg.workers);
        for id in 0..self.cfg.workers {
            let worker = Worker::new(id, &self.cfg, listener.clone(), self.metrics.clone());
            worker.prepare().await?;
            handles.push(tokio::spawn(worker.run()));
        }

        info!(
            target: "pylon::master",
            "Master initialized. Waiting for incoming connections (Ctrl+C to stop)..."
        );

        for handle in handles {
            if let Err(err) = handle.await? {
                error!(
                    target: "pylon::master",
                    error = ?err,
                    "Worker accept loop exited with an error"
                );
                return Err(err);
            }
        }
        Ok(())
    }
}

async fn bind_listener(listen_addr: &str) -> anyhow::Result<TcpListener> {
    info!(
        target: "pylon::master",
        listen = %listen_addr,
        "Binding listener"
    );

    match TcpListener::bind(listen_addr).await {
        Ok(listener) => {
            info!(
                target: "pylon::master",
                listen = %listen_addr,
                "Bind() successful"
            );
            Ok(listener)
        }
        Err(e) => {
            error!(
                target: "pylon::master",
                listen = %listen_addr,
                error = ?e,
                "Failed to bind listener"
            );
            Err(e.into())
        }
    }
}
