//! Per-worker accept loop.
//!
//! Each worker shares the listening socket with its siblings but owns
//! its own upstream pool, engine, and client-connection cap. The cap
//! is a semaphore whose permit is taken before `accept`, so the accept
//! naturally waits while the worker is saturated.

use std::sync::Arc;
use std::time::Duration;

use pylon_config::PylonConfig;
use pylon_http::ClientConnection;
use pylon_metrics::ProxyMetrics;
use pylon_proxy::{PoolConnectionError, ProxyEngine, RoundRobinPool};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, error, info, warn, Instrument};

pub struct Worker {
    id: usize,
    listener: Arc<TcpListener>,
    pool: Arc<RoundRobinPool>,
    engine: Arc<ProxyEngine>,
    semaphore: Arc<Semaphore>,
    read_timeout: Duration,
    write_timeout: Duration,
    total_timeout: Duration,
}

impl Worker {
    pub fn new(
        id: usize,
        cfg: &PylonConfig,
        listener: Arc<TcpListener>,
        metrics: Arc<ProxyMetrics>,
    ) -> Self {
        let pool = Arc::new(RoundRobinPool::new(cfg, metrics.clone()));
        let engine = Arc::new(ProxyEngine::new(pool.clone(), metrics));

        Self {
            id,
            listener,
            pool,
            engine,
            semaphore: Arc::new(Semaphore::new(cfg.limits.max_client_conns)),
            read_timeout: cfg.timeouts.read(),
            write_timeout: cfg.timeouts.write(),
            total_timeout: cfg.timeouts.total(),
        }
    }

    /// Dial this worker's share of upstream connections. An entirely
    /// unreachable upstream set is a startup failure.
    pub async fn prepare(&self) -> Result<(), PoolConnectionError> {
        self.pool.prepare().await
    }

    /// Accept loop. Per-client errors never take the loop down; each
    /// session runs in its own task under the session-wide deadline.
    pub async fn run(self) -> anyhow::Result<()> {
        info!(
            target: "pylon::worker",
            worker = self.id,
            "Worker accept loop started"
        );

        loop {
            let permit = self.semaphore.clone().acquire_owned().await?;

            let (stream, addr) = match self.listener.accept().await {
                Ok(pair) => pair,
                Err(err) => {
                    error!(
                        target: "pylon::worker",
                        worker = self.id,
                        error = ?err,
                        "Failed to accept connection"
                    );
                    continue;
                }
            };
            set_keepalive(&stream);

            debug!(
                target: "pylon::worker",
                worker = self.id,
                client_addr = %addr,
                available_permits = self.semaphore.available_permits(),
                "Connection accepted"
            );

            let engine = self.engine.clone();
            let read_timeout = self.read_timeout;
            let write_timeout = self.write_timeout;
            let total_timeout = self.total_timeout;
            let span = tracing::info_span!("client_session", client_addr = %addr);

            tokio::spawn(
                async move {
                    let _permit = permit;

                    let client = match ClientConnection::new(stream, read_timeout, write_timeout)
                    {
                        Ok(client) => client,
                        Err(err) => {
                            warn!(
                                target: "pylon::worker",
                                error = ?err,
                                "Failed to wrap accepted socket"
                            );
                            return;
                        }
                    };

                    info!(target: "pylon::worker", "Got new client connection");
                    if timeout(total_timeout, engine.handle_client(client))
                        .await
                        .is_err()
                    {
                        info!(
                            target: "pylon::worker",
                            "Session hit the total timeout; closing client connection"
                        );
                    }
                }
                .instrument(span),
            );
        }
    }
}

fn set_keepalive(stream: &TcpStream) {
    if let Err(err) = socket2::SockRef::from(stream).set_keepalive(true) {
        debug!(
            target: "pylon::worker",
            error = ?err,
            "Failed to enable keep-alive on client socket"
        );
    }
}
