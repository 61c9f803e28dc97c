//! Round-robin, bounded pool of upstream connections.
//!
//! One FIFO of idle connections per configured upstream; the outer
//! sequence of FIFOs rotates on every acquisition so selection stays
//! fair regardless of which connections become available first.
//! Dialing happens only in `prepare` and when an unhealthy connection
//! is replaced at release time.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use pylon_config::{PylonConfig, TimeoutsConfig};
use pylon_http::UpstreamConnection;
use pylon_metrics::ProxyMetrics;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::member::PoolMember;

#[derive(Debug, thiserror::Error)]
pub enum PoolConnectionError {
    #[error("failed to connect to any upstream")]
    Empty,

    #[error("timeout on getting upstream connection from pool")]
    AcquireTimeout,

    #[error("failed to dial upstream {addr}: {reason}")]
    Dial { addr: String, reason: String },
}

/// One upstream's bounded FIFO of idle connections plus everything
/// needed to dial it again.
pub(crate) struct UpstreamQueue {
    addr: String,
    tx: mpsc::Sender<UpstreamConnection>,
    rx: Mutex<mpsc::Receiver<UpstreamConnection>>,
    connect_timeout: Duration,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl UpstreamQueue {
    fn new(addr: String, capacity: usize, timeouts: &TimeoutsConfig) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            addr,
            tx,
            rx: Mutex::new(rx),
            connect_timeout: timeouts.connect(),
            read_timeout: timeouts.read(),
            write_timeout: timeouts.write(),
        }
    }

    pub(crate) fn addr(&self) -> &str {
        &self.addr
    }

    /// Dial a fresh connection to this upstream.
    pub(crate) async fn dial(&self) -> Result<UpstreamConnection, PoolConnectionError> {
        let stream = match timeout(self.connect_timeout, TcpStream::connect(&self.addr)).await {
            Err(_) => {
                return Err(PoolConnectionError::Dial {
                    addr: self.addr.clone(),
                    reason: "connect timeout".into(),
                });
            }
            Ok(Err(err)) => {
                return Err(PoolConnectionError::Dial {
                    addr: self.addr.clone(),
                    reason: err.to_string(),
                });
            }
            Ok(Ok(stream)) => stream,
        };

        if let Err(err) = socket2::SockRef::from(&stream).set_keepalive(true) {
            debug!(
                target: "pylon::pool",
                upstream = %self.addr,
                error = ?err,
                "Failed to enable keep-alive on upstream socket"
            );
        }

        self.rewrap(stream).map_err(|err| PoolConnectionError::Dial {
            addr: self.addr.clone(),
            reason: err.to_string(),
        })
    }

    /// Wrap a raw socket that is already connected to this upstream.
    pub(crate) fn rewrap(&self, stream: TcpStream) -> std::io::Result<UpstreamConnection> {
        UpstreamConnection::new(stream, self.read_timeout, self.write_timeout)
    }

    /// Return a connection to the FIFO. The channel capacity equals
    /// the per-upstream bound, so the send can only fail if checkout
    /// and release stop being paired; such a connection is dropped.
    pub(crate) fn put(&self, conn: UpstreamConnection) {
        if self.tx.try_send(conn).is_err() {
            warn!(
                target: "pylon::pool",
                upstream = %self.addr,
                "Upstream queue refused a connection; dropping it"
            );
        }
    }

    async fn take(&self, wait: Duration) -> Result<UpstreamConnection, PoolConnectionError> {
        let recv = async {
            let mut rx = self.rx.lock().await;
            rx.recv().await
        };
        match timeout(wait, recv).await {
            Err(_) | Ok(None) => Err(PoolConnectionError::AcquireTimeout),
            Ok(Some(conn)) => Ok(conn),
        }
    }
}

pub struct RoundRobinPool {
    upstreams: Mutex<VecDeque<Arc<UpstreamQueue>>>,
    capacity_per_upstream: usize,
    acquire_timeout: Duration,
    metrics: Arc<ProxyMetrics>,
}

impl RoundRobinPool {
    pub fn new(cfg: &PylonConfig, metrics: Arc<ProxyMetrics>) -> Self {
        let upstreams = cfg
            .upstreams
            .iter()
            .map(|upstream| {
                Arc::new(UpstreamQueue::new(
                    upstream.addr(),
                    cfg.limits.max_conns_per_upstream,
                    &cfg.timeouts,
                ))
            })
            .collect();

        Self {
            upstreams: Mutex::new(upstreams),
            capacity_per_upstream: cfg.limits.max_conns_per_upstream,
            acquire_timeout: cfg.timeouts.connect(),
            metrics,
        }
    }

    /// Fill every upstream's FIFO up to the per-upstream bound. Dial
    /// failures are logged and skipped; only a pool with no
    /// connections at all is a startup failure.
    pub async fn prepare(&self) -> Result<(), PoolConnectionError> {
        let queues: Vec<Arc<UpstreamQueue>> = self.upstreams.lock().await.iter().cloned().collect();

        let mut total = 0usize;
        for queue in &queues {
            for _ in 0..self.capacity_per_upstream {
                match queue.dial().await {
                    Ok(conn) => {
                        queue.put(conn);
                        total += 1;
                    }
                    Err(err) => {
                        warn!(
                            target: "pylon::pool",
                            upstream = %queue.addr(),
                            error = %err,
                            "Failed to prepare upstream connection"
                        );
                    }
                }
            }
        }

        if total == 0 {
            return Err(PoolConnectionError::Empty);
        }
        info!(target: "pylon::pool", connections = total, "Upstream pool prepared");
        Ok(())
    }

    /// Rotate to the next upstream and take a connection from its
    /// FIFO, waiting at most the connect deadline. The wait is
    /// observed in the pool latency histogram.
    pub async fn acquire(&self) -> Result<Arc<PoolMember>, PoolConnectionError> {
        let queue = {
            let mut upstreams = self.upstreams.lock().await;
            let Some(queue) = upstreams.pop_front() else {
                return Err(PoolConnectionError::Empty);
            };
            upstreams.push_back(queue.clone());
            queue
        };

        let started = Instant::now();
        let conn = queue.take(self.acquire_timeout).await?;
        self.metrics
            .observe_pool_wait(started.elapsed().as_secs_f64());

        Ok(Arc::new(PoolMember::new(queue, conn)))
    }
}
