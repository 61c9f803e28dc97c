//! Per-client proxy state machine.
//!
//! One engine call drives one client connection to completion: client
//! chunks flow to the paired upstream (forward activity) while a
//! spawned task relays the upstream's response back (reverse
//! activity). A pool member is acquired only on a request's first
//! chunk and released only after its response has ended or failed, so
//! every request is paired with exactly one response and each upstream
//! connection carries at most one in-flight request.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use pylon_http::{
    responses, ClientConnection, ClientPeer, ConnectionError, ConnectionReader, ConnectionWriter,
    HttpParseError,
};
use pylon_metrics::ProxyMetrics;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::ProxyError;
use crate::member::PoolMember;
use crate::pool::RoundRobinPool;

type ClientReader = ConnectionReader<ClientPeer>;
type SharedClientWriter = Arc<Mutex<ConnectionWriter<ClientPeer>>>;
type ResponseTask = JoinHandle<Result<(), ProxyError>>;

pub struct ProxyEngine {
    pool: Arc<RoundRobinPool>,
    metrics: Arc<ProxyMetrics>,
}

impl ProxyEngine {
    pub fn new(pool: Arc<RoundRobinPool>, metrics: Arc<ProxyMetrics>) -> Self {
        Self { pool, metrics }
    }

    /// Drive one client connection to completion, mapping any failure
    /// to the response the client should see.
    pub async fn handle_client(&self, client: ClientConnection) {
        let (mut reader, writer) = client.split();
        let writer: SharedClientWriter = Arc::new(Mutex::new(writer));
        let responded = Arc::new(AtomicBool::new(false));

        match self.proxy_client(&mut reader, &writer, &responded).await {
            Ok(()) => {
                debug!(target: "pylon::proxy", "Client session finished");
            }
            Err(
                ProxyError::Connection(ConnectionError::ClientTimeout)
                | ProxyError::Connection(ConnectionError::ClientClosed),
            ) => {
                info!(target: "pylon::proxy", "Client timeout");
            }
            Err(err) if err.is_client_parse() => {
                error!(target: "pylon::proxy", error = %err, "Error parsing client http data");
                send_best_effort(&writer, &responses::bad_request()).await;
            }
            Err(ProxyError::Pool(err)) => {
                self.metrics.inc_pool_error();
                error!(target: "pylon::proxy", error = %err, "Pool error");
                send_best_effort(&writer, &responses::bad_gateway()).await;
            }
            Err(err) => {
                error!(target: "pylon::proxy", error = %err, "Upstream error");
                // A 502 into a partially relayed response would corrupt
                // the stream; in that case only the close below remains.
                if !responded.load(Ordering::SeqCst) {
                    send_best_effort(&writer, &responses::bad_gateway()).await;
                }
            }
        }

        writer.lock().await.close().await;
    }

    async fn proxy_client(
        &self,
        reader: &mut ClientReader,
        writer: &SharedClientWriter,
        responded: &Arc<AtomicBool>,
    ) -> Result<(), ProxyError> {
        let mut member: Option<Arc<PoolMember>> = None;
        let mut response_task: Option<ResponseTask> = None;

        let forward = self
            .forward(reader, writer, responded, &mut member, &mut response_task)
            .await;
        let cleanup = self.cleanup(&mut member, &mut response_task).await;
        merge(forward, cleanup)
    }

    /// Forward activity: relay client chunks to the upstream. Each
    /// message start joins the previous exchange, then pairs the new
    /// request with a freshly acquired pool member.
    async fn forward(
        &self,
        reader: &mut ClientReader,
        writer: &SharedClientWriter,
        responded: &Arc<AtomicBool>,
        member: &mut Option<Arc<PoolMember>>,
        response_task: &mut Option<ResponseTask>,
    ) -> Result<(), ProxyError> {
        while let Some(chunk) = reader.next_chunk().await? {
            if chunk.is_message_start {
                self.cleanup(member, response_task).await?;
                responded.store(false, Ordering::SeqCst);

                let started = Instant::now();
                let acquired = self.pool.acquire().await?;
                debug!(
                    target: "pylon::proxy",
                    upstream = %acquired.addr(),
                    "Got upstream connection"
                );

                *response_task = Some(tokio::spawn(upstream_to_client(
                    writer.clone(),
                    acquired.clone(),
                    started,
                    responded.clone(),
                    self.metrics.clone(),
                )));
                *member = Some(acquired);
            }

            let current = member.as_ref().ok_or_else(|| {
                ConnectionError::ClientParse(HttpParseError::new(
                    "body bytes before any message start",
                ))
            })?;
            current.write(&chunk.bytes).await?;
        }
        Ok(())
    }

    /// Join the previous response activity (if any) and release its
    /// pool member with health derived from what was actually
    /// observed on the wire.
    async fn cleanup(
        &self,
        member: &mut Option<Arc<PoolMember>>,
        response_task: &mut Option<ResponseTask>,
    ) -> Result<(), ProxyError> {
        let mut result = Ok(());

        if let Some(task) = response_task.take() {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    if matches!(
                        err,
                        ProxyError::Connection(ConnectionError::UpstreamTimeout)
                    ) {
                        if let Some(member) = member.as_ref() {
                            if !member.response_is_read() {
                                self.metrics.inc_upstream_error(member.addr());
                            }
                        }
                    }
                    result = Err(err);
                }
                Err(err) => result = Err(ProxyError::ResponseTask(err)),
            }
        }

        if let Some(member) = member.take() {
            let healthy = member.response_is_read();
            if let Err(err) = member.release(healthy).await {
                warn!(
                    target: "pylon::proxy",
                    upstream = %member.addr(),
                    error = %err,
                    "Failed to release upstream connection"
                );
            }
        }

        result
    }
}

/// Reverse activity: relay response chunks to the client.
///
/// Client-side write failures are swallowed so the upstream exchange
/// can still be drained and the connection returned healthy.
async fn upstream_to_client(
    writer: SharedClientWriter,
    member: Arc<PoolMember>,
    started: Instant,
    responded: Arc<AtomicBool>,
    metrics: Arc<ProxyMetrics>,
) -> Result<(), ProxyError> {
    loop {
        let chunk = member.next_chunk().await?;

        match writer.lock().await.write(&chunk.bytes).await {
            Ok(()) => responded.store(true, Ordering::SeqCst),
            Err(err) => {
                debug!(
                    target: "pylon::proxy",
                    error = %err,
                    "Dropping response bytes for a gone client"
                );
            }
        }

        if chunk.is_message_end {
            metrics.observe_request_latency(member.addr(), started.elapsed().as_secs_f64());
            if let Err(err) = member.release(true).await {
                warn!(
                    target: "pylon::proxy",
                    upstream = %member.addr(),
                    error = %err,
                    "Failed to return connection to pool"
                );
            }
            return Ok(());
        }
    }
}

async fn send_best_effort(writer: &SharedClientWriter, bytes: &[u8]) {
    if let Err(err) = writer.lock().await.write(bytes).await {
        debug!(
            target: "pylon::proxy",
            error = %err,
            "Failed to send error response to client"
        );
    }
}

/// Merge the forward and cleanup outcomes: a client-side parse error
/// wins (it maps to 400), otherwise an upstream-side error wins (502),
/// otherwise the first observed error.
fn merge(forward: Result<(), ProxyError>, cleanup: Result<(), ProxyError>) -> Result<(), ProxyError> {
    match (forward, cleanup) {
        (Ok(()), cleanup) => cleanup,
        (forward, Ok(())) => forward,
        (Err(forward), Err(cleanup)) => {
            if forward.is_client_parse() {
                Err(forward)
            } else if cleanup.is_client_parse() {
                Err(cleanup)
            } else if forward.is_upstream_side() {
                Err(forward)
            } else if cleanup.is_upstream_side() {
                Err(cleanup)
            } else {
                Err(forward)
            }
        }
    }
}
