//! A checked-out upstream connection.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use pylon_http::{
    Connection, ConnectionError, ConnectionReader, ConnectionWriter, HttpMessageChunk,
    UpstreamConnection, UpstreamPeer,
};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::pool::{PoolConnectionError, UpstreamQueue};

/// An upstream connection checked out of the pool for exactly one
/// request/response exchange.
///
/// The connection is held as split halves behind separate locks: the
/// forward activity writes the request while the response activity
/// reads concurrently, and only one task ever touches each side.
pub struct PoolMember {
    queue: Arc<UpstreamQueue>,
    reader: Mutex<Option<ConnectionReader<UpstreamPeer>>>,
    writer: Mutex<Option<ConnectionWriter<UpstreamPeer>>>,
    messages_read: Arc<AtomicU64>,
    returned: AtomicBool,
}

impl std::fmt::Debug for PoolMember {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolMember").finish()
    }
}

impl PoolMember {
    pub(crate) fn new(queue: Arc<UpstreamQueue>, conn: UpstreamConnection) -> Self {
        let messages_read = conn.messages_read_handle();
        let (reader, writer) = conn.split();
        Self {
            queue,
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            messages_read,
            returned: AtomicBool::new(false),
        }
    }

    /// Upstream "host:port"; doubles as the metrics label.
    pub fn addr(&self) -> &str {
        self.queue.addr()
    }

    /// True iff exactly one complete response has been observed on
    /// this connection since checkout.
    pub fn response_is_read(&self) -> bool {
        self.messages_read.load(Ordering::SeqCst) == 1
    }

    /// Forward request bytes to the upstream.
    pub async fn write(&self, bytes: &[u8]) -> Result<(), ConnectionError> {
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(writer) => writer.write(bytes).await,
            None => Err(ConnectionError::UpstreamClosed),
        }
    }

    /// Next response chunk. EOF while a response is expected counts as
    /// the upstream dropping the connection.
    pub async fn next_chunk(&self) -> Result<HttpMessageChunk, ConnectionError> {
        let mut reader = self.reader.lock().await;
        match reader.as_mut() {
            Some(reader) => match reader.next_chunk().await? {
                Some(chunk) => Ok(chunk),
                None => Err(ConnectionError::UpstreamClosed),
            },
            None => Err(ConnectionError::UpstreamClosed),
        }
    }

    /// Give the connection back to its upstream's FIFO.
    ///
    /// A healthy member returns its own socket; an unhealthy one is
    /// closed and a fresh dial to the same upstream takes its slot, so
    /// the per-upstream pool size is preserved. Releasing twice is a
    /// no-op.
    pub async fn release(&self, is_healthy: bool) -> Result<(), PoolConnectionError> {
        if self.returned.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let reader = self.reader.lock().await.take();
        let writer = self.writer.lock().await.take();

        if is_healthy {
            if let (Some(reader), Some(writer)) = (reader, writer) {
                match Connection::reunite(reader, writer)
                    .and_then(|stream| self.queue.rewrap(stream))
                {
                    Ok(conn) => {
                        self.queue.put(conn);
                        debug!(
                            target: "pylon::pool",
                            upstream = %self.addr(),
                            "Returned healthy connection to pool"
                        );
                        return Ok(());
                    }
                    Err(err) => {
                        warn!(
                            target: "pylon::pool",
                            upstream = %self.addr(),
                            error = ?err,
                            "Failed to rewrap healthy connection; replacing it"
                        );
                    }
                }
            }
        }

        let conn = self.queue.dial().await?;
        self.queue.put(conn);
        debug!(
            target: "pylon::pool",
            upstream = %self.addr(),
            "Replaced upstream connection"
        );
        Ok(())
    }
}

/// Safety net for cancelled sessions: a member abandoned without an
/// explicit release still returns its slot to the pool.
impl Drop for PoolMember {
    fn drop(&mut self) {
        if self.returned.swap(true, Ordering::SeqCst) {
            return;
        }

        let reader = self.reader.get_mut().take();
        let writer = self.writer.get_mut().take();

        if self.messages_read.load(Ordering::SeqCst) == 1 {
            if let (Some(reader), Some(writer)) = (reader, writer) {
                if let Ok(conn) = Connection::reunite(reader, writer)
                    .and_then(|stream| self.queue.rewrap(stream))
                {
                    self.queue.put(conn);
                    return;
                }
            }
        }

        let queue = self.queue.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                match queue.dial().await {
                    Ok(conn) => queue.put(conn),
                    Err(err) => {
                        warn!(
                            target: "pylon::pool",
                            upstream = %queue.addr(),
                            error = %err,
                            "Failed to replace abandoned upstream connection"
                        );
                    }
                }
            });
        }
    }
}
