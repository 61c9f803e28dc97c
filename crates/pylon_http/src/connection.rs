//! Timed connection wrappers around one TCP socket.
//!
//! A connection owns the socket, imposes the configured read/write
//! deadlines on every operation, and counts completed messages seen on
//! its reader. The two proxy sides share all behavior and differ only
//! in which start-line validation runs and which error identities they
//! surface, so both are the same generic type with a peer marker.

use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::{ConnectionError, HttpParseError, ReadError};
use crate::reader::{HttpMessageChunk, HttpReader, MessageKind, RequestKind, ResponseKind};

/// Which side of the proxy a connection belongs to.
///
/// Supplies the reader kind and the error identities for that side.
pub trait Peer: Send + Sync + 'static {
    type Kind: MessageKind + Send + Sync + 'static;

    fn timeout_error() -> ConnectionError;
    fn closed_error() -> ConnectionError;
    fn parse_error(err: HttpParseError) -> ConnectionError;
}

/// The accepted client side; validates incoming requests.
pub struct ClientPeer;

/// The dialed origin side; validates incoming responses.
pub struct UpstreamPeer;

impl Peer for ClientPeer {
    type Kind = RequestKind;

    fn timeout_error() -> ConnectionError {
        ConnectionError::ClientTimeout
    }

    fn closed_error() -> ConnectionError {
        ConnectionError::ClientClosed
    }

    fn parse_error(err: HttpParseError) -> ConnectionError {
        ConnectionError::ClientParse(err)
    }
}

impl Peer for UpstreamPeer {
    type Kind = ResponseKind;

    fn timeout_error() -> ConnectionError {
        ConnectionError::UpstreamTimeout
    }

    fn closed_error() -> ConnectionError {
        ConnectionError::UpstreamClosed
    }

    fn parse_error(err: HttpParseError) -> ConnectionError {
        ConnectionError::UpstreamParse(err)
    }
}

pub type ClientConnection = Connection<ClientPeer>;
pub type UpstreamConnection = Connection<UpstreamPeer>;

pub struct Connection<P: Peer> {
    reader: ConnectionReader<P>,
    writer: ConnectionWriter<P>,
}

impl<P: Peer> Connection<P> {
    pub fn new(
        stream: TcpStream,
        read_timeout: Duration,
        write_timeout: Duration,
    ) -> std::io::Result<Self> {
        let addr = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();
        let messages_read = Arc::new(AtomicU64::new(0));

        Ok(Self {
            reader: ConnectionReader {
                inner: HttpReader::new(read_half),
                read_timeout,
                messages_read,
                addr,
            },
            writer: ConnectionWriter {
                inner: write_half,
                write_timeout,
                addr,
                _peer: PhantomData,
            },
        })
    }

    /// Remote endpoint of the socket.
    pub fn addr(&self) -> SocketAddr {
        self.reader.addr
    }

    /// Number of complete messages observed on the reader so far.
    pub fn messages_read(&self) -> u64 {
        self.reader.messages_read()
    }

    /// Shared handle to the message counter, usable after `split`.
    pub fn messages_read_handle(&self) -> Arc<AtomicU64> {
        self.reader.messages_read.clone()
    }

    pub async fn next_chunk(&mut self) -> Result<Option<HttpMessageChunk>, ConnectionError> {
        self.reader.next_chunk().await
    }

    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), ConnectionError> {
        self.writer.write(bytes).await
    }

    pub async fn close(&mut self) {
        self.writer.close().await;
    }

    /// Split into independently owned halves so reads and writes can
    /// proceed concurrently from different tasks.
    pub fn split(self) -> (ConnectionReader<P>, ConnectionWriter<P>) {
        (self.reader, self.writer)
    }

    /// Put the halves of one connection back together, recovering the
    /// raw socket. Must only be called at a message boundary; buffered
    /// reader state is discarded.
    pub fn reunite(
        reader: ConnectionReader<P>,
        writer: ConnectionWriter<P>,
    ) -> std::io::Result<TcpStream> {
        reader
            .inner
            .into_inner()
            .reunite(writer.inner)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))
    }
}

/// Read side: framed chunks under the read deadline.
pub struct ConnectionReader<P: Peer> {
    inner: HttpReader<OwnedReadHalf, P::Kind>,
    read_timeout: Duration,
    messages_read: Arc<AtomicU64>,
    addr: SocketAddr,
}

impl<P: Peer> ConnectionReader<P> {
    /// Next framed chunk, or `None` when the peer closed at a message
    /// boundary. A deadline overrun surfaces as this side's timeout
    /// kind, an I/O failure as its closed kind.
    pub async fn next_chunk(&mut self) -> Result<Option<HttpMessageChunk>, ConnectionError> {
        let chunk = match timeout(self.read_timeout, self.inner.next_chunk()).await {
            Err(_) => return Err(P::timeout_error()),
            Ok(Err(ReadError::Io(_))) => return Err(P::closed_error()),
            Ok(Err(ReadError::Parse(err))) => return Err(P::parse_error(err)),
            Ok(Ok(chunk)) => chunk,
        };

        if let Some(chunk) = &chunk {
            if chunk.is_message_end {
                self.messages_read.fetch_add(1, Ordering::SeqCst);
            }
        }
        Ok(chunk)
    }

    pub fn messages_read(&self) -> u64 {
        self.messages_read.load(Ordering::SeqCst)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

/// Write side: whole-buffer writes under the write deadline.
pub struct ConnectionWriter<P: Peer> {
    inner: OwnedWriteHalf,
    write_timeout: Duration,
    addr: SocketAddr,
    _peer: PhantomData<P>,
}

impl<P: Peer> ConnectionWriter<P> {
    /// Send all bytes. Any failure (closed socket, broken pipe,
    /// deadline overrun) surfaces as this side's closed kind.
    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), ConnectionError> {
        match timeout(self.write_timeout, self.inner.write_all(bytes)).await {
            Err(_) => Err(P::closed_error()),
            Ok(Err(_)) => Err(P::closed_error()),
            Ok(Ok(())) => Ok(()),
        }
    }

    /// Half-close the socket. Already-closed peers are not an error.
    pub async fn close(&mut self) {
        let _ = self.inner.shutdown().await;
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}
