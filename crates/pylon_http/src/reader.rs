//! Incremental framing of an HTTP/1.1 byte stream.
//!
//! Turns raw bytes into a lazy sequence of message chunks tagged with
//! message boundaries, without ever buffering a whole message. Bodies
//! are delimited by `Content-Length` only; the reader never interprets
//! `Transfer-Encoding`, `Connection`, or pipelining semantics.

use std::marker::PhantomData;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{HttpParseError, ReadError};

/// Fixed size of streamed body pieces.
const BODY_CHUNK_SIZE: u64 = 512;

/// Cap on the start-line + header block of one message.
const MAX_HEAD_BYTES: usize = 64 * 1024;

const MAX_HEADERS: usize = 64;

const KNOWN_METHODS: &[&str] = &[
    "GET", "HEAD", "POST", "PUT", "DELETE", "CONNECT", "OPTIONS", "TRACE", "PATCH",
];

/// A bounded piece of an HTTP/1.1 message.
///
/// For every message the reader emits exactly one chunk with
/// `is_message_start` (the start-line plus headers), zero or more body
/// chunks, and exactly one chunk with `is_message_end` (which is empty
/// when the message has no body). Concatenating `bytes` across the
/// chunks of a message reproduces the exact bytes on the wire.
#[derive(Debug, Clone)]
pub struct HttpMessageChunk {
    pub bytes: Bytes,
    pub is_message_start: bool,
    pub is_message_end: bool,
}

/// Body framing extracted from a validated message head.
pub struct HeadInfo {
    pub content_length: u64,
}

/// Start-line validation for one direction of the proxy.
pub trait MessageKind {
    fn validate_head(head: &[u8]) -> Result<HeadInfo, HttpParseError>;
}

/// Validates request heads (client side).
pub struct RequestKind;

/// Validates response heads (upstream side).
pub struct ResponseKind;

impl MessageKind for RequestKind {
    fn validate_head(head: &[u8]) -> Result<HeadInfo, HttpParseError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(head) {
            Ok(httparse::Status::Complete(_)) => {}
            Ok(httparse::Status::Partial) => {
                return Err(HttpParseError::new("truncated request head"));
            }
            Err(err) => {
                return Err(HttpParseError::new(format!("malformed request head: {err}")));
            }
        }

        let method = req.method.unwrap_or_default();
        if !KNOWN_METHODS.contains(&method) {
            return Err(HttpParseError::new(format!("wrong method: {method}")));
        }
        if req.path.unwrap_or_default().is_empty() {
            return Err(HttpParseError::new("empty request path"));
        }
        // httparse only understands HTTP/1.x; minor version 1 means 1.1.
        if req.version != Some(1) {
            return Err(HttpParseError::new("invalid version: HTTP/1.1 required"));
        }

        content_length(req.headers).map(|content_length| HeadInfo { content_length })
    }
}

impl MessageKind for ResponseKind {
    fn validate_head(head: &[u8]) -> Result<HeadInfo, HttpParseError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut resp = httparse::Response::new(&mut headers);
        match resp.parse(head) {
            Ok(httparse::Status::Complete(_)) => {}
            Ok(httparse::Status::Partial) => {
                return Err(HttpParseError::new("truncated response head"));
            }
            Err(err) => {
                return Err(HttpParseError::new(format!("malformed response head: {err}")));
            }
        }

        match resp.code {
            Some(code) if (100..=599).contains(&code) => {}
            other => {
                return Err(HttpParseError::new(format!("wrong status code: {other:?}")));
            }
        }
        if resp.version != Some(1) {
            return Err(HttpParseError::new("invalid version: HTTP/1.1 required"));
        }

        content_length(resp.headers).map(|content_length| HeadInfo { content_length })
    }
}

fn content_length(headers: &[httparse::Header<'_>]) -> Result<u64, HttpParseError> {
    let mut value = 0;
    for header in headers {
        if !header.name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        let raw = std::str::from_utf8(header.value)
            .map_err(|_| HttpParseError::new("non-ASCII Content-Length value"))?
            .trim();
        value = raw
            .parse::<u64>()
            .map_err(|_| HttpParseError::new(format!("invalid Content-Length: {raw}")))?;
    }
    Ok(value)
}

enum ReadState {
    /// Waiting for (or mid-way through) a start-line + header block.
    Head,
    /// Streaming a Content-Length body.
    Body { remaining: u64 },
    /// Body-less message: emit the empty end-of-message marker.
    Tail,
}

/// Framed reader over any byte stream.
///
/// Deadlines are the caller's business; each `next_chunk` suspends
/// only on socket reads and never between parsing steps.
pub struct HttpReader<R, K> {
    stream: R,
    buf: BytesMut,
    state: ReadState,
    _kind: PhantomData<K>,
}

impl<R, K> HttpReader<R, K>
where
    R: AsyncRead + Unpin,
    K: MessageKind,
{
    pub fn new(stream: R) -> Self {
        Self {
            stream,
            buf: BytesMut::new(),
            state: ReadState::Head,
            _kind: PhantomData,
        }
    }

    /// Recover the underlying stream. Any bytes buffered past the last
    /// returned chunk are dropped, so call this only at a message
    /// boundary.
    pub fn into_inner(self) -> R {
        self.stream
    }

    /// Next chunk of the message stream, or `None` on EOF at a message
    /// boundary. EOF anywhere inside a message is a parse error.
    pub async fn next_chunk(&mut self) -> Result<Option<HttpMessageChunk>, ReadError> {
        match self.state {
            ReadState::Head => self.read_head().await,
            ReadState::Body { remaining } => self.read_body_piece(remaining).await.map(Some),
            ReadState::Tail => {
                self.state = ReadState::Head;
                Ok(Some(HttpMessageChunk {
                    bytes: Bytes::new(),
                    is_message_start: false,
                    is_message_end: true,
                }))
            }
        }
    }

    async fn read_head(&mut self) -> Result<Option<HttpMessageChunk>, ReadError> {
        loop {
            if let Some(pos) = find_head_end(&self.buf) {
                let head = self.buf.split_to(pos + 4).freeze();
                let info = K::validate_head(&head)?;
                self.state = if info.content_length > 0 {
                    ReadState::Body {
                        remaining: info.content_length,
                    }
                } else {
                    ReadState::Tail
                };
                return Ok(Some(HttpMessageChunk {
                    bytes: head,
                    is_message_start: true,
                    is_message_end: false,
                }));
            }

            if self.buf.len() > MAX_HEAD_BYTES {
                return Err(HttpParseError::new("message head too large").into());
            }

            if self.fill().await? == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(HttpParseError::new("unexpected EOF in message head").into());
            }
        }
    }

    async fn read_body_piece(&mut self, remaining: u64) -> Result<HttpMessageChunk, ReadError> {
        let target = remaining.min(BODY_CHUNK_SIZE) as usize;
        while self.buf.len() < target {
            if self.fill().await? == 0 {
                return Err(HttpParseError::new("unexpected EOF in message body").into());
            }
        }

        let piece = self.buf.split_to(target).freeze();
        let left = remaining - target as u64;
        self.state = if left == 0 {
            ReadState::Head
        } else {
            ReadState::Body { remaining: left }
        };
        Ok(HttpMessageChunk {
            bytes: piece,
            is_message_start: false,
            is_message_end: left == 0,
        })
    }

    async fn fill(&mut self) -> Result<usize, ReadError> {
        let mut tmp = [0u8; 4096];
        let n = self.stream.read(&mut tmp).await?;
        if n > 0 {
            self.buf.extend_from_slice(&tmp[..n]);
        }
        Ok(n)
    }
}

fn find_head_end(buf: &BytesMut) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}
