/// Malformed bytes on either side of the proxy.
#[derive(Debug, thiserror::Error)]
#[error("{reason}")]
pub struct HttpParseError {
    reason: String,
}

impl HttpParseError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Failure while pulling the next chunk out of the framing reader.
///
/// The reader itself knows nothing about deadlines or which side of
/// the proxy it serves; [`crate::Connection`] maps these into the
/// connection-specific [`ConnectionError`] kinds.
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error(transparent)]
    Parse(#[from] HttpParseError),

    #[error("socket read failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Connection-level error taxonomy, one kind per side and failure mode.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("timeout on reading data from client")]
    ClientTimeout,

    #[error("client closed connection")]
    ClientClosed,

    #[error("timeout on reading data from upstream")]
    UpstreamTimeout,

    #[error("upstream closed connection")]
    UpstreamClosed,

    #[error("malformed HTTP request from client: {0}")]
    ClientParse(HttpParseError),

    #[error("malformed HTTP response from upstream: {0}")]
    UpstreamParse(HttpParseError),
}
