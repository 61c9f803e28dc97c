use pylon_http::ConnectionError;

use crate::pool::PoolConnectionError;

/// Everything that can abort one client session.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Pool(#[from] PoolConnectionError),

    #[error("response task failed: {0}")]
    ResponseTask(tokio::task::JoinError),
}

impl ProxyError {
    /// Errors that map to a 400 for the client.
    pub fn is_client_parse(&self) -> bool {
        matches!(
            self,
            ProxyError::Connection(ConnectionError::ClientParse(_))
        )
    }

    /// Errors that map to a 502 for the client.
    pub fn is_upstream_side(&self) -> bool {
        matches!(
            self,
            ProxyError::Connection(
                ConnectionError::UpstreamTimeout
                    | ConnectionError::UpstreamClosed
                    | ConnectionError::UpstreamParse(_)
            ) | ProxyError::Pool(_)
        )
    }
}
