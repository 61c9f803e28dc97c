use serde::Deserialize;

// =======================================================
// LIMITS CONFIG
// =======================================================
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Maximum concurrent client connections per worker.
    pub max_client_conns: usize,
    /// Maximum pooled connections per upstream.
    pub max_conns_per_upstream: usize,
}
