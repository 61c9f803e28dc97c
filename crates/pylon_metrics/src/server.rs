//! Plain-TCP scrape endpoint.
//!
//! Scrapers get the full text-format dump on every connection; the
//! request itself is not read, and the connection is closed after one
//! response.

use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::ProxyMetrics;

pub async fn serve(listen: String, metrics: Arc<ProxyMetrics>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&listen).await?;
    info!(target: "pylon::metrics", listen = %listen, "Metrics endpoint listening");

    loop {
        let (mut stream, addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                error!(target: "pylon::metrics", error = ?err, "Failed to accept scrape connection");
                continue;
            }
        };

        let body = metrics.render();
        let head = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            prometheus::TEXT_FORMAT,
            body.len()
        );

        if let Err(err) = stream.write_all(head.as_bytes()).await {
            debug!(target: "pylon::metrics", scraper = %addr, error = ?err, "Scrape write failed");
            continue;
        }
        if let Err(err) = stream.write_all(&body).await {
            debug!(target: "pylon::metrics", scraper = %addr, error = ?err, "Scrape write failed");
            continue;
        }
        let _ = stream.shutdown().await;
    }
}
