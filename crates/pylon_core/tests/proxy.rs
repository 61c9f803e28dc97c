//! End-to-end proxy scenarios over real sockets: literal bytes in,
//! literal bytes out.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pylon_config::PylonConfig;
use pylon_core::{Master, Worker};
use pylon_metrics::ProxyMetrics;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};

const BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\nContent-Length: 15\r\n\r\nInvalid request";
const BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 14\r\n\r\nInternal error";

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn content_length(head: &str) -> usize {
    head.lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse().ok())
        .unwrap_or(0)
}

/// Keep-alive echo origin: responds 200 with the request body.
async fn spawn_echo_upstream() -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = accepted.clone();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut buf: Vec<u8> = Vec::new();
                loop {
                    let head_end = loop {
                        if let Some(pos) = find(&buf, b"\r\n\r\n") {
                            break pos + 4;
                        }
                        let mut tmp = [0u8; 4096];
                        match stream.read(&mut tmp).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => buf.extend_from_slice(&tmp[..n]),
                        }
                    };
                    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
                    let body_len = content_length(&head);
                    buf.drain(..head_end);

                    while buf.len() < body_len {
                        let mut tmp = [0u8; 4096];
                        match stream.read(&mut tmp).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => buf.extend_from_slice(&tmp[..n]),
                        }
                    }
                    let body: Vec<u8> = buf.drain(..body_len).collect();

                    let head = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n", body.len());
                    if stream.write_all(head.as_bytes()).await.is_err() {
                        return;
                    }
                    if stream.write_all(&body).await.is_err() {
                        return;
                    }
                }
            });
        }
    });

    (addr, accepted)
}

/// Origin that accepts and reads but never answers.
async fn spawn_silent_upstream() -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = accepted.clone();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut tmp = [0u8; 4096];
                loop {
                    match stream.read(&mut tmp).await {
                        Ok(0) | Err(_) => return,
                        Ok(_) => {}
                    }
                }
            });
        }
    });

    (addr, accepted)
}

fn config(
    upstreams: &[&str],
    max_per_upstream: usize,
    connect_ms: u64,
    read_ms: u64,
    total_ms: u64,
) -> PylonConfig {
    let entries: String = upstreams
        .iter()
        .map(|addr| {
            let (host, port) = addr.split_once(':').unwrap();
            format!("  - host: \"{host}\"\n    port: {port}\n")
        })
        .collect();
    PylonConfig::from_yaml(&format!(
        r#"
listen: "127.0.0.1:0"
workers: 1
upstreams:
{entries}
timeouts:
  connect_ms: {connect_ms}
  read_ms: {read_ms}
  write_ms: 1000
  total_ms: {total_ms}
limits:
  max_client_conns: 8
  max_conns_per_upstream: {max_per_upstream}
"#
    ))
    .expect("test config should parse")
}

/// Start one worker on an ephemeral port and return its address plus
/// the metrics sink it reports into.
async fn spawn_proxy(cfg: PylonConfig) -> (String, Arc<ProxyMetrics>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let metrics = Arc::new(ProxyMetrics::new().unwrap());

    let worker = Worker::new(0, &cfg, Arc::new(listener), metrics.clone());
    worker.prepare().await.expect("pool should prepare");
    tokio::spawn(worker.run());

    (addr, metrics)
}

/// Read exactly one Content-Length-framed response.
async fn read_one_response(stream: &mut TcpStream) -> Vec<u8> {
    let mut buf: Vec<u8> = Vec::new();
    loop {
        if let Some(pos) = find(&buf, b"\r\n\r\n") {
            let body_len = content_length(&String::from_utf8_lossy(&buf[..pos + 4]));
            if buf.len() >= pos + 4 + body_len {
                buf.truncate(pos + 4 + body_len);
                return buf;
            }
        }
        let mut tmp = [0u8; 4096];
        match timeout(Duration::from_secs(5), stream.read(&mut tmp)).await {
            Ok(Ok(0)) | Ok(Err(_)) | Err(_) => return buf,
            Ok(Ok(n)) => buf.extend_from_slice(&tmp[..n]),
        }
    }
}

#[tokio::test]
async fn basic_echo_roundtrip() {
    let (upstream, _) = spawn_echo_upstream().await;
    let cfg = config(&[&upstream], 2, 500, 2000, 10_000);
    let (proxy, metrics) = spawn_proxy(cfg).await;

    let mut client = TcpStream::connect(&proxy).await.unwrap();
    client
        .write_all(b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello")
        .await
        .unwrap();

    let response = read_one_response(&mut client).await;
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "got: {text}");
    assert!(text.ends_with("hello"), "got: {text}");

    // The latency observation lands right after the last response
    // byte; give the reverse task a moment to finish.
    sleep(Duration::from_millis(100)).await;
    assert_eq!(metrics.request_latency_count(&upstream), 1);
    assert_eq!(metrics.upstream_errors(&upstream), 0);
}

#[tokio::test]
async fn keep_alive_carries_two_exchanges_in_order() {
    let (upstream, _) = spawn_echo_upstream().await;
    let cfg = config(&[&upstream], 1, 500, 2000, 10_000);
    let (proxy, metrics) = spawn_proxy(cfg).await;

    let mut client = TcpStream::connect(&proxy).await.unwrap();

    client
        .write_all(b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello")
        .await
        .unwrap();
    let first = read_one_response(&mut client).await;
    assert!(String::from_utf8_lossy(&first).ends_with("hello"));

    client
        .write_all(b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\nworld")
        .await
        .unwrap();
    let second = read_one_response(&mut client).await;
    assert!(String::from_utf8_lossy(&second).ends_with("world"));

    sleep(Duration::from_millis(100)).await;
    assert_eq!(metrics.request_latency_count(&upstream), 2);
}

#[tokio::test]
async fn pipelined_requests_are_answered_in_order() {
    let (upstream, _) = spawn_echo_upstream().await;
    let cfg = config(&[&upstream], 1, 500, 2000, 10_000);
    let (proxy, _) = spawn_proxy(cfg).await;

    let mut client = TcpStream::connect(&proxy).await.unwrap();
    client
        .write_all(
            b"POST / HTTP/1.1\r\nContent-Length: 3\r\n\r\nonePOST / HTTP/1.1\r\nContent-Length: 3\r\n\r\ntwo",
        )
        .await
        .unwrap();

    let first = read_one_response(&mut client).await;
    assert!(String::from_utf8_lossy(&first).ends_with("one"));
    let second = read_one_response(&mut client).await;
    assert!(String::from_utf8_lossy(&second).ends_with("two"));
}

#[tokio::test]
async fn upstream_timeout_maps_to_bad_gateway_and_replacement() {
    let (upstream, accepted) = spawn_silent_upstream().await;
    let cfg = config(&[&upstream], 1, 500, 200, 10_000);
    let (proxy, metrics) = spawn_proxy(cfg).await;
    assert_eq!(accepted.load(Ordering::SeqCst), 1);

    let mut client = TcpStream::connect(&proxy).await.unwrap();
    client
        .write_all(b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello")
        .await
        .unwrap();

    let response = read_one_response(&mut client).await;
    assert_eq!(response, BAD_GATEWAY);
    assert_eq!(metrics.upstream_errors(&upstream), 1);

    // The broken connection was closed and a fresh dial took its slot.
    sleep(Duration::from_millis(300)).await;
    assert_eq!(accepted.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn malformed_request_maps_to_bad_request() {
    let (upstream, accepted) = spawn_echo_upstream().await;
    let cfg = config(&[&upstream], 1, 500, 2000, 10_000);
    let (proxy, metrics) = spawn_proxy(cfg).await;

    let mut client = TcpStream::connect(&proxy).await.unwrap();
    client.write_all(b"GARBAGE\r\n\r\n").await.unwrap();

    let response = read_one_response(&mut client).await;
    assert_eq!(response, BAD_REQUEST);

    // Validation failed before the start chunk, so no pool checkout
    // happened and the prepared connection is untouched.
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
    assert_eq!(metrics.pool_errors(), 0);
}

#[tokio::test]
async fn pool_exhaustion_maps_to_bad_gateway() {
    let (upstream, _) = spawn_silent_upstream().await;
    let cfg = config(&[&upstream], 1, 200, 5000, 10_000);
    let (proxy, metrics) = spawn_proxy(cfg).await;

    let mut first = TcpStream::connect(&proxy).await.unwrap();
    first
        .write_all(b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello")
        .await
        .unwrap();
    // Give the first session time to check out the only connection.
    sleep(Duration::from_millis(100)).await;

    let mut second = TcpStream::connect(&proxy).await.unwrap();
    second
        .write_all(b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello")
        .await
        .unwrap();

    let response = read_one_response(&mut second).await;
    assert_eq!(response, BAD_GATEWAY);
    assert_eq!(metrics.pool_errors(), 1);
}

#[tokio::test]
async fn startup_fails_when_all_upstreams_are_down() {
    let dead = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().to_string()
    };
    let cfg = config(&[&dead], 2, 200, 200, 1000);
    let metrics = Arc::new(ProxyMetrics::new().unwrap());

    let result = timeout(Duration::from_secs(5), Master::new(cfg, metrics).run()).await;
    assert!(result.expect("startup should fail fast").is_err());
}

#[tokio::test]
async fn total_timeout_closes_an_idle_session() {
    let (upstream, _) = spawn_echo_upstream().await;
    let cfg = config(&[&upstream], 1, 500, 10_000, 300);
    let (proxy, _) = spawn_proxy(cfg).await;

    let mut client = TcpStream::connect(&proxy).await.unwrap();

    // Say nothing; the session deadline must end the connection even
    // though the read deadline is far away.
    let mut tmp = [0u8; 16];
    let n = timeout(Duration::from_secs(2), client.read(&mut tmp))
        .await
        .expect("session should be closed by total_ms")
        .unwrap_or(0);
    assert_eq!(n, 0);
}
