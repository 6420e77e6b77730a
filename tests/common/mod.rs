//! Shared test infrastructure for integration tests.
//!
//! Provides selector builders, a fixed reference instant for time-based
//! assertions, and throwaway tagged TCP backends for the forwarding tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use backend_selector::{Algorithm, Registry, Selector, SelectorConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

/// Fail timeout used by every test selector.
pub const FAIL_TIMEOUT: Duration = Duration::from_secs(30);

/// Initializes a tracing subscriber for test output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("debug")
        .try_init();
}

/// Builds a selector over `spec` with the given policy and failure threshold.
pub fn test_selector(spec: &str, algorithm: Algorithm, threshold: u32) -> Selector {
    Selector::new(
        Registry::parse(spec).expect("test backend spec must be valid"),
        SelectorConfig {
            algorithm,
            passive_failure_threshold: threshold,
            fail_timeout: FAIL_TIMEOUT,
        },
    )
}

/// The three-backend pool used by most selection tests.
pub fn three_backends(algorithm: Algorithm) -> Selector {
    test_selector(
        "127.0.0.1:8081,127.0.0.1:8082,127.0.0.1:8083",
        algorithm,
        3,
    )
}

/// Reports `threshold` consecutive failures for the backend on `port`.
pub fn fail_until_suspended(selector: &Selector, port: u16, now: std::time::Instant) {
    let backend = selector
        .registry()
        .all()
        .iter()
        .find(|b| b.port() == port)
        .expect("backend with port must exist")
        .clone();
    for _ in 0..selector.config().passive_failure_threshold {
        selector.mark_failure_at(&backend, now);
    }
}

/// Returns a local port with nothing listening on it.
pub async fn unused_port() -> u16 {
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .expect("failed to bind port-reservation listener");
    listener.local_addr().unwrap().port()
}

/// Starts a local TCP backend that writes `"{tag}:"` on every accepted
/// connection, then echoes whatever it reads until the client closes its
/// write half. Returns the backend address and a handle to shut it down.
pub async fn start_tagged_backend(tag: &'static str) -> (SocketAddr, oneshot::Sender<()>) {
    let (tx, rx) = oneshot::channel::<()>();

    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .expect("failed to bind test backend");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let mut shutdown = std::pin::pin!(async {
            let _ = rx.await;
        });

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (mut stream, _) = result.expect("accept failed");
                    tokio::spawn(async move {
                        let (mut reader, mut writer) = stream.split();
                        if writer.write_all(format!("{tag}:").as_bytes()).await.is_err() {
                            return;
                        }
                        let _ = tokio::io::copy(&mut reader, &mut writer).await;
                        let _ = writer.shutdown().await;
                    });
                }
                () = &mut shutdown => break,
            }
        }
    });

    (addr, tx)
}

/// Connects to `proxy`, sends `payload`, closes the write half, and returns
/// everything received until the proxy closes the connection.
pub async fn round_trip(proxy: SocketAddr, payload: &str) -> String {
    let mut stream = TcpStream::connect(proxy)
        .await
        .expect("failed to connect to proxy");
    stream
        .write_all(payload.as_bytes())
        .await
        .expect("failed to write payload");
    stream.shutdown().await.expect("failed to close write half");

    let mut received = Vec::new();
    let _ = stream.read_to_end(&mut received).await;
    String::from_utf8(received).expect("backend replies are utf-8")
}
