//! TCP forwarding loop, status reporting, and graceful shutdown.
//!
//! This is the caller side of the selector contract: for every accepted
//! connection it picks a backend, dials it, reports exactly one outcome per
//! pick, and pipes bytes in both directions while the backend's connection
//! count is held. It lives in the library rather than `main()` so it can be
//! driven from tests without signal handling or `std::process::exit`.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::upstream::{saturating_millis, Backend, ConnectionGuard};
use crate::{Result, Selector, SelectorError};

/// Accepts connections on `listener` and forwards each to a backend chosen
/// by `selector`.
///
/// Runs until `shutdown` resolves, then stops accepting new connections
/// and returns. Connections already being forwarded continue independently.
pub async fn serve(
    listener: TcpListener,
    selector: Selector,
    connect_timeout: Duration,
    shutdown: impl Future<Output = ()>,
) {
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, client_addr) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(%e, "failed to accept connection");
                        continue;
                    }
                };

                let selector = selector.clone();
                tokio::spawn(async move {
                    match handle_connection(stream, client_addr, &selector, connect_timeout).await {
                        Ok((sent, received)) => {
                            debug!(client = %client_addr, sent, received, "connection closed");
                        }
                        Err(SelectorError::NoBackendAvailable) => {
                            warn!(client = %client_addr, "no backend available, closing connection");
                        }
                        Err(e) => {
                            debug!(client = %client_addr, error = %e, "connection ended with error");
                        }
                    }
                });
            }
            () = &mut shutdown => {
                info!("shutting down, no longer accepting connections");
                break;
            }
        }
    }
}

/// Forwards one client connection, returning the bytes sent to and received
/// from the backend.
pub async fn handle_connection(
    mut inbound: TcpStream,
    client_addr: SocketAddr,
    selector: &Selector,
    connect_timeout: Duration,
) -> Result<(u64, u64)> {
    let client = client_addr.ip().to_string();
    let (guard, mut outbound) = connect_backend(selector, &client, connect_timeout).await?;

    debug!(
        client = %client_addr,
        backend = %guard.backend().addr(),
        "forwarding connection"
    );

    let transferred = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await?;
    Ok(transferred)
}

/// Picks and dials a backend for `client`, reporting each attempt's outcome.
///
/// A failed dial is reported and followed by a fresh pick. A pick that
/// lands on a backend already dialed in this call falls forward to the
/// next healthy backend not yet tried, so every backend is dialed at most
/// once. Returns [`SelectorError::NoBackendAvailable`] only if nothing was
/// eligible to dial, and [`SelectorError::Io`] once every dial has failed.
/// The returned guard keeps the backend's connection count raised until
/// dropped.
pub async fn connect_backend(
    selector: &Selector,
    client: &str,
    connect_timeout: Duration,
) -> Result<(ConnectionGuard, TcpStream)> {
    let mut tried: Vec<usize> = Vec::new();
    let mut last_error = None;

    while tried.len() < selector.registry().len() {
        let picked = match selector.pick(client) {
            Ok(backend) => backend,
            Err(e) if tried.is_empty() => return Err(e),
            Err(_) => break,
        };
        let backend = if tried.contains(&picked.index()) {
            match next_untried(selector, &picked, &tried) {
                Some(backend) => backend,
                None => break,
            }
        } else {
            picked
        };
        tried.push(backend.index());

        let guard = backend.acquire();
        let addr = backend.addr();

        match tokio::time::timeout(
            connect_timeout,
            TcpStream::connect((addr.host.as_str(), addr.port)),
        )
        .await
        {
            Ok(Ok(stream)) => {
                selector.mark_success(&backend);
                return Ok((guard, stream));
            }
            Ok(Err(e)) => {
                warn!(backend = %addr, error = %e, "backend connect failed");
                last_error = Some(format!("{addr}: {e}"));
                selector.mark_failure(&backend);
            }
            Err(_) => {
                warn!(
                    backend = %addr,
                    timeout_ms = saturating_millis(connect_timeout),
                    "backend connect timed out"
                );
                last_error = Some(format!("{addr}: connect timed out"));
                selector.mark_failure(&backend);
            }
        }
    }

    Err(match last_error {
        Some(last) => SelectorError::Io(format!(
            "all {} dial attempts failed, last: {last}",
            tried.len()
        )),
        None => SelectorError::NoBackendAvailable,
    })
}

/// Returns the first healthy backend after `from` in registry order that is
/// not in `tried`.
fn next_untried(selector: &Selector, from: &Backend, tried: &[usize]) -> Option<Backend> {
    let backends = selector.registry().all();
    let len = backends.len();
    (1..len)
        .map(|offset| &backends[(from.index() + offset) % len])
        .find(|b| !tried.contains(&b.index()) && b.is_healthy())
        .cloned()
}

/// Spawns a background task that periodically logs the pool state as JSON.
pub fn spawn_status_reporter(selector: Selector, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let snapshot = selector.registry().snapshot();
            let healthy = snapshot.iter().filter(|s| s.healthy).count();
            match serde_json::to_string(&snapshot) {
                Ok(pool) => info!(healthy, total = snapshot.len(), %pool, "backend pool status"),
                Err(e) => warn!(error = %e, "failed to serialize backend pool status"),
            }
        }
    })
}

/// Awaits a shutdown signal (SIGINT or SIGTERM on Unix, Ctrl+C on all
/// platforms). Returns once the first signal is received.
pub async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("received SIGINT, initiating graceful shutdown"),
                    _ = sigterm.recv() => info!("received SIGTERM, initiating graceful shutdown"),
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to register SIGTERM handler, listening for SIGINT only");
                let _ = ctrl_c.await;
                info!("received SIGINT, initiating graceful shutdown");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        info!("received Ctrl+C, initiating graceful shutdown");
    }
}
