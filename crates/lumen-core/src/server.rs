//! Native HTTP server
//!
//! Serves an [`App`] with hyper:
//! - Multi-threaded tokio runtime
//! - HTTP/1.1 with upgrade support for WebSocket routes
//! - SO_REUSEADDR / SO_REUSEPORT and TCP_NODELAY on the listener
//! - Graceful shutdown with a bounded grace period

use crate::{App, Error, Result};
use bytes::Bytes;
use http::StatusCode;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use socket2::{Domain, Protocol, Socket, Type};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Bind a nonblocking listener with SO_REUSEADDR, SO_REUSEPORT (unix) and TCP_NODELAY
pub fn bind_listener(addr: SocketAddr) -> std::io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nodelay(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    Ok(socket.into())
}

/// Convert a dispatcher response to a hyper response
pub fn to_hyper_response(res: http::Response<Bytes>) -> hyper::Response<Full<Bytes>> {
    res.map(Full::new)
}

fn plain(status: StatusCode, body: &'static str) -> hyper::Response<Full<Bytes>> {
    let mut res = hyper::Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *res.status_mut() = status;
    res
}

// ============================================================================
// Draining
// ============================================================================

/// Counts live HTTP connections so shutdown can wait for them
#[derive(Debug, Default)]
pub struct ConnectionTracker {
    live: AtomicUsize,
    draining: AtomicBool,
    idle: Notify,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a connection until the guard drops
    pub fn track(self: &Arc<Self>) -> ConnectionGuard {
        self.live.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            tracker: self.clone(),
        }
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn begin_drain(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Resolves once no connection is live
    pub async fn drained(&self) {
        loop {
            let idle = self.idle.notified();
            if self.live() == 0 {
                return;
            }
            idle.await;
        }
    }
}

/// Releases one tracked connection on drop
#[derive(Debug)]
pub struct ConnectionGuard {
    tracker: Arc<ConnectionTracker>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.tracker.live.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.tracker.idle.notify_waiters();
        }
    }
}

// ============================================================================
// Serving
// ============================================================================

/// Resolves on Ctrl-C
pub async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install Ctrl-C handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

impl App {
    /// Bind `config.addr` and serve until `signal` resolves
    pub async fn listen<F>(&self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let listener = TcpListener::from_std(bind_listener(self.inner.config.addr)?)?;
        self.serve(listener, signal).await
    }

    /// Serve connections from `listener` until `signal` resolves
    ///
    /// After the signal, new connections are refused, idle keep-alive
    /// connections are closed and in-flight requests and WebSocket sessions
    /// get `shutdown_grace` to finish. Whatever remains is then closed.
    ///
    /// An App serves once. Shutdown cancels every scope it handed out and
    /// stops its hubs, so calling this again returns [`Error::Stopped`].
    pub async fn serve<F>(&self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        if self.is_stopped() {
            return Err(Error::Stopped);
        }
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "Server listening");

        let stop = CancellationToken::new();
        let mut tasks = JoinSet::new();
        tokio::pin!(signal);

        loop {
            tokio::select! {
                biased;

                _ = &mut signal => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        tasks.spawn(self.clone().serve_connection(stream, remote, stop.clone()));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                },
                // Reap finished connection tasks
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        drop(listener);
        self.shutdown(stop, &mut tasks).await;
        Ok(())
    }

    /// Whether a previous `serve` has shut this App down
    pub fn is_stopped(&self) -> bool {
        self.inner.force.is_cancelled()
    }

    async fn shutdown(&self, stop: CancellationToken, tasks: &mut JoinSet<()>) {
        let tracker = &self.inner.tracker;
        let hubs = &self.inner.hubs;
        let grace = self.inner.config.shutdown_grace;

        tracker.begin_drain();
        stop.cancel();
        tracing::info!(
            connections = tracker.live(),
            websockets = hubs.total_connections(),
            "Shutting down"
        );

        let drained = tokio::time::timeout(grace, async {
            tracker.drained().await;
            // Upgraded streams leave the tracker once handed to their hub
            while hubs.total_connections() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                connections = tracker.live(),
                websockets = hubs.total_connections(),
                "Grace period elapsed, forcing close"
            );
        }

        self.inner.force.cancel();
        hubs.shutdown();
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
        tracing::info!("Server stopped");
    }

    async fn serve_connection(
        self,
        stream: TcpStream,
        remote: SocketAddr,
        stop: CancellationToken,
    ) {
        let _guard = self.inner.tracker.track();
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "Failed to set TCP_NODELAY");
        }

        let app = self.clone();
        let service = service_fn(move |req| {
            let app = app.clone();
            async move { Ok::<_, Infallible>(app.handle_hyper(req, remote).await) }
        });

        let conn = http1::Builder::new()
            .serve_connection(TokioIo::new(stream), service)
            .with_upgrades();
        tokio::pin!(conn);

        let result = tokio::select! {
            res = conn.as_mut() => res,
            _ = stop.cancelled() => {
                conn.as_mut().graceful_shutdown();
                conn.as_mut().await
            }
        };

        if let Err(e) = result {
            tracing::debug!(remote = %remote, error = %e, "Connection error");
        }
    }

    async fn handle_hyper(
        &self,
        req: hyper::Request<Incoming>,
        remote: SocketAddr,
    ) -> hyper::Response<Full<Bytes>> {
        let (parts, body) = req.into_parts();

        // Upgrade requests keep their extensions (the upgrade handle) and carry no body
        let body = if crate::websocket::is_upgrade_request(&parts.headers) {
            Bytes::new()
        } else {
            match self.read_body(body).await {
                Ok(bytes) => bytes,
                Err(Error::BodyTooLarge { limit }) => {
                    tracing::debug!(remote = %remote, limit, "Request body too large");
                    return plain(StatusCode::PAYLOAD_TOO_LARGE, "Payload Too Large");
                }
                Err(e) => {
                    tracing::debug!(remote = %remote, error = %e, "Failed to read body");
                    return plain(StatusCode::REQUEST_TIMEOUT, "Request Timeout");
                }
            }
        };

        let req = http::Request::from_parts(parts, body);
        let mut res = to_hyper_response(self.dispatch(req, Some(remote)).await);
        if self.inner.tracker.is_draining() && res.status() != StatusCode::SWITCHING_PROTOCOLS {
            res.headers_mut()
                .insert(http::header::CONNECTION, http::HeaderValue::from_static("close"));
        }
        res
    }

    async fn read_body(&self, body: Incoming) -> Result<Bytes> {
        let limit = self.inner.config.max_body_size;
        let timeout = self.inner.config.request_timeout;

        let collected = tokio::time::timeout(timeout, Limited::new(body, limit).collect())
            .await
            .map_err(|_| Error::Internal("body read timed out".into()))?;

        match collected {
            Ok(collected) => Ok(collected.to_bytes()),
            Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
                Err(Error::BodyTooLarge { limit })
            }
            Err(e) => Err(Error::Internal(e.to_string())),
        }
    }
}
