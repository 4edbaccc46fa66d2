//! One upgraded WebSocket stream
//!
//! A connection owns a bounded outbound queue and a cancellation token that
//! is a child of its hub's token, so hub shutdown also ends the connection.
//! Two pumps drive the socket:
//!
//! - the read pump runs on the session task, refreshes the liveness deadline
//!   on every pong and dispatches each data message to the handler on its own
//!   task;
//! - the write pump drains the queue, sends pings on an interval and closes
//!   the socket when the queue is closed or the token is cancelled.

use super::context::{MessageHandler, StreamContext};
use super::hub::Hub;
use super::message::Message;
use crate::middleware::recovery::panic_message;
use crate::Context;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{FutureExt, SinkExt, StreamExt};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message as Frame;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

/// Outcome of a non-blocking enqueue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Enqueue {
    Queued,
    Full,
    Closed,
}

/// A live WebSocket connection registered with a hub
#[derive(Debug)]
pub struct Connection {
    id: String,
    hub: Arc<str>,
    remote_addr: Option<SocketAddr>,
    /// `None` once the queue is closed; never reopened
    outbound: Mutex<Option<mpsc::Sender<Message>>>,
    token: CancellationToken,
}

impl Connection {
    /// New connection and the receiving end of its outbound queue
    pub(crate) fn new(
        hub: Arc<str>,
        hub_token: &CancellationToken,
        capacity: usize,
        remote_addr: Option<SocketAddr>,
    ) -> (Arc<Self>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let conn = Arc::new(Self {
            id: format!("conn_{}", uuid::Uuid::new_v4().simple()),
            hub,
            remote_addr,
            outbound: Mutex::new(Some(tx)),
            token: hub_token.child_token(),
        });
        (conn, rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn hub_name(&self) -> &str {
        &self.hub
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Whether the outbound queue has been closed
    pub fn is_closed(&self) -> bool {
        self.outbound.lock().is_none()
    }

    /// Lifecycle token; cancelled on close or hub shutdown
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Queue a message without blocking
    ///
    /// Closed connections ignore the call. A full queue means the peer is
    /// not keeping up, so the connection closes its own queue.
    pub fn send(&self, message: impl Into<Message>) {
        if self.try_enqueue(message.into()) == Enqueue::Full {
            tracing::warn!(
                hub = %self.hub,
                conn_id = %self.id,
                "Send buffer full, closing connection"
            );
            self.close_queue();
        }
    }

    pub(crate) fn try_enqueue(&self, message: Message) -> Enqueue {
        let outbound = self.outbound.lock();
        let Some(tx) = outbound.as_ref() else {
            return Enqueue::Closed;
        };
        match tx.try_send(message) {
            Ok(()) => Enqueue::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => Enqueue::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => Enqueue::Closed,
        }
    }

    /// Close the outbound queue; returns false if it was already closed
    ///
    /// The write pump flushes what is queued, then closes the socket.
    pub(crate) fn close_queue(&self) -> bool {
        self.outbound.lock().take().is_some()
    }

    /// Close the connection. Safe to call any number of times.
    pub fn close(&self) {
        self.token.cancel();
        self.close_queue();
    }
}

/// Drive both pumps until the socket closes
///
/// The connection is unregistered from its hub and closed on return, and the
/// upgrade request's scope is cancelled so anything waiting on it stops.
pub(crate) async fn serve<S>(
    stream: WebSocketStream<S>,
    conn: Arc<Connection>,
    outbound: mpsc::Receiver<Message>,
    hub: Arc<Hub>,
    handler: Option<MessageHandler>,
    request: Context,
    timing: PumpTiming,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, source) = stream.split();

    let writer = tokio::spawn(write_pump(conn.clone(), sink, outbound, timing));

    read_pump(&conn, &hub, source, handler, &request, timing.pong_timeout).await;

    hub.unregister(conn.id());
    conn.close();
    request.cancel();

    if let Err(e) = writer.await {
        tracing::error!(conn_id = %conn.id(), error = %e, "Write pump failed");
    }
    tracing::info!(hub = %hub.name(), conn_id = %conn.id(), "WebSocket disconnected");
}

/// Timers used by the pumps
#[derive(Debug, Clone, Copy)]
pub(crate) struct PumpTiming {
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub write_timeout: Duration,
}

impl From<&crate::StreamConfig> for PumpTiming {
    fn from(config: &crate::StreamConfig) -> Self {
        Self {
            ping_interval: config.ping_interval,
            pong_timeout: config.pong_timeout,
            write_timeout: config.write_timeout,
        }
    }
}

async fn read_pump<S>(
    conn: &Arc<Connection>,
    hub: &Arc<Hub>,
    mut source: SplitStream<WebSocketStream<S>>,
    handler: Option<MessageHandler>,
    request: &Context,
    pong_timeout: Duration,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut deadline = Instant::now() + pong_timeout;

    loop {
        let frame = tokio::select! {
            _ = conn.token.cancelled() => break,
            _ = tokio::time::sleep_until(deadline) => {
                tracing::info!(conn_id = %conn.id, "Pong timeout");
                break;
            }
            frame = source.next() => frame,
        };

        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                tracing::debug!(conn_id = %conn.id, error = %e, "Read error");
                break;
            }
            None => break,
        };

        match frame {
            Frame::Pong(_) => deadline = Instant::now() + pong_timeout,
            Frame::Close(_) => break,
            frame => {
                let Some(message) = Message::from_frame(frame) else {
                    continue;
                };
                if let Some(handler) = &handler {
                    let ctx =
                        StreamContext::new(request.clone(), conn.clone(), hub.clone(), message);
                    dispatch(handler, ctx);
                }
            }
        }
    }
}

/// Run the handler for one message on its own task
fn dispatch(handler: &MessageHandler, ctx: StreamContext) {
    let handler = handler.clone();
    tokio::spawn(async move {
        let conn_id = ctx.connection_id().to_string();
        if let Err(payload) = AssertUnwindSafe(handler(ctx)).catch_unwind().await {
            tracing::error!(
                conn_id = %conn_id,
                panic = %panic_message(payload.as_ref()),
                "Message handler panicked"
            );
        }
    });
}

async fn write_pump<S>(
    conn: Arc<Connection>,
    mut sink: SplitSink<WebSocketStream<S>, Frame>,
    mut outbound: mpsc::Receiver<Message>,
    timing: PumpTiming,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let start = Instant::now() + timing.ping_interval;
    let mut ping = tokio::time::interval_at(start, timing.ping_interval);

    loop {
        let frame = tokio::select! {
            _ = conn.token.cancelled() => break,
            message = outbound.recv() => match message {
                Some(message) => message.into_frame(),
                // Queue closed by the hub or a full send
                None => break,
            },
            _ = ping.tick() => Frame::Ping(Bytes::new()),
        };

        match tokio::time::timeout(timing.write_timeout, sink.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(conn_id = %conn.id, error = %e, "Write error");
                break;
            }
            Err(_) => {
                tracing::debug!(conn_id = %conn.id, "Write timeout");
                break;
            }
        }
    }

    // Sends the close frame and flushes
    let _ = tokio::time::timeout(timing.write_timeout, sink.close()).await;
    conn.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::context::stream_handler;
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::Role;

    fn timing() -> PumpTiming {
        PumpTiming {
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
        }
    }

    async fn pair() -> (WebSocketStream<DuplexStream>, WebSocketStream<DuplexStream>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let server = WebSocketStream::from_raw_socket(a, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(b, Role::Client, None).await;
        (server, client)
    }

    fn request() -> Context {
        Context::new(http::Request::get("/ws").body(Bytes::new()).unwrap())
    }

    async fn registered(
        hub: &Arc<Hub>,
        capacity: usize,
    ) -> (Arc<Connection>, mpsc::Receiver<Message>) {
        let (conn, rx) = Connection::new(Arc::from(hub.name()), hub.token(), capacity, None);
        hub.register(conn.clone(), Duration::from_secs(1)).await.unwrap();
        (conn, rx)
    }

    #[tokio::test]
    async fn test_id_format() {
        let token = CancellationToken::new();
        let (a, _rx) = Connection::new(Arc::from("h"), &token, 4, None);
        let (b, _rx2) = Connection::new(Arc::from("h"), &token, 4, None);
        assert!(a.id().starts_with("conn_"));
        assert_ne!(a.id(), b.id());
        assert_eq!(a.hub_name(), "h");
    }

    #[tokio::test]
    async fn test_send_full_closes_queue() {
        let token = CancellationToken::new();
        let (conn, mut rx) = Connection::new(Arc::from("h"), &token, 1, None);

        conn.send("one");
        assert!(!conn.is_closed());
        conn.send("two");
        assert!(conn.is_closed());

        // Closed connections ignore sends
        conn.send("three");
        assert_eq!(rx.recv().await, Some(Message::text("one")));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_close_idempotent() {
        let token = CancellationToken::new();
        let (conn, _rx) = Connection::new(Arc::from("h"), &token, 4, None);

        conn.close();
        conn.close();
        assert!(conn.is_closed());
        assert!(conn.token().is_cancelled());
        assert_eq!(conn.try_enqueue(Message::text("late")), Enqueue::Closed);
    }

    #[tokio::test]
    async fn test_hub_token_cascades() {
        let token = CancellationToken::new();
        let (conn, _rx) = Connection::new(Arc::from("h"), &token, 4, None);
        token.cancel();
        assert!(conn.token().is_cancelled());
    }

    #[tokio::test]
    async fn test_echo_session() {
        let hub = Hub::start("echo", &CancellationToken::new(), 16);
        let (conn, rx) = registered(&hub, 8).await;
        let (server, mut client) = pair().await;

        let echo = stream_handler(|ctx: StreamContext| async move {
            let reply = format!("echo: {}", ctx.message().as_str().unwrap_or_default());
            ctx.send_text(reply);
        });
        let session = tokio::spawn(serve(
            server,
            conn.clone(),
            rx,
            hub.clone(),
            Some(echo),
            request(),
            timing(),
        ));

        client.send(Frame::text("hello")).await.unwrap();
        let reply = client.next().await.unwrap().unwrap();
        assert_eq!(reply, Frame::text("echo: hello"));

        client.close(None).await.unwrap();
        session.await.unwrap();

        assert!(conn.is_closed());
        assert_eq!(hub.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_handler_panic_isolated() {
        let hub = Hub::start("panics", &CancellationToken::new(), 16);
        let (conn, rx) = registered(&hub, 8).await;
        let (server, mut client) = pair().await;

        let handler = stream_handler(|ctx: StreamContext| async move {
            if ctx.message().as_str() == Some("boom") {
                panic!("bad message");
            }
            ctx.send_text("ok");
        });
        let session = tokio::spawn(serve(
            server,
            conn,
            rx,
            hub.clone(),
            Some(handler),
            request(),
            timing(),
        ));

        client.send(Frame::text("boom")).await.unwrap();
        client.send(Frame::text("fine")).await.unwrap();
        assert_eq!(client.next().await.unwrap().unwrap(), Frame::text("ok"));

        client.close(None).await.unwrap();
        session.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_sends_single_close_frame() {
        let hub = Hub::start("closing", &CancellationToken::new(), 16);
        let (conn, rx) = registered(&hub, 8).await;
        let (server, mut client) = pair().await;
        let session = tokio::spawn(serve(
            server,
            conn.clone(),
            rx,
            hub.clone(),
            None,
            request(),
            timing(),
        ));

        conn.close();
        conn.close();

        let mut close_frames = 0;
        while let Some(Ok(frame)) = client.next().await {
            if frame.is_close() {
                close_frames += 1;
            }
        }
        assert_eq!(close_frames, 1);

        session.await.unwrap();
        assert_eq!(hub.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_queued_messages_flushed_before_close() {
        let hub = Hub::start("flush", &CancellationToken::new(), 16);
        let (conn, rx) = registered(&hub, 8).await;
        let (server, mut client) = pair().await;

        conn.send("first");
        conn.send(vec![1u8, 2]);
        conn.close_queue();

        let session = tokio::spawn(serve(server, conn, rx, hub, None, request(), timing()));

        assert_eq!(client.next().await.unwrap().unwrap(), Frame::text("first"));
        assert_eq!(
            client.next().await.unwrap().unwrap(),
            Frame::Binary(Bytes::from_static(&[1, 2]))
        );
        assert!(client.next().await.unwrap().unwrap().is_close());
        session.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_pong_timeout_closes() {
        let hub = Hub::start("idle", &CancellationToken::new(), 16);
        let (conn, rx) = registered(&hub, 8).await;
        let (server, client) = pair().await;

        let fast = PumpTiming {
            ping_interval: Duration::from_millis(100),
            pong_timeout: Duration::from_millis(300),
            write_timeout: Duration::from_millis(100),
        };
        // The client never reads, so no pong is ever produced
        let session = tokio::spawn(serve(server, conn.clone(), rx, hub, None, request(), fast));

        session.await.unwrap();
        assert!(conn.token().is_cancelled());
        drop(client);
    }

    #[tokio::test]
    async fn test_peer_close_cancels_request_scope() {
        let hub = Hub::start("scoped", &CancellationToken::new(), 16);
        let (conn, rx) = registered(&hub, 8).await;
        let (server, mut client) = pair().await;

        let upgrade = request();
        let session = tokio::spawn(serve(
            server,
            conn.clone(),
            rx,
            hub,
            None,
            upgrade.clone(),
            timing(),
        ));
        assert!(!upgrade.is_cancelled());

        client.close(None).await.unwrap();
        session.await.unwrap();

        assert!(conn.token().is_cancelled());
        assert!(upgrade.is_cancelled());
        tokio::time::timeout(Duration::from_secs(1), upgrade.done())
            .await
            .unwrap();
    }
}
