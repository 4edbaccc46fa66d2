//! Per-topic connection registry
//!
//! Each hub runs one coordinating task that exclusively owns the map of
//! live connections. Registration, removal and delivery all arrive as
//! channel messages, so the map never needs a lock and deliveries reach a
//! given connection in the order they were issued.

use super::connection::{Connection, Enqueue};
use super::message::Message;
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Hub lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubState {
    Running,
    /// Terminal
    ShuttingDown,
}

struct Register {
    conn: Arc<Connection>,
    ack: oneshot::Sender<()>,
}

enum Delivery {
    All(Message),
    To {
        id: String,
        message: Message,
        ack: oneshot::Sender<bool>,
    },
}

#[derive(Debug, Default)]
struct Shared {
    count: AtomicUsize,
    shutting_down: AtomicBool,
}

/// Broadcast domain for one topic
pub struct Hub {
    name: Arc<str>,
    register_tx: mpsc::Sender<Register>,
    unregister_tx: mpsc::UnboundedSender<String>,
    delivery_tx: mpsc::Sender<Delivery>,
    query_tx: mpsc::Sender<oneshot::Sender<Vec<String>>>,
    shared: Arc<Shared>,
    token: CancellationToken,
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("name", &self.name)
            .field("connections", &self.connection_count())
            .field("state", &self.state())
            .finish()
    }
}

impl Hub {
    /// Create a hub and spawn its coordinating loop
    ///
    /// `capacity` bounds the pending broadcast queue. Must be called from
    /// within a tokio runtime.
    pub fn start(name: &str, parent: &CancellationToken, capacity: usize) -> Arc<Self> {
        let (hub, hub_loop) = Self::new(name, parent, capacity);
        tokio::spawn(hub_loop.run());
        hub
    }

    fn new(name: &str, parent: &CancellationToken, capacity: usize) -> (Arc<Self>, HubLoop) {
        let capacity = capacity.max(1);
        let (register_tx, register_rx) = mpsc::channel(capacity);
        let (unregister_tx, unregister_rx) = mpsc::unbounded_channel();
        let (delivery_tx, delivery_rx) = mpsc::channel(capacity);
        let (query_tx, query_rx) = mpsc::channel(16);

        let name: Arc<str> = Arc::from(name);
        let shared = Arc::new(Shared::default());
        let token = parent.child_token();

        let hub_loop = HubLoop {
            name: name.clone(),
            connections: HashMap::new(),
            register_rx,
            unregister_rx,
            delivery_rx,
            query_rx,
            shared: shared.clone(),
            token: token.clone(),
        };

        let hub = Arc::new(Self {
            name,
            register_tx,
            unregister_tx,
            delivery_tx,
            query_tx,
            shared,
            token,
        });
        (hub, hub_loop)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn state(&self) -> HubState {
        if self.shared.shutting_down.load(Ordering::SeqCst) {
            HubState::ShuttingDown
        } else {
            HubState::Running
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == HubState::Running
    }

    /// Live connections as last recorded by the loop
    pub fn connection_count(&self) -> usize {
        self.shared.count.load(Ordering::SeqCst)
    }

    /// Ids of live connections, sorted
    pub async fn connection_ids(&self) -> Vec<String> {
        let (tx, rx) = oneshot::channel();
        if self.query_tx.send(tx).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Hand a connection to the loop and wait until it is in the map
    pub async fn register(&self, conn: Arc<Connection>, timeout: Duration) -> Result<()> {
        let (ack, acked) = oneshot::channel();
        let submit = async {
            self.register_tx
                .send(Register { conn, ack })
                .await
                .map_err(|_| Error::HubClosed(self.name.to_string()))?;
            acked
                .await
                .map_err(|_| Error::HubClosed(self.name.to_string()))
        };

        tokio::time::timeout(timeout, submit)
            .await
            .map_err(|_| Error::RegisterTimeout {
                hub: self.name.to_string(),
                timeout,
            })?
    }

    /// Remove a connection; unknown ids are ignored
    pub fn unregister(&self, id: &str) {
        let _ = self.unregister_tx.send(id.to_string());
    }

    /// Queue a message for every connection without blocking
    ///
    /// When the hub is saturated the message is dropped.
    pub fn broadcast(&self, message: impl Into<Message>) {
        match self.delivery_tx.try_send(Delivery::All(message.into())) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(hub = %self.name, "Hub busy, broadcast dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(hub = %self.name, "Broadcast to stopped hub");
            }
        }
    }

    /// Queue a message for one connection, ordered with broadcasts
    ///
    /// Returns whether the message reached that connection's queue.
    pub async fn send_to(&self, id: &str, message: impl Into<Message>) -> bool {
        let (ack, acked) = oneshot::channel();
        let delivery = Delivery::To {
            id: id.to_string(),
            message: message.into(),
            ack,
        };
        if self.delivery_tx.send(delivery).await.is_err() {
            return false;
        }
        acked.await.unwrap_or(false)
    }

    /// Stop the loop; live connections are closed
    pub fn shutdown(&self) {
        self.token.cancel();
    }
}

struct HubLoop {
    name: Arc<str>,
    connections: HashMap<String, Arc<Connection>>,
    register_rx: mpsc::Receiver<Register>,
    unregister_rx: mpsc::UnboundedReceiver<String>,
    delivery_rx: mpsc::Receiver<Delivery>,
    query_rx: mpsc::Receiver<oneshot::Sender<Vec<String>>>,
    shared: Arc<Shared>,
    token: CancellationToken,
}

impl HubLoop {
    async fn run(mut self) {
        tracing::debug!(hub = %self.name, "Hub started");

        loop {
            tokio::select! {
                biased;

                _ = self.token.cancelled() => break,
                Some(id) = self.unregister_rx.recv() => self.remove(&id),
                Some(reg) = self.register_rx.recv() => self.insert(reg),
                Some(delivery) = self.delivery_rx.recv() => self.deliver(delivery),
                Some(reply) = self.query_rx.recv() => {
                    let mut ids: Vec<String> = self.connections.keys().cloned().collect();
                    ids.sort();
                    let _ = reply.send(ids);
                }
                else => break,
            }
        }

        self.shared.shutting_down.store(true, Ordering::SeqCst);
        for (_, conn) in self.connections.drain() {
            conn.close();
        }
        self.shared.count.store(0, Ordering::SeqCst);
        tracing::debug!(hub = %self.name, "Hub stopped");
    }

    fn sync_count(&self) {
        self.shared.count.store(self.connections.len(), Ordering::SeqCst);
    }

    fn insert(&mut self, reg: Register) {
        let Register { conn, ack } = reg;
        // Caller gave up (timeout) and closed it already
        if conn.is_closed() {
            return;
        }
        let id = conn.id().to_string();
        self.connections.insert(id.clone(), conn.clone());
        self.sync_count();

        // Caller timed out after queueing the request; nobody owns the connection
        if ack.send(()).is_err() {
            self.connections.remove(&id);
            self.sync_count();
            conn.close();
            tracing::debug!(hub = %self.name, conn_id = %id, "Registration abandoned");
            return;
        }
        tracing::debug!(hub = %self.name, conn_id = %id, "Connection registered");
    }

    fn remove(&mut self, id: &str) {
        if let Some(conn) = self.connections.remove(id) {
            conn.close_queue();
            self.sync_count();
            tracing::debug!(hub = %self.name, conn_id = %id, "Connection unregistered");
        }
    }

    fn drop_slow(&mut self, id: &str) {
        tracing::warn!(hub = %self.name, conn_id = %id, "Slow consumer dropped");
        self.remove(id);
    }

    fn deliver(&mut self, delivery: Delivery) {
        match delivery {
            Delivery::All(message) => {
                let stale: Vec<String> = self
                    .connections
                    .iter()
                    .filter(|(_, conn)| conn.try_enqueue(message.clone()) != Enqueue::Queued)
                    .map(|(id, _)| id.clone())
                    .collect();
                for id in stale {
                    self.drop_slow(&id);
                }
            }
            Delivery::To { id, message, ack } => {
                let outcome = self.connections.get(&id).map(|conn| conn.try_enqueue(message));
                let delivered = match outcome {
                    Some(Enqueue::Queued) => true,
                    Some(_) => {
                        self.drop_slow(&id);
                        false
                    }
                    None => false,
                };
                let _ = ack.send(delivered);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connect(
        hub: &Arc<Hub>,
        capacity: usize,
    ) -> (Arc<Connection>, mpsc::Receiver<Message>) {
        let (conn, rx) = Connection::new(Arc::from(hub.name()), hub.token(), capacity, None);
        hub.register(conn.clone(), Duration::from_secs(1)).await.unwrap();
        (conn, rx)
    }

    #[tokio::test]
    async fn test_broadcast_fan_out() {
        let hub = Hub::start("general", &CancellationToken::new(), 16);
        let mut receivers = Vec::new();
        for _ in 0..3 {
            receivers.push(connect(&hub, 8).await);
        }
        assert_eq!(hub.connection_count(), 3);

        hub.broadcast("P");
        hub.broadcast("Q");
        // Queries are served after pending deliveries
        assert_eq!(hub.connection_ids().await.len(), 3);

        for (_, rx) in receivers.iter_mut() {
            assert_eq!(rx.try_recv().unwrap(), Message::text("P"));
            assert_eq!(rx.try_recv().unwrap(), Message::text("Q"));
            assert!(rx.try_recv().is_err());
        }
    }

    #[tokio::test]
    async fn test_slow_consumer_dropped() {
        let hub = Hub::start("general", &CancellationToken::new(), 16);
        let (slow, _slow_rx) = connect(&hub, 1).await;
        let (_fast, mut fast_rx) = connect(&hub, 8).await;

        hub.broadcast("fills slow queue");
        hub.broadcast("overflows slow queue");
        let ids = hub.connection_ids().await;

        assert_eq!(ids.len(), 1);
        assert!(!ids.contains(&slow.id().to_string()));
        assert!(slow.is_closed());
        assert_eq!(hub.connection_count(), 1);

        assert_eq!(fast_rx.recv().await, Some(Message::text("fills slow queue")));
        assert_eq!(fast_rx.recv().await, Some(Message::text("overflows slow queue")));
    }

    #[tokio::test]
    async fn test_send_to() {
        let hub = Hub::start("direct", &CancellationToken::new(), 16);
        let (a, mut a_rx) = connect(&hub, 8).await;
        let (_b, mut b_rx) = connect(&hub, 8).await;

        assert!(hub.send_to(a.id(), "just you").await);
        assert!(!hub.send_to("conn_missing", "nobody").await);

        assert_eq!(a_rx.try_recv().unwrap(), Message::text("just you"));
        assert!(b_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unregister_idempotent() {
        let hub = Hub::start("general", &CancellationToken::new(), 16);
        let (conn, _rx) = connect(&hub, 8).await;

        hub.unregister(conn.id());
        hub.unregister(conn.id());
        hub.unregister("conn_unknown");

        assert!(hub.connection_ids().await.is_empty());
        assert_eq!(hub.connection_count(), 0);
        assert!(conn.is_closed());
        assert!(hub.is_running());
    }

    #[tokio::test]
    async fn test_shutdown_closes_connections() {
        let parent = CancellationToken::new();
        let hub = Hub::start("general", &parent, 16);
        let (conn, _rx) = connect(&hub, 8).await;

        parent.cancel();
        conn.token().cancelled().await;

        // Loop exit is asynchronous
        while hub.is_running() {
            tokio::task::yield_now().await;
        }
        assert_eq!(hub.state(), HubState::ShuttingDown);
        assert!(conn.is_closed());
        assert_eq!(hub.connection_count(), 0);

        let (late, _late_rx) =
            Connection::new(Arc::from("general"), &CancellationToken::new(), 8, None);
        let err = hub.register(late, Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, Error::HubClosed(_)));
        assert!(hub.connection_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_closed_connection_not_registered() {
        let hub = Hub::start("general", &CancellationToken::new(), 16);
        let (conn, _rx) = Connection::new(Arc::from("general"), hub.token(), 8, None);
        conn.close();

        let result = hub.register(conn, Duration::from_millis(50)).await;
        assert!(result.is_err());
        assert_eq!(hub.connection_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_timeout_then_abandoned() {
        // Loop held back so the registration cannot be acknowledged in time
        let (hub, hub_loop) = Hub::new("stalled", &CancellationToken::new(), 4);
        let (conn, _rx) = Connection::new(Arc::from(hub.name()), hub.token(), 8, None);

        let err = hub
            .register(conn.clone(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::RegisterTimeout { hub: ref name, timeout }
                if name == "stalled" && timeout == Duration::from_millis(50)
        ));
        assert!(!conn.is_closed());

        // The queued request is processed late; its ack has no receiver
        tokio::spawn(hub_loop.run());
        tokio::time::timeout(Duration::from_secs(1), conn.token().cancelled())
            .await
            .unwrap();
        assert!(conn.is_closed());
        assert!(hub.connection_ids().await.is_empty());
        assert_eq!(hub.connection_count(), 0);
        assert!(hub.is_running());
    }
}
