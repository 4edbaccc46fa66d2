//! Per-message context handed to stream handlers

use super::connection::Connection;
use super::hub::Hub;
use super::message::Message;
use crate::middleware::BoxFuture;
use crate::{Context, Result};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;

/// Handler invoked once per inbound data message
pub type MessageHandler = Arc<dyn Fn(StreamContext) -> BoxFuture + Send + Sync>;

/// Wrap an async closure as a [`MessageHandler`]
pub fn stream_handler<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(StreamContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// One inbound message plus handles to reply or fan out
#[derive(Clone, Debug)]
pub struct StreamContext {
    request: Context,
    conn: Arc<Connection>,
    hub: Arc<Hub>,
    message: Message,
}

impl StreamContext {
    pub(crate) fn new(
        request: Context,
        conn: Arc<Connection>,
        hub: Arc<Hub>,
        message: Message,
    ) -> Self {
        Self {
            request,
            conn,
            hub,
            message,
        }
    }

    /// Context of the upgrade request; params and store carry over
    pub fn request(&self) -> &Context {
        &self.request
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub fn connection_id(&self) -> &str {
        self.conn.id()
    }

    pub fn hub_name(&self) -> &str {
        self.hub.name()
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn data(&self) -> &Bytes {
        self.message.data()
    }

    pub fn is_text(&self) -> bool {
        self.message.is_text()
    }

    pub fn is_binary(&self) -> bool {
        self.message.is_binary()
    }

    /// Decode the message payload as JSON
    pub fn bind<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(self.message.data())?)
    }

    /// Reply on this connection
    pub fn send(&self, message: impl Into<Message>) {
        self.conn.send(message);
    }

    pub fn send_text(&self, text: impl Into<String>) {
        self.conn.send(Message::text(text));
    }

    /// Reply on this connection with a JSON text message
    pub fn json<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        self.conn.send(Message::text(serde_json::to_string(value)?));
        Ok(())
    }

    /// Deliver to every connection in the hub, this one included
    pub fn broadcast(&self, message: impl Into<Message>) {
        self.hub.broadcast(message);
    }

    pub fn broadcast_text(&self, text: impl Into<String>) {
        self.hub.broadcast(Message::text(text));
    }

    pub fn broadcast_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        self.hub.broadcast(Message::text(serde_json::to_string(value)?));
        Ok(())
    }

    /// Deliver to one connection of this hub
    pub async fn send_to(&self, id: &str, message: impl Into<Message>) -> bool {
        self.hub.send_to(id, message).await
    }
}
