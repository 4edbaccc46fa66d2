//! Named hub registry and the upgrade entry point

use super::connection::{self, Connection, PumpTiming};
use super::context::MessageHandler;
use super::hub::Hub;
use super::message::{accept_key, Message};
use crate::{Context, Error, Result, StreamConfig};
use http::header::{CONNECTION, ORIGIN, SEC_WEBSOCKET_ACCEPT, UPGRADE};
use http::StatusCode;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::{Role, WebSocketConfig};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

/// Owns every hub of one app
pub struct HubManager {
    config: StreamConfig,
    hubs: RwLock<HashMap<String, Arc<Hub>>>,
    token: CancellationToken,
}

impl std::fmt::Debug for HubManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubManager")
            .field("hubs", &self.hub_names())
            .finish_non_exhaustive()
    }
}

impl HubManager {
    /// Hubs are cancelled with `parent`
    pub fn new(config: StreamConfig, parent: &CancellationToken) -> Self {
        Self {
            config,
            hubs: RwLock::new(HashMap::new()),
            token: parent.child_token(),
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Existing running hub, or a freshly started one
    pub fn get_or_create(&self, name: &str) -> Arc<Hub> {
        if let Some(hub) = self.hubs.read().get(name).filter(|h| h.is_running()) {
            return hub.clone();
        }

        let mut hubs = self.hubs.write();
        if let Some(hub) = hubs.get(name).filter(|h| h.is_running()) {
            return hub.clone();
        }

        let hub = Hub::start(name, &self.token, self.config.send_buffer);
        hubs.insert(name.to_string(), hub.clone());
        tracing::info!(hub = %name, "Hub created");
        hub
    }

    pub fn get(&self, name: &str) -> Option<Arc<Hub>> {
        self.hubs.read().get(name).cloned()
    }

    /// Stop a hub and forget it
    pub fn remove(&self, name: &str) -> bool {
        match self.hubs.write().remove(name) {
            Some(hub) => {
                hub.shutdown();
                tracing::info!(hub = %name, "Hub removed");
                true
            }
            None => false,
        }
    }

    /// Hub names, sorted
    pub fn hub_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.hubs.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn total_connections(&self) -> usize {
        self.hubs.read().values().map(|h| h.connection_count()).sum()
    }

    /// Stop every hub
    pub fn shutdown(&self) {
        self.token.cancel();
        self.hubs.write().clear();
    }

    /// Upgrade the request and attach the connection to `hub_name`
    ///
    /// Validation and hub registration happen before anything is written,
    /// so failures still reach the client as a normal error response. On
    /// success the context holds the `101` response and the session runs on
    /// its own task once the transport hands over the stream.
    pub async fn upgrade(
        &self,
        ctx: &Context,
        hub_name: &str,
        handler: Option<MessageHandler>,
    ) -> Result<()> {
        let accept = accept_key(ctx.headers())?;

        if !(self.config.check_origin)(ctx.headers()) {
            let origin = ctx.header(ORIGIN.as_str()).unwrap_or_default().to_string();
            return Err(Error::OriginRejected(origin));
        }

        let on_upgrade = ctx.take_upgrade().ok_or(Error::UpgradeUnavailable)?;

        let hub = self.get_or_create(hub_name);
        let (conn, outbound) = Connection::new(
            Arc::from(hub.name()),
            hub.token(),
            self.config.send_buffer,
            ctx.remote_addr(),
        );

        if let Err(e) = hub.register(conn.clone(), self.config.register_timeout).await {
            conn.close();
            return Err(e);
        }

        ctx.reset_response();
        ctx.status(StatusCode::SWITCHING_PROTOCOLS);
        ctx.set_header(UPGRADE.as_str(), "websocket")?;
        ctx.set_header(CONNECTION.as_str(), "Upgrade")?;
        ctx.set_header(SEC_WEBSOCKET_ACCEPT.as_str(), &accept)?;

        tracing::info!(hub = %hub.name(), conn_id = %conn.id(), "WebSocket connected");

        let session = Session {
            on_upgrade,
            conn,
            outbound,
            hub,
            handler,
            request: ctx.clone(),
            config: self.config.clone(),
        };
        tokio::spawn(session.run());
        Ok(())
    }
}

struct Session {
    on_upgrade: OnUpgrade,
    conn: Arc<Connection>,
    outbound: mpsc::Receiver<Message>,
    hub: Arc<Hub>,
    handler: Option<MessageHandler>,
    request: Context,
    config: StreamConfig,
}

impl Session {
    async fn run(self) {
        let Session {
            on_upgrade,
            conn,
            outbound,
            hub,
            handler,
            request,
            config,
        } = self;

        let upgraded = match tokio::time::timeout(config.handshake_timeout, on_upgrade).await {
            Ok(Ok(upgraded)) => upgraded,
            Ok(Err(e)) => {
                tracing::warn!(conn_id = %conn.id(), error = %e, "Upgrade failed");
                hub.unregister(conn.id());
                conn.close();
                request.cancel();
                return;
            }
            Err(_) => {
                tracing::warn!(conn_id = %conn.id(), "Upgrade handshake timed out");
                hub.unregister(conn.id());
                conn.close();
                request.cancel();
                return;
            }
        };

        let ws_config = WebSocketConfig::default()
            .read_buffer_size(config.read_buffer_size)
            .write_buffer_size(config.write_buffer_size)
            .max_message_size(Some(config.max_message_size));

        let io = TokioIo::new(upgraded);
        let stream = WebSocketStream::from_raw_socket(io, Role::Server, Some(ws_config)).await;

        let timing = PumpTiming::from(&config);
        connection::serve(stream, conn, outbound, hub, handler, request, timing).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;

    fn manager() -> HubManager {
        HubManager::new(StreamConfig::default(), &CancellationToken::new())
    }

    fn upgrade_request() -> http::request::Builder {
        http::Request::get("/ws")
            .header("upgrade", "websocket")
            .header("connection", "Upgrade")
            .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
            .header("sec-websocket-version", "13")
    }

    #[tokio::test]
    async fn test_get_or_create_reuses() {
        let m = manager();
        let a = m.get_or_create("general");
        let b = m.get_or_create("general");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(m.hub_names(), vec!["general"]);
        assert!(m.get("other").is_none());
    }

    #[tokio::test]
    async fn test_remove_stops_hub() {
        let m = manager();
        let hub = m.get_or_create("general");
        assert!(m.remove("general"));
        assert!(!m.remove("general"));
        assert!(m.get("general").is_none());

        hub.token().cancelled().await;
        let fresh = m.get_or_create("general");
        assert!(!Arc::ptr_eq(&hub, &fresh));
    }

    #[tokio::test]
    async fn test_upgrade_rejects_plain_request() {
        let m = manager();
        let ctx = Context::new(http::Request::get("/ws").body(Bytes::new()).unwrap());
        let err = m.upgrade(&ctx, "general", None).await.unwrap_err();
        assert!(matches!(err, Error::NotUpgrade));
        assert!(m.hub_names().is_empty());
    }

    #[tokio::test]
    async fn test_upgrade_rejects_origin() {
        let config = StreamConfig::default().allow_origins(["http://good.example"]);
        let m = HubManager::new(config, &CancellationToken::new());
        let req = upgrade_request()
            .header("origin", "http://evil.example")
            .body(Bytes::new())
            .unwrap();
        let err = m.upgrade(&Context::new(req), "general", None).await.unwrap_err();
        assert!(matches!(err, Error::OriginRejected(o) if o == "http://evil.example"));
    }

    #[tokio::test]
    async fn test_upgrade_without_transport() {
        let m = manager();
        let ctx = Context::new(upgrade_request().body(Bytes::new()).unwrap());
        let err = m.upgrade(&ctx, "general", None).await.unwrap_err();
        assert!(matches!(err, Error::UpgradeUnavailable));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_shutdown_cascades() {
        let parent = CancellationToken::new();
        let m = HubManager::new(StreamConfig::default(), &parent);
        let hub = m.get_or_create("general");
        parent.cancel();
        tokio::time::timeout(Duration::from_secs(1), hub.token().cancelled())
            .await
            .unwrap();
        assert_eq!(m.total_connections(), 0);
    }

    #[tokio::test]
    async fn test_failed_handover_cancels_request() {
        let m = manager();
        let mut req = upgrade_request().body(Bytes::new()).unwrap();
        // No transport behind this request, so the handle resolves to an error
        let on_upgrade = hyper::upgrade::on(&mut req);
        req.extensions_mut().insert(on_upgrade);
        let ctx = Context::new(req);

        m.upgrade(&ctx, "general", None).await.unwrap();
        assert_eq!(ctx.get_status(), StatusCode::SWITCHING_PROTOCOLS);

        tokio::time::timeout(Duration::from_secs(1), ctx.done())
            .await
            .unwrap();
        assert!(ctx.is_cancelled());

        let hub = m.get("general").unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            while hub.connection_count() != 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }
}
