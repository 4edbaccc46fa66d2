//! Multi-room chat over WebSockets
//!
//! Each room gets its own hub, created on the first connection.
//!
//! ```text
//! GET  /ws/:room                      upgrade, then send chat envelopes
//! GET  /api/rooms                     room names
//! GET  /api/rooms/:room/stats         live connection count
//! POST /api/rooms/:room/broadcast     {"text": ".."} announced to the room
//! ```
//!
//! An envelope is `{"type":"message","user":"..","text":".."}`.

use http::StatusCode;
use lumen_core::middleware::{cors, CorsConfig};
use lumen_core::{
    handler, stream_handler, App, AppConfig, Context, MessageHandler, StreamConfig,
    StreamContext,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    user: String,
    #[serde(default)]
    text: String,
}

impl Envelope {
    fn new(kind: &str, user: &str, text: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            user: user.to_string(),
            text: text.into(),
        }
    }
}

#[derive(Deserialize)]
struct Announcement {
    text: String,
}

fn room_hub(room: &str) -> String {
    format!("room:{room}")
}

fn on_message() -> MessageHandler {
    stream_handler(|ctx: StreamContext| async move {
        let envelope = match ctx.bind::<Envelope>() {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::debug!(
                    conn_id = %ctx.connection_id(),
                    error = %e,
                    "Malformed chat message"
                );
                let reply = Envelope::new("error", "server", "expected {type, user, text}");
                if let Err(e) = ctx.json(&reply) {
                    tracing::warn!(error = %e, "Failed to send error reply");
                }
                return;
            }
        };

        let user = if envelope.user.is_empty() {
            ctx.connection_id().to_string()
        } else {
            envelope.user
        };

        let out = Envelope::new(&envelope.kind, &user, envelope.text);
        if let Err(e) = ctx.broadcast_json(&out) {
            tracing::warn!(error = %e, "Failed to broadcast chat message");
        }
    })
}

fn routes(app: &App) -> lumen_core::Result<()> {
    let hubs = app.hubs().clone();
    let messages = on_message();
    app.get("/ws/:room", handler(move |ctx: Context| {
        let hubs = hubs.clone();
        let messages = messages.clone();
        async move {
            let room = ctx.param("room").unwrap_or_default();
            if let Err(e) = hubs.upgrade(&ctx, &room_hub(&room), Some(messages)).await {
                tracing::warn!(room = %room, error = %e, "Join failed");
                ctx.text(e.status(), e.to_string());
            }
        }
    }), &[])?;

    let api = app.group("/api/rooms", &[]);

    let hubs = app.hubs().clone();
    api.get("/", handler(move |ctx: Context| {
        let hubs = hubs.clone();
        async move {
            let rooms: Vec<String> = hubs
                .hub_names()
                .into_iter()
                .filter_map(|name| name.strip_prefix("room:").map(str::to_string))
                .collect();
            if let Err(e) = ctx.json(StatusCode::OK, &rooms) {
                tracing::error!(error = %e, "Failed to encode rooms");
            }
        }
    }), &[])?;

    let hubs = app.hubs().clone();
    api.get("/:room/stats", handler(move |ctx: Context| {
        let hubs = hubs.clone();
        async move {
            let room = ctx.param("room").unwrap_or_default();
            let connections = hubs.get(&room_hub(&room)).map(|h| h.connection_count()).unwrap_or(0);
            let body = serde_json::json!({ "room": room, "connections": connections });
            if let Err(e) = ctx.json(StatusCode::OK, &body) {
                tracing::error!(error = %e, "Failed to encode stats");
            }
        }
    }), &[])?;

    let hubs = app.hubs().clone();
    api.post("/:room/broadcast", handler(move |ctx: Context| {
        let hubs = hubs.clone();
        async move {
            let room = ctx.param("room").unwrap_or_default();
            let Some(hub) = hubs.get(&room_hub(&room)) else {
                ctx.text(StatusCode::NOT_FOUND, "room not found");
                return;
            };
            let announcement: Announcement = match ctx.bind() {
                Ok(a) => a,
                Err(e) => {
                    ctx.text(StatusCode::BAD_REQUEST, e.to_string());
                    return;
                }
            };

            let envelope = Envelope::new("announcement", "server", announcement.text);
            match serde_json::to_string(&envelope) {
                Ok(json) => {
                    hub.broadcast(json);
                    ctx.status(StatusCode::ACCEPTED);
                }
                Err(e) => ctx.text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            }
        }
    }), &[])?;

    Ok(())
}

#[tokio::main]
async fn main() -> lumen_core::Result<()> {
    lumen_core::logging::init("chat=info,lumen_core=info");

    let addr: SocketAddr = std::env::var("CHAT_ADDR")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8081)));

    let config = AppConfig::new().addr(addr).websocket(StreamConfig::new().send_buffer(64));
    let app = App::with_config(config)?;
    app.use_middleware(cors(CorsConfig::new()));
    routes(&app)?;

    app.listen(lumen_core::shutdown_signal()).await
}
