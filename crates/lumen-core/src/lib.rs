//! lumen-core: HTTP dispatcher with WebSocket hubs
//!
//! - Ordered route table with `:param` and trailing `*` segments
//! - Route groups with inherited middleware
//! - Decorator-style middleware (recovery, access log, deadline, CORS)
//! - Per-request context with params, deadline scope and a typed store
//! - Named WebSocket hubs with bounded queues and slow-consumer eviction
//!
//! ```no_run
//! use lumen_core::middleware::handler;
//! use lumen_core::{App, Context};
//! use http::StatusCode;
//!
//! #[tokio::main]
//! async fn main() -> lumen_core::Result<()> {
//!     let app = App::new();
//!     app.get("/hello/:name", handler(|ctx: Context| async move {
//!         let name = ctx.param("name").unwrap_or_default();
//!         ctx.text(StatusCode::OK, format!("hello {name}"));
//!     }), &[])?;
//!
//!     app.listen(lumen_core::shutdown_signal()).await
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod app;
pub mod config;
pub mod context;
pub mod error;
pub mod group;
pub mod logging;
pub mod middleware;
pub mod server;
pub mod websocket;

// Re-exports
pub use app::App;
pub use config::{AppConfig, OriginCheck, StreamConfig};
pub use context::{Context, Scope};
pub use error::{Error, Result};
pub use group::Group;

pub use middleware::{from_fn, handler, Handler, Middleware};

pub use server::{bind_listener, shutdown_signal, to_hyper_response, ConnectionTracker};

pub use websocket::{
    stream_handler, Connection, Hub, HubManager, HubState, Message, MessageHandler, MessageKind,
    StreamContext,
};

pub use lumen_router::{normalize, validate, PatternError};
