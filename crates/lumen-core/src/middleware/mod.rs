//! Handler chain and middleware
//!
//! A [`Handler`] consumes a [`Context`] and writes its response into it. A
//! [`Middleware`] turns one handler into another, so cross-cutting behavior
//! is layered by composition:
//!
//! ```
//! use lumen_core::middleware::{compose, from_fn, handler};
//! use lumen_core::Context;
//! use http::StatusCode;
//!
//! let auth = from_fn(|ctx: Context, next| async move {
//!     if ctx.header("authorization").is_none() {
//!         ctx.text(StatusCode::UNAUTHORIZED, "unauthorized");
//!         return;
//!     }
//!     next(ctx).await;
//! });
//!
//! let h = handler(|ctx: Context| async move {
//!     ctx.text(StatusCode::OK, "secret");
//! });
//!
//! let _chain = compose(h, &[auth]);
//! ```

pub mod cors;
pub mod logger;
pub mod recovery;
pub mod request_id;
pub mod timeout;

pub use cors::{cors, CorsConfig, Origins};
pub use logger::logger;
pub use recovery::recovery;
pub use request_id::request_id;
pub use timeout::deadline;

use crate::Context;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Boxed unit future returned by handlers
pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Request handler
pub type Handler = Arc<dyn Fn(Context) -> BoxFuture + Send + Sync>;

/// Handler-to-handler transformer
pub type Middleware = Arc<dyn Fn(Handler) -> Handler + Send + Sync>;

/// Wrap an async closure as a [`Handler`]
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// Build a [`Middleware`] from a closure receiving the context and the next handler
///
/// Skipping `next` short-circuits the rest of the chain.
pub fn from_fn<F, Fut>(f: F) -> Middleware
where
    F: Fn(Context, Handler) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let f = Arc::new(f);
    Arc::new(move |next: Handler| {
        let f = f.clone();
        Arc::new(move |ctx: Context| -> BoxFuture { Box::pin(f(ctx, next.clone())) }) as Handler
    })
}

/// Apply middlewares so the first one ends up outermost
pub fn compose(handler: Handler, middlewares: &[Middleware]) -> Handler {
    middlewares
        .iter()
        .rev()
        .fold(handler, |next, middleware| middleware(next))
}
