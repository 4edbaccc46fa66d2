//! Dispatcher
//!
//! `App` owns the route table, the global middleware list and the hub
//! manager. Every request runs through the same onion:
//!
//! recovery -> access log -> deadline -> global middlewares -> route chain
//!
//! where the route chain is the group middlewares (outer groups first), then
//! the route's own middlewares, then the handler.

use crate::context::Scope;
use crate::group::Group;
use crate::middleware::{self, compose, Handler, Middleware};
use crate::server::ConnectionTracker;
use crate::websocket::{is_upgrade_request, Hub, HubManager, MessageHandler};
use crate::{AppConfig, Context, Error, Result};
use bytes::Bytes;
use http::{Method, StatusCode};
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub(crate) struct AppInner {
    pub(crate) config: AppConfig,
    routes: RwLock<lumen_router::Router<Handler>>,
    middlewares: RwLock<Vec<Middleware>>,
    pub(crate) hubs: Arc<HubManager>,
    pub(crate) tracker: Arc<ConnectionTracker>,
    /// Root of every request and hub scope; cancelled on forced shutdown
    pub(crate) force: CancellationToken,
}

/// HTTP dispatcher handle; clones share the same state
#[derive(Clone)]
pub struct App {
    pub(crate) inner: Arc<AppInner>,
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("config", &self.inner.config)
            .field("routes", &self.inner.routes.read().len())
            .finish_non_exhaustive()
    }
}

impl Default for App {
    fn default() -> Self {
        Self::build(AppConfig::default())
    }
}

impl App {
    pub fn new() -> Self {
        Self::default()
    }

    /// App with a validated configuration
    pub fn with_config(config: AppConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: AppConfig) -> Self {
        let force = CancellationToken::new();
        let hubs = Arc::new(HubManager::new(config.websocket.clone(), &force));
        Self {
            inner: Arc::new(AppInner {
                config,
                routes: RwLock::new(lumen_router::Router::new()),
                middlewares: RwLock::new(Vec::new()),
                hubs,
                tracker: Arc::new(ConnectionTracker::new()),
                force,
            }),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Append a global middleware; applies to every route, in order
    pub fn use_middleware(&self, middleware: Middleware) -> &Self {
        self.inner.middlewares.write().push(middleware);
        self
    }

    /// Register a handler for any method token
    pub fn handle(
        &self,
        method: &str,
        pattern: &str,
        handler: Handler,
        middlewares: &[Middleware],
    ) -> Result<()> {
        self.add_route(method, "", pattern, handler, middlewares)
    }

    pub fn get(
        &self,
        pattern: &str,
        handler: Handler,
        middlewares: &[Middleware],
    ) -> Result<()> {
        self.handle(Method::GET.as_str(), pattern, handler, middlewares)
    }

    pub fn post(
        &self,
        pattern: &str,
        handler: Handler,
        middlewares: &[Middleware],
    ) -> Result<()> {
        self.handle(Method::POST.as_str(), pattern, handler, middlewares)
    }

    pub fn put(
        &self,
        pattern: &str,
        handler: Handler,
        middlewares: &[Middleware],
    ) -> Result<()> {
        self.handle(Method::PUT.as_str(), pattern, handler, middlewares)
    }

    pub fn patch(
        &self,
        pattern: &str,
        handler: Handler,
        middlewares: &[Middleware],
    ) -> Result<()> {
        self.handle(Method::PATCH.as_str(), pattern, handler, middlewares)
    }

    pub fn delete(
        &self,
        pattern: &str,
        handler: Handler,
        middlewares: &[Middleware],
    ) -> Result<()> {
        self.handle(Method::DELETE.as_str(), pattern, handler, middlewares)
    }

    pub fn options(
        &self,
        pattern: &str,
        handler: Handler,
        middlewares: &[Middleware],
    ) -> Result<()> {
        self.handle(Method::OPTIONS.as_str(), pattern, handler, middlewares)
    }

    pub fn head(
        &self,
        pattern: &str,
        handler: Handler,
        middlewares: &[Middleware],
    ) -> Result<()> {
        self.handle(Method::HEAD.as_str(), pattern, handler, middlewares)
    }

    /// Start a route group under `prefix`
    pub fn group(&self, prefix: &str, middlewares: &[Middleware]) -> Group {
        Group::new(self.clone(), prefix.to_string(), middlewares.to_vec())
    }

    /// Register a WebSocket endpoint bound to `hub`
    ///
    /// The hub is started right away, so this must run inside a tokio
    /// runtime.
    pub fn websocket(
        &self,
        path: &str,
        hub: &str,
        handler: impl Into<Option<MessageHandler>>,
        middlewares: &[Middleware],
    ) -> Result<()> {
        self.add_websocket("", path, hub, handler.into(), middlewares)
    }

    pub(crate) fn add_websocket(
        &self,
        prefix: &str,
        path: &str,
        hub: &str,
        handler: Option<MessageHandler>,
        middlewares: &[Middleware],
    ) -> Result<()> {
        let manager = self.inner.hubs.clone();
        let hub_name: Arc<str> = Arc::from(hub);

        let upgrade = middleware::handler(move |ctx: Context| {
            let manager = manager.clone();
            let hub_name = hub_name.clone();
            let handler = handler.clone();
            async move {
                if let Err(e) = manager.upgrade(&ctx, &hub_name, handler).await {
                    tracing::warn!(hub = %hub_name, error = %e, "WebSocket upgrade failed");
                    ctx.reset_response();
                    ctx.text(e.status(), e.to_string());
                }
            }
        });

        self.add_route(Method::GET.as_str(), prefix, path, upgrade, middlewares)?;
        self.inner.hubs.get_or_create(hub);
        Ok(())
    }

    pub(crate) fn add_route(
        &self,
        method: &str,
        prefix: &str,
        pattern: &str,
        handler: Handler,
        middlewares: &[Middleware],
    ) -> Result<()> {
        let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
            .map_err(|_| Error::InvalidMethod(method.to_string()))?;

        let full = lumen_router::build(prefix, pattern).map_err(|e| {
            tracing::error!(method = %method, prefix, pattern, error = %e, "Route rejected");
            Error::from(e)
        })?;

        let chain = compose(handler, middlewares);
        self.inner.routes.write().insert(method.as_str(), &full, chain)?;
        tracing::debug!(method = %method, pattern = %full, "Route registered");
        Ok(())
    }

    /// Registered `(method, pattern)` pairs in match order
    pub fn routes(&self) -> Vec<(String, String)> {
        self.inner
            .routes
            .read()
            .routes()
            .iter()
            .map(|r| (r.method().to_string(), r.pattern().to_string()))
            .collect()
    }

    // ------------------------------------------------------------------
    // Hubs
    // ------------------------------------------------------------------

    /// Hub manager shared with the WebSocket routes
    pub fn hubs(&self) -> &Arc<HubManager> {
        &self.inner.hubs
    }

    /// Existing hub by name
    pub fn hub(&self, name: &str) -> Option<Arc<Hub>> {
        self.inner.hubs.get(name)
    }

    /// Start a hub ahead of any connection
    pub fn register_hub(&self, name: &str) -> Arc<Hub> {
        self.inner.hubs.get_or_create(name)
    }

    pub fn remove_hub(&self, name: &str) -> bool {
        self.inner.hubs.remove(name)
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Run one request through the full pipeline
    pub async fn dispatch(
        &self,
        req: http::Request<Bytes>,
        remote_addr: Option<SocketAddr>,
    ) -> http::Response<Bytes> {
        // Upgrades live as long as their stream; everything else gets the app deadline
        let scope = if is_upgrade_request(req.headers()) {
            Scope::new(self.inner.force.child_token(), None)
        } else {
            let deadline = Instant::now() + self.inner.config.request_timeout;
            Scope::new(self.inner.force.child_token(), Some(deadline))
        };

        let ctx = Context::with_scope(req, remote_addr, scope);

        let route = {
            let routes = self.inner.routes.read();
            routes
                .find(ctx.method().as_str(), ctx.path())
                .map(|m| (m.value.clone(), m.params))
        };

        let endpoint = match route {
            Some((chain, params)) => {
                ctx.set_params(params);
                chain
            }
            None => not_found(),
        };

        let mut stack = vec![middleware::recovery(), middleware::logger(), middleware::deadline()];
        stack.extend(self.inner.middlewares.read().iter().cloned());

        compose(endpoint, &stack)(ctx.clone()).await;
        ctx.take_response()
    }
}

fn not_found() -> Handler {
    middleware::handler(|ctx: Context| async move {
        ctx.text(StatusCode::NOT_FOUND, "404 page not found");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::{from_fn, handler};

    fn request(method: Method, uri: &str) -> http::Request<Bytes> {
        http::Request::builder()
            .method(method)
            .uri(uri)
            .body(Bytes::new())
            .unwrap()
    }

    fn echo_param(name: &'static str) -> Handler {
        handler(move |ctx: Context| async move {
            let value = ctx.param(name).unwrap_or_default();
            ctx.text(StatusCode::OK, value);
        })
    }

    #[tokio::test]
    async fn test_dispatch_params() {
        let app = App::new();
        app.get("/users/:id", echo_param("id"), &[]).unwrap();

        let res = app.dispatch(request(Method::GET, "/users/42"), None).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.body().as_ref(), b"42");

        let res = app.dispatch(request(Method::GET, "/users/42/extra"), None).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        assert_eq!(res.body().as_ref(), b"404 page not found");

        let res = app.dispatch(request(Method::POST, "/users/42"), None).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_query_not_part_of_path() {
        let app = App::new();
        app.get("/search", handler(|ctx: Context| async move {
            let q = ctx.query("q").unwrap_or_default();
            ctx.text(StatusCode::OK, q);
        }), &[]).unwrap();

        let res = app.dispatch(request(Method::GET, "/search/?q=rust"), None).await;
        assert_eq!(res.body().as_ref(), b"rust");
    }

    #[tokio::test]
    async fn test_wildcard_dispatch() {
        let app = App::new();
        app.get("/files/*", handler(|ctx: Context| async move {
            let rest = ctx.wildcard().unwrap_or_default();
            ctx.text(StatusCode::OK, rest);
        }), &[]).unwrap();

        let res = app.dispatch(request(Method::GET, "/files/a/b/c.txt"), None).await;
        assert_eq!(res.body().as_ref(), b"a/b/c.txt");

        let res = app.dispatch(request(Method::GET, "/files"), None).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert!(res.body().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_pattern_fails_loudly() {
        let app = App::new();
        let err = app.get("/files/*/meta", echo_param("x"), &[]).unwrap_err();
        assert!(matches!(err, Error::InvalidPattern(_)));

        let err = app.handle("BAD METHOD", "/x", echo_param("x"), &[]).unwrap_err();
        assert!(matches!(err, Error::InvalidMethod(_)));
        assert!(app.routes().is_empty());
    }

    #[tokio::test]
    async fn test_routes_listing() {
        let app = App::new();
        app.get("/a", echo_param("x"), &[]).unwrap();
        app.handle("purge", "//b/", echo_param("x"), &[]).unwrap();
        assert_eq!(
            app.routes(),
            vec![
                ("GET".to_string(), "/a".to_string()),
                ("PURGE".to_string(), "/b".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_global_middleware_wraps_not_found() {
        let app = App::new();
        app.use_middleware(from_fn(|ctx: Context, next| async move {
            ctx.set_header("x-global", "yes").ok();
            next(ctx).await;
        }));

        let res = app.dispatch(request(Method::GET, "/missing"), None).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        assert_eq!(res.headers()["x-global"], "yes");
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout() {
        let config = AppConfig::new().request_timeout(std::time::Duration::from_millis(50));
        let app = App::with_config(config).unwrap();
        app.get("/slow", handler(|_ctx: Context| async move {
            tokio::time::sleep(std::time::Duration::from_secs(10)).await;
        }), &[]).unwrap();

        let res = app.dispatch(request(Method::GET, "/slow"), None).await;
        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_upgrade_requests_get_no_deadline() {
        let app = App::new();
        app.get("/scoped", handler(|ctx: Context| async move {
            let has_deadline = ctx.deadline().is_some();
            ctx.text(StatusCode::OK, has_deadline.to_string());
        }), &[]).unwrap();

        let res = app.dispatch(request(Method::GET, "/scoped"), None).await;
        assert_eq!(res.body().as_ref(), b"true");

        let upgrade = http::Request::get("/scoped")
            .header("upgrade", "websocket")
            .header("connection", "upgrade")
            .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
            .body(Bytes::new())
            .unwrap();
        let res = app.dispatch(upgrade, None).await;
        assert_eq!(res.body().as_ref(), b"false");
    }

    #[tokio::test]
    async fn test_websocket_route_registers_hub() {
        let app = App::new();
        app.websocket("/ws", "general", None, &[]).unwrap();

        assert!(app.hub("general").is_some());
        assert_eq!(app.routes(), vec![("GET".to_string(), "/ws".to_string())]);

        // Plain GET is not an upgrade
        let res = app.dispatch(request(Method::GET, "/ws"), None).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        assert!(app.remove_hub("general"));
        assert!(app.hub("general").is_none());
    }

    #[tokio::test]
    async fn test_apps_are_independent() {
        let a = App::new();
        let b = App::new();
        a.get("/only-a", echo_param("x"), &[]).unwrap();
        a.register_hub("shared-name");

        assert!(b.routes().is_empty());
        assert!(b.hub("shared-name").is_none());
    }
}
