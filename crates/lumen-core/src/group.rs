//! Route groups
//!
//! A group is a registration-time builder: a path prefix plus the
//! middlewares every route below it inherits. Nesting concatenates both.
//!
//! ```
//! use lumen_core::{App, Context};
//! use lumen_core::middleware::handler;
//! use http::StatusCode;
//!
//! let app = App::new();
//! let users = app.group("/api", &[]).group("/v1", &[]).group("/users", &[]);
//! users
//!     .get("/:id", handler(|ctx: Context| async move { ctx.text(StatusCode::OK, "user") }), &[])
//!     .unwrap();
//!
//! assert_eq!(app.routes()[0].1, "/api/v1/users/:id");
//! ```

use crate::middleware::{Handler, Middleware};
use crate::websocket::MessageHandler;
use crate::{App, Result};
use http::Method;
use smallvec::SmallVec;

/// Prefix and inherited middlewares for a set of routes
#[derive(Clone)]
pub struct Group {
    app: App,
    prefix: String,
    middlewares: SmallVec<[Middleware; 4]>,
}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group")
            .field("prefix", &self.prefix)
            .field("middlewares", &self.middlewares.len())
            .finish()
    }
}

impl Group {
    pub(crate) fn new(app: App, prefix: String, middlewares: Vec<Middleware>) -> Self {
        Self {
            app,
            prefix,
            middlewares: middlewares.into_iter().collect(),
        }
    }

    /// Raw (unnormalized) prefix
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Child group; the parent is left untouched
    pub fn group(&self, prefix: &str, middlewares: &[Middleware]) -> Group {
        let mut inherited = self.middlewares.clone();
        inherited.extend(middlewares.iter().cloned());
        Group {
            app: self.app.clone(),
            prefix: format!("{}{}", self.prefix, prefix),
            middlewares: inherited,
        }
    }

    /// Append a middleware for routes registered after this call
    pub fn use_middleware(&mut self, middleware: Middleware) -> &mut Self {
        self.middlewares.push(middleware);
        self
    }

    fn chain(&self, middlewares: &[Middleware]) -> Vec<Middleware> {
        self.middlewares
            .iter()
            .chain(middlewares.iter())
            .cloned()
            .collect()
    }

    pub fn handle(
        &self,
        method: &str,
        pattern: &str,
        handler: Handler,
        middlewares: &[Middleware],
    ) -> Result<()> {
        let chain = self.chain(middlewares);
        self.app.add_route(method, &self.prefix, pattern, handler, &chain)
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

    /// WebSocket endpoint under this group's prefix and middlewares
    pub fn websocket(
        &self,
        path: &str,
        hub: &str,
        handler: impl Into<Option<MessageHandler>>,
        middlewares: &[Middleware],
    ) -> Result<()> {
        self.app
            .add_websocket(&self.prefix, path, hub, handler.into(), &self.chain(middlewares))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::{from_fn, handler};
    use crate::Context;
    use bytes::Bytes;
    use http::StatusCode;

    fn ok() -> Handler {
        handler(|ctx: Context| async move { ctx.text(StatusCode::OK, "ok") })
    }

    fn tag(name: &'static str) -> Middleware {
        from_fn(move |ctx: Context, next| async move {
            let seen = ctx.get_string("tags").unwrap_or_default();
            ctx.set("tags", format!("{seen}{name}"));
            next(ctx).await;
        })
    }

    #[test]
    fn test_prefix_composition() {
        let app = App::new();
        let users = app.group("/api/", &[]).group("//v1", &[]).group("/users/", &[]);
        users.get("/", ok(), &[]).unwrap();
        users.post("/:id/", ok(), &[]).unwrap();

        assert_eq!(
            app.routes(),
            vec![
                ("GET".to_string(), "/api/v1/users".to_string()),
                ("POST".to_string(), "/api/v1/users/:id".to_string()),
            ]
        );
    }

    #[test]
    fn test_child_does_not_mutate_parent() {
        let app = App::new();
        let parent = app.group("/p", &[tag("a")]);
        let child = parent.group("/c", &[tag("b")]);

        assert_eq!(parent.middlewares.len(), 1);
        assert_eq!(child.middlewares.len(), 2);
        assert_eq!(parent.prefix(), "/p");
        assert_eq!(child.prefix(), "/p/c");
    }

    #[test]
    fn test_invalid_pattern_in_group() {
        let app = App::new();
        let g = app.group("/api", &[]);
        assert!(g.get("/:bad-name", ok(), &[]).is_err());
        assert!(app.routes().is_empty());
    }

    #[tokio::test]
    async fn test_inherited_middleware_order() {
        let app = App::new();
        let mut outer = app.group("/o", &[tag("a")]);
        outer.use_middleware(tag("b"));
        let inner = outer.group("/i", &[tag("c")]);

        inner
            .get("/x", handler(|ctx: Context| async move {
                let tags = ctx.get_string("tags").unwrap_or_default();
                ctx.text(StatusCode::OK, tags);
            }), &[tag("d")])
            .unwrap();

        let req = http::Request::get("/o/i/x").body(Bytes::new()).unwrap();
        let res = app.dispatch(req, None).await;
        assert_eq!(res.body().as_ref(), b"abcd");
    }
}
