//! Cross-origin resource sharing
//!
//! Answers preflight requests and adds CORS headers to cross-origin
//! responses. Requests without an `Origin` header are same-origin and pass
//! through untouched.

use super::{from_fn, Middleware};
use crate::Context;
use http::{Method, StatusCode};
use smallvec::SmallVec;
use std::sync::Arc;
use std::time::Duration;

/// Which origins may call the API
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Origins {
    Any,
    List(SmallVec<[String; 4]>),
}

impl Origins {
    fn permits(&self, origin: &str) -> bool {
        match self {
            Origins::Any => true,
            Origins::List(list) => list.iter().any(|o| o == origin),
        }
    }
}

/// Policy applied by [`cors`]
#[derive(Clone, Debug)]
pub struct CorsConfig {
    origins: Origins,
    methods: SmallVec<[Method; 8]>,
    allow_headers: SmallVec<[String; 4]>,
    expose_headers: SmallVec<[String; 4]>,
    credentials: bool,
    max_age: Duration,
}

impl Default for CorsConfig {
    /// Any origin, the common methods, `Content-Type` and `Authorization`
    fn default() -> Self {
        Self {
            origins: Origins::Any,
            methods: [
                Method::GET,
                Method::HEAD,
                Method::POST,
                Method::PUT,
                Method::PATCH,
                Method::DELETE,
                Method::OPTIONS,
            ]
            .into_iter()
            .collect(),
            allow_headers: ["Content-Type", "Authorization"]
                .into_iter()
                .map(String::from)
                .collect(),
            expose_headers: SmallVec::new(),
            credentials: false,
            max_age: Duration::from_secs(600),
        }
    }
}

impl CorsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to `origin`; repeat to allow several
    pub fn allow_origin(mut self, origin: impl Into<String>) -> Self {
        match &mut self.origins {
            Origins::List(list) => list.push(origin.into()),
            any => *any = Origins::List(smallvec::smallvec![origin.into()]),
        }
        self
    }

    pub fn allow_any_origin(mut self) -> Self {
        self.origins = Origins::Any;
        self
    }

    /// Replace the allowed method list
    pub fn methods<I>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = Method>,
    {
        self.methods = methods.into_iter().collect();
        self
    }

    pub fn allow_header(mut self, header: impl Into<String>) -> Self {
        self.allow_headers.push(header.into());
        self
    }

    pub fn expose_header(mut self, header: impl Into<String>) -> Self {
        self.expose_headers.push(header.into());
        self
    }

    /// Let browsers send cookies; the origin is echoed instead of `*`
    pub fn credentials(mut self, allow: bool) -> Self {
        self.credentials = allow;
        self
    }

    /// How long browsers may cache a preflight answer
    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn origins(&self) -> &Origins {
        &self.origins
    }

    fn allow_origin_value(&self, origin: &str) -> String {
        if self.origins == Origins::Any && !self.credentials {
            "*".to_string()
        } else {
            origin.to_string()
        }
    }

    fn apply(&self, ctx: &Context, origin: &str, preflight: bool) {
        let mut headers: Vec<(&str, String)> =
            vec![("access-control-allow-origin", self.allow_origin_value(origin))];
        if self.origins != Origins::Any || self.credentials {
            headers.push(("vary", "Origin".to_string()));
        }
        if self.credentials {
            headers.push(("access-control-allow-credentials", "true".to_string()));
        }
        if !self.expose_headers.is_empty() {
            headers.push(("access-control-expose-headers", self.expose_headers.join(", ")));
        }
        if preflight {
            let methods: Vec<&str> = self.methods.iter().map(Method::as_str).collect();
            headers.push(("access-control-allow-methods", methods.join(", ")));
            if !self.allow_headers.is_empty() {
                headers.push(("access-control-allow-headers", self.allow_headers.join(", ")));
            }
            headers.push(("access-control-max-age", self.max_age.as_secs().to_string()));
        }

        for (name, value) in headers {
            if let Err(e) = ctx.set_header(name, &value) {
                tracing::warn!(header = name, error = %e, "Skipping CORS header");
            }
        }
    }
}

/// CORS middleware
///
/// Disallowed origins get a 403. `OPTIONS` preflights are answered with 204
/// without reaching the handler.
pub fn cors(config: CorsConfig) -> Middleware {
    let config = Arc::new(config);
    from_fn(move |ctx: Context, next| {
        let config = config.clone();
        async move {
            let Some(origin) = ctx.header("origin").map(str::to_string) else {
                next(ctx).await;
                return;
            };

            if !config.origins.permits(&origin) {
                tracing::debug!(origin = %origin, "CORS origin rejected");
                ctx.text(StatusCode::FORBIDDEN, "CORS: origin not allowed");
                return;
            }

            let preflight = ctx.method() == Method::OPTIONS;
            config.apply(&ctx, &origin, preflight);

            if preflight {
                ctx.status(StatusCode::NO_CONTENT);
                return;
            }

            next(ctx).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::{compose, handler};
    use bytes::Bytes;

    fn run(config: CorsConfig, req: http::Request<Bytes>) -> Context {
        let h = handler(|ctx: Context| async move { ctx.text(StatusCode::OK, "body") });
        let chain = compose(h, &[cors(config)]);
        let ctx = Context::new(req);
        let _ = futures_util::FutureExt::now_or_never(chain(ctx.clone()));
        ctx
    }

    fn from(origin: &str, method: Method) -> http::Request<Bytes> {
        http::Request::builder()
            .method(method)
            .uri("/api/v1/todos")
            .header("origin", origin)
            .body(Bytes::new())
            .unwrap()
    }

    #[test]
    fn test_origin_list() {
        let config = CorsConfig::new();
        assert!(config.origins().permits("http://localhost:3000"));

        let config = config.allow_origin("https://a.example").allow_origin("https://b.example");
        assert!(config.origins().permits("https://b.example"));
        assert!(!config.origins().permits("https://c.example"));

        assert_eq!(config.allow_any_origin().origins(), &Origins::Any);
    }

    #[test]
    fn test_preflight_short_circuits() {
        let config = CorsConfig::new().methods([Method::GET, Method::POST]);
        let ctx = run(config, from("http://localhost:3000", Method::OPTIONS));

        assert_eq!(ctx.get_status(), StatusCode::NO_CONTENT);
        assert_eq!(ctx.response_header("access-control-allow-origin").as_deref(), Some("*"));
        assert_eq!(
            ctx.response_header("access-control-allow-methods").as_deref(),
            Some("GET, POST")
        );
        assert_eq!(ctx.response_header("access-control-max-age").as_deref(), Some("600"));
        assert!(ctx.take_response().body().is_empty());
    }

    #[test]
    fn test_simple_request_gets_headers() {
        let config = CorsConfig::new()
            .allow_origin("https://example.com")
            .credentials(true)
            .expose_header("X-Request-ID");
        let ctx = run(config, from("https://example.com", Method::GET));

        assert_eq!(ctx.get_status(), StatusCode::OK);
        assert_eq!(
            ctx.response_header("access-control-allow-origin").as_deref(),
            Some("https://example.com")
        );
        assert_eq!(
            ctx.response_header("access-control-allow-credentials").as_deref(),
            Some("true")
        );
        assert_eq!(ctx.response_header("vary").as_deref(), Some("Origin"));
        assert_eq!(
            ctx.response_header("access-control-expose-headers").as_deref(),
            Some("X-Request-ID")
        );
        // Preflight-only headers stay off simple responses
        assert!(ctx.response_header("access-control-allow-methods").is_none());
    }

    #[test]
    fn test_disallowed_origin() {
        let ctx = run(
            CorsConfig::new().allow_origin("https://example.com"),
            from("https://other.com", Method::GET),
        );
        assert_eq!(ctx.get_status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_same_origin_untouched() {
        let ctx = run(CorsConfig::new(), http::Request::get("/").body(Bytes::new()).unwrap());
        assert!(ctx.response_header("access-control-allow-origin").is_none());
    }
}
