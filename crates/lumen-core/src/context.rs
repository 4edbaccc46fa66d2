//! Per-request context
//!
//! A `Context` is a cheap, clonable handle over one request's state: the
//! parsed request, route parameters, a cancellable deadline scope, a typed
//! key/value store and the buffered response. Middlewares and handlers all
//! receive clones of the same handle.

use crate::{Error, Result};
use bytes::{Bytes, BytesMut};
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use http::{Extensions, HeaderMap, Method, StatusCode, Uri};
use hyper::upgrade::OnUpgrade;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Cancellable execution scope with an optional deadline
#[derive(Clone, Debug, Default)]
pub struct Scope {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Scope {
    pub fn new(token: CancellationToken, deadline: Option<Instant>) -> Self {
        Self { token, deadline }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Cancelled explicitly or past the deadline
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Resolves once the scope is cancelled or its deadline elapses
    pub async fn done(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }

    /// Child scope that also ends after `timeout`, never later than this one
    pub fn with_timeout(&self, timeout: std::time::Duration) -> Scope {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(d) if d < candidate => d,
            _ => candidate,
        };
        Scope {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    /// Child scope cancelled with this one but cancellable on its own
    pub fn with_cancel(&self) -> Scope {
        Scope {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }
}

#[derive(Default)]
struct ResponseState {
    status: Option<StatusCode>,
    headers: HeaderMap,
    body: BytesMut,
    written: bool,
}

type StoreValue = Arc<dyn Any + Send + Sync>;

struct Inner {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
    remote_addr: Option<SocketAddr>,
    extensions: Mutex<Extensions>,
    params: RwLock<HashMap<String, String>>,
    response: Mutex<ResponseState>,
    store: RwLock<HashMap<String, StoreValue>>,
    scope: Scope,
}

/// Request context handle
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("method", &self.inner.method)
            .field("uri", &self.inner.uri)
            .field("status", &self.get_status())
            .finish_non_exhaustive()
    }
}

impl Context {
    /// Context with a fresh, deadline-free scope
    pub fn new(req: http::Request<Bytes>) -> Self {
        Self::with_scope(req, None, Scope::default())
    }

    pub fn with_scope(
        req: http::Request<Bytes>,
        remote_addr: Option<SocketAddr>,
        scope: Scope,
    ) -> Self {
        let (parts, body) = req.into_parts();
        Self {
            inner: Arc::new(Inner {
                method: parts.method,
                uri: parts.uri,
                headers: parts.headers,
                body,
                remote_addr,
                extensions: Mutex::new(parts.extensions),
                params: RwLock::new(HashMap::new()),
                response: Mutex::new(ResponseState::default()),
                store: RwLock::new(HashMap::new()),
                scope,
            }),
        }
    }

    // ------------------------------------------------------------------
    // Request
    // ------------------------------------------------------------------

    pub fn method(&self) -> &Method {
        &self.inner.method
    }

    pub fn uri(&self) -> &Uri {
        &self.inner.uri
    }

    pub fn path(&self) -> &str {
        self.inner.uri.path()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.inner.headers
    }

    /// Request header as a string (case-insensitive name)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.inner.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn body(&self) -> &Bytes {
        &self.inner.body
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.remote_addr
    }

    /// Decode the JSON body
    pub fn bind<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.inner.body)?)
    }

    /// Percent-decoded query parameter
    pub fn query(&self, name: &str) -> Option<String> {
        self.inner
            .uri
            .query()
            .and_then(|q| find_pair(q, name))
    }

    /// All query parameters (last value wins)
    pub fn query_params(&self) -> HashMap<String, String> {
        self.inner
            .uri
            .query()
            .map(parse_pairs)
            .unwrap_or_default()
    }

    /// Field from an `application/x-www-form-urlencoded` body
    pub fn form_value(&self, name: &str) -> Option<String> {
        let is_form = self
            .header(CONTENT_TYPE.as_str())
            .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"));
        if !is_form {
            return None;
        }
        std::str::from_utf8(&self.inner.body)
            .ok()
            .and_then(|body| find_pair(body, name))
    }

    /// Take the transport's upgrade handle, if any
    pub(crate) fn take_upgrade(&self) -> Option<OnUpgrade> {
        self.inner.extensions.lock().remove::<OnUpgrade>()
    }

    /// Request extension inserted by the transport or the caller
    pub fn extension<T: Clone + Send + Sync + 'static>(&self) -> Option<T> {
        self.inner.extensions.lock().get::<T>().cloned()
    }

    // ------------------------------------------------------------------
    // Route parameters
    // ------------------------------------------------------------------

    pub(crate) fn set_params(&self, params: Vec<(String, String)>) {
        let mut map = self.inner.params.write();
        map.clear();
        map.extend(params);
    }

    pub fn param(&self, name: &str) -> Option<String> {
        self.inner.params.read().get(name).cloned()
    }

    pub fn params(&self) -> HashMap<String, String> {
        self.inner.params.read().clone()
    }

    /// Remainder captured by a trailing `*`
    pub fn wildcard(&self) -> Option<String> {
        self.param(lumen_router::WILDCARD_KEY)
    }

    // ------------------------------------------------------------------
    // Scope
    // ------------------------------------------------------------------

    pub fn scope(&self) -> &Scope {
        &self.inner.scope
    }

    pub async fn done(&self) {
        self.inner.scope.done().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.scope.is_cancelled()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.scope.deadline()
    }

    pub fn cancel(&self) {
        self.inner.scope.cancel()
    }

    pub fn with_timeout(&self, timeout: std::time::Duration) -> Scope {
        self.inner.scope.with_timeout(timeout)
    }

    pub fn with_cancel(&self) -> Scope {
        self.inner.scope.with_cancel()
    }

    // ------------------------------------------------------------------
    // Store
    // ------------------------------------------------------------------

    pub fn set<T: Send + Sync + 'static>(&self, key: impl Into<String>, value: T) {
        self.inner.store.write().insert(key.into(), Arc::new(value));
    }

    /// Typed lookup; `None` when absent or of another type
    pub fn get<T: Clone + Send + Sync + 'static>(&self, key: &str) -> Option<T> {
        self.inner
            .store
            .read()
            .get(key)
            .and_then(|v| v.downcast_ref::<T>())
            .cloned()
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        let store = self.inner.store.read();
        let value = store.get(key)?;
        value
            .downcast_ref::<String>()
            .cloned()
            .or_else(|| value.downcast_ref::<&'static str>().map(|s| s.to_string()))
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        let store = self.inner.store.read();
        let value = store.get(key)?;
        value
            .downcast_ref::<i64>()
            .copied()
            .or_else(|| value.downcast_ref::<i32>().map(|v| i64::from(*v)))
            .or_else(|| value.downcast_ref::<u32>().map(|v| i64::from(*v)))
            .or_else(|| value.downcast_ref::<usize>().and_then(|v| i64::try_from(*v).ok()))
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get::<bool>(key)
    }

    /// Stored keys, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.store.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    // ------------------------------------------------------------------
    // Response
    // ------------------------------------------------------------------

    /// Set the response status; ignored once the body has been written
    pub fn status(&self, status: StatusCode) -> &Self {
        let mut res = self.inner.response.lock();
        if !res.written {
            res.status = Some(status);
        }
        self
    }

    pub fn get_status(&self) -> StatusCode {
        self.inner.response.lock().status.unwrap_or(StatusCode::OK)
    }

    pub fn set_header(&self, name: &str, value: &str) -> Result<()> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::Internal(format!("invalid header name {name:?}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| Error::Internal(format!("invalid header value {value:?}: {e}")))?;
        self.inner.response.lock().headers.insert(name, value);
        Ok(())
    }

    /// Response header currently set
    pub fn response_header(&self, name: &str) -> Option<String> {
        self.inner
            .response
            .lock()
            .headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    /// Append raw bytes to the response body
    pub fn write(&self, data: &[u8]) {
        let mut res = self.inner.response.lock();
        res.body.extend_from_slice(data);
        res.written = true;
    }

    /// Whether a status or body has been committed
    pub fn is_written(&self) -> bool {
        let res = self.inner.response.lock();
        res.written || res.status.is_some()
    }

    pub fn text(&self, status: StatusCode, body: impl AsRef<str>) {
        self.send(status, "text/plain; charset=utf-8", body.as_ref().as_bytes());
    }

    pub fn json<T: Serialize + ?Sized>(&self, status: StatusCode, value: &T) -> Result<()> {
        let body = serde_json::to_vec(value)?;
        self.send(status, "application/json", &body);
        Ok(())
    }

    fn send(&self, status: StatusCode, content_type: &'static str, body: &[u8]) {
        let mut res = self.inner.response.lock();
        if !res.written {
            res.status = Some(status);
        }
        res.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        res.body.extend_from_slice(body);
        res.written = true;
    }

    /// Discard anything buffered so far
    pub(crate) fn reset_response(&self) {
        *self.inner.response.lock() = ResponseState::default();
    }

    /// Drain the buffered response
    pub(crate) fn take_response(&self) -> http::Response<Bytes> {
        let mut res = self.inner.response.lock();
        let state = std::mem::take(&mut *res);
        drop(res);

        let mut out = http::Response::new(state.body.freeze());
        *out.status_mut() = state.status.unwrap_or(StatusCode::OK);
        *out.headers_mut() = state.headers;
        out
    }
}

fn parse_pairs(s: &str) -> HashMap<String, String> {
    s.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            (url_decode(k), url_decode(v))
        })
        .collect()
}

fn find_pair(s: &str, name: &str) -> Option<String> {
    s.split('&')
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            (url_decode(k) == name).then(|| url_decode(v))
        })
        .next()
}

/// Percent-decode, treating `+` as space; invalid escapes pass through
fn url_decode(s: &str) -> String {
    lumen_router::percent_decode(&s.replace('+', " ")).into_owned()
}
