//! Application and stream configuration
//!
//! Both structs carry working defaults and builder-style setters:
//!
//! ```
//! use lumen_core::{AppConfig, StreamConfig};
//! use std::time::Duration;
//!
//! let config = AppConfig::new()
//!     .request_timeout(Duration::from_secs(5))
//!     .websocket(StreamConfig::new().ping_interval(Duration::from_secs(10)));
//! assert!(config.validate().is_ok());
//! ```

use crate::{Error, Result};
use http::HeaderMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Decides whether an upgrade request's origin is acceptable
pub type OriginCheck = Arc<dyn Fn(&HeaderMap) -> bool + Send + Sync>;

/// Dispatcher configuration
#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Listen address used by `App::listen`
    pub addr: SocketAddr,
    /// Deadline applied to ordinary (non-upgrade) requests
    pub request_timeout: Duration,
    /// Maximum accepted request body
    pub max_body_size: usize,
    /// How long shutdown waits for in-flight work
    pub shutdown_grace: Duration,
    /// WebSocket settings
    pub websocket: StreamConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            request_timeout: Duration::from_secs(30),
            max_body_size: 1024 * 1024, // 1MB
            shutdown_grace: Duration::from_secs(5),
            websocket: StreamConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn max_body_size(mut self, bytes: usize) -> Self {
        self.max_body_size = bytes;
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn websocket(mut self, config: StreamConfig) -> Self {
        self.websocket = config;
        self
    }

    /// Reject settings the server cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.request_timeout.is_zero() {
            return Err(Error::Config("request_timeout must be non-zero".into()));
        }
        if self.max_body_size == 0 {
            return Err(Error::Config("max_body_size must be non-zero".into()));
        }
        self.websocket.validate()
    }
}

/// WebSocket hub and connection configuration
#[derive(Clone)]
pub struct StreamConfig {
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
    /// Time allowed between the 101 response and the upgraded stream
    pub handshake_timeout: Duration,
    /// Origin predicate; accepts everything by default
    pub check_origin: OriginCheck,
    /// Recorded for callers; permessage-deflate is not negotiated
    pub enable_compression: bool,
    /// Interval between outbound pings
    pub ping_interval: Duration,
    /// Connection closes when no pong arrives within this window
    pub pong_timeout: Duration,
    /// Bound on waiting for the hub to accept a new connection
    pub register_timeout: Duration,
    /// Outbound queue capacity per connection
    pub send_buffer: usize,
    /// Bound on a single frame write
    pub write_timeout: Duration,
    /// Largest inbound message accepted
    pub max_message_size: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: 1024,
            write_buffer_size: 1024,
            handshake_timeout: Duration::from_secs(10),
            check_origin: Arc::new(|_| true),
            enable_compression: true,
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(60),
            register_timeout: Duration::from_secs(30),
            send_buffer: 256,
            write_timeout: Duration::from_secs(10),
            max_message_size: 32 << 20,
        }
    }
}

impl fmt::Debug for StreamConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamConfig")
            .field("read_buffer_size", &self.read_buffer_size)
            .field("write_buffer_size", &self.write_buffer_size)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("enable_compression", &self.enable_compression)
            .field("ping_interval", &self.ping_interval)
            .field("pong_timeout", &self.pong_timeout)
            .field("register_timeout", &self.register_timeout)
            .field("send_buffer", &self.send_buffer)
            .field("write_timeout", &self.write_timeout)
            .field("max_message_size", &self.max_message_size)
            .finish_non_exhaustive()
    }
}

impl StreamConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read_buffer_size(mut self, bytes: usize) -> Self {
        self.read_buffer_size = bytes;
        self
    }

    pub fn write_buffer_size(mut self, bytes: usize) -> Self {
        self.write_buffer_size = bytes;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Install an origin predicate
    pub fn check_origin<F>(mut self, check: F) -> Self
    where
        F: Fn(&HeaderMap) -> bool + Send + Sync + 'static,
    {
        self.check_origin = Arc::new(check);
        self
    }

    /// Accept only the listed `Origin` values (requests without one pass)
    pub fn allow_origins<I, S>(self, origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let allowed: Vec<String> = origins.into_iter().map(Into::into).collect();
        self.check_origin(move |headers| match headers.get(http::header::ORIGIN) {
            None => true,
            Some(origin) => origin
                .to_str()
                .map(|o| allowed.iter().any(|a| a == o))
                .unwrap_or(false),
        })
    }

    pub fn enable_compression(mut self, enabled: bool) -> Self {
        self.enable_compression = enabled;
        self
    }

    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn pong_timeout(mut self, timeout: Duration) -> Self {
        self.pong_timeout = timeout;
        self
    }

    pub fn register_timeout(mut self, timeout: Duration) -> Self {
        self.register_timeout = timeout;
        self
    }

    pub fn send_buffer(mut self, capacity: usize) -> Self {
        self.send_buffer = capacity;
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = bytes;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let durations = [
            ("handshake_timeout", self.handshake_timeout),
            ("ping_interval", self.ping_interval),
            ("pong_timeout", self.pong_timeout),
            ("register_timeout", self.register_timeout),
            ("write_timeout", self.write_timeout),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, d)| d.is_zero()) {
            return Err(Error::Config(format!("{name} must be non-zero")));
        }
        if self.send_buffer == 0 {
            return Err(Error::Config("send_buffer must be non-zero".into()));
        }
        if self.ping_interval >= self.pong_timeout {
            return Err(Error::Config(
                "ping_interval must be shorter than pong_timeout".into(),
            ));
        }
        Ok(())
    }
}
