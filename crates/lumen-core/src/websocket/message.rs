//! WebSocket data messages and handshake helpers

use bytes::Bytes;
use http::header::{CONNECTION, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_VERSION, UPGRADE};
use http::HeaderMap;
use tokio_tungstenite::tungstenite;

/// Data frame kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Binary,
}

/// Opaque payload tagged text or binary
///
/// Text messages always hold valid UTF-8.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    kind: MessageKind,
    data: Bytes,
}

impl Message {
    pub fn text(data: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Text,
            data: Bytes::from(data.into()),
        }
    }

    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self {
            kind: MessageKind::Binary,
            data: data.into(),
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn into_data(self) -> Bytes {
        self.data
    }

    pub fn is_text(&self) -> bool {
        self.kind == MessageKind::Text
    }

    pub fn is_binary(&self) -> bool {
        self.kind == MessageKind::Binary
    }

    /// Payload as UTF-8, if valid
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }

    /// Convert from a transport frame; control frames yield `None`
    pub(crate) fn from_frame(frame: tungstenite::Message) -> Option<Self> {
        match frame {
            tungstenite::Message::Text(text) => Some(Self {
                kind: MessageKind::Text,
                data: Bytes::from(text),
            }),
            tungstenite::Message::Binary(data) => Some(Self::binary(data)),
            _ => None,
        }
    }

    /// Convert to a transport frame
    pub(crate) fn into_frame(self) -> tungstenite::Message {
        match self.kind {
            MessageKind::Text => tungstenite::Utf8Bytes::try_from(self.data.clone())
                .map(tungstenite::Message::Text)
                .unwrap_or(tungstenite::Message::Binary(self.data)),
            MessageKind::Binary => tungstenite::Message::Binary(self.data),
        }
    }
}

impl From<String> for Message {
    fn from(s: String) -> Self {
        Message::text(s)
    }
}

impl From<&str> for Message {
    fn from(s: &str) -> Self {
        Message::text(s)
    }
}

impl From<Vec<u8>> for Message {
    fn from(v: Vec<u8>) -> Self {
        Message::binary(v)
    }
}

impl From<Bytes> for Message {
    fn from(b: Bytes) -> Self {
        Message::binary(b)
    }
}

fn header_contains(headers: &HeaderMap, name: http::header::HeaderName, token: &str) -> bool {
    headers.get_all(name).iter().any(|v| {
        v.to_str()
            .map(|s| s.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
            .unwrap_or(false)
    })
}

/// Check if headers ask for a WebSocket upgrade
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    header_contains(headers, UPGRADE, "websocket")
        && header_contains(headers, CONNECTION, "upgrade")
        && headers.contains_key(SEC_WEBSOCKET_KEY)
}

/// Validate the handshake headers and derive `Sec-WebSocket-Accept`
pub(crate) fn accept_key(headers: &HeaderMap) -> crate::Result<String> {
    if !is_upgrade_request(headers) {
        return Err(crate::Error::NotUpgrade);
    }

    let version = headers
        .get(SEC_WEBSOCKET_VERSION)
        .and_then(|v| v.to_str().ok());
    if version != Some("13") {
        return Err(crate::Error::Handshake(format!(
            "unsupported websocket version: {}",
            version.unwrap_or("none")
        )));
    }

    let key = headers
        .get(SEC_WEBSOCKET_KEY)
        .ok_or_else(|| crate::Error::Handshake("missing Sec-WebSocket-Key".into()))?;

    Ok(tungstenite::handshake::derive_accept_key(key.as_bytes()))
}
