//! Inbound payloads handed to application callbacks.

use bytes::Bytes;
use serde::de::DeserializeOwned;

/// Native frame type of a data message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Text,
    Binary,
}

/// Input given to a handler.
///
/// Lifecycle callbacks (connect, disconnect) receive [`Payload::Empty`];
/// message callbacks receive the raw frame exactly as it arrived.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Payload {
    #[default]
    Empty,
    Text(String),
    Binary(Bytes),
}

impl Payload {
    /// Frame type of the payload, `None` for lifecycle events.
    pub fn kind(&self) -> Option<MessageKind> {
        match self {
            Self::Empty => None,
            Self::Text(_) => Some(MessageKind::Text),
            Self::Binary(_) => Some(MessageKind::Binary),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Text(t) => t.is_empty(),
            Self::Binary(b) => b.is_empty(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Empty => &[],
            Self::Text(t) => t.as_bytes(),
            Self::Binary(b) => b,
        }
    }

    /// Text view of the payload; binary frames are accepted when valid UTF-8.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Empty => None,
            Self::Text(t) => Some(t),
            Self::Binary(b) => std::str::from_utf8(b).ok(),
        }
    }

    /// Decode the payload as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(self.as_bytes())
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<Bytes> for Payload {
    fn from(value: Bytes) -> Self {
        Self::Binary(value)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Self::Binary(Bytes::from(value))
    }
}
