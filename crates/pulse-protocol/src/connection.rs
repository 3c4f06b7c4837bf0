//! Connection identity: per-connection data threaded through dispatch.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Globally unique identifier of a live connection.
///
/// Generated once at upgrade time and never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Generate a fresh random (v4) identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ConnectionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl AsRef<str> for ConnectionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Context for a single dispatch, carrying connection-level state.
///
/// Built once per connection by the transport and passed to every
/// lifecycle callback so the handler side can resolve the route table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionContext {
    /// Identifier of the connection.
    pub id: ConnectionId,
    /// Request path the connection was upgraded on, without query string.
    pub route: String,
}

impl ConnectionContext {
    pub fn new(id: ConnectionId, route: impl Into<String>) -> Self {
        Self {
            id,
            route: route.into(),
        }
    }
}
