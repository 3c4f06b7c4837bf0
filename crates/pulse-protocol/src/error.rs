//! Handler error types and the wire error body.

use serde::{Deserialize, Serialize};

/// Category of a handler-side failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The application callback returned an error.
    Handler,
    /// The connect callback failed.
    Connect,
    /// No message handler is registered for the route.
    RouteNotConfigured,
    /// The result could not be encoded.
    Serialization,
}

impl ErrorKind {
    /// Whether this failure ends the connection.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::RouteNotConfigured)
    }
}

/// Body of an `{"error": ...}` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
    pub stack: String,
}

/// Error returned from an application handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    pub kind: ErrorKind,
    pub message: String,
    /// Detail reported as `stack`; defaults to `message` on the wire.
    pub stack: Option<String>,
}

impl HandlerError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            stack: None,
        }
    }

    /// Plain application error.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Handler, message)
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Wrap a failed connect callback: the message is fixed and the
    /// callback's own error travels as the stack.
    pub fn connect_failed(source: &HandlerError) -> Self {
        Self::new(ErrorKind::Connect, "onConnect error").with_stack(source.message.clone())
    }

    pub fn route_not_configured(route: &str) -> Self {
        Self::new(
            ErrorKind::RouteNotConfigured,
            format!("Route is not configured: {route}"),
        )
        .with_stack("no message handler registered for this route")
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Serialization, message)
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            message: self.message.clone(),
            stack: self.stack.clone().unwrap_or_else(|| self.message.clone()),
        }
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::msg(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::msg(message)
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for HandlerError {}
