//! Pulse protocol types.
//!
//! Every frame the server writes is a single-key JSON envelope:
//! `{"data": ...}` for results and `{"error": {"message", "stack"}}` for
//! failures. Inbound frames carry no envelope and reach handlers verbatim
//! as a [`Payload`].

pub mod connection;
pub mod envelope;
pub mod error;
pub mod payload;

pub use connection::{ConnectionContext, ConnectionId};
pub use envelope::Envelope;
pub use error::{ErrorBody, ErrorKind, HandlerError};
pub use payload::{MessageKind, Payload};

/// Result returned by application handlers.
pub type HandlerResult = Result<serde_json::Value, HandlerError>;
