//! Pulse Transport Layer
//!
//! Provides the WebSocket transport for the Pulse server.
//! The transport layer handles:
//! - Connection lifecycle (upgrade, register, read loop, cleanup)
//! - Heartbeat / stale connection detection
//! - Serialized writes per connection
//!
//! The transport is decoupled from application handlers via the
//! `ConnectionHandler` trait.

pub mod connection;
pub mod error;
pub mod keepalive;
pub mod registry;
pub mod server;

pub use connection::{ConnectionHandle, FrameSink};
pub use error::TransportError;
pub use keepalive::{Keepalive, KeepaliveExit};
pub use registry::{ConnectionRegistry, Delivery};
pub use server::{ConnectionHandler, TlsConfig, TransportConfig, TransportServer};
