//! Pulse Server: route handlers, channel subscriptions and the outbound hub.
//!
//! The server owns the handler table and provides the `ConnectionHandler`
//! implementation for the transport layer. Application code registers
//! callbacks per route and pushes messages through a [`Hub`].

pub mod handlers;
pub mod hub;
pub mod router;
pub mod subscriptions;

pub use handlers::{DataHandler, HandlerTable, LifecycleEvent};
pub use hub::{Hub, PublishReport};
pub use router::PulseServer;
pub use subscriptions::SubscriptionRegistry;
