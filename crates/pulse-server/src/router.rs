//! Pulse Server Router: dispatches connection events to route handlers.

use std::future::Future;
use std::sync::Arc;

use pulse_protocol::{ConnectionContext, ConnectionId, HandlerResult, Payload};
use pulse_transport::{
    ConnectionHandler, ConnectionRegistry, TransportConfig, TransportError, TransportServer,
};
use tracing::{info, warn};

use crate::handlers::{HandlerTable, LifecycleEvent};
use crate::hub::Hub;

/// The Pulse server. Owns the handler table and the hub, and implements
/// [`ConnectionHandler`] for the transport.
#[derive(Default)]
pub struct PulseServer {
    handlers: HandlerTable,
    hub: Hub,
}

impl PulseServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build around an existing connection registry.
    pub fn with_registry(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            handlers: HandlerTable::new(),
            hub: Hub::with_registry(registry),
        }
    }

    /// Clone of the hub for use inside handlers.
    pub fn hub(&self) -> Hub {
        self.hub.clone()
    }

    pub fn handlers(&self) -> &HandlerTable {
        &self.handlers
    }

    pub fn on_connect<F, Fut>(&self, route: &str, handler: F)
    where
        F: Fn(ConnectionId, Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.handlers.on_connect(route, handler);
    }

    pub fn on_disconnect<F, Fut>(&self, route: &str, handler: F)
    where
        F: Fn(ConnectionId, Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.handlers.on_disconnect(route, handler);
    }

    pub fn on_message<F, Fut>(&self, route: &str, handler: F)
    where
        F: Fn(ConnectionId, Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.handlers.on_message(route, handler);
    }

    /// Start serving. The transport shares this server's connection registry.
    pub async fn start(self, config: TransportConfig) -> Result<TransportServer, TransportError> {
        let registry = self.hub.connections();
        info!("Starting Pulse server (routes: {:?})", self.handlers.routes());
        TransportServer::start_with_registry(config, Arc::new(self), registry).await
    }
}

impl ConnectionHandler for PulseServer {
    async fn on_connect(&self, ctx: &ConnectionContext) -> Option<HandlerResult> {
        self.handlers
            .dispatch(&ctx.route, LifecycleEvent::Connect, ctx.id.clone(), Payload::Empty)
            .await
    }

    async fn on_message(&self, ctx: &ConnectionContext, payload: Payload) -> Option<HandlerResult> {
        self.handlers
            .dispatch(&ctx.route, LifecycleEvent::Message, ctx.id.clone(), payload)
            .await
    }

    async fn on_disconnect(&self, ctx: &ConnectionContext) {
        let outcome = self
            .handlers
            .dispatch(&ctx.route, LifecycleEvent::Disconnect, ctx.id.clone(), Payload::Empty)
            .await;
        if let Some(Err(err)) = outcome {
            warn!("Disconnect handler failed for {}: {err}", ctx.id);
        }

        let left = self.hub.forget(&ctx.id);
        if !left.is_empty() {
            info!("{} left channels {left:?}", ctx.id);
        }
    }
}
