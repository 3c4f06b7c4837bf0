//! Handler table: per-route lifecycle callbacks.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::RwLock;
use pulse_protocol::{ConnectionId, HandlerResult, Payload};
use tracing::{debug, info};

/// Boxed future returned by a stored handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;

/// Object-safe form of an application callback.
pub type DataHandler = Arc<dyn Fn(ConnectionId, Payload) -> HandlerFuture + Send + Sync>;

/// Lifecycle event a handler is registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    Connect,
    Disconnect,
    Message,
}

#[derive(Default, Clone)]
struct RouteHandlers {
    connect: Option<DataHandler>,
    disconnect: Option<DataHandler>,
    message: Option<DataHandler>,
}

impl RouteHandlers {
    fn slot(&mut self, event: LifecycleEvent) -> &mut Option<DataHandler> {
        match event {
            LifecycleEvent::Connect => &mut self.connect,
            LifecycleEvent::Disconnect => &mut self.disconnect,
            LifecycleEvent::Message => &mut self.message,
        }
    }

    fn get(&self, event: LifecycleEvent) -> Option<&DataHandler> {
        match event {
            LifecycleEvent::Connect => self.connect.as_ref(),
            LifecycleEvent::Disconnect => self.disconnect.as_ref(),
            LifecycleEvent::Message => self.message.as_ref(),
        }
    }
}

/// Route → (event → handler). At most one handler per (route, event);
/// registering again replaces the previous one.
#[derive(Default)]
pub struct HandlerTable {
    routes: RwLock<HashMap<String, RouteHandlers>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(&self, route: &str, event: LifecycleEvent, handler: F)
    where
        F: Fn(ConnectionId, Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler: DataHandler =
            Arc::new(move |id: ConnectionId, payload: Payload| -> HandlerFuture {
                Box::pin(handler(id, payload))
            });
        let mut routes = self.routes.write();
        let replaced = routes
            .entry(route.to_string())
            .or_default()
            .slot(event)
            .replace(handler)
            .is_some();
        if replaced {
            info!("Replaced {event:?} handler on {route}");
        } else {
            info!("Registered {event:?} handler on {route}");
        }
    }

    pub fn on_connect<F, Fut>(&self, route: &str, handler: F)
    where
        F: Fn(ConnectionId, Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register(route, LifecycleEvent::Connect, handler);
    }

    pub fn on_disconnect<F, Fut>(&self, route: &str, handler: F)
    where
        F: Fn(ConnectionId, Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register(route, LifecycleEvent::Disconnect, handler);
    }

    pub fn on_message<F, Fut>(&self, route: &str, handler: F)
    where
        F: Fn(ConnectionId, Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register(route, LifecycleEvent::Message, handler);
    }

    pub fn get(&self, route: &str, event: LifecycleEvent) -> Option<DataHandler> {
        self.routes.read().get(route)?.get(event).cloned()
    }

    pub fn has(&self, route: &str, event: LifecycleEvent) -> bool {
        self.get(route, event).is_some()
    }

    pub fn routes(&self) -> Vec<String> {
        let mut routes: Vec<String> = self.routes.read().keys().cloned().collect();
        routes.sort();
        routes
    }

    /// Invoke the handler for `(route, event)`. `None` when nothing is registered.
    pub async fn dispatch(
        &self,
        route: &str,
        event: LifecycleEvent,
        id: ConnectionId,
        payload: Payload,
    ) -> Option<HandlerResult> {
        // Clone the handler out so the table lock is released before awaiting.
        let Some(handler) = self.get(route, event) else {
            debug!("No {event:?} handler on {route}");
            return None;
        };
        Some(handler(id, payload).await)
    }
}
