//! ConnectionRegistry: the single owner of live connection handles.

use std::sync::Arc;

use dashmap::DashMap;
use pulse_protocol::{ConnectionId, Envelope};
use tracing::{debug, warn};

use crate::connection::ConnectionHandle;

/// Outcome of a best-effort send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The frame was written to the connection.
    Delivered,
    /// No live connection with that ID.
    NotFound,
    /// The connection exists but the write failed.
    Failed,
}

impl Delivery {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered)
    }
}

/// Maps connection ID to its handle.
///
/// Lookups clone the `Arc` out of the map so no shard lock is held across
/// an await point. Removal cancels the connection's token, which stops its
/// keepalive task.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<ConnectionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a handle, replacing (and cancelling) any handle under the same ID.
    pub fn add(&self, handle: Arc<ConnectionHandle>) {
        let id = handle.id().clone();
        if let Some(previous) = self.connections.insert(id.clone(), handle) {
            warn!("Connection ID collision, replacing {id}");
            previous.cancellation().cancel();
        }
        debug!("Connection registered: {id} (total: {})", self.connections.len());
    }

    /// Remove a connection. Idempotent: removing an unknown ID is a no-op.
    pub fn remove(&self, id: &ConnectionId) -> Option<Arc<ConnectionHandle>> {
        let (_, handle) = self.connections.remove(id)?;
        handle.cancellation().cancel();
        debug!("Connection removed: {id} (total: {})", self.connections.len());
        Some(handle)
    }

    /// Remove `handle` only if it is still the one registered under its ID.
    /// A handle that was replaced leaves its successor untouched.
    pub fn remove_handle(&self, handle: &Arc<ConnectionHandle>) -> bool {
        let id = handle.id();
        let removed = self
            .connections
            .remove_if(id, |_, current| Arc::ptr_eq(current, handle))
            .is_some();
        handle.cancellation().cancel();
        if removed {
            debug!("Connection removed: {id} (total: {})", self.connections.len());
        }
        removed
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.connections.get(id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Send an envelope to one connection as a text frame.
    pub async fn send(&self, id: &ConnectionId, envelope: &Envelope) -> Delivery {
        let Some(handle) = self.get(id) else {
            debug!("Send to unknown connection {id} dropped");
            return Delivery::NotFound;
        };
        match handle
            .send_envelope(envelope, pulse_protocol::MessageKind::Text)
            .await
        {
            Ok(()) => Delivery::Delivered,
            Err(e) => {
                debug!("Send to {id} failed: {e}");
                Delivery::Failed
            }
        }
    }
}
