//! Hub: application-facing handle for pushing messages.
//!
//! Cheap to clone; handlers capture a clone to reply to other connections
//! or fan out to a channel.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use pulse_protocol::{ConnectionId, Envelope};
use pulse_transport::{ConnectionRegistry, Delivery};
use serde_json::Value;
use tracing::debug;

use crate::subscriptions::SubscriptionRegistry;

/// Result of a channel publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Members the frame was written to.
    pub delivered: usize,
    /// Members that were gone or whose write failed.
    pub skipped: usize,
}

#[derive(Clone, Default)]
pub struct Hub {
    connections: Arc<ConnectionRegistry>,
    subscriptions: Arc<SubscriptionRegistry>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_registry(connections: Arc<ConnectionRegistry>) -> Self {
        Self {
            connections,
            subscriptions: Arc::new(SubscriptionRegistry::new()),
        }
    }

    pub fn connections(&self) -> Arc<ConnectionRegistry> {
        self.connections.clone()
    }

    pub fn subscriptions(&self) -> &SubscriptionRegistry {
        &self.subscriptions
    }

    pub fn is_connected(&self, id: &ConnectionId) -> bool {
        self.connections.contains(id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Send `{"data": payload}` to one connection. Unknown IDs yield
    /// [`Delivery::NotFound`] rather than an error.
    pub async fn send(&self, id: &ConnectionId, payload: Value) -> Delivery {
        self.connections.send(id, &Envelope::Data(payload)).await
    }

    /// Subscribe a live connection to a channel. Returns `None` when the
    /// connection is not registered.
    pub fn subscribe(&self, channel: &str, id: &ConnectionId) -> Option<DateTime<Utc>> {
        self.subscriptions
            .subscribe_if(channel, id, || self.connections.contains(id))
    }

    pub fn unsubscribe(&self, channel: &str, id: &ConnectionId) -> bool {
        self.subscriptions.unsubscribe(channel, id)
    }

    /// Send `{"data": payload}` to every member of a channel. Members are
    /// written concurrently, each bounded by its connection's write timeout,
    /// so one stalled peer cannot hold up the rest. Members that are gone or
    /// fail to receive are skipped; the broadcast never aborts.
    pub async fn publish(&self, channel: &str, payload: Value) -> PublishReport {
        let envelope = Envelope::Data(payload);
        let members = self.subscriptions.members(channel);
        let deliveries =
            join_all(members.iter().map(|id| self.connections.send(id, &envelope))).await;

        let mut report = PublishReport::default();
        for delivery in deliveries {
            match delivery {
                Delivery::Delivered => report.delivered += 1,
                Delivery::NotFound | Delivery::Failed => report.skipped += 1,
            }
        }

        debug!(
            "Published to {channel}: {} delivered, {} skipped",
            report.delivered, report.skipped
        );
        report
    }

    /// Drop a departed connection from every channel.
    pub fn forget(&self, id: &ConnectionId) -> Vec<String> {
        self.subscriptions.remove_connection(id)
    }
}
