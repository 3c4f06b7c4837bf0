//! SubscriptionRegistry: named channels of connection IDs.
//!
//! A channel exists while it has members: it is created by the first
//! subscribe and dropped when its last member leaves.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use pulse_protocol::ConnectionId;
use tracing::debug;

type Members = HashMap<ConnectionId, DateTime<Utc>>;

#[derive(Default)]
pub struct SubscriptionRegistry {
    channels: RwLock<HashMap<String, Members>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or refresh) a member. Returns the recorded timestamp.
    pub fn subscribe(&self, channel: &str, id: &ConnectionId) -> DateTime<Utc> {
        let now = Utc::now();
        self.channels
            .write()
            .entry(channel.to_string())
            .or_default()
            .insert(id.clone(), now);
        debug!("{id} subscribed to {channel}");
        now
    }

    /// Subscribe only if `is_live` holds, evaluated under the write lock so
    /// a concurrent [`remove_connection`](Self::remove_connection) cannot
    /// leave a stale member behind.
    pub fn subscribe_if(
        &self,
        channel: &str,
        id: &ConnectionId,
        is_live: impl FnOnce() -> bool,
    ) -> Option<DateTime<Utc>> {
        let mut channels = self.channels.write();
        if !is_live() {
            return None;
        }
        let now = Utc::now();
        channels
            .entry(channel.to_string())
            .or_default()
            .insert(id.clone(), now);
        debug!("{id} subscribed to {channel}");
        Some(now)
    }

    /// Remove a member. Returns whether it was subscribed.
    pub fn unsubscribe(&self, channel: &str, id: &ConnectionId) -> bool {
        let mut channels = self.channels.write();
        let Some(members) = channels.get_mut(channel) else {
            return false;
        };
        let removed = members.remove(id).is_some();
        if members.is_empty() {
            channels.remove(channel);
        }
        if removed {
            debug!("{id} unsubscribed from {channel}");
        }
        removed
    }

    /// Drop a connection from every channel. Returns the channels it left.
    pub fn remove_connection(&self, id: &ConnectionId) -> Vec<String> {
        let mut left = Vec::new();
        self.channels.write().retain(|channel, members| {
            if members.remove(id).is_some() {
                left.push(channel.clone());
            }
            !members.is_empty()
        });
        if !left.is_empty() {
            debug!("{id} removed from {} channel(s)", left.len());
        }
        left.sort();
        left
    }

    pub fn members(&self, channel: &str) -> Vec<ConnectionId> {
        self.channels
            .read()
            .get(channel)
            .map(|members| members.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn member_count(&self, channel: &str) -> usize {
        self.channels.read().get(channel).map_or(0, HashMap::len)
    }

    pub fn subscribed_at(&self, channel: &str, id: &ConnectionId) -> Option<DateTime<Utc>> {
        self.channels.read().get(channel)?.get(id).copied()
    }

    pub fn is_subscribed(&self, channel: &str, id: &ConnectionId) -> bool {
        self.subscribed_at(channel, id).is_some()
    }

    pub fn channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.channels.read().keys().cloned().collect();
        channels.sort();
        channels
    }

    pub fn channels_of(&self, id: &ConnectionId) -> Vec<String> {
        let mut channels: Vec<String> = self
            .channels
            .read()
            .iter()
            .filter(|(_, members)| members.contains_key(id))
            .map(|(channel, _)| channel.clone())
            .collect();
        channels.sort();
        channels
    }

    pub fn is_empty(&self) -> bool {
        self.channels.read().is_empty()
    }
}
