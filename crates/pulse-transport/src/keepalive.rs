//! Keepalive supervisor: one heartbeat task per connection.
//!
//! Probes are sent every `timeout / 10`, so a single lost pong never drops
//! a connection while a dead peer is still detected within one probe
//! interval after the timeout elapses.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::close_code;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::connection::ConnectionHandle;

/// Lower bound for the probe interval.
const MIN_PROBE_INTERVAL: Duration = Duration::from_millis(1);

/// Why a keepalive task stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveExit {
    /// A probe could not be written within one probe interval; the
    /// connection was cancelled.
    Closed,
    /// No pong arrived within the timeout; the channel was force-closed.
    TimedOut,
    /// The connection was removed or the server is stopping.
    Cancelled,
}

#[derive(Debug, Clone, Copy)]
pub struct Keepalive {
    timeout: Duration,
}

impl Keepalive {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn probe_interval(&self) -> Duration {
        (self.timeout / 10).max(MIN_PROBE_INTERVAL)
    }

    /// Start the heartbeat task for a freshly registered connection.
    pub fn spawn(self, handle: Arc<ConnectionHandle>) -> JoinHandle<KeepaliveExit> {
        tokio::spawn(async move { self.run(&handle).await })
    }

    pub async fn run(&self, handle: &ConnectionHandle) -> KeepaliveExit {
        let id = handle.id().clone();
        let cancel = handle.cancellation().clone();
        let interval = self.probe_interval();
        handle.record_ack();
        debug!("Keepalive started for {id} (probe every {interval:?})");

        loop {
            if cancel.is_cancelled() {
                return KeepaliveExit::Cancelled;
            }

            let probe = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Keepalive cancelled for {id}");
                    return KeepaliveExit::Cancelled;
                }
                probe = tokio::time::timeout(interval, handle.ping()) => probe,
            };
            match probe {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!("Keepalive probe failed for {id}: {e}");
                    return KeepaliveExit::Closed;
                }
                Err(_) => {
                    warn!("Keepalive probe to {id} stalled for {interval:?}, closing");
                    handle.cancellation().cancel();
                    return KeepaliveExit::Closed;
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Keepalive cancelled for {id}");
                    return KeepaliveExit::Cancelled;
                }
                _ = tokio::time::sleep(interval) => {}
            }

            let silent = handle.since_last_ack();
            if silent > self.timeout {
                warn!("Heartbeat timeout for {id} (silent for {silent:?}), closing");
                handle.close(close_code::AWAY, "heartbeat timeout").await;
                return KeepaliveExit::TimedOut;
            }
        }
    }
}
