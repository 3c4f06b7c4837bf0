//! Live connection state and its serialized write half.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message};
use bytes::Bytes;
use futures_util::{Sink, SinkExt};
use pulse_protocol::{ConnectionContext, ConnectionId, Envelope, HandlerError, MessageKind};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::TransportError;

/// Payload carried by every heartbeat probe.
pub const PING_PAYLOAD: &[u8] = b"ping";

/// Deadline for a single frame write unless configured otherwise.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Write half of a transport channel.
pub type FrameSink = Pin<Box<dyn Sink<Message, Error = axum::Error> + Send>>;

/// A registered connection.
///
/// Owns the write half of the socket behind an async mutex so data frames,
/// error frames and heartbeat probes are never interleaved. The read half
/// stays with the connection's read loop.
///
/// Every write, including the close frame, is bounded by the write timeout.
/// A write that fails or stalls past it cancels the connection.
pub struct ConnectionHandle {
    context: ConnectionContext,
    sink: Mutex<FrameSink>,
    write_timeout: Duration,
    last_ack: parking_lot::Mutex<Instant>,
    connected_at: Instant,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl ConnectionHandle {
    pub fn new<S>(context: ConnectionContext, sink: S, cancel: CancellationToken) -> Self
    where
        S: Sink<Message, Error = axum::Error> + Send + 'static,
    {
        let now = Instant::now();
        Self {
            context,
            sink: Mutex::new(Box::pin(sink)),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            last_ack: parking_lot::Mutex::new(now),
            connected_at: now,
            closed: AtomicBool::new(false),
            cancel,
        }
    }

    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }

    pub fn write_timeout(&self) -> Duration {
        self.write_timeout
    }

    pub fn id(&self) -> &ConnectionId {
        &self.context.id
    }

    pub fn route(&self) -> &str {
        &self.context.route
    }

    pub fn context(&self) -> &ConnectionContext {
        &self.context
    }

    pub fn connected_for(&self) -> Duration {
        self.connected_at.elapsed()
    }

    // ── Liveness ─────────────────────────────────────────────────────────

    /// Record a heartbeat acknowledgment (pong).
    pub fn record_ack(&self) {
        *self.last_ack.lock() = Instant::now();
    }

    /// Time since the last heartbeat acknowledgment.
    pub fn since_last_ack(&self) -> Duration {
        self.last_ack.lock().elapsed()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.cancel.is_cancelled()
    }

    // ── Writes ───────────────────────────────────────────────────────────

    /// Write a single frame while holding the connection's write lock.
    async fn write(&self, message: Message) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        match self.send_bounded(message).await {
            Ok(()) => Ok(()),
            Err(e) => {
                debug!("Write to {} failed, cancelling: {e}", self.context.id);
                self.cancel.cancel();
                Err(e)
            }
        }
    }

    /// Lock the sink and send one frame, giving up after the write timeout.
    async fn send_bounded(&self, message: Message) -> Result<(), TransportError> {
        let send = async {
            let mut sink = self.sink.lock().await;
            sink.send(message).await
        };
        match tokio::time::timeout(self.write_timeout, send).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(TransportError::WriteTimeout(self.write_timeout)),
        }
    }

    /// Encode an envelope and write it with the given frame type.
    pub async fn send_envelope(
        &self,
        envelope: &Envelope,
        kind: MessageKind,
    ) -> Result<(), TransportError> {
        let json = envelope.to_json()?;
        let message = match kind {
            MessageKind::Text => Message::Text(json.into()),
            MessageKind::Binary => Message::Binary(Bytes::from(json)),
        };
        self.write(message).await
    }

    pub async fn send_data(&self, value: Value) -> Result<(), TransportError> {
        self.send_envelope(&Envelope::Data(value), MessageKind::Text).await
    }

    pub async fn send_error(&self, err: &HandlerError) -> Result<(), TransportError> {
        self.send_envelope(&Envelope::error(err), MessageKind::Text).await
    }

    /// Emit a heartbeat probe.
    pub async fn ping(&self) -> Result<(), TransportError> {
        self.write(Message::Ping(Bytes::from_static(PING_PAYLOAD))).await
    }

    /// Answer a client-initiated ping.
    pub async fn pong(&self, data: Bytes) -> Result<(), TransportError> {
        self.write(Message::Pong(data)).await
    }

    /// Send a close frame and cancel the connection. Only the first call
    /// writes; later calls are no-ops.
    pub async fn close(&self, code: u16, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            self.cancel.cancel();
            return;
        }
        let frame = CloseFrame {
            code,
            reason: reason.to_string().into(),
        };
        if let Err(e) = self.send_bounded(Message::Close(Some(frame))).await {
            debug!("Close frame not delivered to {}: {e}", self.context.id);
        }
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.context.id)
            .field("route", &self.context.route)
            .field("closed", &self.is_closed())
            .finish()
    }
}
