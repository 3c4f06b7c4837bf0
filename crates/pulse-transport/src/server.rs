//! WebSocket transport server using Axum.
//!
//! Handles HTTP upgrade to WebSocket on any route, registers each new
//! connection, starts its keepalive task, and runs the read loop that feeds
//! inbound frames to the [`ConnectionHandler`].

use std::future::Future;
use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket, close_code, rejection::WebSocketUpgradeRejection},
    },
    http::{StatusCode, Uri},
    response::{IntoResponse, Json, Response},
    routing::get,
};
use futures_util::{StreamExt, stream::SplitStream};
use pulse_protocol::{
    ConnectionContext, ConnectionId, Envelope, HandlerError, HandlerResult, MessageKind, Payload,
};
use serde_json::{Value, json};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};

use crate::connection::ConnectionHandle;
use crate::error::TransportError;
use crate::keepalive::Keepalive;
use crate::registry::ConnectionRegistry;

/// Trait implemented by the application side to receive lifecycle events.
///
/// `on_connect` and `on_message` return `None` when the route has no
/// handler for that event.
pub trait ConnectionHandler: Send + Sync + 'static {
    fn on_connect(
        &self,
        ctx: &ConnectionContext,
    ) -> impl Future<Output = Option<HandlerResult>> + Send;

    fn on_message(
        &self,
        ctx: &ConnectionContext,
        payload: Payload,
    ) -> impl Future<Output = Option<HandlerResult>> + Send;

    /// Called once per connection, after it left the registry and before
    /// its socket is closed.
    fn on_disconnect(&self, ctx: &ConnectionContext) -> impl Future<Output = ()> + Send;
}

/// TLS certificate and key (PEM).
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Transport server configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Port to listen on (0 for OS-assigned)
    pub port: u16,
    /// Hostname to bind to
    pub hostname: String,
    /// Idle timeout; heartbeat probes go out every `timeout / 10`
    pub timeout: Duration,
    /// Sent as `{"data": greeting}` when a route has no connect handler
    pub greeting: Option<Value>,
    /// Maximum concurrent connections
    pub max_connections: Option<usize>,
    /// Enable CORS
    pub enable_cors: bool,
    /// Serve `GET /health`
    pub health_check: bool,
    /// Serve `wss://` with these credentials
    pub tls: Option<TlsConfig>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            port: 7070,
            hostname: "127.0.0.1".into(),
            timeout: Duration::from_secs(30),
            greeting: None,
            max_connections: Some(1024),
            enable_cors: false,
            health_check: true,
            tls: None,
        }
    }
}

/// Shared state for the transport server.
struct AppState<H: ConnectionHandler> {
    handler: Arc<H>,
    config: TransportConfig,
    registry: Arc<ConnectionRegistry>,
    keepalive: Keepalive,
    /// Parent of every connection token.
    shutdown: CancellationToken,
    /// One permit per live connection when `max_connections` is set.
    slots: Option<Arc<Semaphore>>,
}

/// The transport server. Accepts WebSocket connections and drives them.
pub struct TransportServer {
    registry: Arc<ConnectionRegistry>,
    shutdown: CancellationToken,
    handle: Option<JoinHandle<()>>,
    addr: SocketAddr,
    tls: bool,
}

impl TransportServer {
    /// Start the transport server with a fresh connection registry.
    pub async fn start<H: ConnectionHandler>(
        config: TransportConfig,
        handler: H,
    ) -> Result<Self, TransportError> {
        Self::start_with_registry(config, Arc::new(handler), Arc::new(ConnectionRegistry::new()))
            .await
    }

    /// Start the transport server around an existing registry.
    /// The application keeps its own `Arc` to the registry to push messages.
    pub async fn start_with_registry<H: ConnectionHandler>(
        config: TransportConfig,
        handler: Arc<H>,
        registry: Arc<ConnectionRegistry>,
    ) -> Result<Self, TransportError> {
        let shutdown = CancellationToken::new();

        let state = Arc::new(AppState {
            handler,
            keepalive: Keepalive::new(config.timeout),
            config: config.clone(),
            registry: registry.clone(),
            shutdown: shutdown.clone(),
            slots: config.max_connections.map(|max| Arc::new(Semaphore::new(max))),
        });

        let app = build_router(state, &config);

        let addr_str = format!("{}:{}", config.hostname, config.port);
        let addr: SocketAddr = addr_str.parse().map_err(|source| TransportError::Address {
            addr: addr_str.clone(),
            source,
        })?;

        let (handle, local_addr) = match &config.tls {
            None => {
                let listener = tokio::net::TcpListener::bind(addr)
                    .await
                    .map_err(|source| TransportError::Bind { addr, source })?;
                let local_addr = listener
                    .local_addr()
                    .map_err(|source| TransportError::Bind { addr, source })?;
                let stop = shutdown.clone();
                let handle = tokio::spawn(async move {
                    if let Err(e) = axum::serve(listener, app)
                        .with_graceful_shutdown(stop.cancelled_owned())
                        .await
                    {
                        error!("Transport server error: {e}");
                    }
                });
                (handle, local_addr)
            }
            Some(tls) => serve_tls(app, addr, tls, shutdown.clone()).await?,
        };

        let scheme = if config.tls.is_some() { "wss" } else { "ws" };
        info!("Pulse transport listening on {scheme}://{local_addr}");

        Ok(Self {
            registry,
            shutdown,
            handle: Some(handle),
            addr: local_addr,
            tls: config.tls.is_some(),
        })
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        self.registry.clone()
    }

    /// Get the actual bound port.
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_tls(&self) -> bool {
        self.tls
    }

    /// Gracefully stop the server. Every live connection is cancelled and
    /// runs its normal cleanup.
    pub async fn stop(&mut self) {
        self.shutdown.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        info!("Pulse transport server stopped");
    }
}

fn build_router<H: ConnectionHandler>(state: Arc<AppState<H>>, config: &TransportConfig) -> Router {
    let mut router = Router::new();
    if config.health_check {
        router = router.route("/health", get(health_handler::<H>));
    }
    let mut app = router
        .route("/", get(ws_upgrade_handler::<H>))
        .route("/{*route}", get(ws_upgrade_handler::<H>))
        .with_state(state);

    if config.enable_cors {
        app = app.layer(CorsLayer::permissive());
    }
    app.layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
}

async fn serve_tls(
    app: Router,
    addr: SocketAddr,
    tls: &TlsConfig,
    shutdown: CancellationToken,
) -> Result<(JoinHandle<()>, SocketAddr), TransportError> {
    let rustls = axum_server::tls_rustls::RustlsConfig::from_pem_file(&tls.cert_path, &tls.key_path)
        .await
        .map_err(TransportError::Tls)?;

    let listener =
        std::net::TcpListener::bind(addr).map_err(|source| TransportError::Bind { addr, source })?;
    listener
        .set_nonblocking(true)
        .map_err(|source| TransportError::Bind { addr, source })?;
    let local_addr = listener
        .local_addr()
        .map_err(|source| TransportError::Bind { addr, source })?;

    let server_handle = axum_server::Handle::new();
    let stop_handle = server_handle.clone();
    tokio::spawn(async move {
        shutdown.cancelled().await;
        stop_handle.graceful_shutdown(Some(Duration::from_secs(5)));
    });

    let handle = tokio::spawn(async move {
        if let Err(e) = axum_server::from_tcp_rustls(listener, rustls)
            .handle(server_handle)
            .serve(app.into_make_service())
            .await
        {
            error!("Transport server error: {e}");
        }
    });
    Ok((handle, local_addr))
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP Handlers
// ─────────────────────────────────────────────────────────────────────────────

async fn ws_upgrade_handler<H: ConnectionHandler>(
    State(state): State<Arc<AppState<H>>>,
    uri: Uri,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let route = uri.path().to_string();

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            warn!("Handshake rejected on {route}: {rejection}");
            return rejection.into_response();
        }
    };

    // Reserve a connection slot; the permit lives as long as the connection task.
    let permit = match &state.slots {
        Some(slots) => match slots.clone().try_acquire_owned() {
            Ok(permit) => Some(permit),
            Err(_) => {
                warn!(
                    "Connection rejected on {route}: max connections reached ({})",
                    state.config.max_connections.unwrap_or_default()
                );
                return StatusCode::SERVICE_UNAVAILABLE.into_response();
            }
        },
        None => None,
    };

    let failed_route = route.clone();
    ws.on_failed_upgrade(move |e| warn!("Upgrade failed on {failed_route}: {e}"))
        .on_upgrade(move |socket| handle_ws_connection(socket, state, route, permit))
        .into_response()
}

async fn health_handler<H: ConnectionHandler>(
    State(state): State<Arc<AppState<H>>>,
) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "connections": state.registry.len(),
    }))
}

// ─────────────────────────────────────────────────────────────────────────────
// WebSocket Connection Handler
// ─────────────────────────────────────────────────────────────────────────────

/// Why a read loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    PeerClosed,
    ReadError,
    WriteError,
    RouteNotConfigured,
    Cancelled,
}

impl CloseReason {
    fn close_code(&self) -> u16 {
        match self {
            Self::RouteNotConfigured => close_code::POLICY,
            Self::WriteError | Self::ReadError => close_code::ERROR,
            Self::Cancelled => close_code::AWAY,
            Self::PeerClosed => close_code::NORMAL,
        }
    }
}

async fn handle_ws_connection<H: ConnectionHandler>(
    socket: WebSocket,
    state: Arc<AppState<H>>,
    route: String,
    _permit: Option<OwnedSemaphorePermit>,
) {
    let ctx = ConnectionContext::new(ConnectionId::generate(), route);
    let (ws_tx, ws_rx) = socket.split();

    let handle = Arc::new(
        ConnectionHandle::new(ctx.clone(), ws_tx, state.shutdown.child_token())
            .with_write_timeout(state.keepalive.probe_interval()),
    );
    state.registry.add(handle.clone());
    info!("Client connected: {} on {} (total: {})", ctx.id, ctx.route, state.registry.len());

    state.keepalive.spawn(handle.clone());

    let reason = match send_welcome(&state, &handle).await {
        Ok(()) => read_loop(&state, &handle, ws_rx).await,
        Err(e) => {
            warn!("Failed to greet {}: {e}", ctx.id);
            CloseReason::WriteError
        }
    };

    state.registry.remove_handle(&handle);
    state.handler.on_disconnect(&ctx).await;
    handle.close(reason.close_code(), "").await;

    info!(
        "Client disconnected: {} after {:?} ({reason:?}, total: {})",
        ctx.id,
        handle.connected_for(),
        state.registry.len()
    );
}

/// Dispatch the connect event, falling back to the configured greeting.
async fn send_welcome<H: ConnectionHandler>(
    state: &AppState<H>,
    handle: &ConnectionHandle,
) -> Result<(), TransportError> {
    match state.handler.on_connect(handle.context()).await {
        Some(Ok(value)) => handle.send_data(value).await,
        Some(Err(err)) => {
            warn!("Connect handler failed for {}: {err}", handle.id());
            handle.send_error(&HandlerError::connect_failed(&err)).await
        }
        None => match &state.config.greeting {
            Some(greeting) => handle.send_data(greeting.clone()).await,
            None => {
                debug!("No connect handler for {}", handle.route());
                Ok(())
            }
        },
    }
}

async fn read_loop<H: ConnectionHandler>(
    state: &AppState<H>,
    handle: &ConnectionHandle,
    mut ws_rx: SplitStream<WebSocket>,
) -> CloseReason {
    let cancel = handle.cancellation().clone();
    let id = handle.id();

    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => return CloseReason::Cancelled,
            msg = ws_rx.next() => msg,
        };

        let flow = match msg {
            Some(Ok(Message::Text(text))) => {
                respond(state, handle, Payload::Text(text.to_string()), MessageKind::Text).await
            }
            Some(Ok(Message::Binary(data))) => {
                respond(state, handle, Payload::Binary(data), MessageKind::Binary).await
            }
            Some(Ok(Message::Pong(_))) => {
                handle.record_ack();
                ControlFlow::Continue(())
            }
            Some(Ok(Message::Ping(data))) => match handle.pong(data).await {
                Ok(()) => ControlFlow::Continue(()),
                Err(_) => ControlFlow::Break(CloseReason::WriteError),
            },
            Some(Ok(Message::Close(_))) | None => {
                debug!("Client closed: {id}");
                ControlFlow::Break(CloseReason::PeerClosed)
            }
            Some(Err(e)) => {
                warn!("WebSocket error for {id}: {e}");
                ControlFlow::Break(CloseReason::ReadError)
            }
        };

        if let ControlFlow::Break(reason) = flow {
            return reason;
        }
    }
}

/// Run the message handler for one inbound frame and write its response.
async fn respond<H: ConnectionHandler>(
    state: &AppState<H>,
    handle: &ConnectionHandle,
    payload: Payload,
    kind: MessageKind,
) -> ControlFlow<CloseReason> {
    let id = handle.id();
    let outcome = state
        .handler
        .on_message(handle.context(), payload)
        .await
        .unwrap_or_else(|| Err(HandlerError::route_not_configured(handle.route())));

    let err = match outcome {
        Ok(value) => {
            if let Err(e) = handle.send_envelope(&Envelope::Data(value), kind).await {
                error!("Failed to send response to {id}: {e}");
                return ControlFlow::Break(CloseReason::WriteError);
            }
            return ControlFlow::Continue(());
        }
        Err(err) => err,
    };

    if err.kind.is_fatal() {
        error!("{err} (connection {id})");
        let _ = handle.send_error(&err).await;
        return ControlFlow::Break(CloseReason::RouteNotConfigured);
    }

    debug!("Message handler error for {id}: {err}");
    if let Err(e) = handle.send_error(&err).await {
        error!("Failed to send error to {id}: {e}");
        return ControlFlow::Break(CloseReason::WriteError);
    }
    ControlFlow::Continue(())
}
