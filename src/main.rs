//! Pulse: WebSocket messaging server
//!
//! Runs the Pulse middleware with two demo routes:
//!
//!   /chat   greets each connection and echoes text back upper-cased
//!   /rooms  JSON commands: {"subscribe": ch}, {"unsubscribe": ch},
//!           {"publish": {"channel": ch, "message": ...}}
//!
//! Usage:
//!   pulse                          # Default port 7070
//!   pulse --port 8080              # Custom port
//!   pulse --timeout-ms 5000        # Shorter heartbeat timeout
//!   pulse --log-file               # Log to ~/.pulse/logs/pulse.log

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use pulse_protocol::{ConnectionId, HandlerError, HandlerResult, Payload};
use pulse_server::{Hub, PulseServer};
use pulse_transport::{TlsConfig, TransportConfig};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "pulse", about = "Pulse: real-time WebSocket messaging")]
struct Cli {
    /// Port to listen on (0 for OS-assigned)
    #[arg(long, default_value = "7070")]
    port: u16,

    /// Hostname to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Heartbeat timeout in milliseconds
    #[arg(long, default_value = "30000")]
    timeout_ms: u64,

    /// JSON value sent to new connections on routes without a connect handler
    #[arg(long)]
    greeting: Option<String>,

    /// Maximum concurrent connections
    #[arg(long, default_value = "1024")]
    max_connections: usize,

    /// Enable permissive CORS
    #[arg(long)]
    cors: bool,

    /// Path to TLS certificate (PEM)
    #[arg(long, requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// Path to TLS private key (PEM)
    #[arg(long, requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,

    /// Write logs to a file (defaults to ~/.pulse/logs/pulse.log if no path given)
    #[arg(long, default_missing_value = "DEFAULT", num_args = 0..=1)]
    log_file: Option<String>,
}

fn init_tracing(cli: &Cli) -> Result<()> {
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let Some(log_file_arg) = &cli.log_file else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        return Ok(());
    };

    let log_path = if log_file_arg == "DEFAULT" {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".pulse/logs/pulse.log")
    } else {
        PathBuf::from(log_file_arg)
    };
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating log directory {}", parent.display()))?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("opening log file {}", log_path.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::sync::Mutex::new(file))
        .with_ansi(false)
        .init();
    eprintln!("Logging to {}", log_path.display());
    Ok(())
}

/// Commands accepted on `/rooms`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum RoomCommand {
    Subscribe(String),
    Unsubscribe(String),
    Publish { channel: String, message: Value },
}

async fn shout(payload: Payload) -> HandlerResult {
    let text = payload
        .as_text()
        .ok_or_else(|| HandlerError::msg("expected a UTF-8 message"))?;
    Ok(Value::String(text.to_uppercase()))
}

async fn run_room_command(hub: Hub, id: ConnectionId, payload: Payload) -> HandlerResult {
    match payload.json::<RoomCommand>()? {
        RoomCommand::Subscribe(channel) => {
            let since = hub
                .subscribe(&channel, &id)
                .ok_or_else(|| HandlerError::msg("connection is gone"))?;
            Ok(json!({ "subscribed": channel, "since": since }))
        }
        RoomCommand::Unsubscribe(channel) => {
            let removed = hub.unsubscribe(&channel, &id);
            Ok(json!({ "unsubscribed": channel, "removed": removed }))
        }
        RoomCommand::Publish { channel, message } => {
            let report = hub.publish(&channel, message).await;
            Ok(json!({
                "published": channel,
                "delivered": report.delivered,
                "skipped": report.skipped,
            }))
        }
    }
}

fn register_routes(server: &PulseServer) {
    server.on_connect("/chat", |_, _| async { Ok(json!({ "welcome": true })) });
    server.on_message("/chat", |_, payload| shout(payload));

    let hub = server.hub();
    server.on_message("/rooms", move |id, payload| run_room_command(hub.clone(), id, payload));
    server.on_disconnect("/rooms", |id, _| async move {
        info!("{id} left /rooms");
        Ok(Value::Null)
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli)?;

    let greeting = cli
        .greeting
        .as_deref()
        .map(|raw| serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string())));

    let tls = match (cli.tls_cert.clone(), cli.tls_key.clone()) {
        (Some(cert_path), Some(key_path)) => Some(TlsConfig { cert_path, key_path }),
        _ => None,
    };

    let config = TransportConfig {
        port: cli.port,
        hostname: cli.host.clone(),
        timeout: Duration::from_millis(cli.timeout_ms),
        greeting,
        max_connections: Some(cli.max_connections),
        enable_cors: cli.cors,
        health_check: true,
        tls,
    };

    let server = PulseServer::new();
    register_routes(&server);

    let mut transport = server
        .start(config)
        .await
        .context("failed to start transport")?;

    let scheme = if transport.is_tls() { "wss" } else { "ws" };
    println!();
    println!("  Pulse running on {scheme}://{}:{}", cli.host, transport.port());
    println!("  Routes: /chat, /rooms   Health: /health");
    println!("  Press Ctrl+C to stop.");
    println!();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;

    println!("  Shutting down...");
    transport.stop().await;
    println!("  Server stopped.");
    Ok(())
}
