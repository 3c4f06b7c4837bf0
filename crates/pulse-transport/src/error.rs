//! Transport error type.

use std::net::SocketAddr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid listen address {addr}: {source}")]
    Address {
        addr: String,
        #[source]
        source: std::net::AddrParseError,
    },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS configuration error: {0}")]
    Tls(#[source] std::io::Error),

    #[error("socket error: {0}")]
    Socket(#[from] axum::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("write timed out after {0:?}")]
    WriteTimeout(std::time::Duration),

    #[error("connection closed")]
    Closed,
}
