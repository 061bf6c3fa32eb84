//! TAK Transport Module
//!
//! Drains the outbound queue onto the wire.
//!
//! - [`StreamTransport`]: persistent TCP or TLS stream with reconnection
//! - [`UdpTransport`]: one datagram per event
//! - [`StdoutTransport`]: dry run, events go to stdout
//! - [`run_sender`]: the consumer task tying the queue to a transport
//! - [`preflight`]: one-shot reachability probe before startup

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::config::{TakConnectionConfig, TakEndpoint, TransportMode};

pub mod preflight;
pub mod sender;
pub mod stream;
pub mod tls;

pub use preflight::{probe, PreflightError};
pub use sender::run_sender;
pub use stream::{ReconnectPolicy, StdoutTransport, StreamTransport, UdpTransport};

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Connection to {addr} timed out after {secs}s")]
    ConnectTimeout { addr: String, secs: u64 },

    #[error("Could not resolve {0}")]
    Resolve(String),

    #[error("TLS handshake with {addr} failed: {source}")]
    Handshake {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Write to {addr} failed: {source}")]
    Write {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Gave up reconnecting to {addr} after {attempts} attempts")]
    ReconnectExhausted { addr: String, attempts: u32 },

    #[error("TLS configuration error: {0}")]
    Tls(#[from] tokio_rustls::rustls::Error),

    #[error("Invalid TLS server name '{0}'")]
    InvalidServerName(String),

    #[error("Failed to read {path}: {source}")]
    Certificate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No {what} found in {path}")]
    MissingPem { what: &'static str, path: PathBuf },

    #[error(
        "PKCS#12 client identity {0} is not supported; convert it to PEM and set cert_pem and cert_key"
    )]
    UnsupportedIdentity(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Something that puts serialized CoT events on the wire.
#[async_trait]
pub trait CotTransport: Send + 'static {
    /// Deliver one event. Returns `Err` only once the transport has given up.
    async fn send(&mut self, payload: &[u8]) -> Result<(), TransportError>;

    /// Human-readable name for logging (e.g. "tls://host:8089").
    fn transport_name(&self) -> &str;

    /// Release the connection, if any.
    async fn close(&mut self) {}
}

/// Build the network transport for `endpoint`.
pub fn connect_transport(
    cfg: &TakConnectionConfig,
    endpoint: &TakEndpoint,
) -> Result<Box<dyn CotTransport>, TransportError> {
    let timeout = cfg.connect_timeout();
    let transport: Box<dyn CotTransport> = match endpoint.mode {
        TransportMode::Tls => {
            let config = tls::client_config(cfg)?;
            let server_name = tls::server_name(&endpoint.host)?;
            Box::new(StreamTransport::tls(
                &endpoint.host,
                endpoint.port,
                timeout,
                config,
                server_name,
            ))
        }
        TransportMode::Tcp => Box::new(StreamTransport::tcp(&endpoint.host, endpoint.port, timeout)),
        TransportMode::Udp => Box::new(UdpTransport::new(&endpoint.host, endpoint.port)),
    };
    info!(transport = transport.transport_name(), "TAK transport ready");
    Ok(transport)
}
