//! Startup reachability probe.
//!
//! A plain TCP connect against the TAK server before any worker starts. In UDP
//! mode the target comes from [`TakConnectionConfig::preflight_target`].
//!
//! [`TakConnectionConfig::preflight_target`]: crate::config::TakConnectionConfig::preflight_target

use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;
use tracing::info;

use crate::config::TakEndpoint;

#[derive(Debug, Error)]
pub enum PreflightError {
    #[error("TAK server {addr} is unreachable: {source}")]
    Unreachable {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TAK server {addr} did not accept a connection within {secs}s")]
    Timeout { addr: String, secs: u64 },
}

/// Check that the TAK server accepts TCP connections at `endpoint`.
pub async fn probe(endpoint: &TakEndpoint, timeout: Duration) -> Result<(), PreflightError> {
    let addr = format!("{}:{}", endpoint.host, endpoint.port);
    let stream = tokio::time::timeout(
        timeout,
        TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
    )
    .await
    .map_err(|_| PreflightError::Timeout {
        addr: addr.clone(),
        secs: timeout.as_secs(),
    })?
    .map_err(|source| PreflightError::Unreachable {
        addr: addr.clone(),
        source,
    })?;
    drop(stream);

    info!(address = %addr, "TAK server reachable");
    Ok(())
}
