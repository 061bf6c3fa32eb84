//! Sender task: outbound queue → transport.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::{CotTransport, TransportError};

/// Drain `rx` into `transport` until the queue closes or `cancel` fires.
///
/// Returns the number of events delivered. Events still queued at
/// cancellation are dropped.
pub async fn run_sender(
    mut rx: mpsc::Receiver<Vec<u8>>,
    mut transport: Box<dyn CotTransport>,
    cancel: CancellationToken,
) -> Result<u64, TransportError> {
    let name = transport.transport_name().to_string();
    let mut sent = 0u64;
    info!(transport = %name, "TAK sender started");

    loop {
        let payload = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(payload) => payload,
                None => {
                    debug!(transport = %name, "Outbound queue closed");
                    break;
                }
            },
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = transport.send(&payload) => result,
        };
        if let Err(e) = result {
            error!(transport = %name, sent, error = %e, "TAK sender failed");
            transport.close().await;
            return Err(e);
        }
        sent += 1;
        debug!(transport = %name, sent, bytes = payload.len(), "Event sent");
    }

    transport.close().await;
    info!(transport = %name, sent, "TAK sender stopped");
    Ok(sent)
}
