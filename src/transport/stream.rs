//! Concrete transports: TCP/TLS stream, UDP datagrams, stdout.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::TlsConnector;
use tracing::{error, info, warn};

use super::{CotTransport, TransportError};
use crate::config::defaults::{
    TAK_INITIAL_RECONNECT_DELAY_SECS, TAK_MAX_RECONNECT_ATTEMPTS, TAK_MAX_RECONNECT_DELAY_SECS,
};

// ============================================================================
// Reconnect Policy
// ============================================================================

/// Exponential backoff for re-establishing a dropped stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: TAK_MAX_RECONNECT_ATTEMPTS,
            initial_delay: Duration::from_secs(TAK_INITIAL_RECONNECT_DELAY_SECS),
            max_delay: Duration::from_secs(TAK_MAX_RECONNECT_DELAY_SECS),
        }
    }
}

impl ReconnectPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.initial_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }
}

/// Enable TCP keepalive so a silently dead server is noticed.
pub(crate) fn set_keepalive(stream: &TcpStream) {
    let sock_ref = socket2::SockRef::from(stream);
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(30))
        .with_interval(Duration::from_secs(10));
    if let Err(e) = sock_ref.set_tcp_keepalive(&keepalive) {
        warn!(error = %e, "Failed to enable TCP keepalive");
    }
}

// ============================================================================
// Stream Transport (TCP / TLS)
// ============================================================================

enum Connection {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Connection {
    async fn write_event(&mut self, payload: &[u8]) -> std::io::Result<()> {
        match self {
            Connection::Plain(s) => {
                s.write_all(payload).await?;
                s.flush().await
            }
            Connection::Tls(s) => {
                s.write_all(payload).await?;
                s.flush().await
            }
        }
    }

    async fn shutdown(&mut self) {
        let _ = match self {
            Connection::Plain(s) => s.shutdown().await,
            Connection::Tls(s) => s.shutdown().await,
        };
    }
}

struct TlsParams {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

/// Persistent CoT stream to the TAK server with reconnection.
///
/// Connects lazily on the first event. A failed connect or write drops the
/// connection and retries with backoff; the event is only reported as failed
/// once every attempt is spent.
pub struct StreamTransport {
    host: String,
    port: u16,
    name: String,
    connect_timeout: Duration,
    tls: Option<TlsParams>,
    reconnect: ReconnectPolicy,
    conn: Option<Connection>,
    /// Total connections established
    connections: u64,
}

impl StreamTransport {
    /// Plain TCP stream.
    pub fn tcp(host: &str, port: u16, connect_timeout: Duration) -> Self {
        Self {
            host: host.to_string(),
            port,
            name: format!("tcp://{host}:{port}"),
            connect_timeout,
            tls: None,
            reconnect: ReconnectPolicy::default(),
            conn: None,
            connections: 0,
        }
    }

    /// TLS stream verified against `server_name`.
    pub fn tls(
        host: &str,
        port: u16,
        connect_timeout: Duration,
        config: ClientConfig,
        server_name: ServerName<'static>,
    ) -> Self {
        Self {
            name: format!("tls://{host}:{port}"),
            tls: Some(TlsParams {
                connector: TlsConnector::from(Arc::new(config)),
                server_name,
            }),
            ..Self::tcp(host, port, connect_timeout)
        }
    }

    #[must_use]
    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    async fn connect(&self) -> Result<Connection, TransportError> {
        let addr = self.addr();
        let secs = self.connect_timeout.as_secs();

        let tcp = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        .map_err(|_| TransportError::ConnectTimeout {
            addr: addr.clone(),
            secs,
        })?
        .map_err(|source| TransportError::Connect {
            addr: addr.clone(),
            source,
        })?;
        set_keepalive(&tcp);

        let Some(tls) = &self.tls else {
            return Ok(Connection::Plain(tcp));
        };
        let stream = tokio::time::timeout(
            self.connect_timeout,
            tls.connector.connect(tls.server_name.clone(), tcp),
        )
        .await
        .map_err(|_| TransportError::ConnectTimeout {
            addr: addr.clone(),
            secs,
        })?
        .map_err(|source| TransportError::Handshake { addr, source })?;
        Ok(Connection::Tls(Box::new(stream)))
    }
}

#[async_trait]
impl CotTransport for StreamTransport {
    async fn send(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        let mut failures = 0u32;
        loop {
            if self.conn.is_none() {
                match self.connect().await {
                    Ok(conn) => {
                        self.connections += 1;
                        info!(
                            transport = %self.name,
                            connections = self.connections,
                            "TAK connection established"
                        );
                        self.conn = Some(conn);
                    }
                    Err(e) => {
                        warn!(transport = %self.name, error = %e, "TAK connect failed");
                    }
                }
            }

            if let Some(conn) = self.conn.as_mut() {
                match conn.write_event(payload).await {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        warn!(transport = %self.name, error = %e, "TAK write failed, dropping connection");
                        self.conn = None;
                    }
                }
            }

            failures += 1;
            if failures > self.reconnect.max_attempts {
                error!(
                    transport = %self.name,
                    max_attempts = self.reconnect.max_attempts,
                    "TAK reconnection exhausted"
                );
                return Err(TransportError::ReconnectExhausted {
                    addr: self.addr(),
                    attempts: self.reconnect.max_attempts,
                });
            }
            let delay = self.reconnect.delay(failures);
            warn!(
                transport = %self.name,
                attempt = failures,
                max_attempts = self.reconnect.max_attempts,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting to TAK server"
            );
            tokio::time::sleep(delay).await;
        }
    }

    fn transport_name(&self) -> &str {
        &self.name
    }

    async fn close(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.shutdown().await;
            info!(transport = %self.name, "TAK connection closed");
        }
    }
}

// ============================================================================
// UDP Transport
// ============================================================================

/// One datagram per event. No delivery guarantee.
pub struct UdpTransport {
    host: String,
    port: u16,
    name: String,
    socket: Option<UdpSocket>,
}

impl UdpTransport {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            name: format!("udp://{host}:{port}"),
            socket: None,
        }
    }

    async fn open(&self) -> Result<UdpSocket, TransportError> {
        let addr = format!("{}:{}", self.host, self.port);
        let connect_err = |source| TransportError::Connect {
            addr: addr.clone(),
            source,
        };

        let target = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(connect_err)?
            .next()
            .ok_or_else(|| TransportError::Resolve(addr.clone()))?;
        let local: SocketAddr = if target.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };

        let socket = UdpSocket::bind(local).await.map_err(connect_err)?;
        socket.connect(target).await.map_err(connect_err)?;
        Ok(socket)
    }
}

#[async_trait]
impl CotTransport for UdpTransport {
    async fn send(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        if self.socket.is_none() {
            self.socket = Some(self.open().await?);
        }
        if let Some(socket) = &self.socket {
            if let Err(source) = socket.send(payload).await {
                self.socket = None;
                return Err(TransportError::Write {
                    addr: format!("{}:{}", self.host, self.port),
                    source,
                });
            }
        }
        Ok(())
    }

    fn transport_name(&self) -> &str {
        &self.name
    }
}

// ============================================================================
// Stdout Transport (dry run)
// ============================================================================

/// Writes each event to a local writer instead of the network.
pub struct StdoutTransport<W = tokio::io::Stdout> {
    out: W,
}

impl StdoutTransport {
    pub fn new() -> Self {
        Self {
            out: tokio::io::stdout(),
        }
    }
}

impl Default for StdoutTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl<W> StdoutTransport<W> {
    pub fn with_writer(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send + 'static> CotTransport for StdoutTransport<W> {
    async fn send(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        self.out.write_all(payload).await?;
        self.out.flush().await?;
        Ok(())
    }

    fn transport_name(&self) -> &str {
        "stdout"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn fast_reconnect(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
        }
    }

    #[test]
    fn reconnect_delay_doubles_and_caps() {
        let p = ReconnectPolicy::default();
        assert_eq!(p.delay(1), Duration::from_secs(2));
        assert_eq!(p.delay(2), Duration::from_secs(4));
        assert_eq!(p.delay(5), Duration::from_secs(32));
        assert_eq!(p.delay(6), Duration::from_secs(60));
        assert_eq!(p.delay(10), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn tcp_stream_delivers_events_in_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            socket.read_to_end(&mut received).await.unwrap();
            received
        });

        let mut transport = StreamTransport::tcp("127.0.0.1", port, Duration::from_secs(2));
        assert_eq!(transport.transport_name(), format!("tcp://127.0.0.1:{port}"));
        transport.send(b"<event uid=\"a\"/>\n").await.unwrap();
        transport.send(b"<event uid=\"b\"/>\n").await.unwrap();
        assert!(transport.is_connected());
        transport.close().await;

        let received = server.await.unwrap();
        assert_eq!(received, b"<event uid=\"a\"/>\n<event uid=\"b\"/>\n");
    }

    #[tokio::test]
    async fn unreachable_server_exhausts_reconnects() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let mut transport = StreamTransport::tcp("127.0.0.1", port, Duration::from_secs(1))
            .with_reconnect(fast_reconnect(2));
        match transport.send(b"x").await {
            Err(TransportError::ReconnectExhausted { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("expected reconnect exhaustion, got {other:?}"),
        }
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn udp_sends_one_datagram_per_event() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();

        let mut transport = UdpTransport::new("127.0.0.1", port);
        transport.send(b"<event/>").await.unwrap();

        let mut buf = [0u8; 64];
        let n = server.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"<event/>");
    }

    #[tokio::test]
    async fn stdout_transport_writes_payload_verbatim() {
        let mut transport = StdoutTransport::with_writer(Vec::new());
        transport.send(b"one\n").await.unwrap();
        transport.send(b"two\n").await.unwrap();
        assert_eq!(transport.into_inner(), b"one\ntwo\n");
    }
}
