// src/core/reverse_dialer.rs

//! Connects to subs. A sub behind NAT or a restrictive firewall can dial
//! in first and register a socket; the dialer prefers that connection
//! over opening a fresh outbound one.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::{rustls, TlsConnector};

use crate::core::cpu_sharer::CpuSharer;
use crate::core::errors::{HerdError, HerdResult};

/// Either end of a connection usable for sub RPC: an outbound TCP stream or
/// a socket the sub dialed in on. Boxed so both variants share one type
/// without generic parameters leaking into every caller.
pub trait DialedStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> DialedStream for T {}

/// A sub-initiated connection parked for reuse, keyed by hostname.
pub struct ReverseConnection {
    pub stream: Box<dyn DialedStream>,
}

/// Dials subs, preferring a previously-registered reverse connection over
/// opening a new outbound socket.
pub struct ReverseDialer {
    reverse: DashMap<String, ReverseConnection>,
    cpu_sharer: Arc<CpuSharer>,
    connect_timeout: Option<Duration>,
    tls_connector: Option<TlsConnector>,
}

impl ReverseDialer {
    pub fn new(cpu_sharer: Arc<CpuSharer>, connect_timeout: Option<Duration>, tls_connector: Option<TlsConnector>) -> Self {
        ReverseDialer {
            reverse: DashMap::new(),
            cpu_sharer,
            connect_timeout,
            tls_connector,
        }
    }

    /// Registers a connection a sub initiated, available to the next
    /// `dial` for that hostname.
    pub fn register_reverse(&self, hostname: String, stream: Box<dyn DialedStream>) {
        self.reverse.insert(hostname, ReverseConnection { stream });
    }

    /// Returns a connection to `hostname:port`: the registered reverse
    /// connection if one exists, otherwise a fresh outbound TCP (or,
    /// when TLS is configured, TCP+TLS) dial. The CPU budget is charged
    /// for the duration of the handshake only, not for the lifetime of
    /// the resulting connection.
    pub async fn dial(&self, hostname: &str, port: u16) -> HerdResult<Box<dyn DialedStream>> {
        if let Some((_, conn)) = self.reverse.remove(hostname) {
            return Ok(conn.stream);
        }

        let _grant = self.cpu_sharer.grab().await;
        let addr = format!("{hostname}:{port}");
        let connect = TcpStream::connect(&addr);
        let tcp_stream = match self.connect_timeout {
            None => connect
                .await
                .map_err(|e| HerdError::Transient(format!("dial {addr}: {e}")))?,
            Some(d) => tokio::time::timeout(d, connect)
                .await
                .map_err(|_| HerdError::Transient(format!("dial {addr}: timed out after {d:?}")))?
                .map_err(|e| HerdError::Transient(format!("dial {addr}: {e}")))?,
        };

        match &self.tls_connector {
            None => Ok(Box::new(tcp_stream)),
            Some(connector) => {
                let domain = rustls::pki_types::ServerName::try_from(hostname)
                    .map_err(|_| HerdError::Transient(format!("dial {addr}: invalid TLS server name")))?
                    .to_owned();
                let tls_stream = connector
                    .connect(domain, tcp_stream)
                    .await
                    .map_err(|e| HerdError::Transient(format!("dial {addr}: TLS handshake failed: {e}")))?;
                Ok(Box::new(tls_stream))
            }
        }
    }

    pub fn has_reverse_connection(&self, hostname: &str) -> bool {
        self.reverse.contains_key(hostname)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sharer() -> Arc<CpuSharer> {
        Arc::new(CpuSharer::new(1.0))
    }

    #[tokio::test]
    async fn dial_prefers_registered_reverse_connection() {
        let dialer = ReverseDialer::new(sharer(), Some(Duration::from_millis(200)), None);
        let (client, server) = tokio::io::duplex(64);
        dialer.register_reverse("sub1".to_string(), Box::new(server));
        assert!(dialer.has_reverse_connection("sub1"));

        let _stream = dialer.dial("sub1", 0).await.expect("should use reverse connection");
        assert!(!dialer.has_reverse_connection("sub1"));
        drop(client);
    }

    #[tokio::test]
    async fn dial_times_out_on_unreachable_host() {
        let dialer = ReverseDialer::new(sharer(), Some(Duration::from_millis(50)), None);
        // 192.0.2.0/24 is reserved (TEST-NET-1) and guaranteed unroutable.
        let result = dialer.dial("192.0.2.1", 1).await;
        assert!(result.is_err());
    }
}
