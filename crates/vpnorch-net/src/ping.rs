//! Server Ping
//!
//! Single-destination reachability probes over TCP or UDP.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpStream, UdpSocket};
use tracing::debug;

/// Transport used by a probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeTransport {
    /// Send a datagram and wait for any answer
    Udp,
    /// Complete a TCP handshake (also used for TLS entry points)
    Tcp,
}

/// One probe destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    /// Entry IP and port
    pub addr: SocketAddr,
    /// Transport
    pub transport: ProbeTransport,
    /// First datagram for UDP probes
    pub payload: Arc<[u8]>,
}

impl ProbeTarget {
    /// TCP probe
    pub fn tcp(addr: SocketAddr) -> Self {
        Self {
            addr,
            transport: ProbeTransport::Tcp,
            payload: Arc::from(Vec::new()),
        }
    }

    /// UDP probe sending `payload`
    pub fn udp(addr: SocketAddr, payload: impl Into<Arc<[u8]>>) -> Self {
        Self {
            addr,
            transport: ProbeTransport::Udp,
            payload: payload.into(),
        }
    }
}

/// A destination that answered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reachable {
    pub target: ProbeTarget,
    pub latency: Duration,
}

/// Probe errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProbeError {
    #[error("Probe timed out")]
    Timeout,

    #[error("Socket error: {0}")]
    Socket(String),

    #[error("Empty UDP payload")]
    EmptyPayload,
}

/// Sends one probe at a time
#[derive(Debug, Clone)]
pub struct ServerPing {
    timeout: Duration,
}

impl ServerPing {
    /// Create with a per-probe timeout
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Per-probe timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Probe a destination, returning the round-trip latency.
    pub async fn ping(&self, target: &ProbeTarget) -> Result<Duration, ProbeError> {
        let started = Instant::now();
        let probe = async {
            match target.transport {
                ProbeTransport::Tcp => Self::ping_tcp(target.addr).await,
                ProbeTransport::Udp => Self::ping_udp(target.addr, &target.payload).await,
            }
        };

        match tokio::time::timeout(self.timeout, probe).await {
            Ok(Ok(())) => {
                let latency = started.elapsed();
                debug!("{:?} {} answered in {:?}", target.transport, target.addr, latency);
                Ok(latency)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ProbeError::Timeout),
        }
    }

    async fn ping_tcp(addr: SocketAddr) -> Result<(), ProbeError> {
        TcpStream::connect(addr)
            .await
            .map(drop)
            .map_err(|e| ProbeError::Socket(e.to_string()))
    }

    async fn ping_udp(addr: SocketAddr, payload: &[u8]) -> Result<(), ProbeError> {
        if payload.is_empty() {
            return Err(ProbeError::EmptyPayload);
        }

        let bind_addr: SocketAddr = if addr.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| ProbeError::Socket(e.to_string()))?;
        socket
            .connect(addr)
            .await
            .map_err(|e| ProbeError::Socket(e.to_string()))?;
        socket
            .send(payload)
            .await
            .map_err(|e| ProbeError::Socket(e.to_string()))?;

        let mut buf = [0u8; 512];
        socket
            .recv(&mut buf)
            .await
            .map(drop)
            .map_err(|e| ProbeError::Socket(e.to_string()))
    }
}

impl Default for ServerPing {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}
