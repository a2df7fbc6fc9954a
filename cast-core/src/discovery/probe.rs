//! Host reachability probes used by segment scans.

use std::io::ErrorKind;
use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;

/// TCP echo service; almost never open, but a refusal still proves the
/// host answered.
pub const ECHO_PORT: u16 = 7;

/// Decides whether a host is worth sending a discovery request to.
#[async_trait]
pub trait Prober: Send + Sync {
    /// Returns within roughly `timeout`. Any failure counts as unreachable.
    async fn probe(&self, ip: Ipv4Addr, timeout: Duration) -> bool;
}

/// Probes by opening a TCP connection. An accepted or actively refused
/// connection both count as reachable; a timeout or any other error does
/// not.
#[derive(Debug, Clone, Copy)]
pub struct TcpProbe {
    port: u16,
}

impl TcpProbe {
    pub fn new(port: u16) -> Self {
        Self { port }
    }
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self::new(ECHO_PORT)
    }
}

#[async_trait]
impl Prober for TcpProbe {
    async fn probe(&self, ip: Ipv4Addr, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, TcpStream::connect((ip, self.port))).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => e.kind() == ErrorKind::ConnectionRefused,
            Err(_) => false,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
