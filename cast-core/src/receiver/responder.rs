use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;

use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::discovery::{MAX_DATAGRAM, encode_reply, is_request};
use crate::error::CastError;
use crate::sync::lock;

const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Answers `CAST_DISCOVER` with `CAST_RESPONSE:<name>`, sent back to the
/// request's source address.
pub struct DiscoveryResponder {
    name: String,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DiscoveryResponder {
    /// Bind `addr` and start answering in the background.
    pub async fn bind(addr: impl ToSocketAddrs, name: impl Into<String>) -> Result<Self, CastError> {
        let name = name.into();
        let socket = UdpSocket::bind(addr).await?;
        socket.set_broadcast(true)?;
        let local_addr = socket.local_addr()?;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(respond(socket, encode_reply(&name), cancel.clone()));

        info!(%local_addr, name = %name, "discovery responder listening");
        Ok(Self {
            name,
            local_addr,
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop answering and close the socket. Idempotent.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = lock(&self.task).take();
        if let Some(task) = task {
            let _ = task.await;
            debug!(local_addr = %self.local_addr, "discovery responder stopped");
        }
    }
}

impl Drop for DiscoveryResponder {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn respond(socket: UdpSocket, reply: Vec<u8>, cancel: CancellationToken) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            r = socket.recv_from(&mut buf) => r,
        };
        match received {
            Ok((len, from)) if is_request(&buf[..len]) => {
                debug!(%from, "discovery request");
                if let Err(e) = socket.send_to(&reply, from).await {
                    warn!(%from, "discovery reply failed: {e}");
                }
            }
            Ok((len, from)) => trace!(%from, len, "ignoring datagram"),
            Err(e) => {
                warn!("discovery responder receive failed: {e}");
                tokio::time::sleep(RECEIVE_ERROR_BACKOFF).await;
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::parse_reply;

    #[tokio::test]
    async fn answers_requests_only() {
        let responder = DiscoveryResponder::bind("127.0.0.1:0", "Bedroom").await.unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        client.send_to(b"hello?", responder.local_addr()).await.unwrap();
        client.send_to(b"CAST_DISCOVER", responder.local_addr()).await.unwrap();

        let mut buf = [0u8; 128];
        let (len, from) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(from, responder.local_addr());
        assert_eq!(parse_reply(&buf[..len]).as_deref(), Some("Bedroom"));

        // Only one reply: the noise datagram went unanswered.
        let extra = tokio::time::timeout(Duration::from_millis(200), client.recv_from(&mut buf)).await;
        assert!(extra.is_err());

        responder.stop().await;
        responder.stop().await;
    }
}
