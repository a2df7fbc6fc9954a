use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::ReceiverListener;
use crate::codec::{CastCodec, MAX_FRAME_SIZE};
use crate::error::CastError;
use crate::message::{Handshake, Message, PROTOCOL_VERSION};
use crate::sync::lock;

/// Bound on sending the farewell error before dropping a broken connection.
const ERROR_REPLY_TIMEOUT: Duration = Duration::from_millis(500);

/// TCP server speaking the cast protocol.
///
/// Every accepted connection gets its own task. A valid handshake is
/// acknowledged with an empty handshake message; an invalid one is answered
/// with an error message and the connection stays open. Heartbeats are
/// echoed. Protocol violations get an error reply and the connection is
/// closed.
pub struct CastServer {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CastServer {
    pub async fn bind(
        addr: impl ToSocketAddrs,
        listener: Arc<dyn ReceiverListener>,
    ) -> Result<Self, CastError> {
        Self::bind_with_limit(addr, MAX_FRAME_SIZE, listener).await
    }

    /// Like [`bind`](Self::bind) with a custom inbound frame limit.
    pub async fn bind_with_limit(
        addr: impl ToSocketAddrs,
        max_frame_size: usize,
        listener: Arc<dyn ReceiverListener>,
    ) -> Result<Self, CastError> {
        let socket = TcpListener::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(accept_loop(socket, listener, max_frame_size, cancel.clone()));

        info!(%local_addr, "cast server listening");
        Ok(Self {
            local_addr,
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, close every open connection and wait for their tasks.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = lock(&self.task).take();
        if let Some(task) = task {
            let _ = task.await;
            info!(local_addr = %self.local_addr, "cast server stopped");
        }
    }
}

impl Drop for CastServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn accept_loop(
    socket: TcpListener,
    listener: Arc<dyn ReceiverListener>,
    max_frame_size: usize,
    cancel: CancellationToken,
) {
    let mut sessions = JoinSet::new();
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = socket.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                info!(%peer, "sender connected");
                sessions.spawn(serve(
                    stream,
                    peer,
                    listener.clone(),
                    max_frame_size,
                    cancel.child_token(),
                ));
            }
            Err(e) => {
                error!("accept failed: {e}");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
        while sessions.try_join_next().is_some() {}
    }
    while sessions.join_next().await.is_some() {}
}

fn check_handshake(h: &Handshake) -> Result<(), String> {
    if h.version != PROTOCOL_VERSION {
        return Err(format!("unsupported protocol version {}", h.version));
    }
    if h.width == 0 || h.height == 0 || h.fps == 0 {
        return Err(format!(
            "invalid video parameters {}x{}@{}",
            h.width, h.height, h.fps
        ));
    }
    Ok(())
}

async fn serve(
    stream: TcpStream,
    peer: SocketAddr,
    listener: Arc<dyn ReceiverListener>,
    max_frame_size: usize,
    cancel: CancellationToken,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("failed to set TCP_NODELAY: {e}");
    }
    let mut framed = Framed::new(stream, CastCodec::with_max_frame_size(max_frame_size));
    let mut started = false;
    let mut frames: u64 = 0;

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = framed.next() => next,
        };

        let reply = match next {
            Some(Ok(Message::Handshake(h))) => match check_handshake(&h) {
                Ok(()) => {
                    info!(
                        %peer,
                        width = h.width,
                        height = h.height,
                        fps = h.fps,
                        "handshake accepted"
                    );
                    started = true;
                    listener.on_session_started(peer, h);
                    Some(Message::HandshakeAck)
                }
                Err(reason) => {
                    warn!(%peer, "rejecting handshake: {reason}");
                    Some(Message::Error(reason))
                }
            },
            Some(Ok(Message::VideoFrame {
                timestamp_ms,
                payload,
            })) => {
                frames += 1;
                trace!(%peer, timestamp_ms, len = payload.len(), "video frame");
                listener.on_frame(peer, timestamp_ms, payload);
                None
            }
            Some(Ok(Message::Heartbeat)) => Some(Message::Heartbeat),
            Some(Ok(Message::Error(text))) => {
                warn!(%peer, "sender reported error: {text}");
                None
            }
            Some(Ok(Message::Unknown(tag))) => {
                debug!(%peer, "ignoring unknown message type {tag:#04x}");
                None
            }
            Some(Ok(Message::HandshakeAck)) => {
                debug!(%peer, "ignoring stray handshake ack");
                None
            }
            Some(Err(e)) => {
                warn!(%peer, "protocol error, closing connection: {e}");
                let farewell = framed.send(Message::Error(e.to_string()));
                let _ = tokio::time::timeout(ERROR_REPLY_TIMEOUT, farewell).await;
                break;
            }
            None => break,
        };

        if let Some(reply) = reply {
            if let Err(e) = framed.send(reply).await {
                warn!(%peer, "write failed: {e}");
                break;
            }
        }
    }

    info!(%peer, frames, "sender disconnected");
    if started {
        listener.on_session_ended(peer);
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receiver::NoopReceiverListener;

    #[test]
    fn handshake_validation() {
        assert!(check_handshake(&Handshake::new(1920, 1080, 30)).is_ok());
        assert!(check_handshake(&Handshake::new(0, 1080, 30)).is_err());
        assert!(check_handshake(&Handshake::new(1920, 1080, 0)).is_err());
        let mut h = Handshake::new(1920, 1080, 30);
        h.version = 2;
        assert!(check_handshake(&h).unwrap_err().contains("version 2"));
    }

    #[tokio::test]
    async fn heartbeat_is_echoed() {
        let server = CastServer::bind("127.0.0.1:0", Arc::new(NoopReceiverListener))
            .await
            .unwrap();
        let stream = TcpStream::connect(server.local_addr()).await.unwrap();
        let mut framed = Framed::new(stream, CastCodec::new());

        framed.send(Message::Heartbeat).await.unwrap();
        let echoed = tokio::time::timeout(Duration::from_secs(2), framed.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(echoed, Message::Heartbeat);

        server.stop().await;
        server.stop().await;
    }

    #[tokio::test]
    async fn bad_handshake_gets_error_but_stays_open() {
        let server = CastServer::bind("127.0.0.1:0", Arc::new(NoopReceiverListener))
            .await
            .unwrap();
        let stream = TcpStream::connect(server.local_addr()).await.unwrap();
        let mut framed = Framed::new(stream, CastCodec::new());

        framed
            .send(Message::Handshake(Handshake::new(0, 0, 30)))
            .await
            .unwrap();
        let reply = framed.next().await.unwrap().unwrap();
        assert!(matches!(reply, Message::Error(_)));

        framed
            .send(Message::Handshake(Handshake::new(640, 480, 30)))
            .await
            .unwrap();
        assert_eq!(framed.next().await.unwrap().unwrap(), Message::HandshakeAck);

        server.stop().await;
    }
}
