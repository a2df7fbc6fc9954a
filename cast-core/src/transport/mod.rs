//! Sender-side streaming transport.
//!
//! One [`TransportClient`] owns at most one TCP connection to a receiver.
//! Outbound messages go through a single queue drained by a writer task, so
//! bytes leave in exactly the order they were queued. A reader task
//! dispatches control replies and tears the connection down on EOF, on a
//! peer error message, or on a framing violation.
//!
//! ```text
//!  send_frame ─┐
//!  heartbeat ──┼─► mpsc ─► writer ─► Framed<TcpStream, CastCodec>
//!  handshake ──┘                         │
//!                     listener ◄─ reader ◄┘
//! ```

mod client;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::MAX_FRAME_SIZE;

pub use client::TransportClient;

/// Default receiver TCP port.
pub const DEFAULT_SERVER_PORT: u16 = 8888;

// ── TransportListener ────────────────────────────────────────────

/// Callbacks fired by [`TransportClient`].
///
/// Invoked from runtime tasks; implementations must return quickly and must
/// not block on the client itself.
pub trait TransportListener: Send + Sync {
    fn on_connected(&self) {}

    /// Fired exactly once for every successful `connect`.
    fn on_disconnected(&self) {}

    /// Connect failures, receiver error messages and protocol violations.
    fn on_error(&self, _message: &str) {}
}

/// Listener that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTransportListener;

impl TransportListener for NoopTransportListener {}

// ── VideoParams ──────────────────────────────────────────────────

/// Stream parameters announced in the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoParams {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl Default for VideoParams {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            fps: 30,
        }
    }
}

// ── TransportConfig ──────────────────────────────────────────────

/// Configuration for [`TransportClient`].
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Upper bound for establishing the TCP connection.
    pub connect_timeout: Duration,
    /// Keep-alive period; `None` disables heartbeats.
    pub heartbeat_interval: Option<Duration>,
    /// Largest frame body accepted in either direction.
    pub max_frame_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            heartbeat_interval: Some(Duration::from_secs(5)),
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

// ── ConnectionState ──────────────────────────────────────────────

/// Snapshot of the live connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    pub address: String,
    pub port: u16,
    pub connected: bool,
    /// Parameters sent in the handshake for this connection.
    pub video: VideoParams,
}
