//! Receiver side of the protocol.
//!
//! A headless counterpart to the sender: [`DiscoveryResponder`] answers
//! discovery requests and [`CastServer`] accepts cast sessions, acknowledges
//! handshakes, echoes heartbeats and hands every video frame to a
//! [`ReceiverListener`]. The `cast-receiver` binary and the integration
//! tests are built on these.

mod responder;
mod server;

use std::net::SocketAddr;

use bytes::Bytes;

use crate::message::Handshake;

pub use responder::DiscoveryResponder;
pub use server::CastServer;

/// Callbacks from [`CastServer`]. All are invoked from the connection's
/// task; keep them short.
pub trait ReceiverListener: Send + Sync {
    /// A sender completed a valid handshake.
    fn on_session_started(&self, _peer: SocketAddr, _handshake: Handshake) {}

    /// One H.264 access unit arrived.
    fn on_frame(&self, _peer: SocketAddr, _timestamp_ms: u32, _payload: Bytes) {}

    /// The connection of a started session ended.
    fn on_session_ended(&self, _peer: SocketAddr) {}
}

/// Listener that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReceiverListener;

impl ReceiverListener for NoopReceiverListener {}
