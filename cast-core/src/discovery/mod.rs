//! Receiver discovery over UDP.
//!
//! The sender shouts `CAST_DISCOVER` at port 8889 and receivers answer
//! `CAST_RESPONSE:<name>` from the same port. The replying address is the
//! receiver's IP.
//!
//! ```text
//!   round timer (every 3 s, first immediate)
//!        │
//!        ├─ broadcast mode ──► one request per interface broadcast address
//!        │
//!        └─ segment mode ───► ProbePool (50 workers)
//!                               └─ probe .1 … .254 (200 ms each)
//!                                     └─ reachable ──► unicast request
//!
//!   reply listener (1 s receive timeout) ──► DiscoveryListener::on_device_found
//! ```
//!
//! The service does not remember what it found. Every round reports every
//! reply; de-duplication is the caller's job.

mod probe;
mod segment;
mod service;

use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use probe::{ECHO_PORT, Prober, TcpProbe};
pub use segment::{
    NetworkSegment, broadcast_addresses, is_valid_network_segment, suggested_segments,
};
pub use service::DiscoveryService;

/// Default UDP port for discovery requests and replies.
pub const DISCOVERY_PORT: u16 = 8889;

/// Request payload.
pub const DISCOVER_REQUEST: &str = "CAST_DISCOVER";

/// Prefix of every reply; the rest of the datagram is the display name.
pub const RESPONSE_PREFIX: &str = "CAST_RESPONSE:";

/// Largest datagram the listener reads. Longer replies are truncated by
/// the socket and will usually fail UTF-8 validation.
pub const MAX_DATAGRAM: usize = 1024;

/// A receiver that answered a discovery request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    pub name: String,
    pub ip: IpAddr,
}

/// Discovery callback. Called from the reply listener task, once per
/// matching reply.
pub trait DiscoveryListener: Send + Sync {
    fn on_device_found(&self, device: DiscoveredDevice);
}

impl<F> DiscoveryListener for F
where
    F: Fn(DiscoveredDevice) + Send + Sync,
{
    fn on_device_found(&self, device: DiscoveredDevice) {
        self(device)
    }
}

/// How a discovery round reaches receivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanTarget {
    /// Every local interface's broadcast address.
    #[default]
    Broadcast,
    /// Probe each host of a /24 and unicast to the ones that answer.
    Segment(NetworkSegment),
}

impl ScanTarget {
    /// Interpret a user-supplied segment string. Empty means broadcast;
    /// anything else must be a valid segment.
    pub fn parse(segment: &str) -> Result<Self, crate::error::CastError> {
        if segment.is_empty() {
            Ok(Self::Broadcast)
        } else {
            segment.parse().map(Self::Segment)
        }
    }
}

/// Timing and sizing knobs for [`DiscoveryService`].
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Port requests are sent to.
    pub port: u16,
    /// Period of the round timer.
    pub round_interval: Duration,
    /// Receive timeout of the reply listener; bounds how long `stop` waits.
    pub receive_timeout: Duration,
    /// Per-host reachability probe timeout in segment mode.
    pub probe_timeout: Duration,
    /// Concurrent probes in segment mode.
    pub scan_workers: usize,
}

impl DiscoveryConfig {
    pub const DEFAULT_ROUND_INTERVAL: Duration = Duration::from_secs(3);
    pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(1);
    pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(200);
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            port: DISCOVERY_PORT,
            round_interval: Self::DEFAULT_ROUND_INTERVAL,
            receive_timeout: Self::DEFAULT_RECEIVE_TIMEOUT,
            probe_timeout: Self::DEFAULT_PROBE_TIMEOUT,
            scan_workers: crate::task::DEFAULT_WORKERS,
        }
    }
}

/// Extract the display name from a reply datagram. Returns `None` for
/// anything that is not UTF-8 or lacks the prefix.
pub fn parse_reply(datagram: &[u8]) -> Option<String> {
    std::str::from_utf8(datagram)
        .ok()?
        .strip_prefix(RESPONSE_PREFIX)
        .map(str::to_owned)
}

/// Build the reply a receiver named `name` sends.
pub fn encode_reply(name: &str) -> Vec<u8> {
    format!("{RESPONSE_PREFIX}{name}").into_bytes()
}

/// Whether a datagram is a discovery request. Matching is exact.
pub fn is_request(datagram: &[u8]) -> bool {
    datagram == DISCOVER_REQUEST.as_bytes()
}

// ── Tests ────────────────────────────────────────────────────────
