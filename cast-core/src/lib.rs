//! # cast-core
//!
//! Core library for LAN screen casting.
//!
//! This crate contains:
//! - **Capture**: `CapturePipeline` pacing desktop snapshots through an H.264 encoder
//! - **Codec**: `CastCodec`, length-prefixed framing for `tokio_util`
//! - **Messages**: `Message`, `Handshake` and the wire type bytes
//! - **Transport**: `TransportClient`, a persistent connection with heartbeat
//! - **Discovery**: `DiscoveryService`, broadcast or segment-scan receiver lookup
//! - **Receiver**: `DiscoveryResponder` and `CastServer` for the other end
//! - **Task**: `ProbePool`, bounded concurrency for segment scans
//! - **Error**: `CastError`, a typed `thiserror`-based error hierarchy

pub mod capture;
pub mod codec;
pub mod discovery;
pub mod error;
pub mod message;
pub mod receiver;
pub mod task;
pub mod transport;

mod sync;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use capture::{
    CaptureBackend, CaptureConfig, CaptureListener, CaptureParameters, CapturePipeline, Clock,
    EncodedUnit, EncoderSettings, FramePacer, FrameSource, ManualClock, PixelFormat, RawFrame,
    SystemClock, VideoEncoder, calculate_bitrate,
};
pub use codec::{CastCodec, MAX_FRAME_SIZE};
pub use discovery::{
    DISCOVERY_PORT, DiscoveredDevice, DiscoveryConfig, DiscoveryListener, DiscoveryService,
    NetworkSegment, Prober, ScanTarget, TcpProbe, is_valid_network_segment, suggested_segments,
};
pub use error::CastError;
pub use message::{Handshake, Message, MessageType, PROTOCOL_VERSION};
pub use receiver::{CastServer, DiscoveryResponder, NoopReceiverListener, ReceiverListener};
pub use task::ProbePool;
pub use transport::{
    ConnectionState, DEFAULT_SERVER_PORT, NoopTransportListener, TransportClient,
    TransportConfig, TransportListener, VideoParams,
};

#[cfg(all(feature = "desktop", feature = "ffmpeg"))]
pub use capture::DesktopBackend;
