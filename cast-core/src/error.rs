//! Domain-specific error types for the casting core.
//!
//! All fallible operations return `Result<T, CastError>`.
//! Nothing in the core panics on malformed network input; every failure is
//! typed so the owning component can decide whether it is fatal.

use std::time::Duration;
use thiserror::Error;

/// The canonical error type for the casting core.
#[derive(Debug, Error)]
pub enum CastError {
    // ── Protocol Errors ──────────────────────────────────────────
    /// A control message body was shorter than its type requires.
    #[error("truncated {kind} message: need {needed} bytes, got {actual}")]
    Truncated {
        kind: &'static str,
        needed: usize,
        actual: usize,
    },

    /// A numeric value did not map to any known enum variant.
    #[error("unknown {type_name} discriminant: {value:#x}")]
    UnknownVariant { type_name: &'static str, value: u64 },

    /// A message violated protocol rules.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    // ── Framing Errors ───────────────────────────────────────────
    /// A frame exceeded the codec limit, inbound or outbound.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    // ── Connection Errors ────────────────────────────────────────
    /// The TCP/UDP layer reported an error.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// An operation that needs a live connection ran without one.
    #[error("not connected")]
    NotConnected,

    /// An mpsc channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    // ── Capture / Encode Errors ──────────────────────────────────
    /// No display could be found or queried.
    #[error("display unavailable: {0}")]
    Display(String),

    /// Grabbing a frame from the frame source failed.
    #[error("capture failed: {0}")]
    Capture(String),

    /// The requested codec is not compiled into the linked libraries.
    #[error("codec unavailable: {0}")]
    CodecUnavailable(&'static str),

    /// Allocating or opening the encoder failed.
    #[error("encoder initialization failed: {0}")]
    EncoderInit(String),

    /// A single frame failed to encode.
    #[error("encode failed: {0}")]
    Encode(String),

    // ── Discovery Errors ─────────────────────────────────────────
    /// An operation needs a component that has not been started.
    #[error("{0} is not running")]
    NotRunning(&'static str),

    // ── Validation Errors ────────────────────────────────────────
    /// Width, height or frame rate outside the accepted range.
    #[error("invalid video parameters: {0}")]
    InvalidParameters(String),

    /// A network segment string is not three dotted decimal octets.
    #[error("invalid network segment: {0:?}")]
    InvalidSegment(String),

    // ── Task Errors ─────────────────────────────────────────────
    /// A spawned task or thread could not be started or joined.
    #[error("task error: {0}")]
    Task(String),
}

impl CastError {
    /// Whether the error ends the component that raised it, as opposed to
    /// a transient failure that is logged and absorbed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CastError::Display(_)
                | CastError::CodecUnavailable(_)
                | CastError::EncoderInit(_)
                | CastError::InvalidParameters(_)
                | CastError::Task(_)
        )
    }
}

// ── Convenient From implementations ──────────────────────────────

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for CastError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        CastError::ChannelClosed
    }
}

// ── Tests ────────────────────────────────────────────────────────
