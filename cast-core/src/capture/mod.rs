//! Screen capture and H.264 encode pipeline.
//!
//! ```text
//!  FrameSource ──► resize (bilinear, if needed) ──► VideoEncoder ──► CaptureListener
//!        ▲                                                          (on_frame_captured)
//!        └──────────── FramePacer: next_deadline += interval ──────────┘
//! ```
//!
//! - [`types`]: raw frames, pixel formats and encoded units.
//! - [`clock`]: clock abstraction and drift-corrected pacer.
//! - [`source`]: [`FrameSource`] trait and the desktop grabber.
//! - [`encoder`]: bit rate policy, [`VideoEncoder`] trait and the libavcodec encoder.
//! - [`pipeline`]: [`CapturePipeline`], which drives all of the above on its own thread.

pub mod clock;
pub mod encoder;
pub mod pipeline;
pub mod source;
pub mod types;

pub use clock::{Clock, FramePacer, ManualClock, SystemClock};
pub use encoder::{EncoderSettings, VideoEncoder, calculate_bitrate};
pub use pipeline::{CaptureBackend, CaptureConfig, CaptureListener, CaptureParameters, CapturePipeline};
pub use source::FrameSource;
pub use types::{EncodedUnit, PixelFormat, RawFrame};

#[cfg(feature = "ffmpeg")]
pub use encoder::H264Encoder;
#[cfg(all(feature = "desktop", feature = "ffmpeg"))]
pub use pipeline::DesktopBackend;
#[cfg(feature = "desktop")]
pub use source::DesktopSource;
