//! Frame sources.

use super::types::{PixelFormat, RawFrame};
use crate::error::CastError;

/// Produces raw desktop snapshots on demand.
pub trait FrameSource {
    /// Physical resolution of the captured display.
    fn resolution(&self) -> (u32, u32);

    /// Layout of the frames returned by `capture`.
    fn pixel_format(&self) -> PixelFormat;

    /// Grab one frame. Blocks for at most one display refresh.
    fn capture(&mut self) -> Result<RawFrame, CastError>;
}

#[cfg(feature = "desktop")]
pub use self::desktop::DesktopSource;

#[cfg(feature = "desktop")]
mod desktop {
    use display_info::DisplayInfo;
    use tracing::info;
    use xcap::Monitor;

    use super::FrameSource;
    use crate::capture::types::{PixelFormat, RawFrame};
    use crate::error::CastError;

    /// Screen grabber for the primary display.
    pub struct DesktopSource {
        monitor: Monitor,
        width: u32,
        height: u32,
    }

    impl DesktopSource {
        /// Open the primary display, or the first one if none is flagged
        /// primary.
        pub fn primary() -> Result<Self, CastError> {
            let displays = DisplayInfo::all()
                .map_err(|e| CastError::Display(format!("failed to enumerate displays: {e}")))?;
            let display = displays
                .iter()
                .find(|d| d.is_primary)
                .or_else(|| displays.first())
                .ok_or_else(|| CastError::Display("no displays found".into()))?;

            let monitor = Monitor::from_point(display.x, display.y)
                .map_err(|e| CastError::Display(e.to_string()))?;

            info!(
                name = %display.name,
                width = display.width,
                height = display.height,
                "capturing display"
            );

            Ok(Self {
                monitor,
                width: display.width,
                height: display.height,
            })
        }
    }

    impl FrameSource for DesktopSource {
        fn resolution(&self) -> (u32, u32) {
            (self.width, self.height)
        }

        fn pixel_format(&self) -> PixelFormat {
            PixelFormat::Rgba8
        }

        fn capture(&mut self) -> Result<RawFrame, CastError> {
            let image = self
                .monitor
                .capture_image()
                .map_err(|e| CastError::Capture(e.to_string()))?;
            let (width, height) = image.dimensions();
            RawFrame::packed(width, height, PixelFormat::Rgba8, image.into_raw())
        }
    }
}
