//! H.264 encoding.
//!
//! The pipeline talks to encoders through [`VideoEncoder`]. With the
//! `ffmpeg` feature, [`H264Encoder`] provides the real implementation on
//! top of libavcodec (libx264 when available).
//!
//! | Setting        | Value                              |
//! |----------------|------------------------------------|
//! | pixel format   | YUV 4:2:0 planar                   |
//! | time base      | 1 / fps                            |
//! | GOP            | 2 × fps (one key frame every 2 s)  |
//! | B-frames       | 0                                  |
//! | preset / tune  | `ultrafast` / `zerolatency`        |
//! | bit rate       | [`calculate_bitrate`] step table   |

use super::types::{EncodedUnit, PixelFormat, RawFrame};
use crate::error::CastError;

// ── Bitrate policy ───────────────────────────────────────────────

/// Target bit rate in bits/second for an encode resolution.
///
/// | pixels up to  | bit rate |
/// |---------------|----------|
/// | 1280 × 720    | 4 Mbps   |
/// | 1920 × 1080   | 8 Mbps   |
/// | 2560 × 1440   | 12 Mbps  |
/// | 3840 × 2160   | 25 Mbps  |
/// | above         | 35 Mbps  |
pub fn calculate_bitrate(width: u32, height: u32) -> u64 {
    let pixels = u64::from(width) * u64::from(height);
    match pixels {
        p if p <= 1280 * 720 => 4_000_000,
        p if p <= 1920 * 1080 => 8_000_000,
        p if p <= 2560 * 1440 => 12_000_000,
        p if p <= 3840 * 2160 => 25_000_000,
        _ => 35_000_000,
    }
}

// ── EncoderSettings ──────────────────────────────────────────────

/// Everything needed to open an encoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bitrate: u64,
    /// Frames between key frames.
    pub gop: u32,
    pub max_b_frames: usize,
    pub preset: &'static str,
    pub tune: &'static str,
    /// Layout of the frames that will be passed to `encode`.
    pub input_format: PixelFormat,
}

impl EncoderSettings {
    /// Low-latency settings for the given encode resolution.
    pub fn new(width: u32, height: u32, fps: u32, input_format: PixelFormat) -> Self {
        Self {
            width,
            height,
            fps,
            bitrate: calculate_bitrate(width, height),
            gop: fps.saturating_mul(2),
            max_b_frames: 0,
            preset: "ultrafast",
            tune: "zerolatency",
            input_format,
        }
    }

    /// Replace the step-table bit rate with an explicit one.
    pub fn with_bitrate(mut self, bitrate: Option<u64>) -> Self {
        if let Some(b) = bitrate.filter(|b| *b > 0) {
            self.bitrate = b;
        }
        self
    }
}

// ── VideoEncoder ─────────────────────────────────────────────────

/// A stateful frame encoder.
///
/// Implementations own all codec resources and release them on drop.
/// They are created and used on the capture thread only, so they need not
/// be `Send`.
pub trait VideoEncoder {
    /// Encode one frame. The result may be empty when the codec buffers
    /// internally.
    fn encode(&mut self, frame: &RawFrame) -> Result<EncodedUnit, CastError>;

    fn settings(&self) -> &EncoderSettings;
}

// ── H264Encoder ──────────────────────────────────────────────────

#[cfg(feature = "ffmpeg")]
pub use self::ffmpeg_impl::H264Encoder;

#[cfg(feature = "ffmpeg")]
mod ffmpeg_impl {
    use ffmpeg_next as ffmpeg;

    use ffmpeg::format::Pixel;
    use ffmpeg::software::scaling;
    use ffmpeg::util::error::EAGAIN;
    use ffmpeg::{Dictionary, Packet, Rational, codec, frame};
    use tracing::{debug, info};

    use super::{EncoderSettings, VideoEncoder};
    use crate::capture::types::{EncodedUnit, PixelFormat, RawFrame};
    use crate::error::CastError;

    fn av_pixel(format: PixelFormat) -> Pixel {
        match format {
            PixelFormat::Bgra8 => Pixel::BGRA,
            PixelFormat::Rgba8 => Pixel::RGBA,
            PixelFormat::Rgb8 => Pixel::RGB24,
        }
    }

    fn init_err(e: ffmpeg::Error) -> CastError {
        CastError::EncoderInit(e.to_string())
    }

    /// libavcodec H.264 encoder with its scratch frames and RGB→YUV converter.
    ///
    /// Construction allocates everything; every field frees itself on
    /// drop, so a failure halfway through `open` releases what was
    /// already created.
    pub struct H264Encoder {
        settings: EncoderSettings,
        encoder: ffmpeg::encoder::Video,
        converter: scaling::Context,
        source: frame::Video,
        target: frame::Video,
        packet: Packet,
        frame_index: i64,
    }

    impl H264Encoder {
        pub fn open(settings: EncoderSettings) -> Result<Self, CastError> {
            ffmpeg::init().map_err(init_err)?;

            let codec = ffmpeg::encoder::find_by_name("libx264")
                .or_else(|| ffmpeg::encoder::find(codec::Id::H264))
                .ok_or(CastError::CodecUnavailable("h264"))?;
            let codec_name = codec.name().to_string();

            let mut video = codec::Context::new_with_codec(codec)
                .encoder()
                .video()
                .map_err(init_err)?;
            video.set_width(settings.width);
            video.set_height(settings.height);
            video.set_format(Pixel::YUV420P);
            video.set_time_base(Rational::new(1, settings.fps as i32));
            video.set_frame_rate(Some(Rational::new(settings.fps as i32, 1)));
            video.set_bit_rate(settings.bitrate as usize);
            video.set_gop(settings.gop);
            video.set_max_b_frames(settings.max_b_frames);

            let mut options = Dictionary::new();
            options.set("preset", settings.preset);
            options.set("tune", settings.tune);
            let encoder = video.open_with(options).map_err(init_err)?;

            let input = av_pixel(settings.input_format);
            let converter = scaling::Context::get(
                input,
                settings.width,
                settings.height,
                Pixel::YUV420P,
                settings.width,
                settings.height,
                scaling::Flags::FAST_BILINEAR,
            )
            .map_err(init_err)?;

            info!(
                codec = %codec_name,
                width = settings.width,
                height = settings.height,
                fps = settings.fps,
                bitrate = settings.bitrate,
                gop = settings.gop,
                "H.264 encoder opened"
            );

            Ok(Self {
                source: frame::Video::new(input, settings.width, settings.height),
                target: frame::Video::new(Pixel::YUV420P, settings.width, settings.height),
                settings,
                encoder,
                converter,
                packet: Packet::empty(),
                frame_index: 0,
            })
        }

        fn load_source(&mut self, frame: &RawFrame) {
            let row_len = frame.width as usize * frame.format.bytes_per_pixel();
            let dst_stride = self.source.stride(0);
            let dst = self.source.data_mut(0);
            for y in 0..frame.height {
                let offset = y as usize * dst_stride;
                dst[offset..offset + row_len].copy_from_slice(frame.row(y));
            }
        }
    }

    impl VideoEncoder for H264Encoder {
        fn encode(&mut self, frame: &RawFrame) -> Result<EncodedUnit, CastError> {
            if frame.width != self.settings.width
                || frame.height != self.settings.height
                || frame.format != self.settings.input_format
            {
                return Err(CastError::Encode(format!(
                    "frame {}x{} {:?} does not match encoder {}x{} {:?}",
                    frame.width,
                    frame.height,
                    frame.format,
                    self.settings.width,
                    self.settings.height,
                    self.settings.input_format
                )));
            }

            self.load_source(frame);
            self.converter
                .run(&self.source, &mut self.target)
                .map_err(|e| CastError::Encode(e.to_string()))?;

            self.target.set_pts(Some(self.frame_index));
            self.frame_index += 1;
            self.encoder
                .send_frame(&self.target)
                .map_err(|e| CastError::Encode(e.to_string()))?;

            let mut out = Vec::new();
            loop {
                match self.encoder.receive_packet(&mut self.packet) {
                    Ok(()) => {
                        if let Some(data) = self.packet.data() {
                            out.extend_from_slice(data);
                        }
                    }
                    Err(ffmpeg::Error::Other { errno }) if errno == EAGAIN => break,
                    Err(ffmpeg::Error::Eof) => break,
                    Err(e) => return Err(CastError::Encode(e.to_string())),
                }
            }

            if out.is_empty() {
                debug!(frame = self.frame_index, "encoder buffered frame");
            }
            Ok(EncodedUnit::from(out))
        }

        fn settings(&self) -> &EncoderSettings {
            &self.settings
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitrate_matches_step_table_at_boundaries() {
        assert_eq!(calculate_bitrate(1280, 720), 4_000_000);
        assert_eq!(calculate_bitrate(1920, 1080), 8_000_000);
        assert_eq!(calculate_bitrate(2560, 1440), 12_000_000);
        assert_eq!(calculate_bitrate(3840, 2160), 25_000_000);
        assert_eq!(calculate_bitrate(5120, 2880), 35_000_000);
    }

    #[test]
    fn bitrate_steps_just_past_boundaries() {
        assert_eq!(calculate_bitrate(1281, 720), 8_000_000);
        assert_eq!(calculate_bitrate(1921, 1080), 12_000_000);
        assert_eq!(calculate_bitrate(2561, 1440), 25_000_000);
        assert_eq!(calculate_bitrate(3841, 2160), 35_000_000);
    }

    #[test]
    fn bitrate_is_monotonic_in_pixel_count() {
        let sizes = [
            (320, 240),
            (640, 480),
            (1280, 720),
            (1366, 768),
            (1600, 900),
            (1920, 1080),
            (1920, 1200),
            (2560, 1440),
            (3440, 1440),
            (3840, 2160),
            (7680, 4320),
        ];
        let mut last = 0;
        for (w, h) in sizes {
            let b = calculate_bitrate(w, h);
            assert!(b >= last, "{w}x{h} gave {b} after {last}");
            last = b;
        }
    }

    #[test]
    fn settings_follow_frame_rate() {
        let s = EncoderSettings::new(1920, 1080, 30, PixelFormat::Bgra8);
        assert_eq!(s.gop, 60);
        assert_eq!(s.max_b_frames, 0);
        assert_eq!(s.bitrate, 8_000_000);
        assert_eq!(s.preset, "ultrafast");
        assert_eq!(s.tune, "zerolatency");
    }

    #[test]
    fn explicit_bitrate_overrides_table() {
        let s = EncoderSettings::new(1280, 720, 30, PixelFormat::Rgba8).with_bitrate(Some(2_500_000));
        assert_eq!(s.bitrate, 2_500_000);
        let s = EncoderSettings::new(1280, 720, 30, PixelFormat::Rgba8).with_bitrate(Some(0));
        assert_eq!(s.bitrate, 4_000_000);
    }
}
