//! Timed capture → resize → encode loop.
//!
//! [`CapturePipeline::start`] spawns one OS thread. That thread opens the
//! frame source, resolves [`CaptureParameters`], opens the encoder and
//! reports back before entering the loop, so initialization failures
//! surface as the return value of `start`. The thread owns the source and
//! the encoder; both are dropped when it exits, and [`CapturePipeline::stop`]
//! joins it, so all codec state is gone by the time `stop` returns.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, trace, warn};

use super::clock::{Clock, FramePacer, PACING_GRANULARITY, SystemClock};
use super::encoder::{EncoderSettings, VideoEncoder};
use super::source::FrameSource;
use super::types::EncodedUnit;
use crate::error::CastError;
use crate::sync::lock;
use crate::transport::VideoParams;

/// Consecutive failed grabs after which the display is considered gone.
const MAX_CAPTURE_FAILURES: u32 = 30;

// ── Callbacks & backend ──────────────────────────────────────────

/// Receives pipeline output. Called on the capture thread; keep it short.
pub trait CaptureListener: Send + Sync {
    /// One non-empty encoded unit per successful tick, in capture order.
    fn on_frame_captured(&self, unit: EncodedUnit);

    /// Skipped frames and fatal errors.
    fn on_error(&self, _error: &CastError) {}
}

/// Opens fresh capture resources for every `start`.
pub trait CaptureBackend: Send + Sync {
    fn open_source(&self) -> Result<Box<dyn FrameSource>, CastError>;
    fn open_encoder(&self, settings: EncoderSettings) -> Result<Box<dyn VideoEncoder>, CastError>;
}

/// Primary display grabbed with `xcap`, encoded with libavcodec.
#[cfg(all(feature = "desktop", feature = "ffmpeg"))]
#[derive(Debug, Default, Clone, Copy)]
pub struct DesktopBackend;

#[cfg(all(feature = "desktop", feature = "ffmpeg"))]
impl CaptureBackend for DesktopBackend {
    fn open_source(&self) -> Result<Box<dyn FrameSource>, CastError> {
        Ok(Box::new(super::source::DesktopSource::primary()?))
    }

    fn open_encoder(&self, settings: EncoderSettings) -> Result<Box<dyn VideoEncoder>, CastError> {
        Ok(Box::new(super::encoder::H264Encoder::open(settings)?))
    }
}

// ── Configuration ────────────────────────────────────────────────

/// Caller-supplied capture settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConfig {
    /// Target frames per second.
    pub frame_rate: u32,
    /// Encode at the display's own resolution, ignoring `width`/`height`.
    pub use_native_resolution: bool,
    pub width: u32,
    pub height: u32,
    /// Explicit bit rate; `None` uses the resolution step table.
    pub bitrate: Option<u64>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            frame_rate: 30,
            use_native_resolution: true,
            width: 1920,
            height: 1080,
            bitrate: None,
        }
    }
}

/// Resolved capture and encode geometry for one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureParameters {
    pub capture_width: u32,
    pub capture_height: u32,
    pub encode_width: u32,
    pub encode_height: u32,
    pub frame_rate: u32,
    pub use_native_resolution: bool,
}

impl CaptureParameters {
    /// Combine the configuration with the display's native resolution.
    ///
    /// Encode dimensions are rounded down to even values as 4:2:0 chroma
    /// subsampling requires.
    pub fn resolve(config: &CaptureConfig, native: (u32, u32)) -> Result<Self, CastError> {
        if config.frame_rate == 0 {
            return Err(CastError::InvalidParameters("frame rate must be > 0".into()));
        }
        let (capture_width, capture_height) = native;
        if capture_width == 0 || capture_height == 0 {
            return Err(CastError::Display(format!(
                "display reports {capture_width}x{capture_height}"
            )));
        }

        let (width, height) = if config.use_native_resolution {
            native
        } else {
            (config.width, config.height)
        };
        let (encode_width, encode_height) = (width & !1, height & !1);
        if encode_width == 0 || encode_height == 0 {
            return Err(CastError::InvalidParameters(format!(
                "encode resolution {width}x{height} must be at least 2x2"
            )));
        }

        Ok(Self {
            capture_width,
            capture_height,
            encode_width,
            encode_height,
            frame_rate: config.frame_rate,
            use_native_resolution: config.use_native_resolution,
        })
    }

    pub fn needs_resize(&self) -> bool {
        self.capture_width != self.encode_width || self.capture_height != self.encode_height
    }

    /// Parameters to announce in the transport handshake.
    pub fn video_params(&self) -> VideoParams {
        VideoParams {
            width: self.encode_width,
            height: self.encode_height,
            fps: self.frame_rate,
        }
    }
}

// ── CapturePipeline ──────────────────────────────────────────────

/// Frame source + encoder driven at a fixed cadence on a dedicated thread.
///
/// # Lifetime
///
/// `start` and `stop` are both idempotent and may be called from any
/// thread. A stopped pipeline can be started again; each run opens a new
/// source and encoder through the [`CaptureBackend`].
pub struct CapturePipeline {
    config: CaptureConfig,
    backend: Arc<dyn CaptureBackend>,
    listener: Arc<dyn CaptureListener>,
    clock: Arc<dyn Clock>,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    params: Mutex<Option<CaptureParameters>>,
}

impl CapturePipeline {
    pub fn new(
        config: CaptureConfig,
        backend: Arc<dyn CaptureBackend>,
        listener: Arc<dyn CaptureListener>,
    ) -> Self {
        Self::with_clock(config, backend, listener, Arc::new(SystemClock))
    }

    /// Pipeline paced by a custom clock.
    pub fn with_clock(
        config: CaptureConfig,
        backend: Arc<dyn CaptureBackend>,
        listener: Arc<dyn CaptureListener>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            backend,
            listener,
            clock,
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
            params: Mutex::new(None),
        }
    }

    /// Whether the capture loop is currently running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Parameters of the current or most recent run.
    pub fn parameters(&self) -> Option<CaptureParameters> {
        *lock(&self.params)
    }

    /// Start capturing.
    ///
    /// Blocks until the source and encoder are open. Any initialization
    /// failure is returned and also passed to [`CaptureListener::on_error`];
    /// the pipeline is left stopped and nothing is retried.
    pub fn start(&self) -> Result<CaptureParameters, CastError> {
        let mut worker = lock(&self.worker);
        if worker.is_some() && self.is_running() {
            if let Some(params) = self.parameters() {
                debug!("capture pipeline already running");
                return Ok(params);
            }
        }

        // A previous run that ended on its own leaves a finished thread.
        if let Some(stale) = worker.take() {
            if stale.join().is_err() {
                warn!("previous capture thread panicked");
            }
        }

        self.running.store(true, Ordering::SeqCst);
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let capture_loop = CaptureLoop {
            config: self.config.clone(),
            backend: Arc::clone(&self.backend),
            listener: Arc::clone(&self.listener),
            clock: Arc::clone(&self.clock),
            running: Arc::clone(&self.running),
        };

        let spawned = thread::Builder::new()
            .name("cast-capture".into())
            .spawn(move || capture_loop.run(ready_tx));
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                drop(worker);
                return Err(self.fail_start(CastError::Task(format!(
                    "failed to spawn capture thread: {e}"
                ))));
            }
        };

        let outcome = ready_rx.recv();
        match outcome {
            Ok(Ok(params)) => {
                *lock(&self.params) = Some(params);
                *worker = Some(handle);
                info!(
                    "capture pipeline started: {}x{} -> {}x{} @ {} fps",
                    params.capture_width,
                    params.capture_height,
                    params.encode_width,
                    params.encode_height,
                    params.frame_rate
                );
                Ok(params)
            }
            Ok(Err(e)) => {
                drop(worker);
                let _ = handle.join();
                Err(self.fail_start(e))
            }
            Err(_) => {
                drop(worker);
                let _ = handle.join();
                Err(self.fail_start(CastError::Task(
                    "capture thread exited during initialization".into(),
                )))
            }
        }
    }

    /// Stop capturing and release the source and encoder.
    ///
    /// Safe to call repeatedly, before `start`, or from another thread.
    /// When called from the frame callback itself the loop exits right
    /// after the callback returns.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handle = lock(&self.worker).take();
        let Some(handle) = handle else {
            return;
        };

        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            error!("capture thread panicked");
        }
        info!("capture pipeline stopped");
    }

    fn fail_start(&self, err: CastError) -> CastError {
        self.running.store(false, Ordering::SeqCst);
        error!("capture pipeline failed to start: {err}");
        self.listener.on_error(&err);
        err
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

// ── Capture thread ───────────────────────────────────────────────

type Ready = SyncSender<Result<CaptureParameters, CastError>>;

struct CaptureLoop {
    config: CaptureConfig,
    backend: Arc<dyn CaptureBackend>,
    listener: Arc<dyn CaptureListener>,
    clock: Arc<dyn Clock>,
    running: Arc<AtomicBool>,
}

impl CaptureLoop {
    fn run(self, ready: Ready) {
        let (mut source, mut encoder, params) = match self.open() {
            Ok(opened) => opened,
            Err(e) => {
                let _ = ready.send(Err(e));
                return;
            }
        };
        if ready.send(Ok(params)).is_err() {
            return;
        }

        let mut pacer = FramePacer::new(
            FramePacer::interval_for(params.frame_rate),
            self.clock.now(),
        );
        let mut meter = RateMeter::new(self.clock.now());
        let mut failures = 0u32;

        while self.running.load(Ordering::SeqCst) {
            if !pacer.is_due(self.clock.now()) {
                self.clock.sleep(PACING_GRANULARITY);
                continue;
            }

            match Self::tick(source.as_mut(), encoder.as_mut(), &params) {
                Ok(unit) if unit.is_empty() => {
                    failures = 0;
                    trace!("no encoder output this tick");
                }
                Ok(unit) => {
                    failures = 0;
                    self.listener.on_frame_captured(unit);
                    if let Some(fps) = meter.record(self.clock.now()) {
                        debug!("capture rate {fps:.1} fps");
                    }
                }
                Err(e @ CastError::Capture(_)) => {
                    failures += 1;
                    warn!("frame grab failed ({failures}/{MAX_CAPTURE_FAILURES}): {e}");
                    if failures >= MAX_CAPTURE_FAILURES {
                        error!("giving up after {failures} consecutive capture failures");
                        self.listener.on_error(&e);
                        break;
                    }
                }
                Err(e) => {
                    warn!("skipping frame: {e}");
                    self.listener.on_error(&e);
                }
            }

            pacer.advance();
        }

        self.running.store(false, Ordering::SeqCst);
        debug!("capture loop exited");
    }

    fn open(
        &self,
    ) -> Result<(Box<dyn FrameSource>, Box<dyn VideoEncoder>, CaptureParameters), CastError> {
        let source = self.backend.open_source()?;
        let params = CaptureParameters::resolve(&self.config, source.resolution())?;
        let settings = EncoderSettings::new(
            params.encode_width,
            params.encode_height,
            params.frame_rate,
            source.pixel_format(),
        )
        .with_bitrate(self.config.bitrate);
        let encoder = self.backend.open_encoder(settings)?;
        Ok((source, encoder, params))
    }

    fn tick(
        source: &mut dyn FrameSource,
        encoder: &mut dyn VideoEncoder,
        params: &CaptureParameters,
    ) -> Result<EncodedUnit, CastError> {
        let frame = source.capture()?;
        let frame = if frame.width != params.encode_width || frame.height != params.encode_height
        {
            frame.resize(params.encode_width, params.encode_height)?
        } else {
            frame
        };
        encoder.encode(&frame)
    }
}

// ── RateMeter ────────────────────────────────────────────────────

/// Counts delivered frames and yields the achieved rate once per second.
#[derive(Debug)]
struct RateMeter {
    window_start: Instant,
    frames: u32,
}

impl RateMeter {
    const WINDOW: Duration = Duration::from_secs(1);

    fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            frames: 0,
        }
    }

    fn record(&mut self, now: Instant) -> Option<f64> {
        self.frames += 1;
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < Self::WINDOW {
            return None;
        }
        let fps = f64::from(self.frames) / elapsed.as_secs_f64();
        self.window_start = now;
        self.frames = 0;
        Some(fps)
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::types::{PixelFormat, RawFrame};
    use std::sync::atomic::AtomicUsize;

    struct StaticSource(u32, u32);

    impl FrameSource for StaticSource {
        fn resolution(&self) -> (u32, u32) {
            (self.0, self.1)
        }
        fn pixel_format(&self) -> PixelFormat {
            PixelFormat::Rgba8
        }
        fn capture(&mut self) -> Result<RawFrame, CastError> {
            RawFrame::packed(self.0, self.1, PixelFormat::Rgba8, vec![0; (self.0 * self.1 * 4) as usize])
        }
    }

    struct SizeEncoder(EncoderSettings);

    impl VideoEncoder for SizeEncoder {
        fn encode(&mut self, frame: &RawFrame) -> Result<EncodedUnit, CastError> {
            Ok(EncodedUnit::from(format!("{}x{}", frame.width, frame.height).into_bytes()))
        }
        fn settings(&self) -> &EncoderSettings {
            &self.0
        }
    }

    struct Backend {
        native: (u32, u32),
        fail_encoder: bool,
        opened: AtomicUsize,
    }

    impl CaptureBackend for Backend {
        fn open_source(&self) -> Result<Box<dyn FrameSource>, CastError> {
            Ok(Box::new(StaticSource(self.native.0, self.native.1)))
        }
        fn open_encoder(&self, settings: EncoderSettings) -> Result<Box<dyn VideoEncoder>, CastError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            if self.fail_encoder {
                return Err(CastError::CodecUnavailable("h264"));
            }
            Ok(Box::new(SizeEncoder(settings)))
        }
    }

    #[derive(Default)]
    struct Sink {
        frames: Mutex<Vec<EncodedUnit>>,
        errors: AtomicUsize,
    }

    impl CaptureListener for Sink {
        fn on_frame_captured(&self, unit: EncodedUnit) {
            lock(&self.frames).push(unit);
        }
        fn on_error(&self, _error: &CastError) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn backend(native: (u32, u32), fail_encoder: bool) -> Arc<Backend> {
        Arc::new(Backend {
            native,
            fail_encoder,
            opened: AtomicUsize::new(0),
        })
    }

    #[test]
    fn native_resolution_is_used_by_default() {
        let p = CaptureParameters::resolve(&CaptureConfig::default(), (2560, 1440)).unwrap();
        assert_eq!((p.encode_width, p.encode_height), (2560, 1440));
        assert!(!p.needs_resize());
        assert_eq!(p.video_params().fps, 30);
    }

    #[test]
    fn configured_resolution_needs_resize() {
        let config = CaptureConfig {
            use_native_resolution: false,
            width: 1280,
            height: 720,
            ..CaptureConfig::default()
        };
        let p = CaptureParameters::resolve(&config, (1920, 1080)).unwrap();
        assert_eq!((p.capture_width, p.capture_height), (1920, 1080));
        assert_eq!((p.encode_width, p.encode_height), (1280, 720));
        assert!(p.needs_resize());
    }

    #[test]
    fn odd_dimensions_round_down_to_even() {
        let p = CaptureParameters::resolve(&CaptureConfig::default(), (1366, 769)).unwrap();
        assert_eq!((p.encode_width, p.encode_height), (1366, 768));
    }

    #[test]
    fn zero_configured_size_is_rejected() {
        let config = CaptureConfig {
            use_native_resolution: false,
            width: 0,
            ..CaptureConfig::default()
        };
        assert!(matches!(
            CaptureParameters::resolve(&config, (1920, 1080)),
            Err(CastError::InvalidParameters(_))
        ));
    }

    #[test]
    fn zero_frame_rate_is_rejected() {
        let config = CaptureConfig {
            frame_rate: 0,
            ..CaptureConfig::default()
        };
        assert!(CaptureParameters::resolve(&config, (1920, 1080)).is_err());
    }

    #[test]
    fn stop_before_start_is_harmless() {
        let sink = Arc::new(Sink::default());
        let pipeline = CapturePipeline::new(CaptureConfig::default(), backend((64, 36), false), sink);
        pipeline.stop();
        pipeline.stop();
        assert!(!pipeline.is_running());
        assert!(pipeline.parameters().is_none());
    }

    #[test]
    fn encoder_init_failure_aborts_start() {
        let sink = Arc::new(Sink::default());
        let pipeline = CapturePipeline::new(
            CaptureConfig::default(),
            backend((64, 36), true),
            sink.clone(),
        );
        let err = pipeline.start().unwrap_err();
        assert!(matches!(err, CastError::CodecUnavailable(_)));
        assert_eq!(sink.errors.load(Ordering::SeqCst), 1);
        assert!(!pipeline.is_running());
        pipeline.stop();
    }

    #[test]
    fn frames_are_resized_before_encoding() {
        let sink = Arc::new(Sink::default());
        let config = CaptureConfig {
            use_native_resolution: false,
            width: 32,
            height: 18,
            frame_rate: 60,
            bitrate: None,
        };
        let pipeline = CapturePipeline::new(config, backend((64, 36), false), sink.clone());
        pipeline.start().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while lock(&sink.frames).is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        pipeline.stop();

        let frames = lock(&sink.frames);
        assert!(!frames.is_empty());
        assert_eq!(frames[0].as_bytes(), b"32x18");
    }

    #[test]
    fn start_is_idempotent() {
        let backend = backend((64, 36), false);
        let pipeline = CapturePipeline::new(
            CaptureConfig::default(),
            backend.clone(),
            Arc::new(Sink::default()),
        );
        let first = pipeline.start().unwrap();
        let second = pipeline.start().unwrap();
        assert_eq!(first, second);
        assert_eq!(backend.opened.load(Ordering::SeqCst), 1);
        pipeline.stop();
        assert!(!pipeline.is_running());
    }

    #[test]
    fn rate_meter_reports_once_per_second() {
        let start = Instant::now();
        let mut meter = RateMeter::new(start);
        for i in 1..30 {
            assert!(meter.record(start + Duration::from_millis(i * 33)).is_none());
        }
        let fps = meter.record(start + Duration::from_millis(1000)).unwrap();
        assert!((fps - 30.0).abs() < 0.01);
    }
}
