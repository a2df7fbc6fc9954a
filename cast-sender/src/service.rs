//! Sender session logic.
//!
//! Wires the three core components together the way a UI would:
//! discovery picks a receiver, the transport connects to it, and the
//! capture pipeline feeds the transport one encoded unit per frame.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use cast_core::{
    CaptureBackend, CaptureConfig, CaptureListener, CaptureParameters, CapturePipeline, CastError,
    DiscoveredDevice, DiscoveryService, EncodedUnit, TransportClient, TransportListener,
};

use crate::config::CastConfig;

// ── Discovery ────────────────────────────────────────────────────

/// Run discovery for up to `window` and return each receiver once, in the
/// order first seen. With `first_only`, returns as soon as one answers.
/// `on_found` sees every new device as it arrives.
pub async fn discover_devices(
    config: &CastConfig,
    window: Duration,
    first_only: bool,
    mut on_found: impl FnMut(&DiscoveredDevice),
) -> Result<Vec<DiscoveredDevice>, CastError> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let listener = move |device: DiscoveredDevice| {
        let _ = tx.send(device);
    };
    let service = DiscoveryService::new(config.to_discovery_config(), Arc::new(listener));
    service.set_network_segment(config.scan_segment());
    service.start().await?;

    let mut found: Vec<DiscoveredDevice> = Vec::new();
    let deadline = tokio::time::sleep(window);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            next = rx.recv() => {
                let Some(device) = next else { break };
                if found.iter().any(|d| d.ip == device.ip) {
                    continue;
                }
                on_found(&device);
                found.push(device);
                if first_only {
                    break;
                }
            }
        }
    }

    service.stop().await;
    Ok(found)
}

// ── Session ──────────────────────────────────────────────────────

/// Shared by the transport and the pipeline; cancels `ended` when either
/// side gives up.
struct SessionEvents {
    ended: CancellationToken,
}

impl TransportListener for SessionEvents {
    fn on_connected(&self) {
        info!("connected to receiver");
    }

    fn on_disconnected(&self) {
        info!("receiver connection closed");
        self.ended.cancel();
    }

    fn on_error(&self, message: &str) {
        warn!("transport error: {message}");
    }
}

/// Capture callback: hands every encoded unit straight to the transport.
struct FrameForwarder {
    transport: Arc<TransportClient>,
    events: Arc<SessionEvents>,
}

impl CaptureListener for FrameForwarder {
    fn on_frame_captured(&self, unit: EncodedUnit) {
        self.transport.send_frame(unit);
    }

    fn on_error(&self, error: &CastError) {
        if error.is_fatal() || matches!(error, CastError::Capture(_)) {
            error!("capture stopped: {error}");
            self.events.ended.cancel();
        } else {
            warn!("capture: {error}");
        }
    }
}

/// One streaming session to one receiver.
pub struct CastSession {
    transport: Arc<TransportClient>,
    pipeline: CapturePipeline,
    events: Arc<SessionEvents>,
    parameters: CaptureParameters,
}

impl CastSession {
    /// Connect to `host:port` announcing the capture geometry, then start
    /// the pipeline. Nothing is left running when this fails.
    pub async fn open(
        config: &CastConfig,
        backend: Arc<dyn CaptureBackend>,
        host: &str,
        port: u16,
    ) -> Result<Self, CastError> {
        let capture = config.to_capture_config();
        let planned = resolve_parameters(backend.as_ref(), &capture)?;
        info!(
            "streaming {}x{} @ {} fps to {host}:{port}",
            planned.encode_width, planned.encode_height, planned.frame_rate
        );

        let events = Arc::new(SessionEvents {
            ended: CancellationToken::new(),
        });
        let transport = Arc::new(TransportClient::new(
            config.to_transport_config(),
            planned.video_params(),
            events.clone(),
        ));
        transport.connect(host, port).await?;

        let pipeline = CapturePipeline::new(
            capture,
            backend,
            Arc::new(FrameForwarder {
                transport: transport.clone(),
                events: events.clone(),
            }),
        );
        let parameters = match pipeline.start() {
            Ok(p) => p,
            Err(e) => {
                transport.disconnect().await;
                return Err(e);
            }
        };
        if parameters != planned {
            warn!("display changed while connecting; receiver was told {planned:?}");
        }

        Ok(Self {
            transport,
            pipeline,
            events,
            parameters,
        })
    }

    pub fn parameters(&self) -> CaptureParameters {
        self.parameters
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Resolves when the receiver goes away or capture fails for good.
    pub async fn ended(&self) {
        self.events.ended.cancelled().await;
    }

    /// Stop capturing, then close the connection.
    pub async fn close(self) {
        let Self {
            transport,
            pipeline,
            ..
        } = self;
        let joined = tokio::task::spawn_blocking(move || pipeline.stop()).await;
        if let Err(e) = joined {
            error!("capture shutdown failed: {e}");
        }
        transport.disconnect().await;
        info!("session closed");
    }
}

/// Open a source just long enough to learn the display resolution.
fn resolve_parameters(
    backend: &dyn CaptureBackend,
    config: &CaptureConfig,
) -> Result<CaptureParameters, CastError> {
    let native = backend.open_source()?.resolution();
    CaptureParameters::resolve(config, native)
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use cast_core::{
        CastServer, EncoderSettings, FrameSource, Handshake, PixelFormat, RawFrame,
        ReceiverListener, VideoEncoder,
    };
    use std::net::SocketAddr;

    struct Gray;

    impl FrameSource for Gray {
        fn resolution(&self) -> (u32, u32) {
            (64, 48)
        }
        fn pixel_format(&self) -> PixelFormat {
            PixelFormat::Rgb8
        }
        fn capture(&mut self) -> Result<RawFrame, CastError> {
            RawFrame::packed(64, 48, PixelFormat::Rgb8, vec![128; 64 * 48 * 3])
        }
    }

    struct Marker(EncoderSettings);

    impl VideoEncoder for Marker {
        fn encode(&mut self, _frame: &RawFrame) -> Result<EncodedUnit, CastError> {
            Ok(EncodedUnit::from(vec![0, 0, 0, 1, 0x65]))
        }
        fn settings(&self) -> &EncoderSettings {
            &self.0
        }
    }

    struct TestBackend;

    impl CaptureBackend for TestBackend {
        fn open_source(&self) -> Result<Box<dyn FrameSource>, CastError> {
            Ok(Box::new(Gray))
        }
        fn open_encoder(&self, settings: EncoderSettings) -> Result<Box<dyn VideoEncoder>, CastError> {
            Ok(Box::new(Marker(settings)))
        }
    }

    enum Seen {
        Handshake(Handshake),
        Frame,
    }

    struct Collect(mpsc::UnboundedSender<Seen>);

    impl ReceiverListener for Collect {
        fn on_session_started(&self, _peer: SocketAddr, handshake: Handshake) {
            let _ = self.0.send(Seen::Handshake(handshake));
        }
        fn on_frame(&self, _peer: SocketAddr, _ts: u32, _payload: bytes::Bytes) {
            let _ = self.0.send(Seen::Frame);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn session_streams_to_server() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let server = CastServer::bind("127.0.0.1:0", Arc::new(Collect(tx))).await.unwrap();
        let mut config = CastConfig::default();
        config.video.frame_rate = 20;

        let session = CastSession::open(
            &config,
            Arc::new(TestBackend),
            "127.0.0.1",
            server.local_addr().port(),
        )
        .await
        .unwrap();
        assert!(session.is_connected());
        assert_eq!(session.parameters().encode_width, 64);

        let first = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        match first {
            Some(Seen::Handshake(h)) => assert_eq!(h, Handshake::new(64, 48, 20)),
            _ => panic!("handshake must come first"),
        }
        let frame = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert!(matches!(frame, Some(Seen::Frame)));

        session.close().await;
        server.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn session_ends_when_receiver_leaves() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let server = CastServer::bind("127.0.0.1:0", Arc::new(Collect(tx))).await.unwrap();
        let session = CastSession::open(
            &CastConfig::default(),
            Arc::new(TestBackend),
            "127.0.0.1",
            server.local_addr().port(),
        )
        .await
        .unwrap();

        server.stop().await;
        tokio::time::timeout(Duration::from_secs(5), session.ended())
            .await
            .expect("session should notice the receiver leaving");
        session.close().await;
    }

    #[tokio::test]
    async fn failed_connect_leaves_nothing_running() {
        let port = {
            let l = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let result =
            CastSession::open(&CastConfig::default(), Arc::new(TestBackend), "127.0.0.1", port)
                .await;
        assert!(matches!(result, Err(CastError::Connection(_))));
    }
}
