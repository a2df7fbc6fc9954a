use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::capture::EncodedUnit;
use crate::codec::CastCodec;
use crate::error::CastError;
use crate::message::{Handshake, Message};
use crate::sync::lock;

use super::{ConnectionState, TransportConfig, TransportListener, VideoParams};

type FrameSink = SplitSink<Framed<TcpStream, CastCodec>, Message>;
type FrameStream = SplitStream<Framed<TcpStream, CastCodec>>;

/// How long the writer may spend flushing queued bytes on shutdown.
const CLOSE_GRACE: Duration = Duration::from_millis(500);

// ── Session ──────────────────────────────────────────────────────

/// Everything owned by one established connection.
struct Session {
    address: String,
    port: u16,
    video: VideoParams,
    outbound: mpsc::UnboundedSender<Message>,
    cancel: CancellationToken,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Session {
    /// Mark the session closed and stop its tasks. Returns `true` only for
    /// the first caller, which then owns the disconnect notification.
    fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.cancel.cancel();
        true
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

type SessionSlot = Arc<Mutex<Option<Arc<Session>>>>;

/// Shared by `disconnect` and the background tasks so that whichever side
/// notices the end of the connection first reports it, and only once.
fn teardown(slot: &SessionSlot, session: &Arc<Session>, listener: &dyn TransportListener) {
    {
        let mut current = lock(slot);
        if current.as_ref().is_some_and(|s| Arc::ptr_eq(s, session)) {
            *current = None;
        }
    }
    if session.close() {
        info!(
            address = %session.address,
            port = session.port,
            "disconnected from receiver"
        );
        listener.on_disconnected();
    }
}

// ── TransportClient ──────────────────────────────────────────────

/// Persistent connection to a single receiver.
///
/// `connect` and `disconnect` are async; `send_frame` is synchronous and
/// may be called from any thread, including the capture thread.
pub struct TransportClient {
    config: TransportConfig,
    video: Mutex<VideoParams>,
    listener: Arc<dyn TransportListener>,
    slot: SessionSlot,
    connecting: tokio::sync::Mutex<()>,
}

impl TransportClient {
    pub fn new(
        config: TransportConfig,
        video: VideoParams,
        listener: Arc<dyn TransportListener>,
    ) -> Self {
        Self {
            config,
            video: Mutex::new(video),
            listener,
            slot: Arc::new(Mutex::new(None)),
            connecting: tokio::sync::Mutex::new(()),
        }
    }

    /// Parameters announced by the next handshake. Does not affect a
    /// connection that is already established.
    pub fn set_video_params(&self, video: VideoParams) {
        *lock(&self.video) = video;
    }

    pub fn video_params(&self) -> VideoParams {
        *lock(&self.video)
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.slot).as_ref().is_some_and(|s| !s.is_closed())
    }

    /// Snapshot of the live connection, if any.
    pub fn state(&self) -> Option<ConnectionState> {
        lock(&self.slot).as_ref().map(|s| ConnectionState {
            address: s.address.clone(),
            port: s.port,
            connected: !s.is_closed(),
            video: s.video,
        })
    }

    /// Connect to `host:port` and queue the handshake.
    ///
    /// Returns once the TCP connection is established, or fails after
    /// `connect_timeout`. A no-op when already connected. Failures are
    /// also reported through [`TransportListener::on_error`].
    pub async fn connect(&self, host: &str, port: u16) -> Result<(), CastError> {
        let _guard = self.connecting.lock().await;
        if self.is_connected() {
            debug!(host, port, "already connected");
            return Ok(());
        }

        info!(host, port, "connecting to receiver");
        let stream = match tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect((host, port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(self.connect_failed(host, port, CastError::Connection(e))),
            Err(_) => {
                return Err(self.connect_failed(
                    host,
                    port,
                    CastError::Timeout(self.config.connect_timeout),
                ));
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            warn!("failed to set TCP_NODELAY: {e}");
        }

        let video = self.video_params();
        let codec = CastCodec::with_max_frame_size(self.config.max_frame_size);
        let (sink, frames) = Framed::new(stream, codec).split();
        let (outbound, queue) = mpsc::unbounded_channel();

        // Queued before anything else, so it is the first message on the wire.
        outbound.send(Message::Handshake(Handshake::new(
            video.width,
            video.height,
            video.fps,
        )))?;

        let session = Arc::new(Session {
            address: host.to_string(),
            port,
            video,
            outbound,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });
        *lock(&self.slot) = Some(Arc::clone(&session));

        info!(
            host,
            port,
            width = video.width,
            height = video.height,
            fps = video.fps,
            "connected; handshake queued"
        );
        self.listener.on_connected();

        let mut tasks = vec![
            tokio::spawn(write_loop(
                sink,
                queue,
                Arc::clone(&self.slot),
                Arc::clone(&session),
                Arc::clone(&self.listener),
            )),
            tokio::spawn(read_loop(
                frames,
                Arc::clone(&self.slot),
                Arc::clone(&session),
                Arc::clone(&self.listener),
            )),
        ];
        if let Some(period) = self.config.heartbeat_interval {
            tasks.push(tokio::spawn(heartbeat_loop(Arc::clone(&session), period)));
        }
        *lock(&session.tasks) = tasks;

        Ok(())
    }

    /// Queue a message on the live connection.
    pub fn send(&self, message: Message) -> Result<(), CastError> {
        let slot = lock(&self.slot);
        let session = match slot.as_ref() {
            Some(s) if !s.is_closed() => s,
            _ => return Err(CastError::NotConnected),
        };

        let len = message.encoded_len();
        if len > self.config.max_frame_size {
            return Err(CastError::FrameTooLarge {
                size: len,
                max: self.config.max_frame_size,
            });
        }
        session.outbound.send(message)?;
        Ok(())
    }

    /// Fire-and-forget send of one encoded unit, stamped with the current
    /// wall-clock time. Silently dropped while disconnected.
    pub fn send_frame(&self, unit: EncodedUnit) {
        match self.send(Message::video_frame(unit.into_bytes())) {
            Ok(()) => {}
            Err(CastError::NotConnected) | Err(CastError::ChannelClosed) => {
                trace!("dropping frame: not connected");
            }
            Err(e) => warn!("dropping frame: {e}"),
        }
    }

    /// Close the connection and wait for its tasks to finish.
    ///
    /// Idempotent. Fires `on_disconnected` if the connection was still up.
    pub async fn disconnect(&self) {
        let session = lock(&self.slot).take();
        let Some(session) = session else {
            return;
        };

        teardown(&self.slot, &session, self.listener.as_ref());

        let tasks = std::mem::take(&mut *lock(&session.tasks));
        for task in tasks {
            if let Err(e) = task.await {
                warn!("transport task ended abnormally: {e}");
            }
        }
    }

    fn connect_failed(&self, host: &str, port: u16, err: CastError) -> CastError {
        error!(host, port, "connect failed: {err}");
        self.listener
            .on_error(&format!("failed to connect to {host}:{port}: {err}"));
        err
    }
}

impl Drop for TransportClient {
    fn drop(&mut self) {
        if let Some(session) = lock(&self.slot).take() {
            session.close();
        }
    }
}

// ── Background tasks ─────────────────────────────────────────────

async fn write_loop(
    mut sink: FrameSink,
    mut queue: mpsc::UnboundedReceiver<Message>,
    slot: SessionSlot,
    session: Arc<Session>,
    listener: Arc<dyn TransportListener>,
) {
    loop {
        tokio::select! {
            _ = session.cancel.cancelled() => break,
            next = queue.recv() => {
                let Some(message) = next else { break };
                if let Err(e) = sink.send(message).await {
                    error!("network write error: {e}");
                    listener.on_error(&format!("send failed: {e}"));
                    teardown(&slot, &session, listener.as_ref());
                    break;
                }
            }
        }
    }

    if tokio::time::timeout(CLOSE_GRACE, sink.close()).await.is_err() {
        debug!("writer close timed out");
    }
}

async fn read_loop(
    mut frames: FrameStream,
    slot: SessionSlot,
    session: Arc<Session>,
    listener: Arc<dyn TransportListener>,
) {
    loop {
        let next = tokio::select! {
            _ = session.cancel.cancelled() => break,
            next = frames.next() => next,
        };

        match next {
            Some(Ok(Message::HandshakeAck)) => info!("handshake acknowledged"),
            Some(Ok(Message::Heartbeat)) => trace!("heartbeat acknowledged"),
            Some(Ok(Message::Error(text))) => {
                warn!("receiver reported error: {text}");
                listener.on_error(&text);
                break;
            }
            Some(Ok(Message::Unknown(tag))) => {
                warn!("ignoring unknown message type {tag:#04x}");
            }
            Some(Ok(other)) => {
                debug!("ignoring unexpected {:?} from receiver", other.message_type());
            }
            Some(Err(e)) => {
                error!("protocol error, closing connection: {e}");
                listener.on_error(&e.to_string());
                break;
            }
            None => {
                info!("receiver closed the connection");
                break;
            }
        }
    }

    teardown(&slot, &session, listener.as_ref());
}

async fn heartbeat_loop(session: Arc<Session>, period: Duration) {
    let start = tokio::time::Instant::now() + period;
    let mut interval = tokio::time::interval_at(start, period);
    loop {
        tokio::select! {
            _ = session.cancel.cancelled() => break,
            _ = interval.tick() => {
                if session.outbound.send(Message::Heartbeat).is_err() {
                    break;
                }
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::NoopTransportListener;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counting {
        connected: AtomicUsize,
        disconnected: AtomicUsize,
        errors: AtomicUsize,
    }

    impl TransportListener for Counting {
        fn on_connected(&self) {
            self.connected.fetch_add(1, Ordering::SeqCst);
        }
        fn on_disconnected(&self) {
            self.disconnected.fetch_add(1, Ordering::SeqCst);
        }
        fn on_error(&self, _message: &str) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn client(listener: Arc<dyn TransportListener>) -> TransportClient {
        TransportClient::new(TransportConfig::default(), VideoParams::default(), listener)
    }

    #[tokio::test]
    async fn send_frame_while_disconnected_is_dropped() {
        let c = client(Arc::new(NoopTransportListener));
        assert!(!c.is_connected());
        c.send_frame(EncodedUnit::from(vec![0, 0, 0, 1]));
        assert!(matches!(
            c.send(Message::Heartbeat),
            Err(CastError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn disconnect_without_connect_is_silent() {
        let listener = Arc::new(Counting::default());
        let c = client(listener.clone());
        c.disconnect().await;
        c.disconnect().await;
        assert_eq!(listener.disconnected.load(Ordering::SeqCst), 0);
        assert!(c.state().is_none());
    }

    #[tokio::test]
    async fn refused_connect_reports_error() {
        // Bind then drop to get a port nobody listens on.
        let port = {
            let l = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let listener = Arc::new(Counting::default());
        let c = client(listener.clone());

        let err = c.connect("127.0.0.1", port).await.unwrap_err();
        assert!(matches!(err, CastError::Connection(_)));
        assert_eq!(listener.errors.load(Ordering::SeqCst), 1);
        assert_eq!(listener.connected.load(Ordering::SeqCst), 0);
        assert!(!c.is_connected());
    }

    #[tokio::test]
    async fn video_params_apply_to_next_handshake() {
        let c = client(Arc::new(NoopTransportListener));
        let params = VideoParams {
            width: 1280,
            height: 720,
            fps: 60,
        };
        c.set_video_params(params);
        assert_eq!(c.video_params(), params);
    }
}
