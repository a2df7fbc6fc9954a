//! The discovery service: one UDP socket, a reply listener task and a
//! round timer task.

use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::probe::{Prober, TcpProbe};
use super::segment::{NetworkSegment, broadcast_addresses};
use super::{
    DISCOVER_REQUEST, DiscoveredDevice, DiscoveryConfig, DiscoveryListener, MAX_DATAGRAM,
    ScanTarget, parse_reply,
};
use crate::error::CastError;
use crate::sync::lock;
use crate::task::ProbePool;

/// Pause after an unexpected receive error so a broken socket cannot spin.
const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Finds receivers by broadcast or by segment scan and reports every reply
/// through a [`DiscoveryListener`].
///
/// `start` and `stop` are idempotent and the service can be restarted.
pub struct DiscoveryService {
    config: DiscoveryConfig,
    listener: Arc<dyn DiscoveryListener>,
    prober: Arc<dyn Prober>,
    segment: Arc<Mutex<String>>,
    running: Arc<AtomicBool>,
    active: tokio::sync::Mutex<Option<Active>>,
}

struct Active {
    round: Round,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Everything one discovery round needs; shared by the timer and
/// [`DiscoveryService::discover`].
#[derive(Clone)]
struct Round {
    socket: Arc<UdpSocket>,
    pool: Arc<ProbePool>,
    prober: Arc<dyn Prober>,
    segment: Arc<Mutex<String>>,
    port: u16,
    probe_timeout: Duration,
}

impl DiscoveryService {
    /// A service probing hosts with [`TcpProbe`] in segment mode.
    pub fn new(config: DiscoveryConfig, listener: Arc<dyn DiscoveryListener>) -> Self {
        Self::with_prober(config, listener, Arc::new(TcpProbe::default()))
    }

    pub fn with_prober(
        config: DiscoveryConfig,
        listener: Arc<dyn DiscoveryListener>,
        prober: Arc<dyn Prober>,
    ) -> Self {
        Self {
            config,
            listener,
            prober,
            segment: Arc::new(Mutex::new(String::new())),
            running: Arc::new(AtomicBool::new(false)),
            active: tokio::sync::Mutex::new(None),
        }
    }

    /// Select the scan mode for subsequent rounds. Empty selects broadcast.
    ///
    /// The value is not validated here; check it with
    /// [`is_valid_network_segment`](super::is_valid_network_segment) first.
    /// An invalid segment makes every round log a warning and send nothing.
    pub fn set_network_segment(&self, segment: impl Into<String>) {
        let segment = segment.into();
        debug!(segment = %segment, "network segment set");
        *lock(&self.segment) = segment;
    }

    pub fn network_segment(&self) -> String {
        lock(&self.segment).clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Address of the discovery socket while running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        let active = self.active.lock().await;
        active.as_ref().and_then(|a| a.round.socket.local_addr().ok())
    }

    /// Open the socket and spawn the reply listener and the round timer.
    /// The first round runs immediately. A bind failure is returned and
    /// leaves the service stopped.
    pub async fn start(&self) -> Result<(), CastError> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            return Ok(());
        }

        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
            .await
            .inspect_err(|e| error!("discovery socket bind failed: {e}"))?;
        socket.set_broadcast(true)?;
        let socket = Arc::new(socket);

        let cancel = CancellationToken::new();
        let round = Round {
            socket: socket.clone(),
            pool: Arc::new(ProbePool::new(self.config.scan_workers, cancel.child_token())),
            prober: self.prober.clone(),
            segment: self.segment.clone(),
            port: self.config.port,
            probe_timeout: self.config.probe_timeout,
        };

        self.running.store(true, Ordering::SeqCst);
        let tasks = vec![
            tokio::spawn(listen(
                socket.clone(),
                self.listener.clone(),
                self.running.clone(),
                cancel.clone(),
                self.config.receive_timeout,
            )),
            tokio::spawn(run_rounds(
                round.clone(),
                cancel.clone(),
                self.config.round_interval,
            )),
        ];

        info!(
            local = ?socket.local_addr().ok(),
            port = self.config.port,
            "discovery started"
        );
        *active = Some(Active {
            round,
            cancel,
            tasks,
        });
        Ok(())
    }

    /// Stop the timer, cancel queued and running probes, wait for the
    /// listener to exit and close the socket. No-op when not running.
    pub async fn stop(&self) {
        let Some(active) = self.active.lock().await.take() else {
            return;
        };
        self.running.store(false, Ordering::SeqCst);
        active.cancel.cancel();
        active.round.pool.shutdown().await;

        for task in active.tasks {
            if let Err(e) = task.await {
                if e.is_panic() {
                    error!("discovery task panicked: {e}");
                }
            }
        }
        info!("discovery stopped");
    }

    /// Run one round now, in addition to the timer's. Returns once every
    /// request has been sent (broadcast) or every probe has been queued
    /// (segment).
    pub async fn discover(&self) -> Result<(), CastError> {
        let round = {
            let active = self.active.lock().await;
            active
                .as_ref()
                .map(|a| a.round.clone())
                .ok_or(CastError::NotRunning("discovery service"))?
        };
        round.run().await;
        Ok(())
    }
}

impl Drop for DiscoveryService {
    fn drop(&mut self) {
        if let Some(active) = self.active.get_mut().take() {
            active.cancel.cancel();
            active.round.pool.cancel_all();
            for task in active.tasks {
                task.abort();
            }
        }
    }
}

impl Round {
    async fn run(&self) {
        let segment = lock(&self.segment).clone();
        match ScanTarget::parse(&segment) {
            Ok(ScanTarget::Broadcast) => self.broadcast().await,
            Ok(ScanTarget::Segment(segment)) => self.scan(segment),
            Err(e) => warn!("skipping discovery round: {e}"),
        }
    }

    async fn broadcast(&self) {
        let targets = match broadcast_addresses() {
            Ok(targets) => targets,
            Err(e) => {
                warn!("interface enumeration failed: {e}");
                return;
            }
        };
        if targets.is_empty() {
            debug!("no broadcast-capable interfaces");
        }
        let targets: Vec<SocketAddr> = targets
            .into_iter()
            .map(|ip| SocketAddr::from((ip, self.port)))
            .collect();
        let sent = send_requests(&self.socket, &targets).await;
        debug!(sent, total = targets.len(), "broadcast round done");
    }

    fn scan(&self, segment: NetworkSegment) {
        for ip in segment.hosts() {
            let socket = self.socket.clone();
            let prober = self.prober.clone();
            let port = self.port;
            let timeout = self.probe_timeout;
            self.pool.spawn(async move {
                if prober.probe(ip, timeout).await {
                    trace!(%ip, "host reachable");
                    send_request(&socket, SocketAddr::from((ip, port))).await;
                }
            });
        }
        debug!(%segment, "segment scan queued");
    }
}

/// One request per target. A failed send is logged and the rest still go
/// out. Returns how many were sent.
async fn send_requests(socket: &UdpSocket, targets: &[SocketAddr]) -> usize {
    let mut sent = 0;
    for &dest in targets {
        if send_request(socket, dest).await {
            sent += 1;
        }
    }
    sent
}

async fn send_request(socket: &UdpSocket, dest: SocketAddr) -> bool {
    match socket.send_to(DISCOVER_REQUEST.as_bytes(), dest).await {
        Ok(_) => {
            trace!(%dest, "discovery request sent");
            true
        }
        Err(e) => {
            warn!(%dest, "discovery request failed: {e}");
            false
        }
    }
}

async fn run_rounds(round: Round, cancel: CancellationToken, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => round.run().await,
        }
    }
    debug!("discovery round timer stopped");
}

async fn listen(
    socket: Arc<UdpSocket>,
    listener: Arc<dyn DiscoveryListener>,
    running: Arc<AtomicBool>,
    cancel: CancellationToken,
    receive_timeout: Duration,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            r = tokio::time::timeout(receive_timeout, socket.recv_from(&mut buf)) => r,
        };

        match received {
            // Receive timeout; nothing arrived this second.
            Err(_) => continue,
            Ok(Ok((len, from))) => match parse_reply(&buf[..len]) {
                Some(name) => {
                    info!(name = %name, ip = %from.ip(), "device found");
                    listener.on_device_found(DiscoveredDevice { name, ip: from.ip() });
                }
                None => trace!(%from, len, "ignoring datagram"),
            },
            // ICMP unreachable from a probed host surfaces here on some platforms.
            Ok(Err(e))
                if matches!(e.kind(), ErrorKind::ConnectionReset | ErrorKind::ConnectionRefused) =>
            {
                trace!("discovery receive: {e}");
            }
            Ok(Err(e)) => {
                if running.load(Ordering::SeqCst) {
                    error!("discovery receive failed: {e}");
                }
                tokio::time::sleep(RECEIVE_ERROR_BACKOFF).await;
            }
        }
    }
    debug!("discovery listener stopped");
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    struct Unreachable;

    #[async_trait]
    impl Prober for Unreachable {
        async fn probe(&self, _ip: Ipv4Addr, _timeout: Duration) -> bool {
            false
        }
    }

    fn quiet_service(tx: mpsc::UnboundedSender<DiscoveredDevice>) -> DiscoveryService {
        let config = DiscoveryConfig {
            round_interval: Duration::from_secs(60),
            ..DiscoveryConfig::default()
        };
        let listener = move |d: DiscoveredDevice| {
            let _ = tx.send(d);
        };
        let service = DiscoveryService::with_prober(config, Arc::new(listener), Arc::new(Unreachable));
        service.set_network_segment("127.0.0");
        service
    }

    #[tokio::test]
    async fn stop_without_start_is_noop() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let service = quiet_service(tx);
        service.stop().await;
        service.stop().await;
        assert!(!service.is_running());
        assert!(service.local_addr().await.is_none());
    }

    #[tokio::test]
    async fn discover_requires_start() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let service = quiet_service(tx);
        let err = service.discover().await.unwrap_err();
        assert!(matches!(err, CastError::NotRunning(_)));
    }

    #[tokio::test]
    async fn start_is_idempotent_and_restartable() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let service = quiet_service(tx);

        service.start().await.unwrap();
        let first = service.local_addr().await.unwrap();
        service.start().await.unwrap();
        assert_eq!(service.local_addr().await.unwrap(), first);
        assert!(service.is_running());

        service.stop().await;
        assert!(!service.is_running());
        assert!(service.local_addr().await.is_none());

        service.start().await.unwrap();
        assert!(service.is_running());
        service.discover().await.unwrap();
        service.stop().await;
    }

    #[tokio::test]
    async fn invalid_segment_skips_round() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let service = quiet_service(tx);
        service.set_network_segment("300.1.1");
        service.start().await.unwrap();
        service.discover().await.unwrap();
        assert!(service.is_running());
        service.stop().await;
    }

    #[tokio::test]
    async fn listener_reports_replies_and_ignores_noise() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let service = quiet_service(tx);
        service.start().await.unwrap();
        let port = service.local_addr().await.unwrap().port();

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        peer.send_to(b"hello", target).await.unwrap();
        peer.send_to(&[0xff, 0xfe], target).await.unwrap();
        peer.send_to(b"CAST_RESPONSE:Kitchen", target).await.unwrap();

        let device = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(device.name, "Kitchen");
        assert_eq!(device.ip, std::net::IpAddr::V4(Ipv4Addr::LOCALHOST));

        service.stop().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn requests_reach_every_target_despite_a_failed_send() {
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        // Port 0 is not a valid destination; the send fails.
        let dead = SocketAddr::from((Ipv4Addr::LOCALHOST, 0));
        let targets = [a.local_addr().unwrap(), dead, b.local_addr().unwrap()];

        let sent = send_requests(&sender, &targets).await;
        assert_eq!(sent, 2);

        let mut buf = [0u8; MAX_DATAGRAM];
        for receiver in [&a, &b] {
            let (len, from) = tokio::time::timeout(Duration::from_secs(2), receiver.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(&buf[..len], DISCOVER_REQUEST.as_bytes());
            assert_eq!(from, sender.local_addr().unwrap());
        }
    }

    #[tokio::test]
    async fn broadcast_round_keeps_service_running() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let service = quiet_service(tx);
        service.set_network_segment("");
        service.start().await.unwrap();
        service.discover().await.unwrap();
        assert!(service.is_running());
        service.stop().await;
    }
}
