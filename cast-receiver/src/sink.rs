//! Where received frames go.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use tracing::{info, warn};

use cast_core::{Handshake, ReceiverListener};

/// Counts frames and optionally appends every payload to an Annex-B
/// `.h264` file that ffplay/ffmpeg can open directly.
pub struct StreamSink {
    dump: Option<Mutex<BufWriter<File>>>,
    frames: AtomicU64,
    bytes: AtomicU64,
}

impl StreamSink {
    pub fn new() -> Self {
        Self {
            dump: None,
            frames: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
        }
    }

    /// Sink that also writes the elementary stream to `path`, truncating it.
    pub fn with_dump(path: &Path) -> std::io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            dump: Some(Mutex::new(BufWriter::new(file))),
            frames: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
        })
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    fn flush(&self) {
        if let Some(dump) = &self.dump {
            let mut dump = dump.lock().unwrap_or_else(|e| e.into_inner());
            if let Err(e) = dump.flush() {
                warn!("failed to flush stream dump: {e}");
            }
        }
    }
}

impl Default for StreamSink {
    fn default() -> Self {
        Self::new()
    }
}

impl ReceiverListener for StreamSink {
    fn on_session_started(&self, peer: SocketAddr, handshake: Handshake) {
        info!(
            %peer,
            "casting {}x{} @ {} fps",
            handshake.width, handshake.height, handshake.fps
        );
    }

    fn on_frame(&self, _peer: SocketAddr, _timestamp_ms: u32, payload: Bytes) {
        self.frames.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(payload.len() as u64, Ordering::Relaxed);
        if let Some(dump) = &self.dump {
            let mut dump = dump.lock().unwrap_or_else(|e| e.into_inner());
            if let Err(e) = dump.write_all(&payload) {
                warn!("failed to write stream dump: {e}");
            }
        }
    }

    fn on_session_ended(&self, peer: SocketAddr) {
        self.flush();
        info!(%peer, frames = self.frames(), bytes = self.bytes(), "cast ended");
    }
}

impl Drop for StreamSink {
    fn drop(&mut self) {
        self.flush();
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dump_concatenates_payloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.h264");
        let peer: SocketAddr = "127.0.0.1:5000".parse().unwrap();

        let sink = StreamSink::with_dump(&path).unwrap();
        sink.on_frame(peer, 1, Bytes::from_static(&[0, 0, 0, 1, 0x67]));
        sink.on_frame(peer, 2, Bytes::from_static(&[0, 0, 0, 1, 0x65]));
        sink.on_session_ended(peer);

        assert_eq!(sink.frames(), 2);
        assert_eq!(sink.bytes(), 10);
        assert_eq!(
            std::fs::read(&path).unwrap(),
            vec![0, 0, 0, 1, 0x67, 0, 0, 0, 1, 0x65]
        );
    }

    #[test]
    fn counting_without_dump() {
        let sink = StreamSink::new();
        sink.on_frame("127.0.0.1:1".parse().unwrap(), 0, Bytes::from_static(b"abc"));
        assert_eq!((sink.frames(), sink.bytes()), (1, 3));
    }
}
