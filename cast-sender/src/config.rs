//! Configuration for the cast sender.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use cast_core::{
    CaptureConfig, CastError, DiscoveryConfig, TransportConfig, is_valid_network_segment,
};

/// Highest frame rate the sender will ask the pipeline for.
pub const MAX_FRAME_RATE: u32 = 60;

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CastConfig {
    /// Capture and encode settings.
    pub video: VideoConfig,
    /// Transport and discovery settings.
    pub network: NetworkConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Capture and encode settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    /// Bit rate in bits/second. 0 picks one from the encode resolution.
    pub bitrate: u64,
    /// Target frames per second, clamped to 1..=60.
    pub frame_rate: u32,
    /// Encode width when `use_native_resolution` is off.
    pub width: u32,
    /// Encode height when `use_native_resolution` is off.
    pub height: u32,
    /// Encode at the display's own resolution.
    pub use_native_resolution: bool,
}

/// Transport and discovery settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// TCP port of the receiver's cast server.
    pub server_port: u16,
    /// UDP port discovery requests are sent to.
    pub discovery_port: u16,
    /// Three-octet prefix to scan, e.g. "192.168.1". Empty = broadcast.
    pub network_segment: String,
    /// Prefer broadcast discovery even when a segment is configured.
    pub use_broadcast: bool,
    /// TCP connect timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Heartbeat period in milliseconds; 0 disables heartbeats.
    pub heartbeat_interval_ms: u64,
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or filter directive: "trace", "debug", "info", "cast_core=debug", ...
    pub level: String,
    /// Optional log file path. If empty, logs to stderr.
    pub file: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            bitrate: 0,
            frame_rate: 30,
            width: 1920,
            height: 1080,
            use_native_resolution: true,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            server_port: cast_core::DEFAULT_SERVER_PORT,
            discovery_port: cast_core::DISCOVERY_PORT,
            network_segment: String::new(),
            use_broadcast: true,
            connect_timeout_ms: 5000,
            heartbeat_interval_ms: 5000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            file: String::new(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

/// Where the loaded values came from. [`CastConfig::load`] runs before
/// logging is set up, so the caller reports this afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Parsed from the file.
    Loaded,
    /// The file could not be read; defaults are in use.
    Missing,
    /// The file did not parse; defaults are in use.
    Invalid(String),
}

impl LoadOutcome {
    /// Log the outcome for `path`.
    pub fn report(&self, path: &Path) {
        match self {
            LoadOutcome::Loaded => tracing::info!("loaded config from {}", path.display()),
            LoadOutcome::Missing => {
                tracing::info!("no config at {}; using defaults", path.display())
            }
            LoadOutcome::Invalid(e) => {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display())
            }
        }
    }
}

impl CastConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> (Self, LoadOutcome) {
        match std::fs::read_to_string(path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => (config, LoadOutcome::Loaded),
                Err(e) => (Self::default(), LoadOutcome::Invalid(e.to_string())),
            },
            Err(_) => (Self::default(), LoadOutcome::Missing),
        }
    }

    /// Persist the current values.
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }

    /// Write the default configuration to a file (for bootstrapping).
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        Self::default().save(path)
    }

    /// Reject settings that would only fail later, at scan time.
    pub fn validate(&self) -> Result<(), CastError> {
        if !is_valid_network_segment(&self.network.network_segment) {
            return Err(CastError::InvalidSegment(self.network.network_segment.clone()));
        }
        Ok(())
    }

    /// Segment handed to discovery; empty selects broadcast mode.
    pub fn scan_segment(&self) -> &str {
        if self.network.use_broadcast {
            ""
        } else {
            &self.network.network_segment
        }
    }

    pub fn to_capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            frame_rate: self.video.frame_rate.clamp(1, MAX_FRAME_RATE),
            use_native_resolution: self.video.use_native_resolution,
            width: self.video.width,
            height: self.video.height,
            bitrate: (self.video.bitrate > 0).then_some(self.video.bitrate),
        }
    }

    pub fn to_transport_config(&self) -> TransportConfig {
        let heartbeat = self.network.heartbeat_interval_ms;
        TransportConfig {
            connect_timeout: Duration::from_millis(self.network.connect_timeout_ms.max(1)),
            heartbeat_interval: (heartbeat > 0).then(|| Duration::from_millis(heartbeat)),
            ..TransportConfig::default()
        }
    }

    pub fn to_discovery_config(&self) -> DiscoveryConfig {
        DiscoveryConfig {
            port: self.network.discovery_port,
            ..DiscoveryConfig::default()
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let cfg = CastConfig::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        assert!(text.contains("server_port = 8888"));
        assert!(text.contains("discovery_port = 8889"));
        assert!(text.contains("frame_rate = 30"));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let cfg: CastConfig = toml::from_str("[video]\nframe_rate = 15\n").unwrap();
        assert_eq!(cfg.video.frame_rate, 15);
        assert_eq!(cfg.video.width, 1920);
        assert_eq!(cfg.network.server_port, 8888);
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cast-sender.toml");

        let mut cfg = CastConfig::default();
        cfg.network.network_segment = "10.0.0".into();
        cfg.network.use_broadcast = false;
        cfg.video.bitrate = 6_000_000;
        cfg.save(&path).unwrap();

        assert_eq!(CastConfig::load(&path), (cfg, LoadOutcome::Loaded));
    }

    #[test]
    fn missing_or_broken_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert_eq!(
            CastConfig::load(&missing),
            (CastConfig::default(), LoadOutcome::Missing)
        );

        let broken = dir.path().join("broken.toml");
        std::fs::write(&broken, "[video\nframe_rate = ").unwrap();
        let (cfg, outcome) = CastConfig::load(&broken);
        assert_eq!(cfg, CastConfig::default());
        assert!(matches!(outcome, LoadOutcome::Invalid(ref e) if !e.is_empty()));
    }

    #[test]
    fn mistyped_value_is_reported_not_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("typo.toml");
        std::fs::write(&path, "[network]\nnetwork_segment = \"10.0.0\"\nserver_port = \"eighty\"\n")
            .unwrap();
        let (cfg, outcome) = CastConfig::load(&path);
        assert_eq!(cfg.network.network_segment, "");
        match outcome {
            LoadOutcome::Invalid(e) => assert!(e.contains("server_port"), "{e}"),
            other => panic!("expected a parse failure, got {other:?}"),
        }
    }

    #[test]
    fn write_default_bootstraps_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("default.toml");
        CastConfig::write_default(&path).unwrap();
        assert_eq!(CastConfig::load(&path).0, CastConfig::default());
    }

    #[test]
    fn frame_rate_is_clamped() {
        let mut cfg = CastConfig::default();
        cfg.video.frame_rate = 120;
        assert_eq!(cfg.to_capture_config().frame_rate, 60);
        cfg.video.frame_rate = 0;
        assert_eq!(cfg.to_capture_config().frame_rate, 1);
    }

    #[test]
    fn zero_bitrate_means_automatic() {
        let mut cfg = CastConfig::default();
        assert_eq!(cfg.to_capture_config().bitrate, None);
        cfg.video.bitrate = 3_000_000;
        assert_eq!(cfg.to_capture_config().bitrate, Some(3_000_000));
    }

    #[test]
    fn zero_heartbeat_disables_it() {
        let mut cfg = CastConfig::default();
        assert_eq!(
            cfg.to_transport_config().heartbeat_interval,
            Some(Duration::from_secs(5))
        );
        cfg.network.heartbeat_interval_ms = 0;
        assert_eq!(cfg.to_transport_config().heartbeat_interval, None);
    }

    #[test]
    fn broadcast_flag_overrides_segment() {
        let mut cfg = CastConfig::default();
        cfg.network.network_segment = "192.168.1".into();
        assert_eq!(cfg.scan_segment(), "");
        cfg.network.use_broadcast = false;
        assert_eq!(cfg.scan_segment(), "192.168.1");
    }

    #[test]
    fn invalid_segment_is_rejected() {
        let mut cfg = CastConfig::default();
        assert!(cfg.validate().is_ok());
        cfg.network.network_segment = "192.168".into();
        assert!(matches!(cfg.validate(), Err(CastError::InvalidSegment(_))));
    }
}
