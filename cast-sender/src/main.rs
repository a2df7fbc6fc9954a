//! Cast sender entry point.
//!
//! ```text
//! cast-sender                          Cast to the first receiver found
//! cast-sender cast --target <ip>       Cast to a known receiver
//! cast-sender discover [--json]        List receivers and exit
//! cast-sender --config <path>          Load a custom config TOML
//! cast-sender --gen-config             Write default config to stdout
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use cast_core::{CaptureBackend, suggested_segments};
use cast_sender::config::CastConfig;
use cast_sender::logging;
use cast_sender::service::{CastSession, discover_devices};

/// How long `cast` without `--target` waits for a receiver to answer.
const TARGET_SEARCH_WINDOW: Duration = Duration::from_secs(10);

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "cast-sender", about = "Stream this desktop to a LAN receiver")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "cast-sender.toml")]
    config: PathBuf,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Look for receivers and print them.
    Discover {
        /// How long to listen for replies.
        #[arg(long, default_value_t = 5)]
        seconds: u64,

        /// Print one JSON object per device instead of plain text.
        #[arg(long)]
        json: bool,
    },
    /// Stream to a receiver.
    Cast {
        /// Receiver address. Without it the first receiver found is used.
        #[arg(long)]
        target: Option<String>,

        /// Receiver TCP port (defaults to `network.server_port`).
        #[arg(long)]
        port: Option<u16>,
    },
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        let text = toml::to_string_pretty(&CastConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    // Load config.
    let (config, outcome) = CastConfig::load(&cli.config);
    logging::init(&config.logging)?;
    outcome.report(&cli.config);

    info!("cast-sender v{}", env!("CARGO_PKG_VERSION"));
    if let Err(e) = config.validate() {
        error!("{e}; suggested segments: {}", suggested_segments().join(", "));
        return Err(e.into());
    }

    match cli.command.unwrap_or(Command::Cast {
        target: None,
        port: None,
    }) {
        Command::Discover { seconds, json } => discover(&config, seconds, json).await,
        Command::Cast { target, port } => cast(&config, target, port).await,
    }
}

async fn discover(
    config: &CastConfig,
    seconds: u64,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut failed = None;
    let found = discover_devices(config, Duration::from_secs(seconds), false, |device| {
        if json {
            match serde_json::to_string(device) {
                Ok(line) => println!("{line}"),
                Err(e) => failed = Some(e),
            }
        } else {
            println!("{}\t{}", device.ip, device.name);
        }
    })
    .await?;
    if let Some(e) = failed {
        return Err(e.into());
    }
    info!("{} receiver(s) found", found.len());
    Ok(())
}

async fn cast(
    config: &CastConfig,
    target: Option<String>,
    port: Option<u16>,
) -> Result<(), Box<dyn std::error::Error>> {
    let host = match target {
        Some(host) => host,
        None => {
            let mode = if config.scan_segment().is_empty() {
                "broadcast"
            } else {
                "segment"
            };
            info!(mode, "searching for a receiver");
            let found = discover_devices(config, TARGET_SEARCH_WINDOW, true, |d| {
                info!("found {} at {}", d.name, d.ip);
            })
            .await?;
            match found.into_iter().next() {
                Some(device) => device.ip.to_string(),
                None => return Err("no receiver answered; pass --target".into()),
            }
        }
    };
    let port = port.unwrap_or(config.network.server_port);

    let session = CastSession::open(config, capture_backend()?, &host, port).await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Ctrl-C received, shutting down"),
        _ = session.ended() => info!("session ended"),
    }
    session.close().await;
    Ok(())
}

#[cfg(all(feature = "desktop", feature = "ffmpeg"))]
fn capture_backend() -> Result<Arc<dyn CaptureBackend>, Box<dyn std::error::Error>> {
    Ok(Arc::new(cast_core::DesktopBackend))
}

#[cfg(not(all(feature = "desktop", feature = "ffmpeg")))]
fn capture_backend() -> Result<Arc<dyn CaptureBackend>, Box<dyn std::error::Error>> {
    Err("built without desktop capture; enable the `desktop` and `ffmpeg` features".into())
}
