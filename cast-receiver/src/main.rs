//! Cast receiver entry point.
//!
//! ```text
//! cast-receiver                         Answer discovery as this host, serve on 8888
//! cast-receiver --name LivingRoomTV     Advertise a custom name
//! cast-receiver --dump out.h264         Save the received stream
//! ```

mod sink;

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cast_core::{CastServer, DEFAULT_SERVER_PORT, DISCOVERY_PORT, DiscoveryResponder};

use crate::sink::StreamSink;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "cast-receiver", about = "Receive a screen cast from the LAN")]
struct Cli {
    /// Name reported to discovering senders.
    #[arg(long, default_value = "cast-receiver")]
    name: String,

    /// TCP port for cast sessions.
    #[arg(long, default_value_t = DEFAULT_SERVER_PORT)]
    port: u16,

    /// UDP port for discovery requests.
    #[arg(long, default_value_t = DISCOVERY_PORT)]
    discovery_port: u16,

    /// Append the received H.264 elementary stream to this file.
    #[arg(long)]
    dump: Option<PathBuf>,

    /// Log level when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("cast-receiver v{}", env!("CARGO_PKG_VERSION"));

    let sink = match &cli.dump {
        Some(path) => {
            info!("dumping stream to {}", path.display());
            StreamSink::with_dump(path)?
        }
        None => StreamSink::new(),
    };
    let sink = Arc::new(sink);

    let server = CastServer::bind((Ipv4Addr::UNSPECIFIED, cli.port), sink.clone()).await?;
    let responder =
        DiscoveryResponder::bind((Ipv4Addr::UNSPECIFIED, cli.discovery_port), cli.name.as_str())
            .await?;

    info!(
        name = %cli.name,
        port = server.local_addr().port(),
        discovery_port = responder.local_addr().port(),
        "ready"
    );

    tokio::signal::ctrl_c().await.ok();
    info!("Ctrl-C received, shutting down");

    responder.stop().await;
    server.stop().await;
    info!(frames = sink.frames(), bytes = sink.bytes(), "receiver stopped");
    Ok(())
}
