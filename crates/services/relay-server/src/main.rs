//! Relay server binary entry point
//!
//! Runs the CineSync room relay: participants join rooms over WebSocket, the
//! first joiner hosts, negotiation payloads are routed between peers and host
//! playback actions are stamped with relay time and fanned out.
//!
//! # Usage
//!
//! ```bash
//! # Listen on the default address (0.0.0.0:8080)
//! cargo run -p cinesync-relay-server
//!
//! # Smaller rooms, JSON logs
//! cargo run -p cinesync-relay-server -- \
//!   --bind 127.0.0.1:9000 \
//!   --max-room-size 4 \
//!   --json-logs
//! ```

use cinesync_webrtc::signaling::{RelayServer, RelayServerConfig};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// CineSync relay server
///
/// Room membership, negotiation routing and host playback fan-out.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "0.0.0.0:8080", env = "CINESYNC_RELAY_BIND")]
    bind: SocketAddr,

    /// Participants allowed per room
    #[arg(long, default_value_t = 16, env = "CINESYNC_MAX_ROOM_SIZE")]
    max_room_size: usize,

    /// Largest accepted text frame in bytes
    #[arg(long, default_value_t = 64 * 1024, env = "CINESYNC_MAX_MESSAGE_BYTES")]
    max_message_bytes: usize,

    /// Seconds between room-count log lines (0 disables)
    #[arg(long, default_value_t = 60, env = "CINESYNC_STATS_INTERVAL")]
    stats_interval_secs: u64,

    /// Emit logs as JSON lines
    #[arg(long, default_value_t = false, env = "CINESYNC_JSON_LOGS")]
    json_logs: bool,
}

impl Args {
    fn relay_config(&self) -> RelayServerConfig {
        RelayServerConfig {
            bind_addr: self.bind,
            max_room_size: self.max_room_size,
            max_message_bytes: self.max_message_bytes,
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_handler = Arc::clone(&shutdown_flag);

    ctrlc::set_handler(move || {
        if shutdown_flag_handler.swap(true, Ordering::SeqCst) {
            eprintln!("Shutdown already in progress, forcing exit");
            std::process::exit(0);
        }
        eprintln!("Ctrl+C received, shutting down relay...");

        std::thread::spawn(|| {
            std::thread::sleep(Duration::from_secs(3));
            eprintln!("Graceful shutdown timed out after 3s, forcing exit");
            std::process::exit(0);
        });
    })?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .thread_name("relay-worker")
        .enable_all()
        .build()?;

    runtime.block_on(async_main(args, shutdown_flag))
}

async fn async_main(
    args: Args,
    shutdown_flag: Arc<AtomicBool>,
) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing(args.json_logs);

    let config = args.relay_config();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        bind = %config.bind_addr,
        max_room_size = config.max_room_size,
        max_message_bytes = config.max_message_bytes,
        "CineSync relay starting"
    );

    let relay = RelayServer::new(config).start().await?;
    info!("Relay running at {}. Press Ctrl+C to shutdown.", relay.url());

    let registry = relay.registry();
    let stats_every = Duration::from_secs(args.stats_interval_secs);
    let mut last_stats = tokio::time::Instant::now();

    while !shutdown_flag.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if !stats_every.is_zero() && last_stats.elapsed() >= stats_every {
            info!(rooms = registry.room_count().await, "Relay stats");
            last_stats = tokio::time::Instant::now();
        }
    }

    info!("Shutdown signal received, stopping relay...");
    relay.shutdown().await;
    info!("Relay shut down gracefully");
    Ok(())
}

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
