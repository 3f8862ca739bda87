//! Ad-hoc relay - Lobby server for emulated ad-hoc play
//!
//! Players' emulators log in here, join named groups and learn each other's
//! addresses. Game traffic itself flows directly between the players.
//!
//! # Usage
//!
//! ```bash
//! # Listen on the default port on every interface
//! adhoc-relay
//!
//! # Custom address, drop users after 30 seconds of silence
//! adhoc-relay --bind 127.0.0.1 --port 30000 --timeout 30
//! ```

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use pspnet_core::relay::{RELAY_PORT, RelayServer, server::USER_TIMEOUT};

/// Relay lobby server for ad-hoc network emulation
#[derive(Parser)]
#[command(name = "adhoc-relay")]
#[command(version)]
struct Cli {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// TCP port to listen on
    #[arg(long, default_value_t = RELAY_PORT)]
    port: u16,

    /// Seconds of silence before a user is dropped
    #[arg(long, default_value_t = USER_TIMEOUT.as_secs())]
    timeout: u64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let addr = SocketAddr::new(cli.bind, cli.port);
    let mut server = RelayServer::bind(addr)
        .with_context(|| format!("failed to listen on {addr}"))?
        .with_timeout(Duration::from_secs(cli.timeout));

    tracing::info!(%addr, timeout_s = cli.timeout, "adhoc relay starting");
    let running = AtomicBool::new(true);
    server.run(&running);
    Ok(())
}
