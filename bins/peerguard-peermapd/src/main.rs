//! PeerGuard peermap daemon
//!
//! Rendezvous service for peer agents: authenticates sessions, brokers
//! discovery, relays traffic, and persists network metadata across
//! restarts.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use peerguard_peermap::{Config, OidcRegistry, PeerMap, RateLimiterConfig};

/// PeerGuard rendezvous server
#[derive(Parser)]
#[command(name = "peerguard-peermapd")]
#[command(author, version, about)]
struct Cli {
    /// Listen address
    #[arg(short, long, default_value = "127.0.0.1:9987")]
    listen: String,

    /// Symmetric secret key (hex); generated and logged when omitted
    #[arg(long, default_value = "")]
    secret_key: String,

    /// STUN server advertised to peers; repeatable
    #[arg(long = "stun")]
    stuns: Vec<String>,

    /// Network name that skips authentication (testing namespace)
    #[arg(long)]
    public_network: Option<String>,

    /// Network metadata persistence path
    #[arg(long, default_value = "peermap_state.json")]
    state_file: PathBuf,

    /// Per-network rate limit, bytes per second (0 = unlimited)
    #[arg(long, default_value = "0")]
    rate_limit: usize,

    /// Rate limiter burst, bytes
    #[arg(long, default_value = "0")]
    rate_burst: usize,

    /// Secret validity period, seconds
    #[arg(long, default_value = "14400")]
    secret_validity: u64,

    /// Secret rotation period, seconds
    #[arg(long, default_value = "3600")]
    secret_rotation: u64,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level: Level = cli.log_level.parse().unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    let rate_limiter = (cli.rate_limit > 0).then_some(RateLimiterConfig {
        limit: cli.rate_limit,
        burst: cli.rate_burst,
    });
    let cfg = Config {
        listen: cli.listen,
        secret_key: cli.secret_key,
        stuns: cli.stuns,
        public_network: cli.public_network,
        state_file: cli.state_file,
        rate_limiter,
        secret_validity: Duration::from_secs(cli.secret_validity),
        secret_rotation: Duration::from_secs(cli.secret_rotation),
    };

    let peermap = PeerMap::new(cfg, OidcRegistry::new())?;

    let shutdown = peermap.clone();
    tokio::spawn(async move {
        if let Err(err) = wait_for_signal().await {
            error!(%err, "signal handler");
        }
        info!("shutdown requested");
        shutdown.shutdown();
    });

    peermap.serve().await?;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        r = tokio::signal::ctrl_c() => r,
        _ = term.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
