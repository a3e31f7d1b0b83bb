//! peerdexd — peerdex registry daemon.
//!
//! Usage: peerdexd <port>

use std::net::SocketAddrV4;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use peerdex_core::config::PeerdexConfig;
use peerdexd::Registry;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // stdout carries the command log; diagnostics go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let Some(port) = parse_port(std::env::args().skip(1)) else {
        eprintln!("Usage: peerdexd <port>");
        std::process::exit(1);
    };

    // Load config
    if let Err(e) = PeerdexConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = PeerdexConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        PeerdexConfig::default()
    });

    let addr = SocketAddrV4::new(config.network.bind_addr, port);
    let registry = Registry::bind(addr, &config).context("registry startup failed")?;

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);
    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    registry.run(shutdown_rx).await
}

/// Exactly one argument, a port number.
fn parse_port(mut args: impl Iterator<Item = String>) -> Option<u16> {
    let port = args.next()?.parse().ok()?;
    match args.next() {
        Some(_) => None,
        None => Some(port),
    }
}
