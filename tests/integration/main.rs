//! peerdex integration test harness.
//!
//! Each test starts its own registry in-process on an ephemeral loopback
//! port and talks to it over real TCP with `RegistryClient`. Nothing is
//! shared between tests.
//!
//!   cargo test --test integration
//!
//! Cross-connection effects (one peer's publish or disconnect, another
//! peer's search) are not ordered by the registry, so tests either use a
//! same-connection search as a barrier (`sync`) or poll (`eventually`,
//! `wait_until_gone`).

use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use peerdex_core::config::{PeerdexConfig, RegistryConfig};
use peerdex_core::RegistryClient;
use peerdexd::Registry;

mod policy;
mod registry;

// ── Harness ───────────────────────────────────────────────────────────────────

pub struct TestRegistry {
    pub addr: SocketAddr,
    config: PeerdexConfig,
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<Result<()>>,
}

impl TestRegistry {
    /// Connect a fresh peer using the registry's own wire limits.
    pub async fn client(&self) -> Result<RegistryClient> {
        RegistryClient::connect(self.addr, self.config.registry.wire_limits())
            .await
            .with_context(|| format!("connect to {}", self.addr))
    }

    /// Connect, join as `peer_id`, publish `files`, and wait until the
    /// registry has applied both.
    pub async fn peer(&self, peer_id: u32, files: &[&str]) -> Result<RegistryClient> {
        let mut client = self.client().await?;
        client.join(peer_id).await?;
        client.publish(files).await?;
        sync(&mut client).await?;
        Ok(client)
    }

    pub async fn stop(self) -> Result<()> {
        let _ = self.shutdown.send(());
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .context("registry did not shut down")?
            .context("registry task panicked")?
    }
}

pub async fn start_registry() -> Result<TestRegistry> {
    start_registry_with(RegistryConfig::default()).await
}

pub async fn start_registry_with(registry: RegistryConfig) -> Result<TestRegistry> {
    let mut config = PeerdexConfig::default();
    config.registry = registry;
    config.registry.snapshot_interval_secs = 0;

    let server = Registry::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0), &config)?;
    let addr = server.local_addr()?;
    let (shutdown, shutdown_rx) = broadcast::channel(1);
    let task = tokio::spawn(server.run(shutdown_rx));

    Ok(TestRegistry {
        addr,
        config,
        shutdown,
        task,
    })
}

/// Round trip on `client`'s own connection. When it returns, every request
/// the client sent earlier has been applied.
pub async fn sync(client: &mut RegistryClient) -> Result<()> {
    client.search(".peerdex-sync").await?;
    Ok(())
}

/// Poll `check` until it returns true or `secs` elapse.
pub async fn eventually<F, Fut>(secs: u64, mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(secs);
    loop {
        if check().await? {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("condition not met within {secs}s");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Search from `client` until `filename` is no longer found. Disconnects
/// are applied asynchronously, so this is how tests observe them.
pub async fn wait_until_gone(client: &mut RegistryClient, filename: &str) -> Result<()> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while client.search(filename).await?.is_some() {
        if tokio::time::Instant::now() >= deadline {
            bail!("{filename} still advertised after 5s");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Ok(())
}

/// The endpoint the registry recorded for `client`.
pub fn endpoint_of(client: &RegistryClient) -> Result<SocketAddrV4> {
    match client.local_addr()? {
        SocketAddr::V4(v4) => Ok(v4),
        other => bail!("expected an IPv4 client address, got {other}"),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_registry_starts_and_stops() -> Result<()> {
    let registry = start_registry().await?;
    assert_ne!(registry.addr.port(), 0);
    registry.stop().await
}

#[tokio::test]
async fn test_search_on_empty_registry_is_not_found() -> Result<()> {
    let registry = start_registry().await?;
    let mut client = registry.client().await?;
    assert_eq!(client.search("anything").await?, None);
    registry.stop().await
}
