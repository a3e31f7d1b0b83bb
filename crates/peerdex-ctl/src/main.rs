//! peerdex-ctl — command-line peer for a peerdex registry.

use anyhow::{Context, Result};
use serde::Serialize;

use peerdex_core::config::PeerdexConfig;
use peerdex_core::RegistryClient;

const DEFAULT_REGISTRY: &str = "127.0.0.1:5432";

// ── Output types ──────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct SearchOutput<'a> {
    filename: &'a str,
    found: bool,
    peer_id: u32,
    addr: String,
}

// ── Subcommand handlers ───────────────────────────────────────────────────────

async fn connect(registry: &str) -> Result<RegistryClient> {
    let limits = PeerdexConfig::load()
        .unwrap_or_default()
        .registry
        .wire_limits();
    RegistryClient::connect(registry, limits)
        .await
        .with_context(|| format!("failed to connect to registry at {registry}, is peerdexd running?"))
}

/// Join and publish, then hold the connection: the registry forgets this
/// peer's files the moment it closes.
async fn cmd_announce(registry: &str, peer_id: &str, files: &[&str]) -> Result<()> {
    let peer_id: u32 = peer_id.parse().context("peer id must be a number")?;

    let mut client = connect(registry).await?;
    client.join(peer_id).await.context("join failed")?;
    client.publish(files).await.context("publish failed")?;

    println!("Announced peer {} with {} file(s) from {}", peer_id, files.len(), client.local_addr()?);
    for f in files {
        println!("  {}", f);
    }
    println!("Holding registration, ctrl-c to withdraw.");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => println!("Withdrawn."),
        closed = client.closed() => {
            closed.context("registry connection failed")?;
            anyhow::bail!("registry closed the connection");
        }
    }
    Ok(())
}

async fn cmd_search(registry: &str, filename: &str, json: bool) -> Result<()> {
    let mut client = connect(registry).await?;
    let found = client.search(filename).await.context("search failed")?;

    if json {
        let out = SearchOutput {
            filename,
            found: found.is_some(),
            peer_id: found.map(|l| l.peer_id).unwrap_or(0),
            addr: found
                .map(|l| l.endpoint.to_string())
                .unwrap_or_else(|| "0.0.0.0:0".into()),
        };
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    match found {
        Some(loc) => println!("{} is held by peer {} at {}", filename, loc.peer_id, loc.endpoint),
        None => println!("{} not found", filename),
    }
    Ok(())
}

fn print_usage() {
    println!("Usage: peerdex-ctl [--registry <host:port>] <command>");
    println!();
    println!("Commands:");
    println!("  announce <peer_id> <file>...   Join, publish files, hold until ctrl-c");
    println!("  search <file> [--json]         Find a peer holding a file");
    println!();
    println!("Options:");
    println!("  --registry <host:port>   Registry address (default: {})", DEFAULT_REGISTRY);
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    // Parse --registry and --json options
    let mut registry = DEFAULT_REGISTRY.to_string();
    let mut json = false;
    let mut remaining: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--registry" => {
                i += 1;
                registry = args.get(i).context("--registry requires a value")?.clone();
            }
            "--json" => json = true,
            other => remaining.push(other),
        }
        i += 1;
    }

    match remaining.as_slice() {
        ["announce", peer_id, files @ ..] if !files.is_empty() => {
            cmd_announce(&registry, peer_id, files).await
        }
        ["search", filename]               => cmd_search(&registry, filename, json).await,
        ["help"] | ["--help"] | ["-h"]     => { print_usage(); Ok(()) }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}
