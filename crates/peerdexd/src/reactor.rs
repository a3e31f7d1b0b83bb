//! The registry event loop.
//!
//! One task owns the listener, the peer table (through `CommandHandler`),
//! and the set of live connections. Accepts, connection events, snapshots
//! and shutdown are multiplexed with `select!`; every table mutation happens
//! here, one event at a time.

use std::collections::HashMap;
use std::io::Write;
use std::net::{SocketAddr, SocketAddrV4};
use std::time::Duration;

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use peerdex_core::config::{PeerdexConfig, RegistryConfig};
use peerdex_core::wire::RequestDecoder;
use peerdex_services::ConnectionId;

use crate::connection::{Connection, ConnectionEvent};
use crate::handler::{Activity, CommandHandler};

pub struct Registry {
    listener: TcpListener,
    config: RegistryConfig,
    decoder: RequestDecoder,
    handler: CommandHandler,
    connections: HashMap<ConnectionId, JoinHandle<()>>,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    events_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    next_connection: u64,
}

impl Registry {
    /// Bind the listening socket. Must be called from within a tokio runtime.
    pub fn bind(addr: SocketAddrV4, config: &PeerdexConfig) -> Result<Self> {
        config.registry.validate()?;
        let listener = make_listener(addr, config.network.backlog)
            .with_context(|| format!("failed to listen on {addr}"))?;
        let listener =
            TcpListener::from_std(listener).context("failed to register listener with tokio")?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(Self {
            listener,
            config: config.registry.clone(),
            decoder: RequestDecoder::new(config.registry.wire_limits()),
            handler: CommandHandler::new(&config.registry),
            connections: HashMap::new(),
            events_tx,
            events_rx,
            next_connection: 0,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Run until `shutdown` fires. Open connections are dropped on exit.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let snapshot_secs = self.config.snapshot_interval_secs;
        let mut snapshot = tokio::time::interval(Duration::from_secs(snapshot_secs.max(1)));

        tracing::info!(
            addr = %self.local_addr()?,
            max_peers = self.config.max_peers,
            max_files = self.config.max_files,
            duplicate_ids = ?self.config.duplicate_ids,
            "registry listening"
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("registry shutting down");
                    break;
                }

                accepted = self.listener.accept() => match accepted {
                    Ok((stream, remote)) => self.admit(stream, remote),
                    Err(e) => tracing::warn!(error = %e, "accept failed"),
                },

                Some(event) = self.events_rx.recv() => self.on_event(event),

                _ = snapshot.tick(), if snapshot_secs > 0 => self.log_snapshot(),
            }
        }

        for (_, task) in self.connections.drain() {
            task.abort();
        }
        Ok(())
    }

    fn admit(&mut self, stream: TcpStream, remote: SocketAddr) {
        let endpoint = match remote {
            SocketAddr::V4(v4) => v4,
            SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
                Some(ip) => SocketAddrV4::new(ip, v6.port()),
                None => {
                    tracing::warn!(%remote, "refusing non-IPv4 peer");
                    return;
                }
            },
        };

        let connection = ConnectionId(self.next_connection);
        self.next_connection += 1;

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(%connection, error = %e, "TCP_NODELAY failed");
        }

        self.handler.connected(connection, endpoint);
        let task = tokio::spawn(
            Connection::new(connection, stream, self.decoder, self.events_tx.clone()).run(),
        );
        self.connections.insert(connection, task);

        tracing::debug!(
            %connection,
            remote = %endpoint,
            open = self.connections.len(),
            "connection accepted"
        );
    }

    fn on_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Request {
                connection,
                request,
                reply,
            } => {
                let outcome = self.handler.handle(connection, request);
                if let Some(activity) = &outcome.activity {
                    emit(activity);
                }
                // The task may already be gone; its close event follows.
                let _ = reply.send(outcome.reply);
            }
            ConnectionEvent::Closed { connection, reason } => {
                self.connections.remove(&connection);
                let record = self.handler.disconnected(connection);
                tracing::debug!(
                    %connection,
                    peer_id = ?record.as_ref().map(|r| r.peer_id),
                    %reason,
                    peers = self.handler.table().len(),
                    "connection closed"
                );
            }
        }
    }

    fn log_snapshot(&self) {
        let table = self.handler.table();
        tracing::info!(
            peers = table.len(),
            capacity = table.capacity(),
            connections = self.handler.connection_count(),
            "peer table snapshot"
        );
        for record in table.iter() {
            tracing::info!(
                peer_id = record.peer_id,
                endpoint = %record.endpoint,
                files = record.files.len(),
                joined_secs = record.joined_at.elapsed().as_secs(),
                "  peer"
            );
        }
    }
}

/// Command log line on stdout. A closed stdout is not the registry's problem.
fn emit(activity: &Activity) {
    let mut out = std::io::stdout().lock();
    let _ = writeln!(out, "{activity}");
}

/// IPv4 listening socket with SO_REUSEADDR, ready for tokio.
fn make_listener(addr: SocketAddrV4, backlog: u32) -> Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).context("socket()")?;

    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    socket.set_nonblocking(true).context("set_nonblocking")?;
    socket.bind(&addr.into()).context("bind()")?;
    socket
        .listen(backlog.min(i32::MAX as u32) as i32)
        .context("listen()")?;

    Ok(socket.into())
}
