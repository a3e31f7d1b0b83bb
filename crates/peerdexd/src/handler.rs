//! Applies decoded requests to the peer table.
//!
//! Runs inside the event loop, one request at a time. Each connection is
//! either Unjoined or Joined; only a successful JOIN moves it forward and
//! only losing the connection ends it.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddrV4;

use peerdex_core::config::RegistryConfig;
use peerdex_core::wire::{PeerLocation, Request, SearchReply};
use peerdex_services::{ConnectionId, PeerRecord, PeerTable, TableError, TableLimits};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Unjoined,
    Joined { peer_id: u32 },
}

/// What the connection should do after a request has been applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Nothing to send; keep reading.
    Nothing,
    /// Write this reply, then keep reading.
    Search(SearchReply),
    /// Tear the connection down without replying.
    Disconnect,
}

/// A successfully processed command, rendered as one stdout line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Activity {
    Join {
        peer_id: u32,
    },
    Publish {
        files: Vec<String>,
    },
    Search {
        filename: String,
        found: Option<PeerLocation>,
    },
}

impl fmt::Display for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Activity::Join { peer_id } => write!(f, "JOIN {peer_id}"),
            Activity::Publish { files } => {
                write!(f, "PUBLISH {}", files.len())?;
                for name in files {
                    write!(f, " {name}")?;
                }
                Ok(())
            }
            Activity::Search { filename, found } => match found {
                Some(loc) => write!(f, "SEARCH {filename} {} {}", loc.peer_id, loc.endpoint),
                None => write!(f, "SEARCH {filename} 0 0.0.0.0:0"),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub reply: Reply,
    pub activity: Option<Activity>,
}

impl Outcome {
    fn silent(reply: Reply) -> Self {
        Self {
            reply,
            activity: None,
        }
    }
}

#[derive(Debug)]
struct Session {
    endpoint: SocketAddrV4,
    state: PeerState,
}

/// Owns the peer table and the per-connection state machines.
#[derive(Debug)]
pub struct CommandHandler {
    table: PeerTable,
    sessions: HashMap<ConnectionId, Session>,
    exclude_self_from_search: bool,
}

impl CommandHandler {
    pub fn new(config: &RegistryConfig) -> Self {
        Self {
            table: PeerTable::new(TableLimits::from(config)),
            sessions: HashMap::new(),
            exclude_self_from_search: config.exclude_self_from_search,
        }
    }

    pub fn table(&self) -> &PeerTable {
        &self.table
    }

    /// Open connections, joined or not.
    pub fn connection_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn state(&self, connection: ConnectionId) -> Option<PeerState> {
        self.sessions.get(&connection).map(|s| s.state)
    }

    /// Start tracking a freshly accepted connection.
    pub fn connected(&mut self, connection: ConnectionId, endpoint: SocketAddrV4) {
        self.sessions.insert(
            connection,
            Session {
                endpoint,
                state: PeerState::Unjoined,
            },
        );
    }

    pub fn handle(&mut self, connection: ConnectionId, request: Request) -> Outcome {
        if !self.sessions.contains_key(&connection) {
            tracing::warn!(%connection, "request from untracked connection");
            return Outcome::silent(Reply::Disconnect);
        }
        match request {
            Request::Join { peer_id } => self.join(connection, peer_id),
            Request::Publish { files } => self.publish(connection, files),
            Request::Search { filename } => self.search(connection, filename),
        }
    }

    /// Forget a connection. The only path that deletes peer records.
    pub fn disconnected(&mut self, connection: ConnectionId) -> Option<PeerRecord> {
        self.sessions.remove(&connection);
        self.table.remove(connection)
    }

    fn join(&mut self, connection: ConnectionId, peer_id: u32) -> Outcome {
        let Some(session) = self.sessions.get_mut(&connection) else {
            return Outcome::silent(Reply::Disconnect);
        };

        if let PeerState::Joined { peer_id: current } = session.state {
            tracing::warn!(%connection, current, requested = peer_id, "repeated join ignored");
            return Outcome::silent(Reply::Nothing);
        }

        match self.table.insert(connection, peer_id, session.endpoint) {
            Ok(_) => {
                session.state = PeerState::Joined { peer_id };
                tracing::info!(%connection, peer_id, endpoint = %session.endpoint, "peer joined");
                Outcome {
                    reply: Reply::Nothing,
                    activity: Some(Activity::Join { peer_id }),
                }
            }
            Err(e) => {
                tracing::warn!(%connection, peer_id, error = %e, "join dropped");
                Outcome::silent(Reply::Nothing)
            }
        }
    }

    fn publish(&mut self, connection: ConnectionId, files: Vec<String>) -> Outcome {
        match self.state(connection) {
            Some(PeerState::Joined { .. }) => {}
            _ => {
                tracing::debug!(%connection, count = files.len(), "publish before join ignored");
                return Outcome::silent(Reply::Nothing);
            }
        }

        match self.table.replace_files(connection, files.clone()) {
            Ok(()) => {
                tracing::info!(%connection, count = files.len(), "file list replaced");
                Outcome {
                    reply: Reply::Nothing,
                    activity: Some(Activity::Publish { files }),
                }
            }
            Err(TableError::NotJoined(_)) => {
                tracing::warn!(%connection, "joined connection has no record");
                if let Some(session) = self.sessions.get_mut(&connection) {
                    session.state = PeerState::Unjoined;
                }
                Outcome::silent(Reply::Nothing)
            }
            Err(e) => {
                tracing::warn!(%connection, error = %e, "publish violates table bounds");
                Outcome::silent(Reply::Disconnect)
            }
        }
    }

    fn search(&mut self, connection: ConnectionId, filename: String) -> Outcome {
        let record = if self.exclude_self_from_search {
            self.table.lookup_by_filename_excluding(&filename, connection)
        } else {
            self.table.lookup_by_filename(&filename)
        };
        let found = record.map(|r| PeerLocation {
            peer_id: r.peer_id,
            endpoint: r.endpoint,
        });

        tracing::debug!(%connection, filename = %filename, found = found.is_some(), "search");
        Outcome {
            reply: Reply::Search(SearchReply::from(found)),
            activity: Some(Activity::Search { filename, found }),
        }
    }
}
