//! Peer table — who has joined, from where, and what they hold.
//!
//! Records are keyed by the connection they arrived on. A record lives
//! exactly as long as its connection: the registry creates it on JOIN and
//! removes it when the connection goes away.

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddrV4;
use std::time::Instant;

use peerdex_core::config::{DuplicateIdPolicy, RegistryConfig};

/// Stable handle for one accepted connection. Allocated in accept order and
/// never reused, so it doubles as the table's scan order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One joined peer.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    /// Identity the peer announced in its JOIN.
    pub peer_id: u32,

    /// Connection this record belongs to.
    pub connection: ConnectionId,

    /// Most recently published file list. Empty until the first PUBLISH.
    pub files: Vec<String>,

    /// Remote address observed when the connection was accepted.
    /// Only ever handed out in search replies.
    pub endpoint: SocketAddrV4,

    pub joined_at: Instant,
}

impl PeerRecord {
    pub fn holds(&self, filename: &str) -> bool {
        self.files.iter().any(|f| f == filename)
    }
}

/// Bounds enforced by the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableLimits {
    pub max_peers: usize,
    pub max_files: usize,
    /// Includes the terminator, matching the wire block width.
    pub max_filename_len: usize,
    pub duplicate_ids: DuplicateIdPolicy,
}

impl Default for TableLimits {
    fn default() -> Self {
        Self::from(&RegistryConfig::default())
    }
}

impl From<&RegistryConfig> for TableLimits {
    fn from(config: &RegistryConfig) -> Self {
        Self {
            max_peers: config.max_peers,
            max_files: config.max_files,
            max_filename_len: config.max_filename_len,
            duplicate_ids: config.duplicate_ids,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TableError {
    #[error("peer table full ({capacity} peers)")]
    CapacityExceeded { capacity: usize },
    #[error("connection {0} already joined")]
    AlreadyJoined(ConnectionId),
    #[error("peer id {0} already joined on another connection")]
    DuplicatePeerId(u32),
    #[error("connection {0} has not joined")]
    NotJoined(ConnectionId),
    #[error("{count} files exceeds maximum {max}")]
    TooManyFiles { count: usize, max: usize },
    #[error("filename of {len} bytes exceeds maximum {max} including terminator")]
    FilenameTooLong { len: usize, max: usize },
    #[error("empty filename")]
    EmptyFilename,
}

/// The registry's only shared state. Owned by the event loop; never
/// touched from more than one task, so it carries no locks.
#[derive(Debug, Default)]
pub struct PeerTable {
    records: BTreeMap<ConnectionId, PeerRecord>,
    limits: TableLimits,
}

impl PeerTable {
    pub fn new(limits: TableLimits) -> Self {
        Self {
            records: BTreeMap::new(),
            limits,
        }
    }

    pub fn limits(&self) -> &TableLimits {
        &self.limits
    }

    pub fn capacity(&self) -> usize {
        self.limits.max_peers
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records in scan order.
    pub fn iter(&self) -> impl Iterator<Item = &PeerRecord> {
        self.records.values()
    }

    /// Create a record with an empty file list.
    pub fn insert(
        &mut self,
        connection: ConnectionId,
        peer_id: u32,
        endpoint: SocketAddrV4,
    ) -> Result<&PeerRecord, TableError> {
        if self.records.contains_key(&connection) {
            return Err(TableError::AlreadyJoined(connection));
        }
        if self.records.len() >= self.limits.max_peers {
            return Err(TableError::CapacityExceeded {
                capacity: self.limits.max_peers,
            });
        }
        if self.limits.duplicate_ids == DuplicateIdPolicy::Reject
            && self.records.values().any(|r| r.peer_id == peer_id)
        {
            return Err(TableError::DuplicatePeerId(peer_id));
        }

        tracing::debug!(%connection, peer_id, %endpoint, "peer record created");
        Ok(self.records.entry(connection).or_insert(PeerRecord {
            peer_id,
            connection,
            files: Vec::new(),
            endpoint,
            joined_at: Instant::now(),
        }))
    }

    pub fn lookup_by_connection(&self, connection: ConnectionId) -> Option<&PeerRecord> {
        self.records.get(&connection)
    }

    /// First record, in scan order, whose file list contains `filename`.
    pub fn lookup_by_filename(&self, filename: &str) -> Option<&PeerRecord> {
        self.records.values().find(|r| r.holds(filename))
    }

    /// As `lookup_by_filename`, ignoring the record owned by `requester`.
    pub fn lookup_by_filename_excluding(
        &self,
        filename: &str,
        requester: ConnectionId,
    ) -> Option<&PeerRecord> {
        self.records
            .values()
            .find(|r| r.connection != requester && r.holds(filename))
    }

    /// Swap in a new file list. The old list survives any error.
    pub fn replace_files(
        &mut self,
        connection: ConnectionId,
        names: Vec<String>,
    ) -> Result<(), TableError> {
        if names.len() > self.limits.max_files {
            return Err(TableError::TooManyFiles {
                count: names.len(),
                max: self.limits.max_files,
            });
        }
        for name in &names {
            if name.is_empty() {
                return Err(TableError::EmptyFilename);
            }
            if name.len() + 1 > self.limits.max_filename_len {
                return Err(TableError::FilenameTooLong {
                    len: name.len(),
                    max: self.limits.max_filename_len,
                });
            }
        }

        let record = self
            .records
            .get_mut(&connection)
            .ok_or(TableError::NotJoined(connection))?;
        record.files = names;
        Ok(())
    }

    /// Drop the record for `connection`. Absent connections are a no-op.
    pub fn remove(&mut self, connection: ConnectionId) -> Option<PeerRecord> {
        let removed = self.records.remove(&connection);
        if let Some(record) = &removed {
            tracing::debug!(%connection, peer_id = record.peer_id, "peer record removed");
        }
        removed
    }
}
