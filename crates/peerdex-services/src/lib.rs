//! peerdex-services — registry state.

pub mod peer;

pub use peer::{ConnectionId, PeerRecord, PeerTable, TableError, TableLimits};
