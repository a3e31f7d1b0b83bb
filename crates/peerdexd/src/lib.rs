//! peerdexd — the peerdex registry daemon.
//!
//! Exposed as a library so the event loop can be embedded and driven from
//! tests; `main.rs` is a thin wrapper around [`Registry`].

pub mod connection;
pub mod handler;
pub mod reactor;

pub use reactor::Registry;
