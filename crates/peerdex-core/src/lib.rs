//! peerdex-core — wire format, configuration, and the peer-side client.
//! All other peerdex crates depend on this one.

pub mod client;
pub mod config;
pub mod wire;

pub use client::{ClientError, RegistryClient};
pub use wire::{PeerLocation, Request, RequestDecoder, SearchReply, WireError, WireLimits};
