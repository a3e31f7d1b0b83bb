//! Configuration system for peerdex.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $PEERDEX_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/peerdex/config.toml
//!   3. ~/.config/peerdex/config.toml
//!
//! The listening port is not part of the file; it always comes from the
//! daemon's command line.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::wire::{
    WireLimits, DEFAULT_MAX_FILENAME_LEN, DEFAULT_MAX_FILES, DEFAULT_MAX_MESSAGE_BYTES,
    PUBLISH_HEADER_LEN,
};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerdexConfig {
    pub network: NetworkConfig,
    pub registry: RegistryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// IPv4 address the registry listens on.
    pub bind_addr: Ipv4Addr,
    /// Pending-connection backlog passed to listen(2).
    pub backlog: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Peer table capacity. Joins beyond it are dropped.
    pub max_peers: usize,
    /// Files accepted per PUBLISH.
    pub max_files: usize,
    /// PUBLISH block width and SEARCH name bound, terminator included.
    pub max_filename_len: usize,
    /// Ceiling on the size of a single request.
    pub max_message_bytes: usize,
    /// What to do when a JOIN reuses an id another live peer holds.
    pub duplicate_ids: DuplicateIdPolicy,
    /// Skip the requester's own record when answering its SEARCH.
    pub exclude_self_from_search: bool,
    /// Log a peer table snapshot every N seconds. 0 = never.
    pub snapshot_interval_secs: u64,
}

/// Policy for two live connections joining with the same peer id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicateIdPolicy {
    /// Both records live side by side, keyed by connection.
    #[default]
    Coexist,
    /// The later join is dropped.
    Reject,
}

impl std::str::FromStr for DuplicateIdPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "coexist" => Ok(DuplicateIdPolicy::Coexist),
            "reject" => Ok(DuplicateIdPolicy::Reject),
            other => Err(ConfigError::Invalid(format!(
                "unknown duplicate id policy: {other}"
            ))),
        }
    }
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: Ipv4Addr::UNSPECIFIED,
            backlog: 10,
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_peers: 10,
            max_files: DEFAULT_MAX_FILES,
            max_filename_len: DEFAULT_MAX_FILENAME_LEN,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            duplicate_ids: DuplicateIdPolicy::Coexist,
            exclude_self_from_search: false,
            snapshot_interval_secs: 0,
        }
    }
}

impl RegistryConfig {
    /// Protocol bounds derived from this config.
    pub fn wire_limits(&self) -> WireLimits {
        WireLimits {
            max_files: self.max_files,
            max_filename_len: self.max_filename_len,
            max_message_bytes: self.max_message_bytes,
        }
    }

    /// Reject bounds the protocol cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_filename_len < 2 {
            return Err(ConfigError::Invalid(
                "max_filename_len must leave room for a name and its terminator".into(),
            ));
        }
        let largest_publish = self
            .wire_limits()
            .publish_len(self.max_files)
            .unwrap_or(usize::MAX);
        if largest_publish > self.max_message_bytes {
            return Err(ConfigError::Invalid(format!(
                "max_message_bytes {} cannot hold a publish of {} files ({} bytes)",
                self.max_message_bytes, self.max_files, largest_publish
            )));
        }
        if self.max_message_bytes < PUBLISH_HEADER_LEN {
            return Err(ConfigError::Invalid(
                "max_message_bytes is smaller than a publish header".into(),
            ));
        }
        Ok(())
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("peerdex")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl PeerdexConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            PeerdexConfig::default()
        };
        config.apply_env_overrides();
        config.registry.validate()?;
        Ok(config)
    }

    /// Parse a config file without applying env overrides.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("PEERDEX_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&PeerdexConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply PEERDEX_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from any key lookup. Unparsable values are ignored.
    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("PEERDEX_NETWORK__BIND_ADDR") {
            match v.parse() {
                Ok(addr) => self.network.bind_addr = addr,
                Err(_) => tracing::warn!(value = %v, "ignoring unparsable bind address"),
            }
        }
        if let Some(Ok(n)) = var("PEERDEX_NETWORK__BACKLOG").map(|v| v.parse()) {
            self.network.backlog = n;
        }
        if let Some(Ok(n)) = var("PEERDEX_REGISTRY__MAX_PEERS").map(|v| v.parse()) {
            self.registry.max_peers = n;
        }
        if let Some(v) = var("PEERDEX_REGISTRY__DUPLICATE_IDS") {
            match v.parse() {
                Ok(policy) => self.registry.duplicate_ids = policy,
                Err(e) => tracing::warn!(error = %e, "ignoring duplicate id override"),
            }
        }
        if let Some(v) = var("PEERDEX_REGISTRY__EXCLUDE_SELF_FROM_SEARCH") {
            self.registry.exclude_self_from_search = v == "true" || v == "1";
        }
        if let Some(Ok(n)) = var("PEERDEX_REGISTRY__SNAPSHOT_INTERVAL_SECS").map(|v| v.parse()) {
            self.registry.snapshot_interval_secs = n;
        }
    }
}
