//! Configuration system for arbor.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $ARBOR_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/arbor/config.toml
//!   3. ~/.config/arbor/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ArborConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub scheduler: SchedulerSettings,
    pub export: ExportConfig,
    pub discovery: DiscoveryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Name announced in Hello. Must be unique per directory server.
    pub name: String,
    /// Path to the P-256 private key. Auto-generated on first run.
    pub keypair_path: PathBuf,
    /// Sign Hello, PublicKey and Root messages and their replies.
    pub sign_messages: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// UDP socket address. Port 0 = OS-assigned.
    pub bind_addr: String,
    /// Seconds between keepalive Hellos to known peers. 0 = off.
    pub keepalive_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Transmissions per request before giving up.
    pub attempts: u32,
    /// Wait after the first transmission; doubles on each retry.
    pub initial_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// File or directory served to peers. Missing = empty directory.
    pub root: PathBuf,
    /// Where fetched trees are written.
    pub download_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Base URL of the peer directory. Empty = no directory.
    pub endpoint: String,
    /// Peers to greet at startup: socket addresses, or names resolved
    /// through the directory.
    pub bootstrap_peers: Vec<String>,
    /// Accept self-signed directory certificates.
    pub accept_invalid_certs: bool,
    pub timeout_secs: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            name: "arbor".to_string(),
            keypair_path: config_dir().join("keypair"),
            sign_messages: true,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:0".to_string(),
            keepalive_secs: 30,
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_timeout_ms: 1000,
        }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            root: data_dir().join("export"),
            download_dir: data_dir().join("downloads"),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            bootstrap_peers: Vec::new(),
            accept_invalid_certs: false,
            timeout_secs: 50,
        }
    }
}

impl SchedulerSettings {
    pub fn initial_timeout(&self) -> Duration {
        Duration::from_millis(self.initial_timeout_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("arbor")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("arbor")
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
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl ArborConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            Self::from_toml(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            ArborConfig::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Parse a config document; missing keys take their defaults.
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("ARBOR_CONFIG")
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
            let text = toml::to_string_pretty(&ArborConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply ARBOR_* overrides. `lookup` is `std::env::var` in production.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("ARBOR_IDENTITY__NAME") {
            self.identity.name = v;
        }
        if let Some(v) = lookup("ARBOR_NETWORK__BIND_ADDR") {
            self.network.bind_addr = v;
        }
        if let Some(v) = lookup("ARBOR_EXPORT__ROOT") {
            self.export.root = PathBuf::from(v);
        }
        if let Some(v) = lookup("ARBOR_DISCOVERY__ENDPOINT") {
            self.discovery.endpoint = v;
        }
        if let Some(v) = lookup("ARBOR_SCHEDULER__ATTEMPTS") {
            match v.parse() {
                Ok(n) => self.scheduler.attempts = n,
                Err(_) => tracing::warn!(value = %v, "ignoring invalid ARBOR_SCHEDULER__ATTEMPTS"),
            }
        }
    }
}
