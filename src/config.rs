//! TOML configuration for both binaries. Every field has a default, so an
//! empty or missing file is valid.

use crate::checksum::DigestAlgorithm;
use crate::error::Result as TransferResult;
use crate::protocol::{self, timeouts};
use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Knobs shared by sender and receiver
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TransferConfig {
    pub chunk_bytes: usize,
    pub algorithm: String,
    pub io_timeout_ms: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_bytes: protocol::CHUNK_BYTES,
            algorithm: protocol::DEFAULT_ALGORITHM.to_string(),
            io_timeout_ms: timeouts::IO_MS,
        }
    }
}

impl TransferConfig {
    pub fn algorithm(&self) -> TransferResult<DigestAlgorithm> {
        self.algorithm.parse()
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    /// Chunk size, never zero
    pub fn chunk(&self) -> usize {
        self.chunk_bytes.max(1)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub root: PathBuf,
    /// Re-hash the received payload and discard it on mismatch
    pub verify_digest: bool,
    /// JSON-lines record of every connection
    pub journal: Option<PathBuf>,
    pub progress: bool,
    pub transfer: TransferConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: format!("127.0.0.1:{}", protocol::DEFAULT_PORT),
            root: PathBuf::from(protocol::SERVER_DIR),
            verify_digest: false,
            journal: None,
            progress: false,
            transfer: TransferConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClientConfig {
    pub port: u16,
    pub root: PathBuf,
    pub retry_delay_ms: u64,
    /// None retries forever
    pub max_connect_attempts: Option<u32>,
    pub progress: bool,
    pub transfer: TransferConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            port: protocol::DEFAULT_PORT,
            root: PathBuf::from(protocol::CLIENT_DIR),
            retry_delay_ms: timeouts::CONNECT_RETRY_MS,
            max_connect_attempts: None,
            progress: true,
            transfer: TransferConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Load a config file, or defaults when no path is given
pub fn load_config<T: DeserializeOwned + Default>(path: Option<&Path>) -> Result<T> {
    let Some(p) = path else {
        return Ok(T::default());
    };
    let data = std::fs::read_to_string(p)
        .with_context(|| format!("read config {}", p.display()))?;
    let cfg: T = toml::from_str(&data).with_context(|| format!("parse config {}", p.display()))?;
    Ok(cfg)
}
