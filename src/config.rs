//! Configuration for vc-jukebox
//!
//! A minimal TOML bootstrap file with built-in defaults in code. Every value
//! has a default so the core runs with no file at all; the binary applies
//! CLI/env overrides on top.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::info;

use crate::error::{Error, Result};

/// Complete configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub limits: LimitsConfig,
    pub fetch: FetchConfig,
    pub sessions: SessionsConfig,
    pub logging: LoggingConfig,
}

/// Per-chat playback limits
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum queued tracks per chat
    pub max_queue_size: usize,

    /// Maximum accepted track duration in seconds (30 minutes)
    pub max_track_duration_secs: u64,

    /// Volume applied to new sessions (1-200)
    pub default_volume: u16,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 50,
            max_track_duration_secs: 1800,
            default_volume: 100,
        }
    }
}

/// Shared fetch/decode worker pool sizing
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Concurrent resolve operations across all chats
    pub max_workers: usize,

    /// Bound of the pool-wide FIFO admission queue; beyond this, submission
    /// fails fast instead of growing unboundedly
    pub max_pending: usize,

    /// Per-job resolve timeout in seconds
    pub timeout_secs: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            max_pending: 32,
            timeout_secs: 60,
        }
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Session registry lifecycle settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    /// How long an idle session with an empty queue is retained before the
    /// sweep evicts it
    pub retention_secs: u64,

    /// Interval of the periodic eviction sweep
    pub sweep_interval_secs: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            retention_secs: 300,
            sweep_interval_secs: 60,
        }
    }
}

impl SessionsConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log file path (logs to stderr if not specified)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::Config(format!("failed to read config file {}: {e}", path.display()))
        })?;

        let config: Config = toml::from_str(&raw)
            .map_err(|e| Error::Config(format!("failed to parse TOML: {e}")))?;

        info!("loaded configuration from {}", path.display());
        Ok(config)
    }
}
