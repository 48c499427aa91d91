//! Configuration loading and persistence.
//!
//! Settings are read from `config.json` in the configuration directory and
//! then overridden by `CIRCUIT_*` environment variables. Missing fields fall
//! back to the defaults in [`crate::constants`].

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::fs;

use crate::constants;

/// Delivery tuning for an outbound render queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliverySettings {
    /// Maximum transmissions of one batch.
    pub max_send_attempts: u32,
    /// Pause after a failed transmission.
    pub retry_interval: Duration,
    /// Wait for an acknowledgement before retransmitting.
    pub ack_timeout: Duration,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            max_send_attempts: constants::MAX_BATCH_SEND_ATTEMPTS,
            retry_interval: constants::SEND_RETRY_INTERVAL,
            ack_timeout: constants::ACK_TIMEOUT,
        }
    }
}

/// Tuning for client acknowledgement sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckSettings {
    /// Maximum attempts per acknowledgement.
    pub max_attempts: u32,
    /// Pause between failed attempts.
    pub retry_interval: Duration,
}

impl Default for AckSettings {
    fn default() -> Self {
        Self {
            max_attempts: constants::ACK_SEND_ATTEMPTS,
            retry_interval: constants::ACK_RETRY_INTERVAL,
        }
    }
}

/// Tuning for the client auto-reconnect loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectSettings {
    /// Attempts before giving up.
    pub max_attempts: u32,
    /// First backoff delay.
    pub initial_backoff: Duration,
    /// Backoff cap.
    pub max_backoff: Duration,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            max_attempts: constants::RECONNECT_MAX_ATTEMPTS,
            initial_backoff: constants::RECONNECT_INITIAL_BACKOFF,
            max_backoff: constants::RECONNECT_MAX_BACKOFF,
        }
    }
}

/// Configuration for circuit-relay.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Milliseconds to wait after a failed batch transmission.
    pub send_retry_interval_ms: u64,
    /// Maximum transmissions of one render batch.
    pub max_batch_send_attempts: u32,
    /// Milliseconds a transmitted batch waits for its acknowledgement.
    pub ack_timeout_ms: u64,
    /// Maximum attempts to deliver one client acknowledgement.
    pub ack_send_attempts: u32,
    /// Milliseconds between acknowledgement attempts.
    pub ack_retry_interval_ms: u64,
    /// Seconds a disconnected circuit is retained before eviction.
    pub disconnected_retention_secs: u64,
    /// Attempts made by the client auto-reconnect loop.
    pub reconnect_max_attempts: u32,
    /// First auto-reconnect backoff in milliseconds.
    pub reconnect_initial_backoff_ms: u64,
    /// Auto-reconnect backoff cap in milliseconds.
    pub reconnect_max_backoff_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            send_retry_interval_ms: millis(constants::SEND_RETRY_INTERVAL),
            max_batch_send_attempts: constants::MAX_BATCH_SEND_ATTEMPTS,
            ack_timeout_ms: millis(constants::ACK_TIMEOUT),
            ack_send_attempts: constants::ACK_SEND_ATTEMPTS,
            ack_retry_interval_ms: millis(constants::ACK_RETRY_INTERVAL),
            disconnected_retention_secs: constants::DISCONNECTED_CIRCUIT_RETENTION.as_secs(),
            reconnect_max_attempts: constants::RECONNECT_MAX_ATTEMPTS,
            reconnect_initial_backoff_ms: millis(constants::RECONNECT_INITIAL_BACKOFF),
            reconnect_max_backoff_ms: millis(constants::RECONNECT_MAX_BACKOFF),
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// `CIRCUIT_CONFIG_DIR` overrides the platform config directory.
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(dir) = std::env::var("CIRCUIT_CONFIG_DIR") {
            PathBuf::from(dir)
        } else {
            dirs::config_dir()
                .context("Could not determine config directory")?
                .join("circuit-relay")
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config directory {}", dir.display()))?;
        Ok(dir)
    }

    /// Loads configuration from the config directory, with environment
    /// variable overrides. A missing file yields the defaults.
    pub fn load() -> Result<Self> {
        let path = Self::config_dir()?.join("config.json");
        let mut config = if path.exists() {
            Self::load_from(&path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from a specific file without environment overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Persists the configuration to `path`.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write config file {}", path.display()))
    }

    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_parse("CIRCUIT_SEND_RETRY_INTERVAL_MS") {
            self.send_retry_interval_ms = v;
        }
        if let Some(v) = env_parse("CIRCUIT_MAX_BATCH_SEND_ATTEMPTS") {
            self.max_batch_send_attempts = v;
        }
        if let Some(v) = env_parse("CIRCUIT_ACK_TIMEOUT_MS") {
            self.ack_timeout_ms = v;
        }
        if let Some(v) = env_parse("CIRCUIT_RETENTION_SECS") {
            self.disconnected_retention_secs = v;
        }
        if let Some(v) = env_parse("CIRCUIT_RECONNECT_MAX_ATTEMPTS") {
            self.reconnect_max_attempts = v;
        }
    }

    /// Settings for server-side outbound queues.
    pub fn delivery(&self) -> DeliverySettings {
        DeliverySettings {
            max_send_attempts: self.max_batch_send_attempts.max(1),
            retry_interval: Duration::from_millis(self.send_retry_interval_ms),
            ack_timeout: Duration::from_millis(self.ack_timeout_ms),
        }
    }

    /// Settings for client acknowledgement sends.
    pub fn acks(&self) -> AckSettings {
        AckSettings {
            max_attempts: self.ack_send_attempts.max(1),
            retry_interval: Duration::from_millis(self.ack_retry_interval_ms),
        }
    }

    /// Settings for the client auto-reconnect loop.
    pub fn reconnect(&self) -> ReconnectSettings {
        ReconnectSettings {
            max_attempts: self.reconnect_max_attempts,
            initial_backoff: Duration::from_millis(self.reconnect_initial_backoff_ms),
            max_backoff: Duration::from_millis(self.reconnect_max_backoff_ms),
        }
    }

    /// Grace period for disconnected circuits.
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.disconnected_retention_secs)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            log::warn!("Ignoring unparsable {}={}", key, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_match_constants() {
        let config = Config::default();
        assert_eq!(config.max_batch_send_attempts, 3);
        assert_eq!(config.delivery(), DeliverySettings::default());
        assert_eq!(config.acks(), AckSettings::default());
        assert_eq!(config.reconnect(), ReconnectSettings::default());
        assert_eq!(config.retention(), constants::DISCONNECTED_CIRCUIT_RETENTION);
    }

    #[test]
    fn test_partial_file_falls_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "ack_timeout_ms": 40, "disconnected_retention_secs": 5 }"#).unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.ack_timeout_ms, 40);
        assert_eq!(config.retention(), Duration::from_secs(5));
        assert_eq!(config.max_batch_send_attempts, constants::MAX_BATCH_SEND_ATTEMPTS);
    }

    #[test]
    fn test_save_then_load_preserves_values() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        let config = Config {
            send_retry_interval_ms: 10,
            reconnect_max_attempts: 2,
            ..Config::default()
        };
        config.save_to(&path).unwrap();
        assert_eq!(Config::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "not json").unwrap();
        assert!(Config::load_from(&path).is_err());
    }

    #[test]
    fn test_zero_attempts_clamped_to_one() {
        let config = Config {
            max_batch_send_attempts: 0,
            ack_send_attempts: 0,
            ..Config::default()
        };
        assert_eq!(config.delivery().max_send_attempts, 1);
        assert_eq!(config.acks().max_attempts, 1);
    }
}
