//! Agent Configuration Module
//!
//! Layered configuration for the virtualization management agent: a TOML
//! file overlaid with `VDA_`-prefixed environment variables, loaded once at
//! startup and handed by `Arc` reference to every component (§4.M).

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid environment override {key}: {message}")]
    EnvOverride { key: String, message: String },
}

/// Top-level agent configuration. Every field has a workable default so the
/// agent can start from an empty or partial file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub bus: BusConfig,
    pub http_image: HttpImageConfig,
    pub executor: ExecutorConfig,
    pub poller: PollerConfig,
    pub recovery: RecoveryConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            bus: BusConfig::default(),
            http_image: HttpImageConfig::default(),
            executor: ExecutorConfig::default(),
            poller: PollerConfig::default(),
            recovery: RecoveryConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Loads a TOML file, then applies `VDA_*` environment overrides.
    /// Missing file is not an error: callers typically fall back to
    /// [`AgentConfig::default`] when the configured path does not exist.
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: AgentConfig =
            toml::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(v) = std::env::var("VDA_BUS_LISTEN_ADDRESS") {
            self.bus.listen_address = v.parse().map_err(|_| ConfigError::EnvOverride {
                key: "VDA_BUS_LISTEN_ADDRESS".into(),
                message: "expected host:port".into(),
            })?;
        }
        if let Ok(v) = std::env::var("VDA_POLLER_POLL_INTERVAL_MS") {
            let ms: u64 = v.parse().map_err(|_| ConfigError::EnvOverride {
                key: "VDA_POLLER_POLL_INTERVAL_MS".into(),
                message: "expected integer milliseconds".into(),
            })?;
            self.poller.poll_interval = Duration::from_millis(ms);
        }
        if let Ok(v) = std::env::var("VDA_RECOVERY_STORE_PATH") {
            self.recovery.store_path = PathBuf::from(v);
        }
        Ok(())
    }
}

/// Message-bus adapter configuration (§4.E).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub listen_address: SocketAddr,
    pub heartbeat_min: Duration,
    pub heartbeat_grace: f64,
    pub protocol_detect_window: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:54321".parse().unwrap(),
            heartbeat_min: Duration::from_millis(1000),
            heartbeat_grace: 0.2,
            protocol_detect_window: Duration::from_secs(60),
        }
    }
}

/// HTTP image transport configuration (§4.D).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpImageConfig {
    pub queue_depth: usize,
}

impl Default for HttpImageConfig {
    fn default() -> Self {
        Self { queue_depth: 10 }
    }
}

/// Worker pool configuration (§4.H).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub workers_count: usize,
    pub max_workers: usize,
    pub queue_size: usize,
    pub default_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workers_count: 4,
            max_workers: 16,
            queue_size: 256,
            default_timeout: Duration::from_secs(60),
        }
    }
}

/// Guest-agent poller configuration (§4.J).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    /// P_poll: period of the poller's own periodic Operation.
    pub poll_interval: Duration,
    /// P_caps: minimum interval between capability probes.
    pub capability_refresh_interval: Duration,
    /// T_boot: length of the aggressive boot window.
    pub boot_window: Duration,
    /// T_throttle: cooldown after a guest-agent failure.
    pub failure_throttle: Duration,
    /// TCMD: per-call timeout for `guestInfo`/`agent_command`.
    pub command_timeout: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            capability_refresh_interval: Duration::from_secs(300),
            boot_window: Duration::from_secs(300),
            failure_throttle: Duration::from_secs(60),
            command_timeout: Duration::from_secs(30),
        }
    }
}

/// Recovery store configuration (§4.L, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub store_path: PathBuf,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from("/var/lib/vda/recovery"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_toml() {
        let config = AgentConfig::default();
        let text = toml::to_string(&config).expect("serialize");
        let parsed: AgentConfig = toml::from_str(&text).expect("deserialize");
        assert_eq!(parsed.executor.workers_count, config.executor.workers_count);
        assert_eq!(parsed.poller.poll_interval, config.poller.poll_interval);
    }

    #[test]
    fn load_missing_file_errors() {
        let result = AgentConfig::load(std::path::Path::new("/nonexistent/vda.toml"));
        assert!(result.is_err());
    }
}
