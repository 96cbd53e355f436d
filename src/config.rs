//! Configuration loading.
//!
//! Hierarchical merge via `figment`: programmatic defaults, an optional
//! YAML file, then `LOOM_`-prefixed environment variables (highest
//! precedence), following `infrastructure/config/loader.rs`'s
//! `ConfigLoader::load` in the teacher.

use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(String),
    #[error("invalid max_loop_iterations: {0}, must be at least 1")]
    InvalidMaxLoopIterations(u32),
    #[error("invalid heartbeat_interval_secs: {0}, must be at least 1")]
    InvalidHeartbeatInterval(u64),
    #[error("bus_url must not be empty")]
    EmptyBusUrl,
}

/// Recognized configuration options (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bus_url: String,
    pub stream_name: String,
    pub consumer_prefix: Option<String>,
    pub peer_bus_urls: Vec<String>,
    pub federation_allow_list: Vec<String>,
    pub federation_gateway_name: String,
    pub swarm_heartbeat_interval_secs: u64,
    pub agent_heartbeat_interval_secs: u64,
    pub stale_threshold_secs: u64,
    pub reap_interval_secs: u64,
    pub max_loop_iterations: u32,
    pub action_loop_enabled: bool,
    pub persona_path: Option<String>,
    pub role: Option<String>,
    pub provider_endpoint: Option<String>,
    pub provider_model: String,
    pub provider_api_key: Option<String>,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub log_dir: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            log_dir: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bus_url: "nats://127.0.0.1:4222".to_string(),
            stream_name: "LOOM".to_string(),
            consumer_prefix: None,
            peer_bus_urls: Vec::new(),
            federation_allow_list: vec![
                "swarm.>".to_string(),
                "plans.*".to_string(),
                "events.*".to_string(),
            ],
            federation_gateway_name: "default".to_string(),
            swarm_heartbeat_interval_secs: 15,
            agent_heartbeat_interval_secs: 30,
            stale_threshold_secs: 60,
            reap_interval_secs: 30,
            max_loop_iterations: 20,
            action_loop_enabled: true,
            persona_path: None,
            role: None,
            provider_endpoint: None,
            provider_model: "gpt-4o-mini".to_string(),
            provider_api_key: None,
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    pub fn swarm_heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.swarm_heartbeat_interval_secs)
    }

    pub fn agent_heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.agent_heartbeat_interval_secs)
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_threshold_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging:
    /// 1. programmatic defaults
    /// 2. `loom.yaml` in the current directory, if present
    /// 3. `LOOM_*` environment variables (highest precedence)
    pub fn load() -> Result<Config, ConfigError> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file("loom.yaml"))
            .merge(Env::prefixed("LOOM_").split("__"))
            .extract()
            .map_err(|e| ConfigError::Load(e.to_string()))?;

        Self::validate(&config)?;
        Ok(config)
    }

    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<Config, ConfigError> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path.as_ref()))
            .extract()
            .map_err(|e| ConfigError::Load(e.to_string()))?;

        Self::validate(&config)?;
        Ok(config)
    }

    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        if config.max_loop_iterations == 0 {
            return Err(ConfigError::InvalidMaxLoopIterations(
                config.max_loop_iterations,
            ));
        }
        if config.agent_heartbeat_interval_secs == 0 || config.swarm_heartbeat_interval_secs == 0 {
            return Err(ConfigError::InvalidHeartbeatInterval(
                config.agent_heartbeat_interval_secs,
            ));
        }
        if config.bus_url.trim().is_empty() {
            return Err(ConfigError::EmptyBusUrl);
        }
        Ok(())
    }
}
