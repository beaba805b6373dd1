//! Configuration Module
//!
//! Provides TOML-based configuration for meshbridge with support for:
//! - Local broker address and device serial
//! - Connection and reconnect tunables
//! - Topic rule overrides
//! - The MQTT control bus
//! - An optional cloud target applied at startup
//! - Environment variable overrides (MESHBRIDGE__* prefix)

use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;
use url::Url;

use crate::bridge::{BridgeSettings, RuleSet};
use crate::remote::ConnectorSettings;

pub use bridge::{BackoffConfig, BridgeConfig, RuleConfig, RulesConfig};

mod bridge;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = match Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}") {
        Ok(re) => re,
        Err(_) => return content.to_string(),
    };
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}


/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Local broker
    pub local: LocalConfig,
    /// Bridge connection tunables
    pub bridge: BridgeConfig,
    /// Topic rules (built-in tables when absent)
    pub rules: Option<RulesConfig>,
    /// Control bus
    pub control: ControlConfig,
    /// Cloud target to start at boot
    pub cloud: Option<CloudConfig>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Local broker configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    /// Broker URL, connected without credentials
    #[serde(default = "default_local_url")]
    pub url: String,
    /// Device serial used to tag local messages (defaults to the hostname)
    pub serial: Option<String>,
}

fn default_local_url() -> String {
    "mqtt://127.0.0.1:1883".to_string()
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            url: default_local_url(),
            serial: None,
        }
    }
}

/// Control bus configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Serve `$sphere/bridge/*` requests on the local broker
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Period of the status report
    #[serde(default = "default_status_interval", with = "humantime_serde")]
    pub status_interval: Duration,
}

fn default_true() -> bool {
    true
}

fn default_status_interval() -> Duration {
    Duration::from_secs(10)
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            status_interval: default_status_interval(),
        }
    }
}

/// Cloud target applied at startup
#[derive(Debug, Clone, Deserialize)]
pub struct CloudConfig {
    pub url: String,
    #[serde(default)]
    pub token: String,
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `MESHBRIDGE__` prefix with double underscores for nesting:
    ///    - `MESHBRIDGE__LOCAL__URL=mqtt://broker:1883` overrides `local.url`
    ///    - `MESHBRIDGE__BRIDGE__KEEP_ALIVE=30s` overrides `bridge.keep_alive`
    ///    - `MESHBRIDGE__CONTROL__ENABLED=false` overrides `control.enabled`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            // Start with defaults
            .set_default("log.level", "info")?
            .set_default("local.url", default_local_url())?
            .set_default("bridge.client_id_prefix", "meshbridge")?
            .set_default("bridge.keep_alive", "15s")?
            .set_default("bridge.connect_timeout", "10s")?
            .set_default("bridge.subscribe_timeout", "10s")?
            .set_default("bridge.backoff.transient", "5s")?
            .set_default("bridge.backoff.credential_rejected", "30s")?
            .set_default("control.enabled", true)?
            .set_default("control.status_interval", "10s")?;

        // Load from file with env var substitution
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("MESHBRIDGE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides only (no file).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.local_url()?;

        if matches!(&self.local.serial, Some(serial) if serial.trim().is_empty()) {
            return Err(ConfigError::Validation(
                "local.serial must not be empty".to_string(),
            ));
        }

        if self.bridge.client_id_prefix.is_empty() {
            return Err(ConfigError::Validation(
                "bridge.client_id_prefix must not be empty".to_string(),
            ));
        }

        for (name, value) in [
            ("bridge.keep_alive", self.bridge.keep_alive),
            ("bridge.connect_timeout", self.bridge.connect_timeout),
            ("bridge.subscribe_timeout", self.bridge.subscribe_timeout),
            ("control.status_interval", self.control.status_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Validation(format!(
                    "{} must be greater than zero",
                    name
                )));
            }
        }

        self.bridge
            .backoff
            .policy()
            .map_err(|e| ConfigError::Validation(e.to_string()))?;

        self.rule_set()?;

        if let Some(cloud) = &self.cloud {
            Url::parse(&cloud.url).map_err(|e| {
                ConfigError::Validation(format!("cloud.url '{}': {}", cloud.url, e))
            })?;
        }

        Ok(())
    }

    pub fn local_url(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.local.url)
            .map_err(|e| ConfigError::Validation(format!("local.url '{}': {}", self.local.url, e)))
    }

    /// Configured serial, falling back to the machine hostname
    pub fn serial(&self) -> String {
        if let Some(serial) = &self.local.serial {
            return serial.clone();
        }
        hostname::get()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string())
    }

    /// Topic rules: the `[rules]` tables, or the built-in ones
    pub fn rule_set(&self) -> Result<RuleSet, ConfigError> {
        match &self.rules {
            Some(rules) => rules
                .rule_set()
                .map_err(|e| ConfigError::Validation(format!("rules: {}", e))),
            None => Ok(RuleSet::default()),
        }
    }

    pub fn bridge_settings(&self) -> Result<BridgeSettings, ConfigError> {
        Ok(BridgeSettings {
            local_url: self.local_url()?,
            serial: self.serial(),
            backoff: self
                .bridge
                .backoff
                .policy()
                .map_err(|e| ConfigError::Validation(e.to_string()))?,
        })
    }

    pub fn connector_settings(&self) -> ConnectorSettings {
        self.bridge.connector_settings()
    }
}
