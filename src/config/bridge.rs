//! Bridge Configuration
//!
//! Connection tunables, backoff and optional topic rule overrides.

use std::time::Duration;

use serde::Deserialize;

use crate::bridge::{BackoffPolicy, BridgeError, RuleSet, TopicRule};
use crate::remote::ConnectorSettings;

/// `[bridge]` section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Prefix for generated MQTT client ids
    pub client_id_prefix: String,
    /// MQTT keep-alive for both endpoints
    #[serde(with = "humantime_serde")]
    pub keep_alive: Duration,
    /// Maximum wait for the broker's CONNACK
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Maximum wait for a SUBACK
    #[serde(with = "humantime_serde")]
    pub subscribe_timeout: Duration,
    /// Reconnect delays
    pub backoff: BackoffConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        let connector = ConnectorSettings::default();
        Self {
            client_id_prefix: connector.client_id_prefix,
            keep_alive: connector.keep_alive,
            connect_timeout: connector.connect_timeout,
            subscribe_timeout: connector.subscribe_timeout,
            backoff: BackoffConfig::default(),
        }
    }
}

impl BridgeConfig {
    pub fn connector_settings(&self) -> ConnectorSettings {
        ConnectorSettings {
            client_id_prefix: self.client_id_prefix.clone(),
            keep_alive: self.keep_alive,
            connect_timeout: self.connect_timeout,
            subscribe_timeout: self.subscribe_timeout,
            ..ConnectorSettings::default()
        }
    }
}

/// `[bridge.backoff]` section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay after timeouts, refused connections and other transient failures
    #[serde(with = "humantime_serde")]
    pub transient: Duration,
    /// Delay after the cloud broker rejected the token
    #[serde(with = "humantime_serde")]
    pub credential_rejected: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            transient: Duration::from_secs(5),
            credential_rejected: Duration::from_secs(30),
        }
    }
}

impl BackoffConfig {
    pub fn policy(&self) -> Result<BackoffPolicy, BridgeError> {
        BackoffPolicy::new(self.transient, self.credential_rejected)
    }
}

/// A single topic rule as written in the config file
#[derive(Debug, Clone, Deserialize)]
pub struct RuleConfig {
    /// Subscription filter on the source broker
    pub pattern: String,
    /// Literal prefix of `pattern` replaced when forwarding
    #[serde(alias = "match")]
    pub match_prefix: String,
    /// Prefix substituted on the destination broker
    #[serde(alias = "replacement")]
    pub replacement_prefix: String,
}

impl RuleConfig {
    pub fn to_rule(&self) -> Result<TopicRule, BridgeError> {
        TopicRule::new(&self.pattern, &self.match_prefix, &self.replacement_prefix)
    }
}

/// `[rules]` section. Replaces the built-in tables when present.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    pub local_to_cloud: Vec<RuleConfig>,
    pub cloud_to_local: Vec<RuleConfig>,
}

impl RulesConfig {
    pub fn rule_set(&self) -> Result<RuleSet, BridgeError> {
        let local_to_cloud = self
            .local_to_cloud
            .iter()
            .map(RuleConfig::to_rule)
            .collect::<Result<Vec<_>, _>>()?;
        let cloud_to_local = self
            .cloud_to_local
            .iter()
            .map(RuleConfig::to_rule)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(RuleSet::new(local_to_cloud, cloud_to_local))
    }
}
