//! Topic Rules
//!
//! Which topics are forwarded in which direction, and how their names
//! change on the way. Rules are immutable data handed to the bridge at
//! construction.

use std::fmt;

use super::error::BridgeError;
use crate::topic::has_wildcards;

/// Direction a message travels through the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Local broker → cloud broker (egress)
    LocalToCloud,
    /// Cloud broker → local broker (ingress)
    CloudToLocal,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::LocalToCloud => write!(f, "local"),
            Direction::CloudToLocal => write!(f, "cloud"),
        }
    }
}

/// A subscribed pattern plus the prefix substitution applied to matching topics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicRule {
    pattern: String,
    match_prefix: String,
    replacement_prefix: String,
}

impl TopicRule {
    /// Create a rule. `match_prefix` must be a literal prefix of `pattern`.
    pub fn new(
        pattern: impl Into<String>,
        match_prefix: impl Into<String>,
        replacement_prefix: impl Into<String>,
    ) -> Result<Self, BridgeError> {
        let pattern = pattern.into();
        let match_prefix = match_prefix.into();

        if match_prefix.is_empty() {
            return Err(BridgeError::InvalidConfiguration(format!(
                "rule '{}' has an empty match prefix",
                pattern
            )));
        }
        if !pattern.starts_with(&match_prefix) || has_wildcards(&match_prefix) {
            return Err(BridgeError::InvalidConfiguration(format!(
                "'{}' is not a literal prefix of '{}'",
                match_prefix, pattern
            )));
        }

        Ok(Self {
            pattern,
            match_prefix,
            replacement_prefix: replacement_prefix.into(),
        })
    }

    /// Subscription filter on the source broker
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn match_prefix(&self) -> &str {
        &self.match_prefix
    }

    pub fn replacement_prefix(&self) -> &str {
        &self.replacement_prefix
    }

    /// Destination topic: the first occurrence of the match prefix replaced
    pub fn rewrite(&self, topic: &str) -> String {
        topic.replacen(&self.match_prefix, &self.replacement_prefix, 1)
    }
}

// Built-in tables are compile-time constants; every entry satisfies the prefix invariant.
fn rule(pattern: &str, match_prefix: &str, replacement_prefix: &str) -> TopicRule {
    TopicRule {
        pattern: pattern.to_string(),
        match_prefix: match_prefix.to_string(),
        replacement_prefix: replacement_prefix.to_string(),
    }
}

/// Ordered rule lists for both directions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSet {
    pub local_to_cloud: Vec<TopicRule>,
    pub cloud_to_local: Vec<TopicRule>,
}

impl RuleSet {
    pub fn new(local_to_cloud: Vec<TopicRule>, cloud_to_local: Vec<TopicRule>) -> Self {
        Self {
            local_to_cloud,
            cloud_to_local,
        }
    }

    /// Rules whose subscriptions are installed on the source of `direction`
    pub fn rules(&self, direction: Direction) -> &[TopicRule] {
        match direction {
            Direction::LocalToCloud => &self.local_to_cloud,
            Direction::CloudToLocal => &self.cloud_to_local,
        }
    }

    pub fn len(&self) -> usize {
        self.local_to_cloud.len() + self.cloud_to_local.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RuleSet {
    /// The device/cloud topic tables
    fn default() -> Self {
        let local_to_cloud = vec![
            // location
            rule("$location/calibration", "$location", "$cloud/location"),
            rule("$location/delete", "$location", "$cloud/location"),
            rule("$device/+/+/rssi", "$device", "$cloud/device"),
            // userspace RPC requests
            rule("$ninja/services/rpc/+/+", "$ninja", "$cloud/ninja"),
            rule("$ninja/services/+", "$ninja", "$cloud/ninja"),
            // device replies go to remote_device so the cloud side does not loop them back
            rule("$device/+/channel/+/reply", "$device", "$cloud/remote_device"),
            // local RPC calls, in case the cloud answers them (push notifications)
            rule("$device/+/channel/+", "$device", "$cloud/device"),
            // state changes
            rule("$device/+/channel/+/event/state", "$device", "$cloud/device"),
        ];

        let cloud_to_local = vec![
            rule(
                "$cloud/location/calibration/progress",
                "$cloud/location",
                "$location",
            ),
            rule("$cloud/device/+/+/location", "$cloud/device", "$device"),
            // userspace RPC replies
            rule(
                "$cloud/ninja/services/rpc/+/+/reply",
                "$cloud/ninja",
                "$ninja",
            ),
            rule(
                "$cloud/remote_device/+/channel/+",
                "$cloud/remote_device",
                "$device",
            ),
            // device and channel announcements made by the cloud
            rule("$cloud/device/+/event/announce", "$cloud/device", "$device"),
            rule(
                "$cloud/device/+/channel/+/event/announce",
                "$cloud/device",
                "$device",
            ),
            // RPC responses from the cloud
            rule("$cloud/device/+/channel/+/reply", "$cloud/device", "$device"),
        ];

        Self::new(local_to_cloud, cloud_to_local)
    }
}
