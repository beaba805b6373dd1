//! meshbridge - local/cloud MQTT bridge
//!
//! Forwards device traffic from a local broker to a cloud broker and cloud
//! replies back, rewriting topics and tagging payloads with their origin.
//! Connections are kept alive by a single reconnect worker with
//! failure-class-aware backoff.

pub mod agent;
pub mod bridge;
pub mod config;
pub mod remote;
pub mod topic;

pub use agent::{Agent, ControlBus, StatusReport};
pub use bridge::{Bridge, BridgeError, BridgeSettings, BridgeStatus, RuleSet, TopicRule};
pub use config::Config;
pub use remote::{Connector, Endpoint, EndpointRole, MqttConnector, RemoteError};
