//! MQTT Bridge Module
//!
//! Bridges a local device broker and a cloud broker. A fixed set of topic
//! rules decides what is forwarded in each direction and how topic names
//! are rewritten; forwarded JSON objects are stamped with their origin.
//!
//! # Reconnection
//!
//! Losing either connection tears both down. The next attempt is scheduled
//! by failure class: by default credential rejections wait 30s, everything
//! else 5s.
//! Exactly one timer and one worker loop exist per configured session, and
//! retries continue until the bridge is stopped.
//!
//! # Loop Prevention
//!
//! Device replies are forwarded to `$cloud/remote_device` so the cloud rules
//! do not send them straight back, and the `$mesh-source` payload tag is
//! never applied twice.

mod backoff;
mod core;
mod counters;
mod error;
mod forward;
mod payload;
mod rules;


pub use self::core::{Bridge, BridgeSettings, BridgeStatus};
pub use backoff::BackoffPolicy;
pub use counters::{CounterSnapshot, TrafficCounters};
pub use error::BridgeError;
pub use payload::{cloud_source_id, tag_payload, SOURCE_TAG_FIELD};
pub use rules::{Direction, RuleSet, TopicRule};
