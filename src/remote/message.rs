//! Remote Message Types
//!
//! Messages delivered by an endpoint to its subscription handlers.

use bytes::Bytes;
use rumqttc::{Publish, QoS};

/// A message delivered on one of an endpoint's subscriptions
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Actual topic the message was published on
    pub topic: String,
    /// Message payload
    pub payload: Bytes,
    /// Quality of Service level of the delivery
    pub qos: QoS,
    /// Retain flag
    pub retain: bool,
    /// Size of the PUBLISH packet that carried the message
    wire_size: usize,
}

impl InboundMessage {
    /// Create a QoS 0, non-retained message
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self::with_qos(topic, payload, QoS::AtMostOnce)
    }

    /// Create a non-retained message delivered at `qos`
    pub fn with_qos(topic: impl Into<String>, payload: impl Into<Bytes>, qos: QoS) -> Self {
        Self::from(Publish::from_bytes(topic, qos, payload.into()))
    }

    /// Size of the PUBLISH packet that carried this message on the wire,
    /// headers and topic included.
    pub fn wire_size(&self) -> usize {
        self.wire_size
    }
}

impl From<Publish> for InboundMessage {
    fn from(publish: Publish) -> Self {
        let wire_size = publish.size();
        Self {
            topic: publish.topic,
            payload: publish.payload,
            qos: publish.qos,
            retain: publish.retain,
            wire_size,
        }
    }
}
