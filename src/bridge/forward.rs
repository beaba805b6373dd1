//! Forwarding Handlers
//!
//! One handler per topic rule: count, rewrite, tag, publish.

use std::sync::Arc;

use futures_util::FutureExt;
use tracing::{debug, warn};

use super::counters::TrafficCounters;
use super::payload::tag_payload;
use super::rules::{Direction, TopicRule};
use crate::remote::{Endpoint, InboundMessage, MessageHandler};

pub(crate) struct Forwarder {
    direction: Direction,
    rule: TopicRule,
    source: Arc<str>,
    destination: Arc<dyn Endpoint>,
    counters: Arc<TrafficCounters>,
}

impl Forwarder {
    pub(crate) fn new(
        direction: Direction,
        rule: TopicRule,
        source: Arc<str>,
        destination: Arc<dyn Endpoint>,
        counters: Arc<TrafficCounters>,
    ) -> Self {
        Self {
            direction,
            rule,
            source,
            destination,
            counters,
        }
    }

    pub(crate) fn into_handler(self) -> MessageHandler {
        let this = Arc::new(self);
        Arc::new(move |msg| {
            let this = this.clone();
            async move { this.forward(msg).await }.boxed()
        })
    }

    async fn forward(&self, msg: InboundMessage) {
        self.counters.record(self.direction, msg.wire_size());

        let topic = self.rule.rewrite(&msg.topic);
        debug!(
            "({}) topic: {} updated: {} len: {}",
            self.direction,
            msg.topic,
            topic,
            msg.payload.len()
        );

        let payload = tag_payload(&msg.payload, &self.source);
        if let Err(e) = self.destination.publish(&topic, payload).await {
            warn!("({}) publish to {} failed: {}", self.direction, topic, e);
        }
    }
}
