//! Bridge Integration Tests
//!
//! Runs the bridge between two in-memory brokers. Each broker delivers a
//! publish to every matching subscriber, including the publisher itself, so
//! forwarding loops show up the way they would against a real broker.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use url::Url;

use meshbridge::agent::Agent;
use meshbridge::bridge::{Bridge, BridgeSettings, RuleSet};
use meshbridge::config::Config;
use meshbridge::remote::{
    Connector, Endpoint, EndpointRole, InboundMessage, LossCallback, MessageHandler, RemoteError,
};
use meshbridge::topic::topic_matches_filter;

/// Minimal in-memory broker
#[derive(Default)]
struct Broker {
    subscriptions: Mutex<Vec<(u64, String, MessageHandler)>>,
    log: Mutex<Vec<(String, String)>>,
}

impl Broker {
    async fn publish(&self, topic: &str, payload: Bytes) {
        self.log.lock().push((
            topic.to_string(),
            String::from_utf8_lossy(&payload).into_owned(),
        ));
        let handlers: Vec<MessageHandler> = self
            .subscriptions
            .lock()
            .iter()
            .filter(|(_, filter, _)| topic_matches_filter(topic, filter))
            .map(|(_, _, handler)| handler.clone())
            .collect();
        for handler in handlers {
            handler(InboundMessage::new(topic, payload.clone())).await;
        }
    }

    fn messages(&self) -> Vec<(String, String)> {
        self.log.lock().clone()
    }

    fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }
}

struct BrokerEndpoint {
    id: u64,
    broker: Arc<Broker>,
    connected: AtomicBool,
}

#[async_trait]
impl Endpoint for BrokerEndpoint {
    async fn subscribe(&self, filter: &str, handler: MessageHandler) -> Result<(), RemoteError> {
        self.broker
            .subscriptions
            .lock()
            .push((self.id, filter.to_string(), handler));
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), RemoteError> {
        self.broker.publish(topic, payload).await;
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.broker
            .subscriptions
            .lock()
            .retain(|(id, _, _)| *id != self.id);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

struct BrokerConnector {
    local: Arc<Broker>,
    cloud: Arc<Broker>,
    next_id: AtomicU64,
    tokens: Mutex<Vec<Option<String>>>,
}

impl BrokerConnector {
    fn new() -> Self {
        Self {
            local: Arc::new(Broker::default()),
            cloud: Arc::new(Broker::default()),
            next_id: AtomicU64::new(1),
            tokens: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Connector for BrokerConnector {
    async fn connect(
        &self,
        role: EndpointRole,
        _url: &Url,
        credentials: Option<&str>,
        _on_loss: LossCallback,
    ) -> Result<Arc<dyn Endpoint>, RemoteError> {
        let broker = match role {
            EndpointRole::Cloud => {
                if credentials == Some("revoked") {
                    return Err(RemoteError::CredentialRejected("NotAuthorized".to_string()));
                }
                self.tokens.lock().push(credentials.map(str::to_string));
                self.cloud.clone()
            }
            EndpointRole::Local | EndpointRole::Control => self.local.clone(),
        };
        Ok(Arc::new(BrokerEndpoint {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            broker,
            connected: AtomicBool::new(true),
        }))
    }
}

fn bridge_with_default_rules(connector: &Arc<BrokerConnector>) -> Bridge {
    let settings = BridgeSettings {
        local_url: Url::parse("mqtt://127.0.0.1:1883").unwrap(),
        serial: "ABC123".to_string(),
        backoff: Default::default(),
    };
    Bridge::new(settings, RuleSet::default(), connector.clone())
}

#[tokio::test]
async fn test_state_change_reaches_cloud_tagged() {
    let connector = Arc::new(BrokerConnector::new());
    let bridge = bridge_with_default_rules(&connector);
    bridge.start("mqtts://cloud.example.com", "tok").await.unwrap();

    connector
        .local
        .publish(
            "$device/12/channel/3/event/state",
            Bytes::from_static(br#"{"on":true}"#),
        )
        .await;

    assert_eq!(
        connector.cloud.messages(),
        vec![(
            "$cloud/device/12/channel/3/event/state".to_string(),
            r#"{"$mesh-source":"ABC123", "on":true}"#.to_string()
        )]
    );
    assert_eq!(bridge.status().counters.egress_count, 1);
    assert_eq!(*connector.tokens.lock(), vec![Some("tok".to_string())]);

    bridge.stop().await.unwrap();
}

#[tokio::test]
async fn test_device_reply_does_not_loop() {
    let connector = Arc::new(BrokerConnector::new());
    let bridge = bridge_with_default_rules(&connector);
    bridge.start("mqtts://cloud.example.com", "tok").await.unwrap();

    connector
        .local
        .publish("$device/7/channel/1/reply", Bytes::from_static(b"{}"))
        .await;

    assert_eq!(
        connector.cloud.messages(),
        vec![(
            "$cloud/remote_device/7/channel/1/reply".to_string(),
            r#"{"$mesh-source":"ABC123"}"#.to_string()
        )]
    );
    // Nothing came back down
    assert_eq!(connector.local.messages().len(), 1);

    bridge.stop().await.unwrap();
}

#[tokio::test]
async fn test_cloud_reply_is_delivered_locally() {
    let connector = Arc::new(BrokerConnector::new());
    let bridge = bridge_with_default_rules(&connector);
    bridge
        .start("mqtts://stream.example.com:8883", "tok")
        .await
        .unwrap();

    connector
        .cloud
        .publish(
            "$cloud/device/7/channel/1/reply",
            Bytes::from_static(br#"{"result":1}"#),
        )
        .await;

    let tagged = r#"{"$mesh-source":"cloud-stream_example_com", "result":1}"#.to_string();
    assert_eq!(
        connector.local.messages(),
        vec![("$device/7/channel/1/reply".to_string(), tagged.clone())]
    );
    // The local reply rule mirrors it to remote_device, keeping the cloud tag
    assert_eq!(
        connector.cloud.messages()[1..].to_vec(),
        vec![("$cloud/remote_device/7/channel/1/reply".to_string(), tagged)]
    );

    let counters = bridge.status().counters;
    assert_eq!(counters.ingress_count, 1);
    assert_eq!(counters.egress_count, 1);

    bridge.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_removes_all_subscriptions() {
    let connector = Arc::new(BrokerConnector::new());
    let bridge = bridge_with_default_rules(&connector);

    bridge.start("mqtts://cloud.example.com", "").await.unwrap();
    assert_eq!(connector.local.subscription_count(), 8);
    assert_eq!(connector.cloud.subscription_count(), 7);
    assert_eq!(*connector.tokens.lock(), vec![None]);

    bridge.stop().await.unwrap();
    assert_eq!(connector.local.subscription_count(), 0);
    assert_eq!(connector.cloud.subscription_count(), 0);

    connector
        .local
        .publish("$device/1/channel/1", Bytes::from_static(b"{}"))
        .await;
    assert!(connector.cloud.messages().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_agent_from_config() {
    let config = Config::parse(
        r#"
[local]
serial = "GW-9"

[bridge.backoff]
transient = "1s"
credential_rejected = "2s"

[[rules.local_to_cloud]]
pattern = "sensors/#"
match_prefix = "sensors"
replacement_prefix = "$cloud/sensors"
"#,
    )
    .unwrap();

    let connector = Arc::new(BrokerConnector::new());
    let bridge = Bridge::new(
        config.bridge_settings().unwrap(),
        config.rule_set().unwrap(),
        connector.clone(),
    );
    let agent = Agent::new(bridge);

    let err = agent
        .start_bridge("mqtts://cloud.example.com", "revoked")
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "Credentials rejected: NotAuthorized".to_string()
    );

    let report = serde_json::to_value(agent.query_status()).unwrap();
    assert_eq!(report["configured"], true);
    assert_eq!(report["connected"], false);
    assert_eq!(report["lastError"], "Credentials rejected: NotAuthorized");

    agent.stop_bridge().await.unwrap();
    agent
        .start_bridge("mqtts://cloud.example.com", "fresh")
        .await
        .unwrap();

    connector
        .local
        .publish("sensors/kitchen/temp", Bytes::from_static(b"21.5"))
        .await;
    assert_eq!(
        connector.cloud.messages(),
        vec![(
            "$cloud/sensors/kitchen/temp".to_string(),
            "21.5".to_string()
        )]
    );

    agent.stop_bridge().await.unwrap();
}
