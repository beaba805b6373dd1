//! Control Bus
//!
//! Serves bridge management requests published on the local broker:
//!
//! | Topic | Direction | Payload |
//! |---|---|---|
//! | `$sphere/bridge/connect` | in | `{"id","url","token"}` |
//! | `$sphere/bridge/disconnect` | in | `{"id"}` |
//! | `$sphere/bridge/response` | out | `{"id","connected","configured","lastError"}` |
//! | `$sphere/bridge/status` | out | `{"status":"started"}` once, then periodic reports |

use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use url::Url;

use super::Agent;
use crate::remote::{
    Connector, Endpoint, EndpointRole, InboundMessage, LossCallback, MessageHandler, RemoteError,
};

pub const CONNECT_TOPIC: &str = "$sphere/bridge/connect";
pub const DISCONNECT_TOPIC: &str = "$sphere/bridge/disconnect";
pub const STATUS_TOPIC: &str = "$sphere/bridge/status";
pub const RESPONSE_TOPIC: &str = "$sphere/bridge/response";

/// Delay before reopening a lost control connection
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct ConnectRequest {
    #[serde(default)]
    id: String,
    url: String,
    #[serde(default)]
    token: String,
}

#[derive(Debug, Deserialize)]
struct DisconnectRequest {
    #[serde(default)]
    id: String,
}

#[derive(Debug, Serialize)]
struct StartedEvent {
    status: &'static str,
}

/// Answer to a connect or disconnect request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlResponse {
    pub id: String,
    pub connected: bool,
    pub configured: bool,
    /// Empty on success
    pub last_error: String,
}

#[derive(Debug, Clone, Copy)]
enum RequestKind {
    Connect,
    Disconnect,
}

/// MQTT front end of the [`Agent`] on the local broker
pub struct ControlBus {
    agent: Arc<Agent>,
    connector: Arc<dyn Connector>,
    local_url: Url,
    status_interval: Duration,
    retry_delay: Duration,
}

impl ControlBus {
    pub fn new(
        agent: Arc<Agent>,
        connector: Arc<dyn Connector>,
        local_url: Url,
        status_interval: Duration,
    ) -> Self {
        Self {
            agent,
            connector,
            local_url,
            status_interval,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Serve requests until `shutdown` fires, reopening the connection when it drops
    pub async fn run(self, mut shutdown: oneshot::Receiver<()>) {
        info!("connecting to the bus");
        let mut announced = false;

        loop {
            let (loss_tx, mut loss_rx) = mpsc::unbounded_channel();

            match self.open(loss_tx).await {
                Ok(endpoint) => {
                    if !announced {
                        publish_json(&*endpoint, STATUS_TOPIC, &StartedEvent { status: "started" })
                            .await;
                        announced = true;
                    }

                    let mut ticker = interval_at(
                        Instant::now() + self.status_interval,
                        self.status_interval,
                    );
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

                    loop {
                        tokio::select! {
                            biased;

                            _ = &mut shutdown => {
                                endpoint.disconnect().await;
                                info!("control bus stopped");
                                return;
                            }
                            Some(e) = loss_rx.recv() => {
                                error!("control connection lost: {}", e);
                                break;
                            }
                            _ = ticker.tick() => {
                                let status = self.agent.query_status();
                                debug!("status {:?}", status);
                                publish_json(&*endpoint, STATUS_TOPIC, &status).await;
                            }
                        }
                    }
                    endpoint.disconnect().await;
                }
                Err(e) => error!("error starting control connection: {}", e),
            }

            tokio::select! {
                biased;

                _ = &mut shutdown => return,
                _ = sleep(self.retry_delay) => {}
            }
        }
    }

    /// Connect and install the request subscriptions
    async fn open(
        &self,
        loss_tx: mpsc::UnboundedSender<RemoteError>,
    ) -> Result<Arc<dyn Endpoint>, RemoteError> {
        let on_loss: LossCallback = Arc::new(move |e| {
            let _ = loss_tx.send(e);
        });
        let endpoint = self
            .connector
            .connect(EndpointRole::Control, &self.local_url, None, on_loss)
            .await?;

        for (topic, kind) in [
            (CONNECT_TOPIC, RequestKind::Connect),
            (DISCONNECT_TOPIC, RequestKind::Disconnect),
        ] {
            let handler = self.handler(kind, Arc::downgrade(&endpoint));
            if let Err(e) = endpoint.subscribe(topic, handler).await {
                endpoint.disconnect().await;
                return Err(e);
            }
        }

        Ok(endpoint)
    }

    fn handler(&self, kind: RequestKind, endpoint: Weak<dyn Endpoint>) -> MessageHandler {
        let agent = self.agent.clone();
        Arc::new(move |msg: InboundMessage| {
            let agent = agent.clone();
            let endpoint = endpoint.clone();
            async move {
                let response = handle_request(&agent, kind, &msg.payload).await;
                if let Some(endpoint) = endpoint.upgrade() {
                    publish_json(&*endpoint, RESPONSE_TOPIC, &response).await;
                }
            }
            .boxed()
        })
    }
}

async fn handle_request(agent: &Agent, kind: RequestKind, payload: &[u8]) -> ControlResponse {
    let (id, result) = match kind {
        RequestKind::Connect => {
            info!("handleConnect");
            match serde_json::from_slice::<ConnectRequest>(payload) {
                Ok(req) => {
                    let result = agent.start_bridge(&req.url, &req.token).await;
                    (req.id, result.map_err(|e| e.to_string()))
                }
                Err(e) => {
                    error!("Unable to decode connect request {}", e);
                    (String::new(), Err(format!("invalid connect request: {}", e)))
                }
            }
        }
        RequestKind::Disconnect => {
            info!("handleDisconnect");
            match serde_json::from_slice::<DisconnectRequest>(payload) {
                Ok(req) => {
                    let result = agent.stop_bridge().await;
                    (req.id, result.map_err(|e| e.to_string()))
                }
                Err(e) => {
                    error!("Unable to decode disconnect request {}", e);
                    (
                        String::new(),
                        Err(format!("invalid disconnect request: {}", e)),
                    )
                }
            }
        }
    };

    let status = agent.bridge().status();
    ControlResponse {
        id,
        connected: status.connected,
        configured: status.configured,
        last_error: result.err().unwrap_or_default(),
    }
}

async fn publish_json<T: Serialize>(endpoint: &dyn Endpoint, topic: &str, value: &T) {
    let payload = match serde_json::to_vec(value) {
        Ok(payload) => payload,
        Err(e) => {
            error!("failed to encode {} message: {}", topic, e);
            return;
        }
    };
    if let Err(e) = endpoint.publish(topic, Bytes::from(payload)).await {
        warn!("publish to {} failed: {}", topic, e);
    }
}
