//! MQTT Endpoint
//!
//! [`Connector`] implementation on top of rumqttc. Each endpoint owns two
//! tasks: the event loop, which drives the connection and never blocks on
//! handlers, and a dispatcher, which runs the subscription handlers for each
//! delivered message in arrival order.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, QoS, SubAck, SubscribeReasonCode, Transport,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use url::Url;

use super::endpoint::{Connector, Endpoint, EndpointRole, LossCallback, MessageHandler, RemoteError};
use super::message::InboundMessage;
use crate::topic::topic_matches_filter;

/// How long a disconnect waits for the DISCONNECT packet to be flushed
const DISCONNECT_GRACE: Duration = Duration::from_millis(100);

/// Tunables for endpoints built by [`MqttConnector`]
#[derive(Debug, Clone)]
pub struct ConnectorSettings {
    /// Prefix for generated client ids
    pub client_id_prefix: String,
    /// MQTT keep-alive interval
    pub keep_alive: Duration,
    /// Maximum wait for CONNACK
    pub connect_timeout: Duration,
    /// Maximum wait for SUBACK
    pub subscribe_timeout: Duration,
    /// Capacity of the client request channel
    pub request_capacity: usize,
    /// Deliveries buffered between the event loop and the dispatcher
    pub dispatch_capacity: usize,
}

impl Default for ConnectorSettings {
    fn default() -> Self {
        Self {
            client_id_prefix: "meshbridge".to_string(),
            keep_alive: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(10),
            subscribe_timeout: Duration::from_secs(10),
            request_capacity: 100,
            dispatch_capacity: 1000,
        }
    }
}

/// Build rumqttc options for a broker URL.
///
/// `mqtt://` and `tcp://` connect in plain text (default port 1883),
/// `mqtts://`, `ssl://` and `tls://` use rustls (default port 8883).
/// The token, when present, is presented as the MQTT username.
pub fn mqtt_options(
    url: &Url,
    client_id: &str,
    credentials: Option<&str>,
    keep_alive: Duration,
) -> Result<MqttOptions, RemoteError> {
    let (tls, default_port) = match url.scheme() {
        "mqtt" | "tcp" => (false, 1883),
        "mqtts" | "ssl" | "tls" => (true, 8883),
        other => {
            return Err(RemoteError::Unknown(format!(
                "unsupported broker scheme '{}'",
                other
            )))
        }
    };
    let host = url
        .host_str()
        .ok_or_else(|| RemoteError::Unknown(format!("broker url {} has no host", url)))?;
    let port = url.port().unwrap_or(default_port);

    let mut options = MqttOptions::new(client_id, host, port);
    options.set_keep_alive(keep_alive).set_clean_session(true);
    if let Some(token) = credentials {
        options.set_credentials(token, "");
    }
    if tls {
        options.set_transport(Transport::tls_with_default_config());
    }
    Ok(options)
}

/// Map a rumqttc connection failure onto the bridge's failure taxonomy
fn classify(err: ConnectionError) -> RemoteError {
    match err {
        ConnectionError::ConnectionRefused(code) => match code {
            ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized => {
                RemoteError::CredentialRejected(format!("{:?}", code))
            }
            ConnectReturnCode::ServiceUnavailable => {
                RemoteError::TransportUnavailable(format!("{:?}", code))
            }
            other => RemoteError::Unknown(format!("connection refused: {:?}", other)),
        },
        ConnectionError::NetworkTimeout | ConnectionError::FlushTimeout => RemoteError::Timeout,
        ConnectionError::Io(e) => RemoteError::TransportUnavailable(e.to_string()),
        ConnectionError::Tls(e) => RemoteError::TransportUnavailable(e.to_string()),
        other => RemoteError::Unknown(other.to_string()),
    }
}

fn suback_result(ack: &SubAck) -> Result<(), String> {
    if ack
        .return_codes
        .iter()
        .any(|code| matches!(code, SubscribeReasonCode::Failure))
    {
        Err("refused by broker".to_string())
    } else {
        Ok(())
    }
}

/// Builds rumqttc-backed endpoints
pub struct MqttConnector {
    settings: ConnectorSettings,
}

impl MqttConnector {
    pub fn new(settings: ConnectorSettings) -> Self {
        Self { settings }
    }

    fn client_id(&self, role: EndpointRole) -> String {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        format!("{}-{}-{}", self.settings.client_id_prefix, role, now)
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), RemoteError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
            Ok(_) => {}
            Err(e) => return Err(classify(e)),
        }
    }
}

#[async_trait]
impl Connector for MqttConnector {
    async fn connect(
        &self,
        role: EndpointRole,
        url: &Url,
        credentials: Option<&str>,
        on_loss: LossCallback,
    ) -> Result<Arc<dyn Endpoint>, RemoteError> {
        let client_id = self.client_id(role);
        let options = mqtt_options(url, &client_id, credentials, self.settings.keep_alive)?;

        info!(
            "Building {} client for {}://{}",
            role,
            url.scheme(),
            url.host_str().unwrap_or_default()
        );

        let (client, mut eventloop) = AsyncClient::new(options, self.settings.request_capacity);

        timeout(self.settings.connect_timeout, wait_for_connack(&mut eventloop))
            .await
            .map_err(|_| RemoteError::Timeout)??;

        info!("({}) connected as {}", role, client_id);

        let endpoint: Arc<dyn Endpoint> =
            MqttEndpoint::spawn(role, client, eventloop, on_loss, &self.settings);
        Ok(endpoint)
    }

    fn supports(&self, url: &Url) -> bool {
        matches!(url.scheme(), "mqtt" | "tcp" | "mqtts" | "ssl" | "tls") && url.host_str().is_some()
    }
}

struct Route {
    filter: String,
    handler: MessageHandler,
}

type AckSender = oneshot::Sender<Result<(), String>>;

/// State shared between an endpoint and its tasks
struct Shared {
    role: EndpointRole,
    connected: AtomicBool,
    closing: AtomicBool,
    routes: RwLock<Vec<Route>>,
    /// SUBSCRIBE requests not yet written, in request order
    queued_acks: Mutex<VecDeque<AckSender>>,
    /// Written SUBSCRIBEs awaiting their SUBACK, by packet id
    pending_acks: Mutex<HashMap<u16, AckSender>>,
}

impl Shared {
    /// The oldest queued SUBSCRIBE went out as `pkid`
    fn subscription_sent(&self, pkid: u16) {
        if let Some(waiter) = self.queued_acks.lock().pop_front() {
            self.pending_acks.lock().insert(pkid, waiter);
        }
    }

    fn complete_subscription(&self, pkid: u16, result: Result<(), String>) {
        match self.pending_acks.lock().remove(&pkid) {
            // The subscriber may have given up already
            Some(waiter) => {
                let _ = waiter.send(result);
            }
            None => debug!("({}) unexpected SUBACK {}", self.role, pkid),
        }
    }

    fn fail_pending(&self, reason: &str) {
        let queued: Vec<AckSender> = self.queued_acks.lock().drain(..).collect();
        let pending: Vec<AckSender> = self.pending_acks.lock().drain().map(|(_, w)| w).collect();
        for waiter in queued.into_iter().chain(pending) {
            let _ = waiter.send(Err(reason.to_string()));
        }
    }

    fn handlers_for(&self, topic: &str) -> Vec<MessageHandler> {
        self.routes
            .read()
            .iter()
            .filter(|route| topic_matches_filter(topic, &route.filter))
            .map(|route| route.handler.clone())
            .collect()
    }
}

/// A live rumqttc connection
pub struct MqttEndpoint {
    shared: Arc<Shared>,
    client: AsyncClient,
    /// Keeps `queued_acks` in the order requests reach the event loop
    subscribe_order: tokio::sync::Mutex<()>,
    subscribe_timeout: Duration,
    event_task: Mutex<Option<JoinHandle<()>>>,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
}

impl MqttEndpoint {
    fn spawn(
        role: EndpointRole,
        client: AsyncClient,
        eventloop: EventLoop,
        on_loss: LossCallback,
        settings: &ConnectorSettings,
    ) -> Arc<Self> {
        let shared = Arc::new(Shared {
            role,
            connected: AtomicBool::new(true),
            closing: AtomicBool::new(false),
            routes: RwLock::new(Vec::new()),
            queued_acks: Mutex::new(VecDeque::new()),
            pending_acks: Mutex::new(HashMap::new()),
        });

        let (tx, rx) = mpsc::channel(settings.dispatch_capacity);
        let dispatch_task = tokio::spawn(Self::dispatch_loop(shared.clone(), rx));
        let event_task = tokio::spawn(Self::event_loop(shared.clone(), eventloop, tx, on_loss));

        Arc::new(Self {
            shared,
            client,
            subscribe_order: tokio::sync::Mutex::new(()),
            subscribe_timeout: settings.subscribe_timeout,
            event_task: Mutex::new(Some(event_task)),
            dispatch_task: Mutex::new(Some(dispatch_task)),
        })
    }

    /// Drive the connection until it drops or is closed
    async fn event_loop(
        shared: Arc<Shared>,
        mut eventloop: EventLoop,
        deliveries: mpsc::Sender<InboundMessage>,
        on_loss: LossCallback,
    ) {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let msg = InboundMessage::from(publish);
                    if let Err(mpsc::error::TrySendError::Full(msg)) = deliveries.try_send(msg) {
                        warn!(
                            "({}) dispatch queue full, dropping message on {}",
                            shared.role, msg.topic
                        );
                    }
                }
                Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => {
                    shared.subscription_sent(pkid);
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    shared.complete_subscription(ack.pkid, suback_result(&ack));
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    debug!("({}) DISCONNECT sent", shared.role);
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    shared.connected.store(false, Ordering::SeqCst);
                    shared.fail_pending("connection lost");
                    if shared.closing.load(Ordering::SeqCst) {
                        debug!("({}) event loop closed: {}", shared.role, e);
                        break;
                    }
                    let err = classify(e);
                    error!("({}) connection lost: {}", shared.role, err);
                    on_loss(err);
                    break;
                }
            }
        }
    }

    /// Run handlers for each delivery, in arrival order
    async fn dispatch_loop(shared: Arc<Shared>, mut rx: mpsc::Receiver<InboundMessage>) {
        while let Some(msg) = rx.recv().await {
            let handlers = shared.handlers_for(&msg.topic);
            if handlers.is_empty() {
                debug!("({}) no subscription for {}", shared.role, msg.topic);
                continue;
            }
            for handler in handlers {
                handler(msg.clone()).await;
            }
        }
    }
}

#[async_trait]
impl Endpoint for MqttEndpoint {
    async fn subscribe(&self, filter: &str, handler: MessageHandler) -> Result<(), RemoteError> {
        if !self.is_connected() {
            return Err(RemoteError::TransportUnavailable(format!(
                "{} endpoint is not connected",
                self.shared.role
            )));
        }

        let subscribe_error = |reason: String| RemoteError::Subscribe {
            filter: filter.to_string(),
            reason,
        };

        // Route first so nothing delivered right after the SUBACK is missed
        self.shared.routes.write().push(Route {
            filter: filter.to_string(),
            handler,
        });

        let (ack_tx, ack_rx) = oneshot::channel();
        {
            let _order = self.subscribe_order.lock().await;
            self.shared.queued_acks.lock().push_back(ack_tx);
            if let Err(e) = self.client.subscribe(filter, QoS::AtMostOnce).await {
                self.shared.queued_acks.lock().pop_back();
                return Err(subscribe_error(e.to_string()));
            }
        }

        match timeout(self.subscribe_timeout, ack_rx).await {
            Ok(Ok(Ok(()))) => {
                debug!("({}) subscribed to {}", self.shared.role, filter);
                Ok(())
            }
            Ok(Ok(Err(reason))) => Err(subscribe_error(reason)),
            Ok(Err(_)) => Err(subscribe_error("endpoint closed".to_string())),
            Err(_) => Err(RemoteError::Timeout),
        }
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), RemoteError> {
        self.client
            .publish_bytes(topic, QoS::AtMostOnce, false, payload)
            .await
            .map_err(|e| RemoteError::TransportUnavailable(e.to_string()))
    }

    async fn disconnect(&self) {
        if self.shared.closing.swap(true, Ordering::SeqCst) {
            return;
        }

        let was_connected = self.shared.connected.swap(false, Ordering::SeqCst);
        // Handlers hold the opposite endpoint; dropping them breaks the cycle
        self.shared.routes.write().clear();

        if was_connected {
            let _ = self.client.try_disconnect();
        }

        let event_task = self.event_task.lock().take();
        if let Some(mut task) = event_task {
            if timeout(DISCONNECT_GRACE, &mut task).await.is_err() {
                task.abort();
            }
        }
        if let Some(task) = self.dispatch_task.lock().take() {
            task.abort();
        }

        info!("({}) disconnected", self.shared.role);
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }
}

impl Drop for MqttEndpoint {
    fn drop(&mut self) {
        if let Some(task) = self.event_task.get_mut().take() {
            task.abort();
        }
        if let Some(task) = self.dispatch_task.get_mut().take() {
            task.abort();
        }
    }
}
