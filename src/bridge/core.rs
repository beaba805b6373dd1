//! Bridge Core
//!
//! Owns the local and cloud endpoints, installs the forwarding
//! subscriptions and keeps them alive through a single reconnect worker.
//!
//! All endpoint (re)creation happens under the session lock, either from
//! `start`/`stop` or from the worker. Loss notifications only flip the
//! connectivity flag and queue an event for the worker; the worker tears
//! down, arms the backoff timer and reconnects when it fires.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde::{Serialize, Serializer};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

use super::backoff::BackoffPolicy;
use super::counters::{CounterSnapshot, TrafficCounters};
use super::error::BridgeError;
use super::forward::Forwarder;
use super::payload::cloud_source_id;
use super::rules::{Direction, RuleSet};
use crate::remote::{Connector, Endpoint, EndpointRole, LossCallback, RemoteError};

/// Process-wide bridge settings
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    /// Local broker, connected without credentials
    pub local_url: Url,
    /// Device serial, used as the source tag of local messages
    pub serial: String,
    /// Reconnect delays
    pub backoff: BackoffPolicy,
}

/// Snapshot returned by [`Bridge::status`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeStatus {
    pub configured: bool,
    pub connected: bool,
    #[serde(serialize_with = "serialize_last_error")]
    pub last_error: Option<RemoteError>,
    pub counters: CounterSnapshot,
}

fn serialize_last_error<S: Serializer>(
    error: &Option<RemoteError>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match error {
        Some(e) => serializer.serialize_some(&e.to_string()),
        None => serializer.serialize_none(),
    }
}

/// Per-session cloud target supplied to `start`
struct CloudTarget {
    url: Url,
    token: String,
    source: Arc<str>,
}

struct LossEvent {
    role: EndpointRole,
    generation: u64,
    error: RemoteError,
}

/// Channels into the worker loop of the current session
struct Signals {
    reconnect_tx: mpsc::Sender<()>,
    loss_tx: mpsc::UnboundedSender<LossEvent>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

#[derive(Default)]
struct Session {
    cloud: Option<CloudTarget>,
    local: Option<Arc<dyn Endpoint>>,
    remote: Option<Arc<dyn Endpoint>>,
    signals: Option<Signals>,
    worker: Option<JoinHandle<()>>,
}

struct Inner {
    settings: BridgeSettings,
    local_source: Arc<str>,
    rules: RuleSet,
    connector: Arc<dyn Connector>,
    session: tokio::sync::Mutex<Session>,
    configured: AtomicBool,
    connected: AtomicBool,
    last_error: RwLock<Option<RemoteError>>,
    counters: Arc<TrafficCounters>,
    timer: Mutex<Option<JoinHandle<()>>>,
    /// Bumped on every teardown; loss events from older endpoints are stale
    generation: AtomicU64,
}

/// Bridge between a local broker and a cloud broker.
///
/// Dropping the last handle of a configured bridge tears it down like
/// [`Bridge::stop`], except that the disconnects finish in the background.
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<Inner>,
}

impl Bridge {
    pub fn new(settings: BridgeSettings, rules: RuleSet, connector: Arc<dyn Connector>) -> Self {
        let local_source: Arc<str> = Arc::from(settings.serial.as_str());
        Self {
            inner: Arc::new(Inner {
                settings,
                local_source,
                rules,
                connector,
                session: tokio::sync::Mutex::new(Session::default()),
                configured: AtomicBool::new(false),
                connected: AtomicBool::new(false),
                last_error: RwLock::new(None),
                counters: Arc::new(TrafficCounters::new()),
                timer: Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Configure the cloud side and connect.
    ///
    /// A failed initial connect is returned to the caller, but the bridge
    /// stays configured and keeps retrying in the background.
    pub async fn start(&self, cloud_url: &str, token: &str) -> Result<(), BridgeError> {
        let inner = &self.inner;
        let mut session = inner.session.lock().await;

        if inner.configured.load(Ordering::SeqCst) {
            warn!("Already configured.");
            return Err(BridgeError::AlreadyConfigured);
        }

        let url = Url::parse(cloud_url).map_err(|e| {
            BridgeError::InvalidConfiguration(format!("cloud url '{}': {}", cloud_url, e))
        })?;
        if !inner.connector.supports(&url) {
            return Err(BridgeError::InvalidConfiguration(format!(
                "unsupported cloud url '{}'",
                url
            )));
        }
        let source = cloud_source_id(&url).ok_or_else(|| {
            BridgeError::InvalidConfiguration(format!("cloud url '{}' has no host", url))
        })?;

        info!("Connecting the bridge");

        session.cloud = Some(CloudTarget {
            url,
            token: token.to_string(),
            source: Arc::from(source),
        });
        inner.configured.store(true, Ordering::SeqCst);

        let (reconnect_tx, reconnect_rx) = mpsc::channel(1);
        let (loss_tx, loss_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        session.signals = Some(Signals {
            reconnect_tx,
            loss_tx,
            shutdown_tx: Some(shutdown_tx),
        });

        let result = inner.connect(&mut session).await;
        if let Err(ref e) = result {
            error!("Connect failed {}", e);
            inner.schedule_reconnect(&mut session, e.clone()).await;
        }

        session.worker = Some(tokio::spawn(Inner::run_worker(
            Arc::downgrade(inner),
            reconnect_rx,
            loss_rx,
            shutdown_rx,
        )));

        result.map_err(BridgeError::from)
    }

    /// Tear down both endpoints and the worker
    pub async fn stop(&self) -> Result<(), BridgeError> {
        let inner = &self.inner;

        let worker = {
            let mut session = inner.session.lock().await;

            if !inner.configured.load(Ordering::SeqCst) {
                warn!("Already unconfigured.");
                return Err(BridgeError::AlreadyUnconfigured);
            }

            info!("Disconnecting bridge");

            if let Some(mut signals) = session.signals.take() {
                if let Some(shutdown_tx) = signals.shutdown_tx.take() {
                    let _ = shutdown_tx.send(());
                }
            }
            inner.configured.store(false, Ordering::SeqCst);
            inner.cancel_timer();
            inner.disconnect_all(&mut session).await;
            session.cloud = None;
            session.worker.take()
        };

        // The worker may be queued on the session lock; it exits once it sees the shutdown
        if let Some(worker) = worker {
            let _ = worker.await;
        }

        Ok(())
    }

    /// Snapshot of the bridge state. Never waits on I/O.
    pub fn status(&self) -> BridgeStatus {
        let inner = &self.inner;
        BridgeStatus {
            configured: inner.configured.load(Ordering::SeqCst),
            connected: inner.connected.load(Ordering::SeqCst),
            last_error: inner.last_error.read().clone(),
            counters: inner.counters.snapshot(),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.inner.configured.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn rules(&self) -> &RuleSet {
        &self.inner.rules
    }
}

impl Inner {
    /// Build both endpoints (local first) and install the subscriptions
    async fn connect(self: &Arc<Self>, session: &mut Session) -> Result<(), RemoteError> {
        // Never two live subscription sets against the same broker
        self.disconnect_all(session).await;
        let generation = self.generation.load(Ordering::SeqCst);

        let (Some(cloud), Some(signals)) = (session.cloud.as_ref(), session.signals.as_ref())
        else {
            return Err(RemoteError::Unknown("bridge is not configured".to_string()));
        };
        let cloud_url = cloud.url.clone();
        let token = cloud.token.clone();
        let cloud_source = cloud.source.clone();
        let loss_tx = signals.loss_tx.clone();

        let local = self
            .connect_endpoint(
                EndpointRole::Local,
                &self.settings.local_url,
                None,
                generation,
                loss_tx.clone(),
            )
            .await?;
        session.local = Some(local.clone());

        let credentials = (!token.is_empty()).then_some(token.as_str());
        let remote = self
            .connect_endpoint(EndpointRole::Cloud, &cloud_url, credentials, generation, loss_tx)
            .await?;
        session.remote = Some(remote.clone());

        self.install_subscriptions(&local, &remote, cloud_source)
            .await?;

        self.connected.store(true, Ordering::SeqCst);
        info!("Bridge connected");
        Ok(())
    }

    /// `connect` from the worker: also clears the recorded failure
    async fn reconnect(self: &Arc<Self>, session: &mut Session) -> Result<(), RemoteError> {
        self.connect(session).await?;
        *self.last_error.write() = None;
        Ok(())
    }

    async fn connect_endpoint(
        self: &Arc<Self>,
        role: EndpointRole,
        url: &Url,
        credentials: Option<&str>,
        generation: u64,
        loss_tx: mpsc::UnboundedSender<LossEvent>,
    ) -> Result<Arc<dyn Endpoint>, RemoteError> {
        let on_loss = self.loss_callback(role, generation, loss_tx);
        match self.connector.connect(role, url, credentials, on_loss).await {
            Ok(endpoint) => Ok(endpoint),
            Err(e) => {
                self.connected.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Runs on the transport's context: mark disconnected, hand off to the worker
    fn loss_callback(
        self: &Arc<Self>,
        role: EndpointRole,
        generation: u64,
        loss_tx: mpsc::UnboundedSender<LossEvent>,
    ) -> LossCallback {
        let inner: Weak<Self> = Arc::downgrade(self);
        Arc::new(move |error| {
            if let Some(inner) = inner.upgrade() {
                if inner.generation.load(Ordering::SeqCst) == generation {
                    inner.connected.store(false, Ordering::SeqCst);
                }
            }
            let _ = loss_tx.send(LossEvent {
                role,
                generation,
                error,
            });
        })
    }

    async fn install_subscriptions(
        &self,
        local: &Arc<dyn Endpoint>,
        remote: &Arc<dyn Endpoint>,
        cloud_source: Arc<str>,
    ) -> Result<(), RemoteError> {
        self.subscribe_direction(Direction::LocalToCloud, local, remote, self.local_source.clone())
            .await?;
        self.subscribe_direction(Direction::CloudToLocal, remote, local, cloud_source)
            .await
    }

    async fn subscribe_direction(
        &self,
        direction: Direction,
        src: &Arc<dyn Endpoint>,
        dst: &Arc<dyn Endpoint>,
        source: Arc<str>,
    ) -> Result<(), RemoteError> {
        for rule in self.rules.rules(direction) {
            let handler = Forwarder::new(
                direction,
                rule.clone(),
                source.clone(),
                dst.clone(),
                self.counters.clone(),
            )
            .into_handler();

            src.subscribe(rule.pattern(), handler).await?;
            info!("({}) subscribed to {}", direction, rule.pattern());
        }
        Ok(())
    }

    /// Disconnect whatever endpoints exist; safe when they are already down
    async fn disconnect_all(&self, session: &mut Session) {
        self.connected.store(false, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);

        let endpoints = [session.local.take(), session.remote.take()];
        if endpoints.iter().all(Option::is_none) {
            return;
        }

        debug!("Disconnecting bridge endpoints");
        for endpoint in endpoints.into_iter().flatten() {
            endpoint.disconnect().await;
        }
    }

    /// Record the failure, tear down and arm the one reconnect timer
    async fn schedule_reconnect(&self, session: &mut Session, reason: RemoteError) {
        *self.last_error.write() = Some(reason.clone());
        self.disconnect_all(session).await;

        let Some(reconnect_tx) = session.signals.as_ref().map(|s| s.reconnect_tx.clone()) else {
            return;
        };

        let delay = self.settings.backoff.delay_for(&reason);
        warn!("Reconnect failed trying again in {:?}", delay);

        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // A signal that is already pending covers this one
            let _ = reconnect_tx.try_send(());
        });

        if let Some(previous) = self.timer.lock().replace(timer) {
            previous.abort();
        }
    }

    fn cancel_timer(&self) {
        if let Some(timer) = self.timer.lock().take() {
            timer.abort();
        }
    }

    /// The single reconnect worker of a session.
    ///
    /// Holds the bridge only while handling an event, so dropping the last
    /// [`Bridge`] handle ends the session.
    async fn run_worker(
        this: Weak<Self>,
        mut reconnect_rx: mpsc::Receiver<()>,
        mut loss_rx: mpsc::UnboundedReceiver<LossEvent>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown_rx => {
                    info!("shutting down bridge");
                    return;
                }
                Some(event) = loss_rx.recv() => {
                    let Some(inner) = this.upgrade() else { return };
                    inner.handle_loss(event).await;
                }
                Some(()) = reconnect_rx.recv() => {
                    let Some(inner) = this.upgrade() else { return };
                    inner.handle_reconnect().await;
                }
                else => return,
            }
        }
    }

    async fn handle_loss(self: &Arc<Self>, event: LossEvent) {
        let mut session = self.session.lock().await;

        if !self.configured.load(Ordering::SeqCst)
            || event.generation != self.generation.load(Ordering::SeqCst)
        {
            debug!(
                "Ignoring stale connection loss from {} endpoint: {}",
                event.role, event.error
            );
            return;
        }

        error!("Connection failed ({}) {}", event.role, event.error);
        self.schedule_reconnect(&mut session, event.error).await;
    }

    async fn handle_reconnect(self: &Arc<Self>) {
        let mut session = self.session.lock().await;

        if !self.configured.load(Ordering::SeqCst) {
            return;
        }

        info!("reconnecting");
        if let Err(e) = self.reconnect(&mut session).await {
            error!("Reconnect failed {}", e);
            self.schedule_reconnect(&mut session, e).await;
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if !*self.configured.get_mut() {
            return;
        }
        warn!("Bridge dropped while configured, shutting down");

        if let Some(timer) = self.timer.get_mut().take() {
            timer.abort();
        }
        let session = self.session.get_mut();
        // Dropping the shutdown sender ends the worker
        session.signals = None;

        let endpoints: Vec<Arc<dyn Endpoint>> = [session.local.take(), session.remote.take()]
            .into_iter()
            .flatten()
            .collect();
        if endpoints.is_empty() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    for endpoint in endpoints {
                        endpoint.disconnect().await;
                    }
                });
            }
            Err(_) => warn!("No runtime to disconnect bridge endpoints"),
        }
    }
}
