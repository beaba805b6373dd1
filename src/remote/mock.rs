//! Scripted in-memory transport for unit tests

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use url::Url;

use super::{
    Connector, Endpoint, EndpointRole, InboundMessage, LossCallback, MessageHandler, RemoteError,
};
use crate::topic::topic_matches_filter;

pub(crate) struct MockEndpoint {
    connected: AtomicBool,
    subscriptions: Mutex<Vec<(String, MessageHandler)>>,
    published: Mutex<Vec<(String, Bytes)>>,
    pub(crate) disconnects: AtomicUsize,
    fail_subscribe: Option<String>,
    pub(crate) on_loss: LossCallback,
}

impl MockEndpoint {
    /// Deliver a message to every matching subscription
    pub(crate) async fn deliver(&self, topic: &str, payload: &str) -> InboundMessage {
        let msg = InboundMessage::new(topic, Bytes::copy_from_slice(payload.as_bytes()));
        let handlers: Vec<MessageHandler> = self
            .subscriptions
            .lock()
            .iter()
            .filter(|(filter, _)| topic_matches_filter(topic, filter))
            .map(|(_, handler)| handler.clone())
            .collect();
        for handler in handlers {
            handler(msg.clone()).await;
        }
        msg
    }

    /// Simulate the transport noticing a dropped connection
    pub(crate) fn drop_connection(&self, error: RemoteError) {
        if self.connected.swap(false, Ordering::SeqCst) {
            (self.on_loss)(error);
        }
    }

    pub(crate) fn published(&self) -> Vec<(String, String)> {
        self.published
            .lock()
            .iter()
            .map(|(t, p)| (t.clone(), String::from_utf8_lossy(p).into_owned()))
            .collect()
    }

    pub(crate) fn filters(&self) -> Vec<String> {
        self.subscriptions
            .lock()
            .iter()
            .map(|(f, _)| f.clone())
            .collect()
    }
}

#[async_trait]
impl Endpoint for MockEndpoint {
    async fn subscribe(&self, filter: &str, handler: MessageHandler) -> Result<(), RemoteError> {
        if self.fail_subscribe.as_deref() == Some(filter) {
            return Err(RemoteError::Subscribe {
                filter: filter.to_string(),
                reason: "refused by broker".to_string(),
            });
        }
        self.subscriptions
            .lock()
            .push((filter.to_string(), handler));
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), RemoteError> {
        self.published.lock().push((topic.to_string(), payload));
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.subscriptions.lock().clear();
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Records every connect attempt and hands out [`MockEndpoint`]s
#[derive(Default)]
pub(crate) struct MockConnector {
    failures: Mutex<HashMap<EndpointRole, VecDeque<RemoteError>>>,
    pub(crate) attempts: Mutex<Vec<(EndpointRole, String, Option<String>)>>,
    endpoints: Mutex<Vec<(EndpointRole, Arc<MockEndpoint>)>>,
    pub(crate) fail_subscribe: Mutex<Option<String>>,
}

impl MockConnector {
    /// Fail the next connect attempt for `role`
    pub(crate) fn fail_next(&self, role: EndpointRole, error: RemoteError) {
        self.failures
            .lock()
            .entry(role)
            .or_default()
            .push_back(error);
    }

    pub(crate) fn attempts(&self, role: EndpointRole) -> usize {
        self.attempts
            .lock()
            .iter()
            .filter(|(r, _, _)| *r == role)
            .count()
    }

    pub(crate) fn endpoints(&self, role: EndpointRole) -> Vec<Arc<MockEndpoint>> {
        self.endpoints
            .lock()
            .iter()
            .filter(|(r, _)| *r == role)
            .map(|(_, e)| e.clone())
            .collect()
    }

    pub(crate) fn latest(&self, role: EndpointRole) -> Arc<MockEndpoint> {
        self.endpoints(role).pop().expect("no endpoint built")
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        role: EndpointRole,
        url: &Url,
        credentials: Option<&str>,
        on_loss: LossCallback,
    ) -> Result<Arc<dyn Endpoint>, RemoteError> {
        self.attempts
            .lock()
            .push((role, url.to_string(), credentials.map(str::to_string)));

        if let Some(error) = self
            .failures
            .lock()
            .get_mut(&role)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }

        let endpoint = Arc::new(MockEndpoint {
            connected: AtomicBool::new(true),
            subscriptions: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
            disconnects: AtomicUsize::new(0),
            fail_subscribe: self.fail_subscribe.lock().clone(),
            on_loss,
        });
        self.endpoints.lock().push((role, endpoint.clone()));
        Ok(endpoint)
    }
}
