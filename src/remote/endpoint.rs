//! Endpoint Abstraction
//!
//! The capability the bridge consumes from a broker client: build a
//! connection, subscribe with a handler, publish, disconnect. Every
//! (re)connect attempt builds a fresh endpoint through a [`Connector`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use url::Url;

use super::message::InboundMessage;

/// Error type for endpoint operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Broker refused the credentials (bad token, not authorized)
    CredentialRejected(String),
    /// Broker could not be reached or the connection dropped
    TransportUnavailable(String),
    /// Connect or acknowledgement did not arrive in time
    Timeout,
    /// A subscription was refused or could not be installed
    Subscribe { filter: String, reason: String },
    /// Anything else
    Unknown(String),
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteError::CredentialRejected(msg) => write!(f, "Credentials rejected: {}", msg),
            RemoteError::TransportUnavailable(msg) => write!(f, "Transport unavailable: {}", msg),
            RemoteError::Timeout => write!(f, "Operation timed out"),
            RemoteError::Subscribe { filter, reason } => {
                write!(f, "Subscribe to {} failed: {}", filter, reason)
            }
            RemoteError::Unknown(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for RemoteError {}

/// Coarse failure classification used to pick a reconnect backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// The broker rejected our credentials
    CredentialRejected,
    /// Transport trouble, timeouts and everything else
    Transient,
}

impl RemoteError {
    pub fn class(&self) -> FailureClass {
        match self {
            RemoteError::CredentialRejected(_) => FailureClass::CredentialRejected,
            _ => FailureClass::Transient,
        }
    }
}

/// Which broker an endpoint is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointRole {
    Local,
    Cloud,
    /// The agent's own connection to the local broker
    Control,
}

impl fmt::Display for EndpointRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointRole::Local => write!(f, "local"),
            EndpointRole::Cloud => write!(f, "cloud"),
            EndpointRole::Control => write!(f, "control"),
        }
    }
}

/// Handler invoked for every message delivered on a subscription
pub type MessageHandler = Arc<dyn Fn(InboundMessage) -> BoxFuture<'static, ()> + Send + Sync>;

/// Callback fired once when an established connection is lost
pub type LossCallback = Arc<dyn Fn(RemoteError) + Send + Sync>;

/// A single managed connection to one broker
#[async_trait]
pub trait Endpoint: Send + Sync {
    /// Subscribe to `filter`, returning once the broker acknowledged it
    async fn subscribe(&self, filter: &str, handler: MessageHandler) -> Result<(), RemoteError>;

    /// Publish a payload (best effort, at most once)
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), RemoteError>;

    /// Close the connection. Calling this on a closed endpoint is a no-op.
    async fn disconnect(&self);

    /// Whether the connection is currently established
    fn is_connected(&self) -> bool;
}

/// Builds endpoints
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to `url`, waiting for the broker's acknowledgement.
    ///
    /// `credentials` is the token presented to the broker, if any.
    /// `on_loss` is invoked when the established connection later drops.
    async fn connect(
        &self,
        role: EndpointRole,
        url: &Url,
        credentials: Option<&str>,
        on_loss: LossCallback,
    ) -> Result<Arc<dyn Endpoint>, RemoteError>;

    /// Whether this connector can reach brokers at `url`
    fn supports(&self, _url: &Url) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_classification() {
        assert_eq!(
            RemoteError::CredentialRejected("bad token".into()).class(),
            FailureClass::CredentialRejected
        );
        assert_eq!(RemoteError::Timeout.class(), FailureClass::Transient);
        assert_eq!(
            RemoteError::TransportUnavailable("refused".into()).class(),
            FailureClass::Transient
        );
        assert_eq!(
            RemoteError::Subscribe {
                filter: "a/+".into(),
                reason: "refused".into()
            }
            .class(),
            FailureClass::Transient
        );
        assert_eq!(
            RemoteError::Unknown("?".into()).class(),
            FailureClass::Transient
        );
    }

    #[test]
    fn test_display() {
        let err = RemoteError::Subscribe {
            filter: "$device/+".into(),
            reason: "refused by broker".into(),
        };
        assert_eq!(err.to_string(), "Subscribe to $device/+ failed: refused by broker");
        assert_eq!(RemoteError::Timeout.to_string(), "Operation timed out");
        assert_eq!(EndpointRole::Cloud.to_string(), "cloud");
    }
}
