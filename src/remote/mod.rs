//! Remote Broker Communication
//!
//! Transport seam between the bridge and the brokers it connects.
//! [`Connector`] builds [`Endpoint`]s; [`MqttConnector`] is the
//! production implementation on top of rumqttc.

mod endpoint;
mod message;
mod mqtt;

#[cfg(test)]
pub(crate) mod mock;

pub use endpoint::{
    Connector, Endpoint, EndpointRole, FailureClass, LossCallback, MessageHandler, RemoteError,
};
pub use message::InboundMessage;
pub use mqtt::{mqtt_options, ConnectorSettings, MqttConnector};
