//! Transport collaborator interface
//!
//! The lifecycle never talks to an MQTT library directly. It asks a
//! [`Transport`] to open a connection for a set of [`SessionOptions`] and
//! receives [`TransportEvent`]s on a channel; the returned
//! [`TransportHandle`] is used to publish, subscribe and stop. Tests inject a
//! fake through the same seam.

use crate::error::TransportError;
use crate::session::SessionOptions;
use bytes::Bytes;
use tokio::sync::mpsc;

pub mod mqtt;

pub use rumqttc::QoS;

/// Events delivered by a running connection
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Broker accepted the connection
    Connected,
    /// Connection lost or closed; emitted once per connected period
    Disconnected,
    /// Inbound publish on a subscribed topic
    Message { topic: String, payload: Bytes },
}

/// Opens connections
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    type Handle: TransportHandle;

    /// Start a connection. Connecting and reconnecting happen in the
    /// background; progress is reported on `events`.
    async fn connect(
        &self,
        options: &SessionOptions,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Self::Handle, TransportError>;
}

/// A single running connection
#[async_trait::async_trait]
pub trait TransportHandle: Send + Sync + 'static {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError>;

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError>;

    /// Tear the connection down. A `Disconnected` event follows if the
    /// connection was up.
    async fn stop(&mut self) -> Result<(), TransportError>;
}

/// Type alias for the rumqttc-backed transport
pub type MqttTransport = mqtt::MqttTransport;
