//! Transport seam between the link and the MQTT client library
//!
//! Two traits keep the link independent of `rumqttc`:
//!
//! - [`Transport`]: outbound side (publish, subscribe, disconnect), cheap to clone
//!   behind an `Arc` and shared by dispatcher, liveness monitor and router.
//! - [`EventSource`]: inbound side, owned by the link driver alone. Every inbound
//!   publish arrives as an explicit `(topic, payload)` pair in [`InboundMessage`].

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, Incoming, MqttOptions, Outgoing, QoS,
    SubscribeFilter,
};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::error::LinkError;
use crate::session::CredentialProvider;

/// One inbound publish
#[derive(Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

impl fmt::Debug for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "InboundMessage({}, {})",
            self.topic,
            String::from_utf8_lossy(&self.payload)
        )
    }
}

/// What the link driver learns from the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Handshake completed
    ConnAck,
    Message(InboundMessage),
    /// Broker closed the session
    BrokerDisconnect,
    /// Our own graceful DISCONNECT left the client
    Disconnecting,
    /// Local network went away / came back
    NetworkOffline,
    NetworkOnline,
    /// Handshake or mid-session transport error
    Failure(String),
    /// Keep-alive traffic, acks and other packets without meaning for the link
    Idle,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), LinkError>;

    /// Subscribes the whole set in one request
    async fn subscribe_many(&self, topics: &[String]) -> Result<(), LinkError>;

    async fn disconnect(&self) -> Result<(), LinkError>;
}

#[async_trait]
pub trait EventSource: Send {
    /// Next event; `None` once the source is exhausted
    async fn next_event(&mut self) -> Option<TransportEvent>;

    /// Called right before a scheduled reconnect attempt
    fn before_reconnect(&mut self) {}
}

/// `rumqttc` client handle with the QoS the link was configured for
#[derive(Clone)]
pub struct MqttTransport {
    client: AsyncClient,
    qos: QoS,
}

impl MqttTransport {
    pub fn new(client: AsyncClient, qos: QoS) -> Self {
        Self { client, qos }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), LinkError> {
        self.client
            .publish(topic, self.qos, false, payload)
            .await
            .map_err(|e| LinkError::PublishError {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn subscribe_many(&self, topics: &[String]) -> Result<(), LinkError> {
        let filters: Vec<SubscribeFilter> = topics
            .iter()
            .map(|topic| SubscribeFilter::new(topic.clone(), self.qos))
            .collect();
        self.client
            .subscribe_many(filters)
            .await
            .map_err(|e| LinkError::SubscribeError(e.to_string()))
    }

    async fn disconnect(&self) -> Result<(), LinkError> {
        self.client
            .disconnect()
            .await
            .map_err(|e| LinkError::DisconnectError(e.to_string()))
    }
}

/// `rumqttc` event loop. Polling it again after an error reconnects.
pub struct MqttEvents {
    eventloop: EventLoop,
    credentials: Arc<dyn CredentialProvider>,
}

impl MqttEvents {
    pub fn new(eventloop: EventLoop, credentials: Arc<dyn CredentialProvider>) -> Self {
        Self {
            eventloop,
            credentials,
        }
    }
}

#[async_trait]
impl EventSource for MqttEvents {
    async fn next_event(&mut self) -> Option<TransportEvent> {
        Some(map_event(self.eventloop.poll().await))
    }

    fn before_reconnect(&mut self) {
        apply_credentials(&mut self.eventloop.mqtt_options, self.credentials.as_ref());
    }
}

/// Writes the provider's current credential into the options.
///
/// A failing provider keeps the previous credential; the broker will reject it if
/// it really expired and the link stays in the retry path.
pub fn apply_credentials(options: &mut MqttOptions, provider: &dyn CredentialProvider) {
    match provider.credential() {
        Ok(Some(credential)) => {
            options.set_credentials(credential.username, credential.password);
        }
        Ok(None) => debug!("Connecting without credentials"),
        Err(e) => warn!("Session provider failed, keeping previous credential: {}", e),
    }
}

fn map_event(event: Result<Event, ConnectionError>) -> TransportEvent {
    match event {
        Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
            debug!("ConnAck received: {:?}", ack);
            TransportEvent::ConnAck
        }
        Ok(Event::Incoming(Incoming::Publish(publish))) => TransportEvent::Message(
            InboundMessage::new(publish.topic, publish.payload.to_vec()),
        ),
        Ok(Event::Incoming(Incoming::Disconnect)) => TransportEvent::BrokerDisconnect,
        Ok(Event::Outgoing(Outgoing::Disconnect)) => TransportEvent::Disconnecting,
        Ok(_) => TransportEvent::Idle,
        Err(e) => {
            error!("MQTT connection error: {}", e);
            TransportEvent::Failure(e.to_string())
        }
    }
}

/// Scripted or bridged sources (another transport, tests)
#[async_trait]
impl EventSource for mpsc::UnboundedReceiver<TransportEvent> {
    async fn next_event(&mut self) -> Option<TransportEvent> {
        self.recv().await
    }
}
