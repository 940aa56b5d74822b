//! ---
//! gl_section: "02-messaging-wire-model"
//! gl_subsection: "module"
//! gl_type: "source"
//! gl_scope: "code"
//! gl_description: "Transport seam shared by all bus backends."
//! gl_version: "v0.0.0-prealpha"
//! gl_owner: "tbd"
//! ---
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use tokio::sync::watch;

use crate::logging::{log_message, MessageDirection};
use crate::{QoS, Result};

/// Message handed to a subscriber by the transport's dispatch context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Topic the message was published on.
    pub topic: String,
    /// Raw payload bytes.
    pub payload: Bytes,
    /// Whether the broker delivered a stored retained value.
    pub retain: bool,
}

impl InboundMessage {
    /// Construct a live (non-retained) inbound message.
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain: false,
        }
    }
}

/// Message the broker publishes on the client's behalf after an unclean disconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    /// Topic the will is published on.
    pub topic: String,
    /// Payload of the will.
    pub payload: Bytes,
    /// Delivery guarantee for the will.
    pub qos: QoS,
    /// Whether the will replaces the retained value.
    pub retain: bool,
}

impl LastWill {
    /// Retained will carrying a JSON encoded value.
    pub fn retained_json<T: Serialize>(topic: impl Into<String>, value: &T) -> Result<Self> {
        Ok(Self {
            topic: topic.into(),
            payload: Bytes::from(serde_json::to_vec(value)?),
            qos: QoS::AtLeastOnce,
            retain: true,
        })
    }
}

/// Publish/subscribe contract consumed by the core components.
///
/// Inbound messages are not pulled through the trait: each backend hands out
/// a channel receiver at connect time which the peer's dispatch loop drains.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish a payload. Fails fast with [`crate::MessagingError::NotConnected`]
    /// when the bus is unreachable.
    async fn publish(&self, topic: &str, payload: Bytes, qos: QoS, retain: bool) -> Result<()>;
    /// Subscribe to a topic filter; retained values are delivered immediately.
    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<()>;
    /// Whether the transport currently holds a live connection.
    fn is_connected(&self) -> bool;
    /// Watch channel following the connected flag.
    fn connection_state(&self) -> watch::Receiver<bool>;
    /// Disconnect cleanly; the broker does not publish the last will.
    async fn disconnect(&self) -> Result<()>;
    /// Human-readable transport name for logging/metrics.
    fn name(&self) -> &'static str;
}

/// Serialize `value` as JSON and publish it.
pub async fn publish_json<T>(
    transport: &dyn Transport,
    topic: &str,
    value: &T,
    qos: QoS,
    retain: bool,
) -> Result<()>
where
    T: Serialize + Sync + ?Sized,
{
    let payload = Bytes::from(serde_json::to_vec(value)?);
    log_message(MessageDirection::Outbound, topic, &payload);
    transport.publish(topic, payload, qos, retain).await
}
