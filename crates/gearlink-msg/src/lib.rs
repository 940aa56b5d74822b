//! ---
//! gl_section: "02-messaging-wire-model"
//! gl_subsection: "module"
//! gl_type: "source"
//! gl_scope: "code"
//! gl_description: "Wire types, topic space and transport adapters."
//! gl_version: "v0.0.0-prealpha"
//! gl_owner: "tbd"
//! ---
//! Messaging primitives shared by the controller and worker peers.
//!
//! The bus only offers topic-addressed, at-least-once delivery. This crate
//! defines the JSON wire model carried on it, the per-deployment topic space,
//! and the [`Transport`] seam with an in-memory broker and an MQTT adapter.
#![warn(missing_docs)]

pub mod dispatch;
pub mod logging;
pub mod memory;
pub mod mqtt;
pub mod qos;
pub mod topics;
pub mod transport;
pub mod types;

/// Shared result type for messaging operations.
pub type Result<T> = std::result::Result<T, MessagingError>;

/// Failures raised by transports and wire decoding.
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    /// The transport has no live connection to the bus.
    #[error("transport {0} is not connected")]
    NotConnected(&'static str),
    /// An inbound payload could not be decoded for the topic it arrived on.
    #[error("malformed message on {topic}: {source}")]
    Malformed {
        /// Topic the payload was received on.
        topic: String,
        /// Underlying decode failure.
        #[source]
        source: serde_json::Error,
    },
    /// Wrapper for JSON serialization problems on the outbound path.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// Error reported by the MQTT client.
    #[error("mqtt client error: {0}")]
    Mqtt(String),
    /// Wrapper for IO errors encountered during messaging operations.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub use dispatch::BusEvent;
pub use logging::{log_message, BusMetricsExporter, MessageDirection};
pub use memory::{InMemoryBroker, InMemoryTransport, PublishRecord};
pub use mqtt::{MqttSettings, MqttTransport};
pub use qos::QoS;
pub use topics::{TopicKind, TopicSet};
pub use transport::{publish_json, InboundMessage, LastWill, Transport};
pub use types::{
    epoch_seconds, CommandMessage, ConfigurationSnapshot, CorrelationId, PresenceRecord,
    PresenceState, ReplyMessage, SessionEnd, SessionSummary, StartSignal, WirePayload,
};
