//! ---
//! gl_section: "02-messaging-wire-model"
//! gl_subsection: "module"
//! gl_type: "source"
//! gl_scope: "code"
//! gl_description: "Delivery guarantees requested from the bus."
//! gl_version: "v0.0.0-prealpha"
//! gl_owner: "tbd"
//! ---
use serde::{Deserialize, Serialize};

/// Delivery guarantee requested per publish or subscription.
///
/// The correlation engine assumes nothing stronger than [`QoS::AtLeastOnce`];
/// duplicates are expected and handled above the transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QoS {
    /// Fire and forget.
    AtMostOnce,
    /// Delivered one or more times.
    #[default]
    AtLeastOnce,
    /// Broker level handshake; still treated as at-least-once by callers.
    ExactlyOnce,
}

impl From<QoS> for rumqttc::QoS {
    fn from(value: QoS) -> Self {
        match value {
            QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
            QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

impl From<rumqttc::QoS> for QoS {
    fn from(value: rumqttc::QoS) -> Self {
        match value {
            rumqttc::QoS::AtMostOnce => QoS::AtMostOnce,
            rumqttc::QoS::AtLeastOnce => QoS::AtLeastOnce,
            rumqttc::QoS::ExactlyOnce => QoS::ExactlyOnce,
        }
    }
}
