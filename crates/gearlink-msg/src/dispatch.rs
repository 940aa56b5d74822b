//! ---
//! gl_section: "02-messaging-wire-model"
//! gl_subsection: "module"
//! gl_type: "source"
//! gl_scope: "code"
//! gl_description: "Decoding inbound bus traffic into typed events."
//! gl_version: "v0.0.0-prealpha"
//! gl_owner: "tbd"
//! ---
use serde::de::DeserializeOwned;

use crate::topics::{TopicKind, TopicSet};
use crate::transport::InboundMessage;
use crate::types::{
    CommandMessage, ConfigurationSnapshot, PresenceRecord, ReplyMessage, SessionEnd, StartSignal,
};
use crate::{MessagingError, Result};

/// Typed view of one inbound message, routed by topic and discriminator.
///
/// Peers consume these from a single dispatch loop and hand each variant to
/// the component that owns it.
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    /// Session start trigger.
    Start(StartSignal),
    /// Session summary from the orchestrator.
    End(SessionEnd),
    /// Correlated command for the executor.
    Command(CommandMessage),
    /// Correlated reply for the correlation engine.
    Reply(ReplyMessage),
    /// Presence snapshot of a peer.
    Presence(PresenceRecord),
    /// Retained configuration snapshot.
    Configuration(ConfigurationSnapshot),
}

impl BusEvent {
    /// Decode an inbound message.
    ///
    /// Returns `Ok(None)` for topics outside the deployment or payloads whose
    /// `type` discriminator does not belong on the topic, and
    /// [`MessagingError::Malformed`] when the payload cannot be decoded.
    pub fn decode(topics: &TopicSet, message: &InboundMessage) -> Result<Option<Self>> {
        let Some(kind) = topics.classify(&message.topic) else {
            return Ok(None);
        };
        let event = match kind {
            TopicKind::CtrlStart => {
                let signal: StartSignal = decode_json(message)?;
                (signal.kind == StartSignal::KIND).then_some(BusEvent::Start(signal))
            }
            TopicKind::CtrlEnd => {
                let end: SessionEnd = decode_json(message)?;
                (end.kind == SessionEnd::KIND).then_some(BusEvent::End(end))
            }
            TopicKind::CmdPoint => {
                let command: CommandMessage = decode_json(message)?;
                (command.kind == CommandMessage::MOVE_POINT).then_some(BusEvent::Command(command))
            }
            TopicKind::TelemetryResult => {
                let reply: ReplyMessage = decode_json(message)?;
                ReplyMessage::is_reply_kind(&reply.kind).then_some(BusEvent::Reply(reply))
            }
            TopicKind::Status => Some(BusEvent::Presence(decode_json(message)?)),
            TopicKind::ConfigSetting => Some(BusEvent::Configuration(decode_json(message)?)),
        };
        Ok(event)
    }

    /// Short label used in logs.
    pub fn label(&self) -> &'static str {
        match self {
            BusEvent::Start(_) => "start",
            BusEvent::End(_) => "end",
            BusEvent::Command(_) => "command",
            BusEvent::Reply(_) => "reply",
            BusEvent::Presence(_) => "presence",
            BusEvent::Configuration(_) => "configuration",
        }
    }
}

fn decode_json<T: DeserializeOwned>(message: &InboundMessage) -> Result<T> {
    serde_json::from_slice(&message.payload).map_err(|source| MessagingError::Malformed {
        topic: message.topic.clone(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topics() -> TopicSet {
        TopicSet::new("id1")
    }

    #[test]
    fn reply_routed_by_topic() {
        let message = InboundMessage::new(
            "v1/id1/telemetry/result",
            r#"{"type":"result_feature_set","req_id":"r-1","ts":1,"sender":"B","values":[]}"#,
        );
        let event = BusEvent::decode(&topics(), &message)
            .expect("decodes")
            .expect("event");
        match event {
            BusEvent::Reply(reply) => assert_eq!(reply.correlation_id.as_str(), "r-1"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn wrong_discriminator_is_ignored() {
        let message = InboundMessage::new(
            "v1/id1/ctrl/start",
            r#"{"type":"pause","ts":1,"sender":"B"}"#,
        );
        assert!(BusEvent::decode(&topics(), &message)
            .expect("decodes")
            .is_none());
    }

    #[test]
    fn only_move_point_commands_are_dispatched() {
        let other = InboundMessage::new(
            "v1/id1/cmd/point",
            r#"{"type":"rotate","req_id":"r-2","ts":1,"sender":"A","angle":90}"#,
        );
        assert!(BusEvent::decode(&topics(), &other)
            .expect("decodes")
            .is_none());

        let point = InboundMessage::new(
            "v1/id1/cmd/point",
            r#"{"type":"move_point","req_id":"r-3","ts":1,"sender":"A","point":{"x":1.0,"y":2.0}}"#,
        );
        match BusEvent::decode(&topics(), &point).expect("decodes") {
            Some(BusEvent::Command(command)) => assert_eq!(command.correlation_id.as_str(), "r-3"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn garbage_payload_is_malformed() {
        let message = InboundMessage::new("v1/id1/telemetry/result", "not json");
        let err = BusEvent::decode(&topics(), &message).expect_err("malformed");
        assert!(matches!(err, MessagingError::Malformed { ref topic, .. } if topic == "v1/id1/telemetry/result"));
    }

    #[test]
    fn foreign_topic_yields_nothing() {
        let message = InboundMessage::new("v1/other/status", "{}");
        assert!(BusEvent::decode(&topics(), &message)
            .expect("decodes")
            .is_none());
    }
}
