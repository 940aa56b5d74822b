//! ---
//! gl_section: "02-messaging-wire-model"
//! gl_subsection: "module"
//! gl_type: "source"
//! gl_scope: "code"
//! gl_description: "JSON wire model exchanged between controller and worker."
//! gl_version: "v0.0.0-prealpha"
//! gl_owner: "tbd"
//! ---
use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Domain fields carried next to the envelope fields of a command or reply.
pub type WirePayload = serde_json::Map<String, JsonValue>;

/// Current wall-clock time as whole epoch seconds, the `ts` field of every message.
pub fn epoch_seconds() -> i64 {
    Utc::now().timestamp()
}

/// Opaque token linking a command to its reply (`req_id` on the wire).
///
/// Freshly generated identifiers are random 128-bit UUIDs, but any string
/// received from the bus is accepted so foreign ids decode cleanly and are
/// rejected later as unknown correlations rather than as malformed payloads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a new random correlation identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Command published by the orchestrator on `cmd/point`.
///
/// Re-published verbatim on retry, so the correlation id never changes for a
/// logical request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandMessage {
    /// Discriminator, `move_point` for the point workflow.
    #[serde(rename = "type")]
    pub kind: String,
    /// Correlation id echoed by the reply.
    #[serde(rename = "req_id")]
    pub correlation_id: CorrelationId,
    /// Epoch seconds at which the command was first issued.
    #[serde(rename = "ts")]
    pub issued_at: i64,
    /// Logical name of the issuing peer.
    pub sender: String,
    /// Domain payload, flattened next to the envelope fields.
    #[serde(flatten)]
    pub payload: WirePayload,
}

impl CommandMessage {
    /// Discriminator used by point commands.
    pub const MOVE_POINT: &'static str = "move_point";

    /// Construct a command stamped with the current time.
    pub fn new(
        kind: impl Into<String>,
        correlation_id: CorrelationId,
        payload: WirePayload,
        sender: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            correlation_id,
            issued_at: epoch_seconds(),
            sender: sender.into(),
            payload,
        }
    }
}

/// Reply published by the executor on `telemetry/result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyMessage {
    /// `result_feature_set` on success, `result_error` when the work failed.
    #[serde(rename = "type")]
    pub kind: String,
    /// Correlation id copied from the command.
    #[serde(rename = "req_id")]
    pub correlation_id: CorrelationId,
    /// Epoch seconds at which the reply was produced.
    #[serde(rename = "ts")]
    pub produced_at: i64,
    /// Logical name of the replying peer.
    pub sender: String,
    /// Domain payload, flattened next to the envelope fields.
    #[serde(flatten)]
    pub payload: WirePayload,
}

impl ReplyMessage {
    /// Discriminator of a successful reply.
    pub const FEATURE_SET: &'static str = "result_feature_set";
    /// Discriminator of a failed unit of work.
    pub const ERROR: &'static str = "result_error";

    /// Successful reply carrying the supplied payload.
    pub fn feature_set(
        correlation_id: CorrelationId,
        payload: WirePayload,
        sender: impl Into<String>,
    ) -> Self {
        Self {
            kind: Self::FEATURE_SET.to_owned(),
            correlation_id,
            produced_at: epoch_seconds(),
            sender: sender.into(),
            payload,
        }
    }

    /// Error reply; `error` is stored under the `error` field next to `context`.
    pub fn error(
        correlation_id: CorrelationId,
        error: impl Into<String>,
        mut context: WirePayload,
        sender: impl Into<String>,
    ) -> Self {
        context.insert("error".to_owned(), JsonValue::String(error.into()));
        Self {
            kind: Self::ERROR.to_owned(),
            correlation_id,
            produced_at: epoch_seconds(),
            sender: sender.into(),
            payload: context,
        }
    }

    /// Whether this kind of message is a reply at all.
    pub fn is_reply_kind(kind: &str) -> bool {
        kind == Self::FEATURE_SET || kind == Self::ERROR
    }

    /// Error text carried by a `result_error` reply.
    pub fn error_message(&self) -> Option<&str> {
        if self.kind != Self::ERROR {
            return None;
        }
        Some(
            self.payload
                .get("error")
                .and_then(JsonValue::as_str)
                .unwrap_or("unspecified executor error"),
        )
    }
}

/// Lifecycle state advertised through the retained status topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceState {
    /// Controller connected and waiting for a start signal.
    Idle,
    /// Worker connected and accepting commands.
    Ready,
    /// A workflow session is in progress.
    Running,
    /// The last session finished.
    Completed,
    /// Peer went away; normally published by the broker as the last will.
    Disconnected,
}

impl PresenceState {
    /// Wire representation of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceState::Idle => "idle",
            PresenceState::Ready => "ready",
            PresenceState::Running => "running",
            PresenceState::Completed => "completed",
            PresenceState::Disconnected => "disconnected",
        }
    }
}

/// Retained presence snapshot on the `status` topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    /// Whether the peer is connected.
    pub online: bool,
    /// Lifecycle state of the peer.
    pub state: PresenceState,
    /// Peer that owns the record.
    pub sender: String,
    /// Epoch seconds of the state change.
    pub ts: i64,
}

impl PresenceRecord {
    /// Record stamped with the current time.
    pub fn new(online: bool, state: PresenceState, sender: impl Into<String>) -> Self {
        Self {
            online,
            state,
            sender: sender.into(),
            ts: epoch_seconds(),
        }
    }

    /// Terminal record registered as last will at connect time.
    pub fn disconnected(sender: impl Into<String>) -> Self {
        Self::new(false, PresenceState::Disconnected, sender)
    }
}

/// External start trigger published on `ctrl/start`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartSignal {
    /// Always `start`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Peer that requested the session.
    pub sender: String,
    /// Epoch seconds of the request.
    pub ts: i64,
    /// Optional job label supplied by the requester.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    /// Optional session identifier supplied by the requester.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Free-form hints from the requester.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<JsonValue>,
}

impl StartSignal {
    /// Discriminator of a start signal.
    pub const KIND: &'static str = "start";

    /// Start signal from `sender` with a fresh session id.
    pub fn new(sender: impl Into<String>) -> Self {
        Self {
            kind: Self::KIND.to_owned(),
            sender: sender.into(),
            ts: epoch_seconds(),
            job_id: None,
            session_id: Some(Uuid::new_v4().to_string()),
            config: None,
        }
    }
}

/// Aggregate counts reported when a session completes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Number of work items in the session.
    #[serde(rename = "total_points")]
    pub total_items: usize,
    /// Items resolved with a successful reply.
    #[serde(rename = "successful_points")]
    pub success_count: usize,
    /// Items that timed out or failed.
    #[serde(rename = "failed_points")]
    pub failure_count: usize,
}

/// Session-end notice published on `ctrl/end`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEnd {
    /// Always `end`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Epoch seconds at completion.
    pub ts: i64,
    /// Orchestrating peer.
    pub sender: String,
    /// Outcome counts.
    pub summary: SessionSummary,
}

impl SessionEnd {
    /// Discriminator of a session-end notice.
    pub const KIND: &'static str = "end";

    /// Session-end notice stamped with the current time.
    pub fn new(sender: impl Into<String>, summary: SessionSummary) -> Self {
        Self {
            kind: Self::KIND.to_owned(),
            ts: epoch_seconds(),
            sender: sender.into(),
            summary,
        }
    }
}

/// Retained configuration snapshot on `config/setting`.
///
/// Only a few fields are interpreted; everything else is preserved in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationSnapshot {
    /// Optional discriminator (`setting`).
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Publisher supplied version label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Workflow parameters.
    #[serde(default, skip_serializing_if = "JsonValue::is_null")]
    pub parameters: JsonValue,
    /// Publishing peer.
    #[serde(default)]
    pub sender: String,
    /// Epoch seconds of publication.
    #[serde(default)]
    pub ts: i64,
    /// Any additional fields.
    #[serde(flatten)]
    pub extra: WirePayload,
}

impl ConfigurationSnapshot {
    /// Unsigned integer parameter under `parameters.<name>`.
    pub fn parameter_u64(&self, name: &str) -> Option<u64> {
        self.parameters.get(name).and_then(JsonValue::as_u64)
    }
}
