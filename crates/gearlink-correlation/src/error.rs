//! ---
//! gl_section: "03-correlation"
//! gl_subsection: "module"
//! gl_type: "source"
//! gl_scope: "code"
//! gl_description: "Errors surfaced by correlated requests."
//! gl_version: "v0.0.0-prealpha"
//! gl_owner: "tbd"
//! ---
use gearlink_msg::{CorrelationId, MessagingError};
use thiserror::Error;

/// Failures a caller of [`crate::CorrelationEngine::issue_request`] can observe.
///
/// Malformed payloads and replies for unknown ids never show up here; the
/// dispatch path logs and drops them.
#[derive(Debug, Error)]
pub enum CorrelationError {
    /// The command could not be handed to the bus. Not retried by the engine.
    #[error("transport unavailable: {0}")]
    TransportUnavailable(#[source] MessagingError),
    /// No reply arrived within `timeout` for any of the attempts.
    #[error("request {correlation_id} timed out after {attempts} attempt(s)")]
    Timeout {
        /// Id shared by every attempt.
        correlation_id: CorrelationId,
        /// Number of publishes performed.
        attempts: u32,
    },
    /// Timeout or attempt budget out of range.
    #[error("invalid retry policy: {0}")]
    InvalidPolicy(&'static str),
    /// An entry for the id already exists in the pending table.
    #[error("correlation id {0} is already pending")]
    DuplicateCorrelation(CorrelationId),
    /// The command could not be serialized.
    #[error("failed to encode command: {0}")]
    Encode(#[from] serde_json::Error),
}

impl CorrelationError {
    /// Whether the error is a reply timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, CorrelationError::Timeout { .. })
    }
}
