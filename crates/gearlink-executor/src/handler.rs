//! ---
//! gl_section: "06-execution"
//! gl_subsection: "module"
//! gl_type: "source"
//! gl_scope: "code"
//! gl_description: "Seam between the executor and domain work."
//! gl_version: "v0.0.0-prealpha"
//! gl_owner: "tbd"
//! ---
use async_trait::async_trait;
use gearlink_msg::{CommandMessage, WirePayload};
use thiserror::Error;

/// Failure of a unit of work; answered with a `result_error` reply.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The command discriminator is not served by this handler.
    #[error("unsupported command type {0}")]
    Unsupported(String),
    /// The domain payload is missing fields or out of range.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    /// The work itself failed.
    #[error("{0}")]
    Failed(String),
}

/// Performs the work behind a command. Implementations may be slow; each
/// command runs on its own task.
///
/// Retries of a command carry the same correlation id and payload, so a
/// handler that runs twice for the same id must produce an equivalent reply.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Compute the reply payload for a command.
    async fn handle(&self, command: &CommandMessage) -> Result<WirePayload, HandlerError>;
}
