//! ---
//! gl_section: "03-correlation"
//! gl_subsection: "module"
//! gl_type: "source"
//! gl_scope: "code"
//! gl_description: "Request/reply correlation over fire-and-forget pub/sub."
//! gl_version: "v0.0.0-prealpha"
//! gl_owner: "tbd"
//! ---
//! Turns topic-addressed, at-least-once messaging into awaitable
//! request/reply calls.
//!
//! Every logical request gets one [`gearlink_msg::CorrelationId`] which is
//! reused by each retry, so executors can deduplicate repeated commands. The
//! first reply delivered for a pending id resolves the caller; later copies
//! are dropped.
#![warn(missing_docs)]

pub mod engine;
pub mod error;

pub use engine::{
    CorrelatedReply, CorrelationEngine, CorrelationStats, ReplyDisposition, RetryPolicy,
};
pub use error::CorrelationError;
