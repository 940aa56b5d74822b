//! ---
//! gl_section: "06-execution"
//! gl_subsection: "module"
//! gl_type: "source"
//! gl_scope: "code"
//! gl_description: "Worker-side command execution."
//! gl_version: "v0.0.0-prealpha"
//! gl_owner: "tbd"
//! ---
//! Worker-side command execution.
//!
//! Commands arrive at least once. The [`CommandExecutor`] runs each distinct
//! correlation id once on its own task, replays the cached reply for
//! repeated ids and drops copies that arrive while the first is still
//! running.
#![warn(missing_docs)]

pub mod executor;
pub mod features;
pub mod handler;
pub mod worker;

pub use executor::{CommandDisposition, CommandExecutor, ExecutorStats};
pub use features::{movement_delay, vibration_features, SimulatedFeatureHandler, FEATURE_NAMES};
pub use handler::{CommandHandler, HandlerError};
pub use worker::{default_settings_snapshot, WorkerHandle, WorkerOptions, WorkerPeer};
