//! ---
//! gl_section: "01-core-functionality"
//! gl_subsection: "module"
//! gl_type: "source"
//! gl_scope: "code"
//! gl_description: "Shared primitives and utilities for gearlink peers."
//! gl_version: "v0.0.0-prealpha"
//! gl_owner: "tbd"
//! ---
//! Shared primitives for the gearlink workspace.
//! This crate exposes configuration loading and logging setup consumed by
//! the peer runtimes and the `gearlinkd` binary.

pub mod config;
pub mod logging;

pub use config::{
    AppConfig, BusConfig, ExecutorConfig, LoadedAppConfig, LoggingConfig, PeerRole, WorkflowConfig,
};
pub use logging::{init_tracing, LogFormat};
