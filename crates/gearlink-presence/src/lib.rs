//! ---
//! gl_section: "04-presence"
//! gl_subsection: "module"
//! gl_type: "source"
//! gl_scope: "code"
//! gl_description: "Retained presence and configuration channels."
//! gl_version: "v0.0.0-prealpha"
//! gl_owner: "tbd"
//! ---
//! Lifecycle signalling between peers through retained topics.
//!
//! Presence records are always published retained, and the terminal
//! `disconnected` record is registered as the connection's last will so an
//! abrupt drop is reported by the broker. Configuration snapshots are
//! observed, never acknowledged.
#![warn(missing_docs)]

pub mod configuration;
pub mod presence;

pub use configuration::ConfigurationChannel;
pub use presence::PresenceChannel;
