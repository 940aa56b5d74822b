//! ---
//! gl_section: "05-orchestration"
//! gl_subsection: "module"
//! gl_type: "source"
//! gl_scope: "code"
//! gl_description: "Workflow sessions driven through the correlation engine."
//! gl_version: "v0.0.0-prealpha"
//! gl_owner: "tbd"
//! ---
//! Controller-side orchestration.
//!
//! A [`WorkflowOrchestrator`] runs one session: it walks an ordered list of
//! work items, issues one correlated request per item and reports a summary
//! on `ctrl/end`. Failed items never abort the session. The
//! [`ControllerPeer`] runtime owns the dispatch loop and queues sessions for
//! a dedicated orchestrator task.
#![warn(missing_docs)]

pub mod controller;
pub mod points;
pub mod workflow;

pub use controller::{
    ControllerError, ControllerHandle, ControllerOptions, ControllerPeer, SessionRequest,
};
pub use points::{generate_sample, parse_points, read_points_file, Point, PointsError, PointsFile, RejectedLine};
pub use workflow::{
    execute_step, SessionReport, SessionState, StepOutcome, StepRecord, WorkItem,
    WorkflowOrchestrator, WorkflowSettings,
};
