//! ---
//! gl_section: "05-orchestration"
//! gl_subsection: "module"
//! gl_type: "source"
//! gl_scope: "code"
//! gl_description: "Session state machine and sequential step execution."
//! gl_version: "v0.0.0-prealpha"
//! gl_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use gearlink_common::WorkflowConfig;
use gearlink_correlation::{CorrelationEngine, CorrelationError, RetryPolicy};
use gearlink_msg::{
    publish_json, ConfigurationSnapshot, CorrelationId, PresenceState, QoS, ReplyMessage,
    SessionEnd, SessionSummary, TopicSet, Transport, WirePayload,
};
use gearlink_presence::PresenceChannel;
use serde::Serialize;
use tracing::{debug, error, info, warn};

/// Lifecycle of one orchestrated session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Waiting for a start trigger.
    Idle,
    /// Work items are being issued.
    Running,
    /// Every item was attempted and the summary was emitted.
    Completed,
}

impl SessionState {
    /// Presence state advertised while in this session state.
    pub fn presence(&self) -> PresenceState {
        match self {
            SessionState::Idle => PresenceState::Idle,
            SessionState::Running => PresenceState::Running,
            SessionState::Completed => PresenceState::Completed,
        }
    }

    fn can_advance_to(&self, next: SessionState) -> bool {
        matches!(
            (self, next),
            (SessionState::Idle, SessionState::Running)
                | (SessionState::Running, SessionState::Completed)
        )
    }
}

/// One unit of the scripted sequence, mapped to exactly one correlated request.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    /// Human readable label used in logs and reports.
    pub label: String,
    /// Command discriminator.
    pub kind: String,
    /// Domain payload of the command.
    pub payload: WirePayload,
}

impl WorkItem {
    /// Construct a work item.
    pub fn new(label: impl Into<String>, kind: impl Into<String>, payload: WirePayload) -> Self {
        Self {
            label: label.into(),
            kind: kind.into(),
            payload,
        }
    }
}

/// Result of one work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome {
    /// A `result_feature_set` reply arrived.
    Success,
    /// No reply within the retry budget.
    Timeout,
    /// The executor answered `result_error`, or the command could not be issued.
    Error {
        /// Reason reported by the executor or the transport.
        message: String,
    },
}

/// Per-item entry of a [`SessionReport`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepRecord {
    /// Label of the work item.
    pub label: String,
    /// What happened.
    #[serde(flatten)]
    pub outcome: StepOutcome,
    /// Publishes performed for the item.
    pub attempts: u32,
    /// Correlation id of the request, when one was issued.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
    /// Reply that resolved the request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply: Option<ReplyMessage>,
}

impl StepRecord {
    /// Whether the item counts as successful in the summary.
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, StepOutcome::Success)
    }
}

/// Outcome of a finished session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionReport {
    /// Session identifier from the start signal, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Counts published on `ctrl/end`.
    pub summary: SessionSummary,
    /// One record per work item, in issue order.
    pub steps: Vec<StepRecord>,
}

/// Retry budget and pacing of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkflowSettings {
    /// Per-item timeout and attempts.
    pub policy: RetryPolicy,
    /// Pause between consecutive items.
    pub step_interval: Duration,
}

impl WorkflowSettings {
    /// Settings from the local configuration file.
    pub fn from_config(config: &WorkflowConfig) -> Self {
        Self {
            policy: RetryPolicy::new(config.request_timeout, config.max_attempts),
            step_interval: config.step_interval,
        }
    }

    /// Apply `parameters.request_timeout_secs`, `parameters.max_attempts` and
    /// `parameters.step_interval_ms` from a retained configuration snapshot.
    /// Out-of-range values are ignored.
    pub fn with_overrides(mut self, snapshot: Option<&ConfigurationSnapshot>) -> Self {
        let Some(snapshot) = snapshot else {
            return self;
        };
        if let Some(secs) = snapshot.parameter_u64("request_timeout_secs").filter(|secs| *secs > 0) {
            self.policy.timeout = Duration::from_secs(secs);
        }
        if let Some(attempts) = snapshot
            .parameter_u64("max_attempts")
            .and_then(|attempts| u32::try_from(attempts).ok())
            .filter(|attempts| *attempts > 0)
        {
            self.policy.max_attempts = attempts;
        }
        if let Some(millis) = snapshot.parameter_u64("step_interval_ms") {
            self.step_interval = Duration::from_millis(millis);
        }
        self
    }
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self::from_config(&WorkflowConfig::default())
    }
}

/// Issue one work item and classify the result.
///
/// Used by sessions and by the single-shot interactive mode.
pub async fn execute_step(engine: &CorrelationEngine, item: &WorkItem, policy: RetryPolicy) -> StepRecord {
    match engine
        .issue_request(&item.kind, item.payload.clone(), policy)
        .await
    {
        Ok(reply) => {
            let outcome = match reply.message.error_message() {
                Some(message) => {
                    warn!(item = %item.label, error = message, "executor reported an error");
                    StepOutcome::Error {
                        message: message.to_owned(),
                    }
                }
                None => StepOutcome::Success,
            };
            StepRecord {
                label: item.label.clone(),
                outcome,
                attempts: reply.attempts,
                correlation_id: Some(reply.message.correlation_id.clone()),
                reply: Some(reply.message),
            }
        }
        Err(CorrelationError::Timeout {
            correlation_id,
            attempts,
        }) => {
            error!(item = %item.label, correlation_id = %correlation_id, attempts, "work item timed out");
            StepRecord {
                label: item.label.clone(),
                outcome: StepOutcome::Timeout,
                attempts,
                correlation_id: Some(correlation_id),
                reply: None,
            }
        }
        Err(err) => {
            error!(item = %item.label, error = %err, "work item could not be issued");
            StepRecord {
                label: item.label.clone(),
                outcome: StepOutcome::Error {
                    message: err.to_string(),
                },
                attempts: 0,
                correlation_id: None,
                reply: None,
            }
        }
    }
}

/// Runs exactly one session; consumed by [`WorkflowOrchestrator::run`].
pub struct WorkflowOrchestrator {
    engine: Arc<CorrelationEngine>,
    presence: Arc<PresenceChannel>,
    transport: Arc<dyn Transport>,
    end_topic: String,
    sender: String,
    settings: WorkflowSettings,
    session_id: Option<String>,
    state: SessionState,
}

impl WorkflowOrchestrator {
    /// Orchestrator in the `idle` state.
    pub fn new(
        engine: Arc<CorrelationEngine>,
        presence: Arc<PresenceChannel>,
        transport: Arc<dyn Transport>,
        topics: &TopicSet,
        sender: impl Into<String>,
        settings: WorkflowSettings,
    ) -> Self {
        Self {
            engine,
            presence,
            transport,
            end_topic: topics.ctrl_end.clone(),
            sender: sender.into(),
            settings,
            session_id: None,
            state: SessionState::Idle,
        }
    }

    /// Tag the session with the identifier carried by its start signal.
    pub fn with_session_id(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Attempt every item in order, then publish the summary and final presence.
    ///
    /// Items run strictly one at a time. A timed-out or failed item is
    /// recorded and the next item is attempted.
    pub async fn run(mut self, items: Vec<WorkItem>) -> SessionReport {
        self.advance(SessionState::Running).await;
        info!(
            session_id = self.session_id.as_deref().unwrap_or("-"),
            items = items.len(),
            timeout = ?self.settings.policy.timeout,
            max_attempts = self.settings.policy.max_attempts,
            "session started"
        );

        let mut steps = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            if index > 0 && !self.settings.step_interval.is_zero() {
                tokio::time::sleep(self.settings.step_interval).await;
            }
            debug!(item = %item.label, position = index + 1, total = items.len(), "issuing work item");
            let record = execute_step(&self.engine, item, self.settings.policy).await;
            info!(item = %record.label, outcome = ?record.outcome, attempts = record.attempts, "work item finished");
            steps.push(record);
        }

        let success_count = steps.iter().filter(|step| step.is_success()).count();
        let summary = SessionSummary {
            total_items: steps.len(),
            success_count,
            failure_count: steps.len() - success_count,
        };
        let end = SessionEnd::new(&self.sender, summary);
        if let Err(err) = publish_json(
            self.transport.as_ref(),
            &self.end_topic,
            &end,
            QoS::AtLeastOnce,
            false,
        )
        .await
        {
            warn!(error = %err, "session summary could not be published");
        }
        self.advance(SessionState::Completed).await;
        info!(
            total = summary.total_items,
            successful = summary.success_count,
            failed = summary.failure_count,
            "session completed"
        );

        SessionReport {
            session_id: self.session_id,
            summary,
            steps,
        }
    }

    async fn advance(&mut self, next: SessionState) {
        debug_assert!(self.state.can_advance_to(next), "{:?} -> {:?}", self.state, next);
        self.state = next;
        if let Err(err) = self.presence.publish_status(true, next.presence()).await {
            warn!(state = ?next, error = %err, "presence update failed");
        }
    }
}
