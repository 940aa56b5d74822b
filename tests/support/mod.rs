//! ---
//! gl_section: "08-testing"
//! gl_subsection: "integration-tests"
//! gl_type: "source"
//! gl_scope: "code"
//! gl_description: "Shared fixtures for the in-memory broker integration suites."
//! gl_version: "v0.0.0-prealpha"
//! gl_owner: "tbd"
//! ---
#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gearlink_correlation::RetryPolicy;
use gearlink_executor::{
    default_settings_snapshot, CommandHandler, HandlerError, WorkerHandle, WorkerOptions, WorkerPeer,
};
use gearlink_msg::{CommandMessage, InMemoryBroker, InMemoryTransport, PresenceRecord, TopicSet, WirePayload};
use gearlink_orchestrator::{ControllerHandle, ControllerOptions, ControllerPeer, Point, WorkflowSettings};
use gearlink_presence::PresenceChannel;
use serde_json::json;

pub const CONTROLLER: &str = "A";
pub const WORKER: &str = "B";

/// Handler with per-point behaviour: `fail_x` answers with an error and
/// `hang_x` never answers. Everything else succeeds after `delay`.
#[derive(Default)]
pub struct ScriptedHandler {
    pub delay: Duration,
    pub fail_x: Option<f64>,
    pub hang_x: Option<f64>,
    calls: AtomicU32,
}

impl ScriptedHandler {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn scripted(fail_x: Option<f64>, hang_x: Option<f64>) -> Self {
        Self {
            fail_x,
            hang_x,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CommandHandler for ScriptedHandler {
    async fn handle(&self, command: &CommandMessage) -> Result<WirePayload, HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let point = command.payload.get("point").cloned().unwrap_or_default();
        let x = point.get("x").and_then(|x| x.as_f64()).unwrap_or_default();
        if self.hang_x == Some(x) {
            std::future::pending::<()>().await;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail_x == Some(x) {
            return Err(HandlerError::Failed("sensor offline".into()));
        }
        let mut payload = WirePayload::new();
        payload.insert("point".into(), point);
        payload.insert("values".into(), json!([x]));
        Ok(payload)
    }
}

pub fn settings(timeout: Duration, max_attempts: u32) -> WorkflowSettings {
    WorkflowSettings {
        policy: RetryPolicy::new(timeout, max_attempts),
        step_interval: Duration::ZERO,
    }
}

pub fn controller_options(topics: &TopicSet, settings: WorkflowSettings, points: &[(f64, f64)]) -> ControllerOptions {
    ControllerOptions {
        topics: topics.clone(),
        sender: CONTROLLER.into(),
        settings,
        points: points.iter().map(|&(x, y)| Point::new(x, y)).collect(),
        queue_capacity: 4,
    }
}

pub async fn start_controller(broker: &InMemoryBroker, options: ControllerOptions) -> ControllerHandle {
    let will = PresenceChannel::last_will(&options.topics, &options.sender).expect("will");
    let client_id = format!("A-{}", options.topics.deployment_id());
    let (transport, inbound) = broker.connect(client_id, Some(will));
    ControllerPeer::start(transport, inbound, options, None)
        .await
        .expect("controller start")
}

/// Start a worker; the raw transport is returned so tests can drop the connection.
pub async fn start_worker(
    broker: &InMemoryBroker,
    topics: &TopicSet,
    handler: Arc<dyn CommandHandler>,
) -> (WorkerHandle, Arc<InMemoryTransport>) {
    let will = PresenceChannel::last_will(topics, WORKER).expect("will");
    let (transport, inbound) = broker.connect(format!("B-{}", topics.deployment_id()), Some(will));
    let options = WorkerOptions {
        topics: topics.clone(),
        sender: WORKER.into(),
        cache_capacity: 100,
        initial_configuration: Some(default_settings_snapshot()),
        auto_start: None,
    };
    let handle = WorkerPeer::start(transport.clone(), inbound, options, handler, None)
        .await
        .expect("worker start");
    (handle, transport)
}

/// Presence records published on the status topic by `sender`, in order.
pub fn presence_history(broker: &InMemoryBroker, topics: &TopicSet, sender: &str) -> Vec<PresenceRecord> {
    broker
        .published_on(&topics.status)
        .iter()
        .filter_map(|record| serde_json::from_slice::<PresenceRecord>(&record.payload).ok())
        .filter(|record| record.sender == sender)
        .collect()
}

pub fn retained_presence(broker: &InMemoryBroker, topics: &TopicSet) -> PresenceRecord {
    let raw = broker.retained(&topics.status).expect("retained presence");
    serde_json::from_slice(&raw).expect("presence json")
}
