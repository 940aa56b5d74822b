//! ---
//! gl_section: "05-orchestration"
//! gl_subsection: "module"
//! gl_type: "source"
//! gl_scope: "code"
//! gl_description: "Controller peer runtime: dispatch loop and session queue."
//! gl_version: "v0.0.0-prealpha"
//! gl_owner: "tbd"
//! ---
use std::sync::Arc;

use gearlink_common::{AppConfig, PeerRole};
use gearlink_correlation::CorrelationEngine;
use gearlink_msg::logging::{log_message, MessageDirection};
use gearlink_msg::{
    BusEvent, BusMetricsExporter, InboundMessage, MessagingError, PresenceState, QoS, TopicSet,
    Transport,
};
use gearlink_presence::{ConfigurationChannel, PresenceChannel};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::points::Point;
use crate::workflow::{execute_step, SessionReport, StepRecord, WorkItem, WorkflowOrchestrator, WorkflowSettings};

/// Sessions waiting behind the running one.
pub const DEFAULT_QUEUE_CAPACITY: usize = 8;

/// Failures surfaced by [`ControllerHandle`].
#[derive(Debug, Error)]
pub enum ControllerError {
    /// The orchestrator task is gone.
    #[error("session queue is closed")]
    QueueClosed,
    /// Bus failure while starting or stopping the peer.
    #[error(transparent)]
    Messaging(#[from] MessagingError),
}

/// Static inputs of the controller runtime.
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Topic space of the deployment.
    pub topics: TopicSet,
    /// Sender name stamped on outgoing messages.
    pub sender: String,
    /// Local workflow defaults, before retained configuration overrides.
    pub settings: WorkflowSettings,
    /// Items of a session started by a `ctrl/start` signal.
    pub points: Vec<Point>,
    /// Capacity of the pending-session queue.
    pub queue_capacity: usize,
}

impl ControllerOptions {
    /// Options derived from the application configuration.
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            topics: TopicSet::new(&config.bus.deployment_id),
            sender: config.bus.sender(PeerRole::Controller).to_owned(),
            settings: WorkflowSettings::from_config(&config.workflow),
            points: config.workflow.points.iter().copied().map(Point::from).collect(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// A session waiting for the orchestrator task.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    /// Identifier supplied by the start signal.
    pub session_id: Option<String>,
    /// Who asked for the session (`sender` of the start signal or `local`).
    pub origin: String,
    /// Items to attempt in order.
    pub items: Vec<WorkItem>,
}

/// Entry point of the controller runtime.
pub struct ControllerPeer;

impl ControllerPeer {
    /// Subscribe, announce `idle` presence and spawn the runtime tasks.
    ///
    /// The dispatch loop only routes events; sessions run on their own task
    /// fed by a queue, so replies keep flowing while a session waits.
    pub async fn start(
        transport: Arc<dyn Transport>,
        inbound: mpsc::UnboundedReceiver<InboundMessage>,
        options: ControllerOptions,
        metrics: Option<Arc<BusMetricsExporter>>,
    ) -> Result<ControllerHandle, ControllerError> {
        let topics = options.topics.clone();
        let mut engine = CorrelationEngine::new(transport.clone(), &topics, &options.sender);
        if let Some(metrics) = &metrics {
            engine = engine.with_metrics(metrics.clone());
        }
        let engine = Arc::new(engine);
        let presence = Arc::new(PresenceChannel::new(transport.clone(), &topics, &options.sender));
        let configuration = Arc::new(ConfigurationChannel::new(transport.clone(), &topics, &options.sender));

        for filter in [
            &topics.ctrl_start,
            &topics.telemetry_result,
            &topics.config_setting,
            &topics.status,
        ] {
            transport.subscribe(filter, QoS::AtLeastOnce).await?;
        }
        if let Err(err) = presence.publish_status(true, PresenceState::Idle).await {
            warn!(error = %err, "initial presence not published; will retry on connect");
        }

        let (sessions_tx, sessions_rx) = mpsc::channel(options.queue_capacity.max(1));
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = broadcast::channel(4);

        let dispatcher = Dispatcher {
            topics: topics.clone(),
            sender: options.sender.clone(),
            engine: engine.clone(),
            configuration: configuration.clone(),
            sessions: sessions_tx.clone(),
            start_items: options.points.iter().map(Point::to_work_item).collect(),
            metrics,
        };
        let dispatch_task = tokio::spawn(dispatcher.run(inbound, shutdown.subscribe()));

        let runner = SessionRunner {
            topics: topics.clone(),
            sender: options.sender.clone(),
            transport: transport.clone(),
            engine: engine.clone(),
            presence: presence.clone(),
            configuration: configuration.clone(),
            settings: options.settings,
            reports: reports_tx,
        };
        let session_task = tokio::spawn(runner.run(sessions_rx, shutdown.subscribe()));
        let presence_task = tokio::spawn(presence.clone().follow_reconnects(transport.connection_state()));

        info!(deployment = topics.deployment_id(), sender = %options.sender, "controller started");
        Ok(ControllerHandle {
            transport,
            engine,
            presence,
            configuration,
            settings: options.settings,
            sessions: sessions_tx,
            reports: reports_rx,
            shutdown,
            tasks: vec![dispatch_task, session_task],
            presence_task,
        })
    }
}

struct Dispatcher {
    topics: TopicSet,
    sender: String,
    engine: Arc<CorrelationEngine>,
    configuration: Arc<ConfigurationChannel>,
    sessions: mpsc::Sender<SessionRequest>,
    start_items: Vec<WorkItem>,
    metrics: Option<Arc<BusMetricsExporter>>,
}

impl Dispatcher {
    async fn run(
        self,
        mut inbound: mpsc::UnboundedReceiver<InboundMessage>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                message = inbound.recv() => match message {
                    Some(message) => self.handle(message),
                    None => break,
                },
            }
        }
        debug!("controller dispatch loop stopped");
    }

    fn handle(&self, message: InboundMessage) {
        log_message(MessageDirection::Inbound, &message.topic, &message.payload);
        if let Some(metrics) = &self.metrics {
            metrics.observe_received();
        }
        let event = match BusEvent::decode(&self.topics, &message) {
            Ok(Some(event)) => event,
            Ok(None) => {
                debug!(topic = %message.topic, "ignoring message");
                return;
            }
            Err(err) => {
                warn!(error = %err, "dropping malformed message");
                if let Some(metrics) = &self.metrics {
                    metrics.observe_dropped();
                }
                return;
            }
        };

        match event {
            BusEvent::Reply(reply) => {
                self.engine.on_reply_received(reply);
            }
            BusEvent::Configuration(snapshot) => self.configuration.on_configuration_received(snapshot),
            BusEvent::Start(signal) => {
                info!(sender = %signal.sender, session_id = signal.session_id.as_deref().unwrap_or("-"), "start signal received");
                let request = SessionRequest {
                    session_id: signal.session_id,
                    origin: signal.sender,
                    items: self.start_items.clone(),
                };
                if let Err(err) = self.sessions.try_send(request) {
                    warn!(error = %err, "session queue full or closed; start signal dropped");
                }
            }
            BusEvent::Presence(record) => {
                if record.sender != self.sender {
                    info!(peer = %record.sender, online = record.online, state = record.state.as_str(), "peer presence");
                }
            }
            other => debug!(event = other.label(), "event not handled by controller"),
        }
    }
}

struct SessionRunner {
    topics: TopicSet,
    sender: String,
    transport: Arc<dyn Transport>,
    engine: Arc<CorrelationEngine>,
    presence: Arc<PresenceChannel>,
    configuration: Arc<ConfigurationChannel>,
    settings: WorkflowSettings,
    reports: mpsc::UnboundedSender<SessionReport>,
}

impl SessionRunner {
    async fn run(
        self,
        mut sessions: mpsc::Receiver<SessionRequest>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            let request = tokio::select! {
                _ = shutdown.recv() => break,
                request = sessions.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };
            let settings = self
                .settings
                .with_overrides(self.configuration.latest().as_ref());
            info!(origin = %request.origin, items = request.items.len(), "running queued session");
            let orchestrator = WorkflowOrchestrator::new(
                self.engine.clone(),
                self.presence.clone(),
                self.transport.clone(),
                &self.topics,
                &self.sender,
                settings,
            )
            .with_session_id(request.session_id);

            tokio::select! {
                _ = shutdown.recv() => {
                    warn!("shutdown requested during a session; abandoning remaining items");
                    break;
                }
                report = orchestrator.run(request.items) => {
                    if self.reports.send(report).is_err() {
                        debug!("session report dropped; no listener");
                    }
                }
            }
        }
        debug!("controller session runner stopped");
    }
}

/// Handle onto a running controller.
pub struct ControllerHandle {
    transport: Arc<dyn Transport>,
    engine: Arc<CorrelationEngine>,
    presence: Arc<PresenceChannel>,
    configuration: Arc<ConfigurationChannel>,
    settings: WorkflowSettings,
    sessions: mpsc::Sender<SessionRequest>,
    reports: mpsc::UnboundedReceiver<SessionReport>,
    shutdown: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
    presence_task: JoinHandle<()>,
}

impl ControllerHandle {
    /// Correlation engine used by the runtime.
    pub fn engine(&self) -> &Arc<CorrelationEngine> {
        &self.engine
    }

    /// Configuration channel fed by the dispatch loop.
    pub fn configuration(&self) -> &Arc<ConfigurationChannel> {
        &self.configuration
    }

    /// Settings the next session would use.
    pub fn current_settings(&self) -> WorkflowSettings {
        self.settings.with_overrides(self.configuration.latest().as_ref())
    }

    /// Queue a locally triggered session.
    pub async fn trigger(&self, items: Vec<WorkItem>) -> Result<(), ControllerError> {
        self.sessions
            .send(SessionRequest {
                session_id: None,
                origin: "local".to_owned(),
                items,
            })
            .await
            .map_err(|_| ControllerError::QueueClosed)
    }

    /// Wait for the next finished session.
    pub async fn next_report(&mut self) -> Option<SessionReport> {
        self.reports.recv().await
    }

    /// Issue a single item outside any session.
    pub async fn execute(&self, item: &WorkItem) -> StepRecord {
        execute_step(&self.engine, item, self.current_settings().policy).await
    }

    /// Stop the runtime, publish an offline presence and disconnect cleanly.
    pub async fn shutdown(self) -> Result<(), ControllerError> {
        let _ = self.shutdown.send(());
        self.presence_task.abort();
        for task in self.tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "controller task ended abnormally");
            }
        }
        if self.transport.is_connected() {
            if let Err(err) = self.presence.publish_status(false, PresenceState::Disconnected).await {
                warn!(error = %err, "offline presence not published");
            }
        }
        self.transport.disconnect().await?;
        info!("controller stopped");
        Ok(())
    }
}
