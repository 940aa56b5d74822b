//! ---
//! gl_section: "06-execution"
//! gl_subsection: "module"
//! gl_type: "source"
//! gl_scope: "code"
//! gl_description: "Worker peer runtime: presence, configuration and command dispatch."
//! gl_version: "v0.0.0-prealpha"
//! gl_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use gearlink_common::{AppConfig, PeerRole};
use gearlink_msg::logging::{log_message, MessageDirection};
use gearlink_msg::{
    publish_json, BusEvent, BusMetricsExporter, ConfigurationSnapshot, InboundMessage,
    MessagingError, PresenceState, QoS, StartSignal, TopicSet, Transport,
};
use gearlink_presence::{ConfigurationChannel, PresenceChannel};
use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::executor::CommandExecutor;
use crate::handler::CommandHandler;

/// Retained configuration a worker advertises after connecting.
pub fn default_settings_snapshot() -> ConfigurationSnapshot {
    ConfigurationSnapshot {
        kind: Some("setting".to_owned()),
        version: Some("2025.09.10-01".to_owned()),
        parameters: json!({
            "start_x": 0,
            "start_y": 0,
            "x_min": -50,
            "x_max": 50,
            "y_min": -50,
            "y_max": 50,
            "sig_x_min": 0.1,
            "sig_y_min": 0.1,
            "analysis_mode": "full_spectrum",
            "sampling_rate": 1000
        }),
        ..ConfigurationSnapshot::default()
    }
}

/// Static inputs of the worker runtime.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Topic space of the deployment.
    pub topics: TopicSet,
    /// Sender name stamped on outgoing messages.
    pub sender: String,
    /// Capacity of the completed-reply cache.
    pub cache_capacity: usize,
    /// Retained configuration published on start, if any.
    pub initial_configuration: Option<ConfigurationSnapshot>,
    /// Delay before the automatic start signal; `None` disables it.
    pub auto_start: Option<Duration>,
}

impl WorkerOptions {
    /// Options derived from the application configuration.
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            topics: TopicSet::new(&config.bus.deployment_id),
            sender: config.bus.sender(PeerRole::Worker).to_owned(),
            cache_capacity: config.executor.cache_capacity,
            initial_configuration: Some(default_settings_snapshot()),
            auto_start: config.executor.auto_start.then_some(Duration::from_secs(1)),
        }
    }
}

/// Entry point of the worker runtime.
pub struct WorkerPeer;

impl WorkerPeer {
    /// Subscribe, announce `ready`, publish the initial configuration and
    /// spawn the dispatch loop.
    pub async fn start(
        transport: Arc<dyn Transport>,
        inbound: mpsc::UnboundedReceiver<InboundMessage>,
        options: WorkerOptions,
        handler: Arc<dyn CommandHandler>,
        metrics: Option<Arc<BusMetricsExporter>>,
    ) -> Result<WorkerHandle, MessagingError> {
        let topics = options.topics.clone();
        let mut executor = CommandExecutor::new(
            transport.clone(),
            &topics,
            &options.sender,
            handler,
            options.cache_capacity,
        );
        if let Some(metrics) = &metrics {
            executor = executor.with_metrics(metrics.clone());
        }
        let executor = Arc::new(executor);
        let presence = Arc::new(PresenceChannel::new(transport.clone(), &topics, &options.sender));
        let configuration = ConfigurationChannel::new(transport.clone(), &topics, &options.sender);

        for filter in [&topics.cmd_point, &topics.ctrl_end, &topics.status] {
            transport.subscribe(filter, QoS::AtLeastOnce).await?;
        }
        if let Err(err) = presence.publish_status(true, PresenceState::Ready).await {
            warn!(error = %err, "initial presence not published; will retry on connect");
        }
        if let Some(snapshot) = options.initial_configuration.clone() {
            if let Err(err) = configuration.publish_configuration(snapshot).await {
                warn!(error = %err, "initial configuration not published");
            }
        }

        let (shutdown, _) = broadcast::channel(4);
        let dispatcher = Dispatcher {
            topics: topics.clone(),
            sender: options.sender.clone(),
            executor: executor.clone(),
            presence: presence.clone(),
            metrics,
        };
        let mut tasks = vec![tokio::spawn(dispatcher.run(inbound, shutdown.subscribe()))];
        let presence_task = tokio::spawn(presence.clone().follow_reconnects(transport.connection_state()));

        let handle = WorkerHandle {
            transport,
            topics,
            sender: options.sender,
            executor,
            presence,
            shutdown,
            tasks: Vec::new(),
            presence_task,
        };
        if let Some(delay) = options.auto_start {
            tasks.push(tokio::spawn(auto_start(
                handle.transport.clone(),
                handle.topics.clone(),
                handle.sender.clone(),
                delay,
                handle.shutdown.subscribe(),
            )));
        }
        info!(deployment = handle.topics.deployment_id(), sender = %handle.sender, "worker started");
        Ok(WorkerHandle { tasks, ..handle })
    }
}

async fn auto_start(
    transport: Arc<dyn Transport>,
    topics: TopicSet,
    sender: String,
    delay: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    tokio::select! {
        _ = shutdown.recv() => return,
        _ = tokio::time::sleep(delay) => {}
    }
    if let Err(err) = send_start(transport.as_ref(), &topics, &sender).await {
        warn!(error = %err, "automatic start signal failed");
    }
}

async fn send_start(transport: &dyn Transport, topics: &TopicSet, sender: &str) -> Result<StartSignal, MessagingError> {
    let signal = StartSignal::new(sender);
    publish_json(transport, &topics.ctrl_start, &signal, QoS::AtLeastOnce, false).await?;
    info!(session_id = signal.session_id.as_deref().unwrap_or("-"), "start signal sent");
    Ok(signal)
}

struct Dispatcher {
    topics: TopicSet,
    sender: String,
    executor: Arc<CommandExecutor>,
    presence: Arc<PresenceChannel>,
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
                    Some(message) => self.handle(message).await,
                    None => break,
                },
            }
        }
        debug!("worker dispatch loop stopped");
    }

    async fn handle(&self, message: InboundMessage) {
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
            BusEvent::Command(command) => {
                let disposition = self.executor.on_command_received(command);
                debug!(?disposition, "command accepted");
            }
            BusEvent::End(end) => {
                info!(
                    sender = %end.sender,
                    total = end.summary.total_items,
                    successful = end.summary.success_count,
                    failed = end.summary.failure_count,
                    "session ended"
                );
                if let Err(err) = self.presence.publish_status(true, PresenceState::Completed).await {
                    warn!(error = %err, "completed presence not published");
                }
                self.executor.clear_cache();
            }
            BusEvent::Presence(record) => {
                if record.sender != self.sender {
                    info!(peer = %record.sender, online = record.online, state = record.state.as_str(), "peer presence");
                }
            }
            other => debug!(event = other.label(), "event not handled by worker"),
        }
    }
}

/// Handle onto a running worker.
pub struct WorkerHandle {
    transport: Arc<dyn Transport>,
    topics: TopicSet,
    sender: String,
    executor: Arc<CommandExecutor>,
    presence: Arc<PresenceChannel>,
    shutdown: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
    presence_task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Executor serving commands.
    pub fn executor(&self) -> &Arc<CommandExecutor> {
        &self.executor
    }

    /// Ask the controller to start a session.
    pub async fn send_start_signal(&self) -> Result<StartSignal, MessagingError> {
        send_start(self.transport.as_ref(), &self.topics, &self.sender).await
    }

    /// Stop the runtime, publish an offline presence and disconnect cleanly.
    pub async fn shutdown(self) -> Result<(), MessagingError> {
        let _ = self.shutdown.send(());
        self.presence_task.abort();
        for task in self.tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "worker task ended abnormally");
            }
        }
        if self.transport.is_connected() {
            if let Err(err) = self.presence.publish_status(false, PresenceState::Disconnected).await {
                warn!(error = %err, "offline presence not published");
            }
        }
        self.transport.disconnect().await?;
        info!("worker stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::SimulatedFeatureHandler;
    use gearlink_msg::{
        CommandMessage, CorrelationId, InMemoryBroker, PresenceRecord, ReplyMessage, SessionEnd,
        SessionSummary, WirePayload,
    };

    fn options(topics: &TopicSet, auto_start: Option<Duration>) -> WorkerOptions {
        WorkerOptions {
            topics: topics.clone(),
            sender: "B".into(),
            cache_capacity: 100,
            initial_configuration: Some(default_settings_snapshot()),
            auto_start,
        }
    }

    fn retained_presence(broker: &InMemoryBroker, topics: &TopicSet) -> PresenceRecord {
        let raw = broker.retained(&topics.status).expect("presence");
        serde_json::from_slice(&raw).expect("decode")
    }

    #[tokio::test]
    async fn start_announces_ready_and_settings() {
        let topics = TopicSet::new("wk");
        let broker = InMemoryBroker::new();
        let (transport, inbound) = broker.connect("B-wk", None);
        let handle = WorkerPeer::start(
            transport,
            inbound,
            options(&topics, None),
            Arc::new(SimulatedFeatureHandler::new(false)),
            None,
        )
        .await
        .expect("start");

        assert_eq!(retained_presence(&broker, &topics).state, PresenceState::Ready);
        let raw = broker.retained(&topics.config_setting).expect("settings retained");
        let snapshot: ConfigurationSnapshot = serde_json::from_slice(&raw).expect("decode");
        assert_eq!(snapshot.kind.as_deref(), Some("setting"));
        assert_eq!(snapshot.sender, "B");
        assert!(snapshot.ts > 0);
        handle.shutdown().await.expect("shutdown");
    }

    #[tokio::test(start_paused = true)]
    async fn end_signal_marks_completed_and_clears_cache() {
        let topics = TopicSet::new("wk");
        let broker = InMemoryBroker::new();
        let (transport, inbound) = broker.connect("B-wk", None);
        let handle = WorkerPeer::start(
            transport,
            inbound,
            options(&topics, None),
            Arc::new(SimulatedFeatureHandler::new(false)),
            None,
        )
        .await
        .expect("start");

        let (controller, mut replies) = broker.connect("A-wk", None);
        controller
            .subscribe(&topics.telemetry_result, QoS::AtLeastOnce)
            .await
            .expect("subscribe");
        let mut payload = WirePayload::new();
        payload.insert("point".into(), json!({ "x": 1.0, "y": 2.0 }));
        let command = CommandMessage::new(CommandMessage::MOVE_POINT, CorrelationId::from("c1"), payload, "A");
        publish_json(controller.as_ref(), &topics.cmd_point, &command, QoS::AtLeastOnce, false)
            .await
            .expect("command");

        let message = replies.recv().await.expect("reply");
        let reply: ReplyMessage = serde_json::from_slice(&message.payload).expect("decode");
        assert_eq!(reply.correlation_id.as_str(), "c1");
        assert_eq!(handle.executor().cached_len(), 1);

        let end = SessionEnd::new("A", SessionSummary { total_items: 1, success_count: 1, failure_count: 0 });
        publish_json(controller.as_ref(), &topics.ctrl_end, &end, QoS::AtLeastOnce, false)
            .await
            .expect("end");
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(handle.executor().cached_len(), 0);
        assert_eq!(retained_presence(&broker, &topics).state, PresenceState::Completed);
        handle.shutdown().await.expect("shutdown");
    }

    #[tokio::test(start_paused = true)]
    async fn auto_start_sends_one_start_signal() {
        let topics = TopicSet::new("wk");
        let broker = InMemoryBroker::new();
        let (transport, inbound) = broker.connect("B-wk", None);
        let handle = WorkerPeer::start(
            transport,
            inbound,
            options(&topics, Some(Duration::from_secs(1))),
            Arc::new(SimulatedFeatureHandler::new(false)),
            None,
        )
        .await
        .expect("start");

        assert!(broker.published_on(&topics.ctrl_start).is_empty());
        tokio::time::sleep(Duration::from_secs(2)).await;
        let starts = broker.published_on(&topics.ctrl_start);
        assert_eq!(starts.len(), 1);
        let signal: StartSignal = serde_json::from_slice(&starts[0].payload).expect("decode");
        assert_eq!(signal.sender, "B");
        handle.shutdown().await.expect("shutdown");
    }
}
