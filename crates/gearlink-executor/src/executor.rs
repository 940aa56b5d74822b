//! ---
//! gl_section: "06-execution"
//! gl_subsection: "module"
//! gl_type: "source"
//! gl_scope: "code"
//! gl_description: "Duplicate-tolerant command execution with a bounded reply cache."
//! gl_version: "v0.0.0-prealpha"
//! gl_owner: "tbd"
//! ---
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use gearlink_msg::{
    publish_json, BusMetricsExporter, CommandMessage, CorrelationId, QoS, ReplyMessage, TopicSet,
    Transport, WirePayload,
};
use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::handler::{CommandHandler, HandlerError};

/// What [`CommandExecutor::on_command_received`] did with a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandDisposition {
    /// First sighting; the handler runs on a new task.
    Spawned,
    /// Already completed; the cached reply is published again.
    ReplayedCached,
    /// Same id is still being processed; this copy is dropped.
    InFlightDuplicate,
}

/// Snapshot of executor counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorStats {
    /// Handler runs started.
    pub executed: u64,
    /// Cached replies re-published.
    pub replayed: u64,
    /// Copies dropped while the first copy was in flight.
    pub dropped_in_flight: u64,
    /// Handler runs that ended in a `result_error` reply.
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    executed: AtomicU64,
    replayed: AtomicU64,
    dropped_in_flight: AtomicU64,
    failed: AtomicU64,
}

/// Insertion-ordered cache of completed replies; the oldest entry goes first.
struct ReplyCache {
    capacity: usize,
    entries: IndexMap<CorrelationId, ReplyMessage>,
}

impl ReplyCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: IndexMap::new(),
        }
    }

    fn insert(&mut self, id: CorrelationId, reply: ReplyMessage) {
        self.entries.insert(id, reply);
        while self.entries.len() > self.capacity {
            if let Some((evicted, _)) = self.entries.shift_remove_index(0) {
                debug!(correlation_id = %evicted, "evicting cached reply");
            }
        }
    }
}

struct ExecutorState {
    cache: ReplyCache,
    in_flight: HashSet<CorrelationId>,
}

/// Runs commands once per correlation id and publishes correlated replies.
pub struct CommandExecutor {
    transport: Arc<dyn Transport>,
    reply_topic: String,
    sender: String,
    handler: Arc<dyn CommandHandler>,
    state: Mutex<ExecutorState>,
    counters: Counters,
    metrics: Option<Arc<BusMetricsExporter>>,
}

impl CommandExecutor {
    /// Executor replying on the deployment's result topic as `sender`.
    pub fn new(
        transport: Arc<dyn Transport>,
        topics: &TopicSet,
        sender: impl Into<String>,
        handler: Arc<dyn CommandHandler>,
        cache_capacity: usize,
    ) -> Self {
        Self {
            transport,
            reply_topic: topics.telemetry_result.clone(),
            sender: sender.into(),
            handler,
            state: Mutex::new(ExecutorState {
                cache: ReplyCache::new(cache_capacity),
                in_flight: HashSet::new(),
            }),
            counters: Counters::default(),
            metrics: None,
        }
    }

    /// Record published replies into the supplied exporter as well.
    pub fn with_metrics(mut self, metrics: Arc<BusMetricsExporter>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Accept a command from the dispatch loop without blocking it.
    ///
    /// The cache lookup and the in-flight registration happen under one lock,
    /// so two copies of the same id can never both start the handler.
    pub fn on_command_received(self: &Arc<Self>, command: CommandMessage) -> CommandDisposition {
        let correlation_id = command.correlation_id.clone();
        let cached = {
            let mut state = self.state.lock();
            let cached = state.cache.entries.get(&correlation_id).cloned();
            if cached.is_none() && !state.in_flight.insert(correlation_id.clone()) {
                self.counters.dropped_in_flight.fetch_add(1, Ordering::Relaxed);
                debug!(correlation_id = %correlation_id, "duplicate command while in flight; dropping");
                return CommandDisposition::InFlightDuplicate;
            }
            cached
        };

        let executor = Arc::clone(self);
        match cached {
            Some(reply) => {
                self.counters.replayed.fetch_add(1, Ordering::Relaxed);
                info!(correlation_id = %correlation_id, "duplicate command; replaying cached reply");
                tokio::spawn(async move { executor.publish_reply(&reply).await });
                CommandDisposition::ReplayedCached
            }
            None => {
                self.counters.executed.fetch_add(1, Ordering::Relaxed);
                tokio::spawn(async move { executor.execute(command).await });
                CommandDisposition::Spawned
            }
        }
    }

    async fn execute(&self, command: CommandMessage) {
        let correlation_id = command.correlation_id.clone();
        debug!(correlation_id = %correlation_id, kind = %command.kind, "executing command");
        let reply = match self.run_handler(&command).await {
            Ok(payload) => ReplyMessage::feature_set(correlation_id.clone(), payload, &self.sender),
            Err(err) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(correlation_id = %correlation_id, error = %err, "command failed");
                let mut context = WirePayload::new();
                if let Some(point) = command.payload.get("point") {
                    context.insert("point".to_owned(), point.clone());
                }
                ReplyMessage::error(correlation_id.clone(), err.to_string(), context, &self.sender)
            }
        };

        {
            let mut state = self.state.lock();
            state.in_flight.remove(&correlation_id);
            // failed work is recomputed on retry
            if reply.error_message().is_none() {
                state.cache.insert(correlation_id, reply.clone());
            }
        }
        self.publish_reply(&reply).await;
    }

    /// Run the handler on its own task so a panic becomes a failed command
    /// instead of leaving the id registered as in flight.
    async fn run_handler(&self, command: &CommandMessage) -> Result<WirePayload, HandlerError> {
        let handler = Arc::clone(&self.handler);
        let work = command.clone();
        match tokio::spawn(async move { handler.handle(&work).await }).await {
            Ok(outcome) => outcome,
            Err(join) => {
                warn!(correlation_id = %command.correlation_id, error = %join, "command handler aborted");
                Err(HandlerError::Failed("command handler panicked".into()))
            }
        }
    }

    async fn publish_reply(&self, reply: &ReplyMessage) {
        match publish_json(
            self.transport.as_ref(),
            &self.reply_topic,
            reply,
            QoS::AtLeastOnce,
            false,
        )
        .await
        {
            Ok(()) => {
                if let Some(metrics) = &self.metrics {
                    metrics.observe_published();
                }
                info!(correlation_id = %reply.correlation_id, kind = %reply.kind, "reply published");
            }
            Err(err) => {
                warn!(correlation_id = %reply.correlation_id, error = %err, "reply publish failed; a retry will replay it");
            }
        }
    }

    /// Forget every cached reply (done when a session ends).
    pub fn clear_cache(&self) {
        let mut state = self.state.lock();
        let cleared = state.cache.entries.len();
        state.cache.entries.clear();
        info!(cleared, "reply cache cleared");
    }

    /// Number of cached replies.
    pub fn cached_len(&self) -> usize {
        self.state.lock().cache.entries.len()
    }

    /// Whether a completed reply is cached for the id.
    pub fn is_cached(&self, correlation_id: &CorrelationId) -> bool {
        self.state.lock().cache.entries.contains_key(correlation_id)
    }

    /// Number of commands currently being processed.
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Current counter values.
    pub fn stats(&self) -> ExecutorStats {
        ExecutorStats {
            executed: self.counters.executed.load(Ordering::Relaxed),
            replayed: self.counters.replayed.load(Ordering::Relaxed),
            dropped_in_flight: self.counters.dropped_in_flight.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}
