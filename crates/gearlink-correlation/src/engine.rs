//! ---
//! gl_section: "03-correlation"
//! gl_subsection: "module"
//! gl_type: "source"
//! gl_scope: "code"
//! gl_description: "Pending-request table, retry loop and reply demultiplexing."
//! gl_version: "v0.0.0-prealpha"
//! gl_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use gearlink_msg::logging::{log_message, MessageDirection};
use gearlink_msg::{
    BusMetricsExporter, CommandMessage, CorrelationId, MessagingError, QoS, ReplyMessage,
    TopicSet, Transport, WirePayload,
};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::CorrelationError;

/// Per-request timeout and attempt budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// How long to wait for a reply after each publish.
    pub timeout: Duration,
    /// Total publishes, including the first one.
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Construct a policy.
    pub fn new(timeout: Duration, max_attempts: u32) -> Self {
        Self {
            timeout,
            max_attempts,
        }
    }

    fn validate(&self) -> Result<(), CorrelationError> {
        if self.timeout.is_zero() {
            return Err(CorrelationError::InvalidPolicy("timeout must be positive"));
        }
        if self.max_attempts == 0 {
            return Err(CorrelationError::InvalidPolicy(
                "max_attempts must be at least 1",
            ));
        }
        Ok(())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(8), 3)
    }
}

/// Reply returned to the caller of a successful request.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrelatedReply {
    /// First reply delivered for the request.
    pub message: ReplyMessage,
    /// Publishes performed before the reply arrived.
    pub attempts: u32,
    /// Time from the first publish to resolution.
    pub elapsed: Duration,
}

/// What the engine did with an inbound reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyDisposition {
    /// The reply resolved a waiting request.
    Resolved,
    /// No pending request had the id: late duplicate, abandoned or foreign.
    Unknown,
}

/// Snapshot of engine counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CorrelationStats {
    /// Logical requests started.
    pub issued: u64,
    /// Requests resolved by a reply.
    pub resolved: u64,
    /// Re-publishes after a timeout.
    pub retries: u64,
    /// Requests abandoned after the last attempt.
    pub timeouts: u64,
    /// Replies dropped because no request was waiting for them.
    pub unknown_replies: u64,
}

#[derive(Default)]
struct Counters {
    issued: AtomicU64,
    resolved: AtomicU64,
    retries: AtomicU64,
    timeouts: AtomicU64,
    unknown_replies: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> CorrelationStats {
        CorrelationStats {
            issued: self.issued.load(Ordering::Relaxed),
            resolved: self.resolved.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            unknown_replies: self.unknown_replies.load(Ordering::Relaxed),
        }
    }
}

/// Table entry for an in-flight request.
///
/// The oneshot sender is both the result slot and the signal: sending the
/// reply stores it and wakes the waiter in one step, and it can fire only once.
struct PendingRequest {
    created_at: Instant,
    resolver: oneshot::Sender<ReplyMessage>,
}

/// Correlates commands with replies for one peer.
///
/// The pending table is the only shared mutable state. Every access takes the
/// table lock; the lock is never held across a publish.
///
/// Tie-break between a reply and the final timeout: whichever takes the table
/// lock first wins. A reply that gets there first is returned to the caller
/// even though the deadline has already passed; once the cleanup has removed
/// the entry, any later reply is dropped as unknown.
pub struct CorrelationEngine {
    transport: Arc<dyn Transport>,
    command_topic: String,
    sender: String,
    pending: Mutex<HashMap<CorrelationId, PendingRequest>>,
    counters: Counters,
    metrics: Option<Arc<BusMetricsExporter>>,
}

impl CorrelationEngine {
    /// Engine publishing commands on the deployment's command topic as `sender`.
    pub fn new(transport: Arc<dyn Transport>, topics: &TopicSet, sender: impl Into<String>) -> Self {
        Self {
            transport,
            command_topic: topics.cmd_point.clone(),
            sender: sender.into(),
            pending: Mutex::new(HashMap::new()),
            counters: Counters::default(),
            metrics: None,
        }
    }

    /// Record activity into the supplied Prometheus exporter as well.
    pub fn with_metrics(mut self, metrics: Arc<BusMetricsExporter>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Publish a command and wait for its correlated reply.
    ///
    /// The same serialized command, with the same correlation id, is
    /// re-published after each timeout until `policy.max_attempts` publishes
    /// have been made. Only the calling task is suspended; replies for other
    /// requests keep flowing through [`Self::on_reply_received`].
    pub async fn issue_request(
        &self,
        kind: &str,
        payload: WirePayload,
        policy: RetryPolicy,
    ) -> Result<CorrelatedReply, CorrelationError> {
        policy.validate()?;
        if !self.transport.is_connected() {
            return Err(CorrelationError::TransportUnavailable(
                MessagingError::NotConnected(self.transport.name()),
            ));
        }

        let correlation_id = CorrelationId::generate();
        let command = CommandMessage::new(kind, correlation_id.clone(), payload, &self.sender);
        let encoded = Bytes::from(serde_json::to_vec(&command)?);
        let mut waiter = self.register(correlation_id.clone())?;
        self.counters.issued.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();

        for attempt in 1..=policy.max_attempts {
            if attempt > 1 {
                // a reply may have been handed off after the last deadline fired
                match waiter.receiver.try_recv() {
                    Ok(message) => {
                        debug!(correlation_id = %correlation_id, attempt, "reply arrived after the deadline; skipping retry");
                        return Ok(self.resolved(message, attempt - 1, started));
                    }
                    Err(oneshot::error::TryRecvError::Closed) => break,
                    Err(oneshot::error::TryRecvError::Empty) => {}
                }
                self.counters.retries.fetch_add(1, Ordering::Relaxed);
                if let Some(metrics) = &self.metrics {
                    metrics.observe_retry();
                }
                log_message(MessageDirection::Retry, &self.command_topic, &encoded);
            } else {
                log_message(MessageDirection::Outbound, &self.command_topic, &encoded);
            }

            if let Err(err) = self
                .transport
                .publish(&self.command_topic, encoded.clone(), QoS::AtLeastOnce, false)
                .await
            {
                warn!(correlation_id = %correlation_id, attempt, error = %err, "command publish failed");
                waiter.settle();
                return Err(CorrelationError::TransportUnavailable(err));
            }
            if let Some(metrics) = &self.metrics {
                metrics.observe_published();
            }
            debug!(correlation_id = %correlation_id, attempt, max_attempts = policy.max_attempts, "command published");

            match tokio::time::timeout(policy.timeout, &mut waiter.receiver).await {
                Ok(Ok(message)) => return Ok(self.resolved(message, attempt, started)),
                Ok(Err(_)) => break,
                Err(_) => {
                    warn!(correlation_id = %correlation_id, attempt, timeout = ?policy.timeout, "no reply before deadline");
                }
            }
        }

        match waiter.settle() {
            Some(message) => {
                info!(correlation_id = %correlation_id, "reply won the race against the final timeout");
                Ok(self.resolved(message, policy.max_attempts, started))
            }
            None => {
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                if let Some(metrics) = &self.metrics {
                    metrics.observe_timeout();
                }
                warn!(correlation_id = %correlation_id, attempts = policy.max_attempts, "request abandoned");
                Err(CorrelationError::Timeout {
                    correlation_id,
                    attempts: policy.max_attempts,
                })
            }
        }
    }

    /// Route an inbound reply to its waiter.
    ///
    /// Removal and hand-off happen under the table lock so they cannot
    /// interleave with a timeout-driven cleanup.
    pub fn on_reply_received(&self, reply: ReplyMessage) -> ReplyDisposition {
        let correlation_id = reply.correlation_id.clone();
        let outcome = {
            let mut pending = self.pending.lock();
            pending
                .remove(&correlation_id)
                .map(|request| (request.created_at, request.resolver.send(reply).is_ok()))
        };

        match outcome {
            Some((created_at, true)) => {
                debug!(correlation_id = %correlation_id, age = ?created_at.elapsed(), "reply matched pending request");
                ReplyDisposition::Resolved
            }
            Some((_, false)) => {
                debug!(correlation_id = %correlation_id, "waiter went away before the reply arrived");
                self.count_unknown();
                ReplyDisposition::Unknown
            }
            None => {
                warn!(correlation_id = %correlation_id, "dropping reply with unknown correlation id");
                self.count_unknown();
                ReplyDisposition::Unknown
            }
        }
    }

    /// Whether a request with this id is in flight.
    pub fn is_pending(&self, correlation_id: &CorrelationId) -> bool {
        self.pending.lock().contains_key(correlation_id)
    }

    /// Number of requests in flight.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Current counter values.
    pub fn stats(&self) -> CorrelationStats {
        self.counters.snapshot()
    }

    /// Whether the underlying transport is connected.
    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    fn register(&self, correlation_id: CorrelationId) -> Result<PendingWaiter<'_>, CorrelationError> {
        let (resolver, receiver) = oneshot::channel();
        let mut pending = self.pending.lock();
        if pending.contains_key(&correlation_id) {
            return Err(CorrelationError::DuplicateCorrelation(correlation_id));
        }
        pending.insert(
            correlation_id.clone(),
            PendingRequest {
                created_at: Instant::now(),
                resolver,
            },
        );
        Ok(PendingWaiter {
            engine: self,
            correlation_id,
            receiver,
        })
    }

    fn resolved(&self, message: ReplyMessage, attempts: u32, started: Instant) -> CorrelatedReply {
        let elapsed = started.elapsed();
        self.counters.resolved.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &self.metrics {
            metrics.observe_latency(elapsed);
        }
        info!(correlation_id = %message.correlation_id, attempts, elapsed = ?elapsed, "request resolved");
        CorrelatedReply {
            message,
            attempts,
            elapsed,
        }
    }

    fn count_unknown(&self) {
        self.counters.unknown_replies.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &self.metrics {
            metrics.observe_dropped();
        }
    }
}

/// Caller side of a pending entry.
///
/// Dropping it (including when the request future is cancelled) removes the
/// entry so no stale id stays in the table.
struct PendingWaiter<'a> {
    engine: &'a CorrelationEngine,
    correlation_id: CorrelationId,
    receiver: oneshot::Receiver<ReplyMessage>,
}

impl PendingWaiter<'_> {
    /// Remove the entry, then take a reply that was handed off before the removal.
    fn settle(&mut self) -> Option<ReplyMessage> {
        let removed = self.engine.pending.lock().remove(&self.correlation_id);
        drop(removed);
        self.receiver.try_recv().ok()
    }
}

impl Drop for PendingWaiter<'_> {
    fn drop(&mut self) {
        self.engine.pending.lock().remove(&self.correlation_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gearlink_msg::{BusEvent, InMemoryBroker, InMemoryTransport, InboundMessage};
    use serde_json::json;
    use tokio::sync::mpsc;
    use tracing_subscriber::layer::{Context as LayerContext, SubscriberExt};
    use tracing_subscriber::Layer;

    const DEPLOYMENT: &str = "test";

    fn point(x: f64, y: f64) -> WirePayload {
        let mut payload = WirePayload::new();
        payload.insert("point".into(), json!({ "x": x, "y": y }));
        payload
    }

    async fn controller(broker: &InMemoryBroker) -> (Arc<CorrelationEngine>, Arc<InMemoryTransport>) {
        let topics = TopicSet::new(DEPLOYMENT);
        let (transport, inbound) = broker.connect("A-test", None);
        transport
            .subscribe(&topics.telemetry_result, QoS::AtLeastOnce)
            .await
            .expect("subscribe");
        let engine = Arc::new(CorrelationEngine::new(transport.clone(), &topics, "A"));
        tokio::spawn(dispatch_replies(engine.clone(), inbound, topics));
        (engine, transport)
    }

    async fn dispatch_replies(
        engine: Arc<CorrelationEngine>,
        mut inbound: mpsc::UnboundedReceiver<InboundMessage>,
        topics: TopicSet,
    ) {
        while let Some(message) = inbound.recv().await {
            if let Ok(Some(BusEvent::Reply(reply))) = BusEvent::decode(&topics, &message) {
                engine.on_reply_received(reply);
            }
        }
    }

    /// Executor that stays silent for the first `silent` commands and then
    /// answers each command `copies` times. Returns the ids it observed.
    async fn scripted_executor(
        broker: &InMemoryBroker,
        silent: usize,
        copies: usize,
    ) -> Arc<Mutex<Vec<CorrelationId>>> {
        let topics = TopicSet::new(DEPLOYMENT);
        let (transport, mut inbound) = broker.connect("B-test", None);
        transport
            .subscribe(&topics.cmd_point, QoS::AtLeastOnce)
            .await
            .expect("subscribe");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_by_task = seen.clone();
        tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                let command: CommandMessage =
                    serde_json::from_slice(&message.payload).expect("command decodes");
                let count = {
                    let mut seen = seen_by_task.lock();
                    seen.push(command.correlation_id.clone());
                    seen.len()
                };
                if count <= silent {
                    continue;
                }
                let reply = ReplyMessage::feature_set(command.correlation_id, command.payload, "B");
                for _ in 0..copies {
                    gearlink_msg::publish_json(
                        transport.as_ref(),
                        &topics.telemetry_result,
                        &reply,
                        QoS::AtLeastOnce,
                        false,
                    )
                    .await
                    .expect("reply publish");
                }
            }
        });
        seen
    }

    #[tokio::test(start_paused = true)]
    async fn retries_reuse_the_same_correlation_id() {
        let broker = InMemoryBroker::new();
        let seen = scripted_executor(&broker, 2, 1).await;
        let (engine, _transport) = controller(&broker).await;

        let reply = engine
            .issue_request(
                CommandMessage::MOVE_POINT,
                point(10.0, 5.0),
                RetryPolicy::new(Duration::from_secs(1), 3),
            )
            .await
            .expect("third attempt answered");

        assert_eq!(reply.attempts, 3);
        let seen = seen.lock().clone();
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|id| *id == reply.message.correlation_id));
        assert_eq!(engine.pending_count(), 0);
        assert_eq!(engine.stats().retries, 2);
        assert_eq!(engine.stats().resolved, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_replies_resolve_once() {
        let broker = InMemoryBroker::new();
        let _seen = scripted_executor(&broker, 0, 2).await;
        let (engine, _transport) = controller(&broker).await;

        let reply = engine
            .issue_request(
                CommandMessage::MOVE_POINT,
                point(0.0, 0.0),
                RetryPolicy::new(Duration::from_secs(1), 2),
            )
            .await
            .expect("resolved");
        assert_eq!(reply.attempts, 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let stats = engine.stats();
        assert_eq!(stats.resolved, 1);
        assert_eq!(stats.unknown_replies, 1);
        assert!(!engine.is_pending(&reply.message.correlation_id));
        assert_eq!(
            engine.on_reply_received(reply.message.clone()),
            ReplyDisposition::Unknown
        );
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_attempts_time_out_and_clear_the_table() {
        let broker = InMemoryBroker::new();
        let seen = scripted_executor(&broker, usize::MAX, 1).await;
        let (engine, _transport) = controller(&broker).await;

        let started = Instant::now();
        let err = engine
            .issue_request(
                CommandMessage::MOVE_POINT,
                point(1.0, 1.0),
                RetryPolicy::new(Duration::from_secs(1), 2),
            )
            .await
            .expect_err("never answered");

        assert!(started.elapsed() >= Duration::from_secs(2));
        match err {
            CorrelationError::Timeout {
                correlation_id,
                attempts,
            } => {
                assert_eq!(attempts, 2);
                assert!(!engine.is_pending(&correlation_id));
                let late = ReplyMessage::feature_set(correlation_id, WirePayload::new(), "B");
                assert_eq!(engine.on_reply_received(late), ReplyDisposition::Unknown);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(engine.pending_count(), 0);
        assert_eq!(seen.lock().len(), 2);
        assert_eq!(engine.stats().timeouts, 1);
    }

    /// Hands a reply to the engine the moment the first deadline is logged,
    /// before the retry loop gets to publish again.
    struct ReplyAtDeadline {
        engine: Arc<CorrelationEngine>,
        seen: Arc<Mutex<Vec<CorrelationId>>>,
        delivered: std::sync::atomic::AtomicBool,
    }

    impl<S: tracing::Subscriber> Layer<S> for ReplyAtDeadline {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: LayerContext<'_, S>) {
            if *event.metadata().level() != tracing::Level::WARN {
                return;
            }
            let Some(id) = self.seen.lock().first().cloned() else {
                return;
            };
            if !self.delivered.swap(true, Ordering::SeqCst) {
                self.engine
                    .on_reply_received(ReplyMessage::feature_set(id, WirePayload::new(), "B"));
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reply_after_deadline_skips_the_retry_publish() {
        let broker = InMemoryBroker::new();
        let seen = scripted_executor(&broker, usize::MAX, 1).await;
        let (engine, _transport) = controller(&broker).await;
        let layer = ReplyAtDeadline {
            engine: engine.clone(),
            seen: seen.clone(),
            delivered: std::sync::atomic::AtomicBool::new(false),
        };
        let _guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(layer));

        let reply = engine
            .issue_request(
                CommandMessage::MOVE_POINT,
                point(2.0, 3.0),
                RetryPolicy::new(Duration::from_secs(1), 3),
            )
            .await
            .expect("late reply accepted");

        assert_eq!(reply.attempts, 1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(engine.stats().retries, 0);
        assert_eq!(engine.stats().resolved, 1);
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn disconnected_transport_fails_fast() {
        let broker = InMemoryBroker::new();
        let (engine, transport) = controller(&broker).await;
        transport.drop_connection();

        let err = engine
            .issue_request(CommandMessage::MOVE_POINT, point(0.0, 0.0), RetryPolicy::default())
            .await
            .expect_err("no connection");
        assert!(matches!(err, CorrelationError::TransportUnavailable(_)));
        assert_eq!(engine.pending_count(), 0);
        assert_eq!(engine.stats().issued, 0);
    }

    #[tokio::test]
    async fn invalid_policies_are_rejected() {
        let broker = InMemoryBroker::new();
        let (engine, _transport) = controller(&broker).await;
        for policy in [
            RetryPolicy::new(Duration::ZERO, 1),
            RetryPolicy::new(Duration::from_secs(1), 0),
        ] {
            let err = engine
                .issue_request(CommandMessage::MOVE_POINT, point(0.0, 0.0), policy)
                .await
                .expect_err("invalid");
            assert!(matches!(err, CorrelationError::InvalidPolicy(_)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_requests_do_not_block_each_other() {
        let broker = InMemoryBroker::new();
        let seen = scripted_executor(&broker, 0, 1).await;
        let (engine, _transport) = controller(&broker).await;
        let policy = RetryPolicy::new(Duration::from_secs(1), 1);

        let (first, second) = tokio::join!(
            engine.issue_request(CommandMessage::MOVE_POINT, point(1.0, 2.0), policy),
            engine.issue_request(CommandMessage::MOVE_POINT, point(3.0, 4.0), policy),
        );
        let first = first.expect("first resolved");
        let second = second.expect("second resolved");
        assert_ne!(first.message.correlation_id, second.message.correlation_id);
        assert_eq!(first.message.payload["point"]["x"], 1.0);
        assert_eq!(second.message.payload["point"]["x"], 3.0);
        assert_eq!(seen.lock().len(), 2);
    }

    #[tokio::test]
    async fn reply_wins_when_it_takes_the_lock_before_cleanup() {
        let broker = InMemoryBroker::new();
        let (engine, _transport) = controller(&broker).await;
        let id = CorrelationId::generate();
        let mut waiter = engine.register(id.clone()).expect("register");

        let reply = ReplyMessage::feature_set(id.clone(), WirePayload::new(), "B");
        assert_eq!(engine.on_reply_received(reply.clone()), ReplyDisposition::Resolved);
        assert_eq!(waiter.settle(), Some(reply));
        assert!(!engine.is_pending(&id));
    }

    #[tokio::test]
    async fn cleanup_wins_when_it_takes_the_lock_first() {
        let broker = InMemoryBroker::new();
        let (engine, _transport) = controller(&broker).await;
        let id = CorrelationId::generate();
        let mut waiter = engine.register(id.clone()).expect("register");

        assert_eq!(waiter.settle(), None);
        let reply = ReplyMessage::feature_set(id.clone(), WirePayload::new(), "B");
        assert_eq!(engine.on_reply_received(reply), ReplyDisposition::Unknown);
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let broker = InMemoryBroker::new();
        let (engine, _transport) = controller(&broker).await;
        let id = CorrelationId::from("fixed");
        let _waiter = engine.register(id.clone()).expect("register");
        assert!(matches!(
            engine.register(id),
            Err(CorrelationError::DuplicateCorrelation(_))
        ));
    }

    #[tokio::test]
    async fn dropped_waiter_leaves_no_entry() {
        let broker = InMemoryBroker::new();
        let (engine, _transport) = controller(&broker).await;
        let id = CorrelationId::generate();
        {
            let _waiter = engine.register(id.clone()).expect("register");
            assert!(engine.is_pending(&id));
        }
        assert!(!engine.is_pending(&id));
    }
}
