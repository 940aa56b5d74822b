//! ---
//! gl_section: "02-messaging-wire-model"
//! gl_subsection: "module"
//! gl_type: "source"
//! gl_scope: "code"
//! gl_description: "In-process broker with retained values and last-will support."
//! gl_version: "v0.0.0-prealpha"
//! gl_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use crate::topics::topic_matches;
use crate::transport::{InboundMessage, LastWill, Transport};
use crate::{MessagingError, QoS, Result};

/// Entry in the broker's publish log, kept for inspection by tests and demos.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRecord {
    /// Client that published the message (`broker` for fired last wills).
    pub client_id: String,
    /// Topic name.
    pub topic: String,
    /// Payload bytes.
    pub payload: Bytes,
    /// Retain flag requested by the publisher.
    pub retain: bool,
}

struct Session {
    client_id: String,
    filters: Vec<String>,
    outbox: mpsc::UnboundedSender<InboundMessage>,
    last_will: Option<LastWill>,
}

#[derive(Default)]
struct BrokerState {
    next_session: u64,
    sessions: HashMap<u64, Session>,
    retained: HashMap<String, Bytes>,
    duplicate_filters: Vec<String>,
    log: Vec<PublishRecord>,
}

impl BrokerState {
    /// Store/clear retained state and collect the deliveries for a publish.
    fn route(
        &mut self,
        client_id: &str,
        topic: &str,
        payload: &Bytes,
        retain: bool,
    ) -> Vec<(mpsc::UnboundedSender<InboundMessage>, InboundMessage)> {
        self.log.push(PublishRecord {
            client_id: client_id.to_owned(),
            topic: topic.to_owned(),
            payload: payload.clone(),
            retain,
        });
        if retain {
            if payload.is_empty() {
                self.retained.remove(topic);
            } else {
                self.retained.insert(topic.to_owned(), payload.clone());
            }
        }

        let copies = if self
            .duplicate_filters
            .iter()
            .any(|filter| topic_matches(filter, topic))
        {
            2
        } else {
            1
        };
        let mut deliveries = Vec::new();
        for session in self.sessions.values() {
            if session
                .filters
                .iter()
                .any(|filter| topic_matches(filter, topic))
            {
                for _ in 0..copies {
                    deliveries.push((
                        session.outbox.clone(),
                        InboundMessage::new(topic, payload.clone()),
                    ));
                }
            }
        }
        deliveries
    }
}

fn deliver(deliveries: Vec<(mpsc::UnboundedSender<InboundMessage>, InboundMessage)>) {
    for (outbox, message) in deliveries {
        // receiver dropped means the peer stopped its dispatch loop
        let _ = outbox.send(message);
    }
}

/// Single-process pub/sub broker following MQTT retained and last-will rules.
///
/// Cloning yields another handle onto the same broker.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a client session. The receiver is the client's inbound stream.
    pub fn connect(
        &self,
        client_id: impl Into<String>,
        last_will: Option<LastWill>,
    ) -> (Arc<InMemoryTransport>, mpsc::UnboundedReceiver<InboundMessage>) {
        let client_id = client_id.into();
        let (outbox, inbound) = mpsc::unbounded_channel();
        let session_id = {
            let mut state = self.state.lock();
            state.next_session += 1;
            let session_id = state.next_session;
            state.sessions.insert(
                session_id,
                Session {
                    client_id: client_id.clone(),
                    filters: Vec::new(),
                    outbox,
                    last_will,
                },
            );
            session_id
        };
        tracing::debug!(client_id = %client_id, session_id, "in-memory session opened");
        let (connected, _) = watch::channel(true);
        let transport = Arc::new(InMemoryTransport {
            broker: self.clone(),
            session_id,
            client_id,
            connected,
        });
        (transport, inbound)
    }

    /// Deliver every publish matching `filter` twice, mimicking at-least-once redelivery.
    pub fn duplicate_deliveries(&self, filter: impl Into<String>) {
        self.state.lock().duplicate_filters.push(filter.into());
    }

    /// Currently retained payload for a topic.
    pub fn retained(&self, topic: &str) -> Option<Bytes> {
        self.state.lock().retained.get(topic).cloned()
    }

    /// Every publish seen on `topic`, oldest first.
    pub fn published_on(&self, topic: &str) -> Vec<PublishRecord> {
        self.state
            .lock()
            .log
            .iter()
            .filter(|record| record.topic == topic)
            .cloned()
            .collect()
    }

    /// Number of open sessions.
    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    fn publish_from(&self, client_id: &str, topic: &str, payload: Bytes, retain: bool) {
        let deliveries = self.state.lock().route(client_id, topic, &payload, retain);
        deliver(deliveries);
    }

    fn subscribe(&self, session_id: u64, filter: &str) -> Result<()> {
        let (outbox, retained) = {
            let mut state = self.state.lock();
            let retained: Vec<InboundMessage> = state
                .retained
                .iter()
                .filter(|(topic, _)| topic_matches(filter, topic))
                .map(|(topic, payload)| InboundMessage {
                    topic: topic.clone(),
                    payload: payload.clone(),
                    retain: true,
                })
                .collect();
            let session = state
                .sessions
                .get_mut(&session_id)
                .ok_or(MessagingError::NotConnected("in_memory"))?;
            if !session.filters.iter().any(|existing| existing == filter) {
                session.filters.push(filter.to_owned());
            }
            (session.outbox.clone(), retained)
        };
        for message in retained {
            let _ = outbox.send(message);
        }
        Ok(())
    }

    fn close(&self, session_id: u64, fire_will: bool) {
        let deliveries = {
            let mut state = self.state.lock();
            let Some(session) = state.sessions.remove(&session_id) else {
                return;
            };
            match session.last_will {
                Some(will) if fire_will => {
                    tracing::debug!(client_id = %session.client_id, topic = %will.topic, "publishing last will");
                    state.route("broker", &will.topic, &will.payload, will.retain)
                }
                _ => Vec::new(),
            }
        };
        deliver(deliveries);
    }
}

/// Client handle onto an [`InMemoryBroker`] session.
pub struct InMemoryTransport {
    broker: InMemoryBroker,
    session_id: u64,
    client_id: String,
    connected: watch::Sender<bool>,
}

impl InMemoryTransport {
    /// Client identifier of the session.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Simulate an abrupt network loss: the broker fires the last will.
    pub fn drop_connection(&self) {
        if self.connected.send_replace(false) {
            self.broker.close(self.session_id, true);
        }
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn publish(&self, topic: &str, payload: Bytes, _qos: QoS, retain: bool) -> Result<()> {
        if !self.is_connected() {
            return Err(MessagingError::NotConnected(self.name()));
        }
        self.broker
            .publish_from(&self.client_id, topic, payload, retain);
        Ok(())
    }

    async fn subscribe(&self, filter: &str, _qos: QoS) -> Result<()> {
        if !self.is_connected() {
            return Err(MessagingError::NotConnected(self.name()));
        }
        self.broker.subscribe(self.session_id, filter)
    }

    fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    fn connection_state(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    async fn disconnect(&self) -> Result<()> {
        if self.connected.send_replace(false) {
            self.broker.close(self.session_id, false);
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}

impl Drop for InMemoryTransport {
    fn drop(&mut self) {
        if *self.connected.borrow() {
            self.broker.close(self.session_id, true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PresenceRecord, PresenceState};

    #[tokio::test]
    async fn retained_value_replayed_to_late_subscriber() {
        let broker = InMemoryBroker::new();
        let (publisher, _inbound) = broker.connect("B-id1", None);
        publisher
            .publish("v1/id1/config/setting", Bytes::from_static(b"{\"v\":1}"), QoS::AtLeastOnce, true)
            .await
            .expect("publish");

        let (late, mut inbound) = broker.connect("A-id1", None);
        late.subscribe("v1/id1/config/setting", QoS::AtLeastOnce)
            .await
            .expect("subscribe");
        let message = inbound.recv().await.expect("retained delivery");
        assert!(message.retain);
        assert_eq!(&message.payload[..], b"{\"v\":1}");
    }

    #[tokio::test]
    async fn abrupt_drop_fires_last_will_but_clean_disconnect_does_not() {
        let broker = InMemoryBroker::new();
        let will = LastWill::retained_json("v1/id1/status", &PresenceRecord::disconnected("A"))
            .expect("will");

        let (clean, _rx) = broker.connect("A-id1", Some(will.clone()));
        clean.disconnect().await.expect("disconnect");
        assert!(broker.retained("v1/id1/status").is_none());

        let (abrupt, _rx) = broker.connect("A-id1", Some(will));
        abrupt.drop_connection();
        let stored = broker.retained("v1/id1/status").expect("will retained");
        let record: PresenceRecord = serde_json::from_slice(&stored).expect("decode");
        assert!(!record.online);
        assert_eq!(record.state, PresenceState::Disconnected);
        assert!(!abrupt.is_connected());
    }

    #[tokio::test]
    async fn publish_after_drop_reports_not_connected() {
        let broker = InMemoryBroker::new();
        let (transport, _rx) = broker.connect("A-id1", None);
        transport.drop_connection();
        let err = transport
            .publish("v1/id1/cmd/point", Bytes::new(), QoS::AtLeastOnce, false)
            .await
            .expect_err("publish must fail");
        assert!(matches!(err, MessagingError::NotConnected("in_memory")));
    }

    #[tokio::test]
    async fn duplicate_delivery_filter_doubles_matching_messages() {
        let broker = InMemoryBroker::new();
        broker.duplicate_deliveries("v1/id1/cmd/#");
        let (subscriber, mut inbound) = broker.connect("B-id1", None);
        subscriber
            .subscribe("v1/id1/#", QoS::AtLeastOnce)
            .await
            .expect("subscribe");
        let (publisher, _rx) = broker.connect("A-id1", None);
        publisher
            .publish("v1/id1/cmd/point", Bytes::from_static(b"{}"), QoS::AtLeastOnce, false)
            .await
            .expect("publish");
        publisher
            .publish("v1/id1/ctrl/end", Bytes::from_static(b"{}"), QoS::AtLeastOnce, false)
            .await
            .expect("publish");

        let mut topics = Vec::new();
        while let Ok(message) = inbound.try_recv() {
            topics.push(message.topic);
        }
        assert_eq!(
            topics,
            vec!["v1/id1/cmd/point", "v1/id1/cmd/point", "v1/id1/ctrl/end"]
        );
        assert_eq!(broker.published_on("v1/id1/cmd/point").len(), 1);
    }
}
