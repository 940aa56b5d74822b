//! ---
//! gl_section: "04-presence"
//! gl_subsection: "module"
//! gl_type: "source"
//! gl_scope: "code"
//! gl_description: "Retained presence publication and reconnect republish."
//! gl_version: "v0.0.0-prealpha"
//! gl_owner: "tbd"
//! ---
use std::sync::Arc;

use gearlink_msg::{
    publish_json, LastWill, PresenceRecord, PresenceState, QoS, TopicSet, Transport,
};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Publishes this peer's presence on the retained `status` topic.
pub struct PresenceChannel {
    transport: Arc<dyn Transport>,
    topic: String,
    sender: String,
    last: Mutex<Option<(bool, PresenceState)>>,
}

impl PresenceChannel {
    /// Channel publishing as `sender` on the deployment's status topic.
    pub fn new(transport: Arc<dyn Transport>, topics: &TopicSet, sender: impl Into<String>) -> Self {
        Self {
            transport,
            topic: topics.status.clone(),
            sender: sender.into(),
            last: Mutex::new(None),
        }
    }

    /// Last will to register when connecting: `{online:false, state:disconnected}`, retained.
    pub fn last_will(topics: &TopicSet, sender: &str) -> gearlink_msg::Result<LastWill> {
        LastWill::retained_json(topics.status.clone(), &PresenceRecord::disconnected(sender))
    }

    /// Publish a retained presence record.
    ///
    /// The state is remembered even when the publish fails so that
    /// [`Self::republish`] restores it once the connection comes back.
    pub async fn publish_status(&self, online: bool, state: PresenceState) -> gearlink_msg::Result<()> {
        *self.last.lock() = Some((online, state));
        let record = PresenceRecord::new(online, state, &self.sender);
        publish_json(self.transport.as_ref(), &self.topic, &record, QoS::AtLeastOnce, true).await?;
        info!(sender = %self.sender, online, state = state.as_str(), "presence published");
        Ok(())
    }

    /// Publish the last remembered presence again. Returns `false` when
    /// nothing has been published yet.
    pub async fn republish(&self) -> gearlink_msg::Result<bool> {
        let last = *self.last.lock();
        match last {
            Some((online, state)) => {
                self.publish_status(online, state).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Most recently requested presence.
    pub fn last_published(&self) -> Option<(bool, PresenceState)> {
        *self.last.lock()
    }

    /// Republish presence every time the transport reports a reconnection.
    ///
    /// The broker may have stored the last will while the peer was away.
    /// Runs until the connection-state channel closes.
    pub async fn follow_reconnects(self: Arc<Self>, mut connection: watch::Receiver<bool>) {
        let mut was_connected = *connection.borrow_and_update();
        while connection.changed().await.is_ok() {
            let connected = *connection.borrow_and_update();
            if connected && !was_connected {
                debug!(sender = %self.sender, "connection restored; republishing presence");
                if let Err(err) = self.republish().await {
                    warn!(sender = %self.sender, error = %err, "presence republish failed");
                }
            }
            was_connected = connected;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use gearlink_msg::InMemoryBroker;
    use std::time::Duration;

    fn topics() -> TopicSet {
        TopicSet::new("id1")
    }

    fn retained_record(broker: &InMemoryBroker) -> PresenceRecord {
        let raw = broker.retained("v1/id1/status").expect("retained presence");
        serde_json::from_slice(&raw).expect("presence decodes")
    }

    #[tokio::test]
    async fn abrupt_drop_leaves_disconnected_record() {
        let broker = InMemoryBroker::new();
        let will = PresenceChannel::last_will(&topics(), "A").expect("will");
        let (transport, _inbound) = broker.connect("A-id1", Some(will));
        let presence = PresenceChannel::new(transport.clone(), &topics(), "A");

        presence
            .publish_status(true, PresenceState::Running)
            .await
            .expect("publish");
        assert_eq!(retained_record(&broker).state, PresenceState::Running);

        transport.drop_connection();
        let record = retained_record(&broker);
        assert!(!record.online);
        assert_eq!(record.state, PresenceState::Disconnected);
        assert_eq!(record.sender, "A");
    }

    #[tokio::test]
    async fn republish_without_history_is_a_no_op() {
        let broker = InMemoryBroker::new();
        let (transport, _inbound) = broker.connect("B-id1", None);
        let presence = PresenceChannel::new(transport, &topics(), "B");
        assert!(!presence.republish().await.expect("republish"));
        assert!(broker.retained("v1/id1/status").is_none());
    }

    /// Transport whose connection flag is driven by the test.
    struct ToggleTransport {
        connected: watch::Sender<bool>,
        published: parking_lot::Mutex<Vec<Bytes>>,
    }

    #[async_trait]
    impl Transport for ToggleTransport {
        async fn publish(&self, _topic: &str, payload: Bytes, _qos: QoS, _retain: bool) -> gearlink_msg::Result<()> {
            if !self.is_connected() {
                return Err(gearlink_msg::MessagingError::NotConnected("toggle"));
            }
            self.published.lock().push(payload);
            Ok(())
        }

        async fn subscribe(&self, _filter: &str, _qos: QoS) -> gearlink_msg::Result<()> {
            Ok(())
        }

        fn is_connected(&self) -> bool {
            *self.connected.borrow()
        }

        fn connection_state(&self) -> watch::Receiver<bool> {
            self.connected.subscribe()
        }

        async fn disconnect(&self) -> gearlink_msg::Result<()> {
            self.connected.send_replace(false);
            Ok(())
        }

        fn name(&self) -> &'static str {
            "toggle"
        }
    }

    #[tokio::test]
    async fn presence_is_restored_after_reconnect() {
        let (connected, _) = watch::channel(true);
        let transport = Arc::new(ToggleTransport {
            connected,
            published: parking_lot::Mutex::new(Vec::new()),
        });
        let presence = Arc::new(PresenceChannel::new(transport.clone(), &topics(), "B"));
        presence
            .publish_status(true, PresenceState::Ready)
            .await
            .expect("publish");

        let watcher = tokio::spawn(presence.clone().follow_reconnects(transport.connection_state()));
        transport.connected.send_replace(false);
        tokio::time::sleep(Duration::from_millis(20)).await;
        transport.connected.send_replace(true);

        let mut restored = false;
        for _ in 0..50 {
            if transport.published.lock().len() == 2 {
                restored = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(restored, "presence was not republished");
        let record: PresenceRecord =
            serde_json::from_slice(&transport.published.lock()[1]).expect("decode");
        assert_eq!(record.state, PresenceState::Ready);
        assert!(record.online);
        watcher.abort();
    }
}
