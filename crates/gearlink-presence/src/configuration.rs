//! ---
//! gl_section: "04-presence"
//! gl_subsection: "module"
//! gl_type: "source"
//! gl_scope: "code"
//! gl_description: "Latest retained configuration snapshot."
//! gl_version: "v0.0.0-prealpha"
//! gl_owner: "tbd"
//! ---
use std::sync::Arc;

use gearlink_msg::{epoch_seconds, publish_json, ConfigurationSnapshot, QoS, TopicSet, Transport};
use tokio::sync::watch;
use tracing::info;

/// Holds the last configuration seen on the retained `config/setting` topic.
///
/// The broker replays the retained value on subscribe, so a peer that joins
/// late still observes the current configuration without a re-send.
pub struct ConfigurationChannel {
    transport: Arc<dyn Transport>,
    topic: String,
    sender: String,
    latest: watch::Sender<Option<ConfigurationSnapshot>>,
}

impl ConfigurationChannel {
    /// Channel for the deployment's configuration topic.
    pub fn new(transport: Arc<dyn Transport>, topics: &TopicSet, sender: impl Into<String>) -> Self {
        let (latest, _) = watch::channel(None);
        Self {
            transport,
            topic: topics.config_setting.clone(),
            sender: sender.into(),
            latest,
        }
    }

    /// Store a snapshot delivered by the dispatch loop. Later snapshots replace earlier ones.
    pub fn on_configuration_received(&self, snapshot: ConfigurationSnapshot) {
        info!(
            sender = %snapshot.sender,
            version = snapshot.version.as_deref().unwrap_or("-"),
            "configuration received"
        );
        self.latest.send_replace(Some(snapshot));
    }

    /// Latest snapshot, if any arrived.
    pub fn latest(&self) -> Option<ConfigurationSnapshot> {
        self.latest.borrow().clone()
    }

    /// Watch channel following the latest snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Option<ConfigurationSnapshot>> {
        self.latest.subscribe()
    }

    /// Publish a snapshot retained, stamping sender and time when missing.
    pub async fn publish_configuration(&self, mut snapshot: ConfigurationSnapshot) -> gearlink_msg::Result<()> {
        if snapshot.sender.is_empty() {
            snapshot.sender = self.sender.clone();
        }
        if snapshot.ts == 0 {
            snapshot.ts = epoch_seconds();
        }
        publish_json(self.transport.as_ref(), &self.topic, &snapshot, QoS::AtLeastOnce, true).await?;
        info!(topic = %self.topic, "configuration published");
        Ok(())
    }
}
