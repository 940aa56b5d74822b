//! ---
//! gl_section: "02-messaging-wire-model"
//! gl_subsection: "module"
//! gl_type: "source"
//! gl_scope: "code"
//! gl_description: "Per-deployment topic space and MQTT filter matching."
//! gl_version: "v0.0.0-prealpha"
//! gl_owner: "tbd"
//! ---

/// Logical role of a topic inside the deployment's topic space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicKind {
    /// `ctrl/start`, begin a session.
    CtrlStart,
    /// `ctrl/end`, session summary.
    CtrlEnd,
    /// `cmd/point`, correlated commands.
    CmdPoint,
    /// `telemetry/result`, correlated replies.
    TelemetryResult,
    /// `config/setting`, retained configuration.
    ConfigSetting,
    /// `status`, retained presence with last will.
    Status,
}

/// Concrete topic names for one deployment identifier (`v1/{ID}/...`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSet {
    deployment_id: String,
    /// Start trigger topic.
    pub ctrl_start: String,
    /// Session summary topic.
    pub ctrl_end: String,
    /// Command topic.
    pub cmd_point: String,
    /// Reply topic.
    pub telemetry_result: String,
    /// Retained configuration topic.
    pub config_setting: String,
    /// Retained presence topic.
    pub status: String,
}

impl TopicSet {
    /// Build the topic set for the given deployment identifier.
    pub fn new(deployment_id: impl Into<String>) -> Self {
        let deployment_id = deployment_id.into();
        let base = format!("v1/{deployment_id}");
        Self {
            ctrl_start: format!("{base}/ctrl/start"),
            ctrl_end: format!("{base}/ctrl/end"),
            cmd_point: format!("{base}/cmd/point"),
            telemetry_result: format!("{base}/telemetry/result"),
            config_setting: format!("{base}/config/setting"),
            status: format!("{base}/status"),
            deployment_id,
        }
    }

    /// Deployment identifier the set was built for.
    pub fn deployment_id(&self) -> &str {
        &self.deployment_id
    }

    /// Filter matching every topic of the deployment.
    pub fn wildcard(&self) -> String {
        format!("v1/{}/#", self.deployment_id)
    }

    /// Topic name for a logical role.
    pub fn topic(&self, kind: TopicKind) -> &str {
        match kind {
            TopicKind::CtrlStart => &self.ctrl_start,
            TopicKind::CtrlEnd => &self.ctrl_end,
            TopicKind::CmdPoint => &self.cmd_point,
            TopicKind::TelemetryResult => &self.telemetry_result,
            TopicKind::ConfigSetting => &self.config_setting,
            TopicKind::Status => &self.status,
        }
    }

    /// Classify an inbound topic name.
    pub fn classify(&self, topic: &str) -> Option<TopicKind> {
        [
            TopicKind::CtrlStart,
            TopicKind::CtrlEnd,
            TopicKind::CmdPoint,
            TopicKind::TelemetryResult,
            TopicKind::ConfigSetting,
            TopicKind::Status,
        ]
        .into_iter()
        .find(|kind| self.topic(*kind) == topic)
    }
}

/// MQTT-style filter match supporting `+` (one level) and `#` (remaining levels).
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_follow_versioned_layout() {
        let topics = TopicSet::new("id1");
        assert_eq!(topics.ctrl_start, "v1/id1/ctrl/start");
        assert_eq!(topics.telemetry_result, "v1/id1/telemetry/result");
        assert_eq!(topics.status, "v1/id1/status");
        assert_eq!(topics.wildcard(), "v1/id1/#");
        assert_eq!(
            topics.classify("v1/id1/cmd/point"),
            Some(TopicKind::CmdPoint)
        );
        assert_eq!(topics.classify("v1/id2/cmd/point"), None);
    }

    #[test]
    fn filter_wildcards() {
        assert!(topic_matches("v1/id1/#", "v1/id1/ctrl/start"));
        assert!(topic_matches("v1/+/status", "v1/id1/status"));
        assert!(topic_matches("v1/id1/status", "v1/id1/status"));
        assert!(!topic_matches("v1/+/status", "v1/id1/ctrl/status"));
        assert!(!topic_matches("v1/id1/ctrl", "v1/id1/ctrl/start"));
    }
}
