//! ---
//! gl_section: "02-messaging-wire-model"
//! gl_subsection: "module"
//! gl_type: "source"
//! gl_scope: "code"
//! gl_description: "Structured message logging and Prometheus bus metrics."
//! gl_version: "v0.0.0-prealpha"
//! gl_owner: "tbd"
//! ---
use std::time::Duration;

use prometheus::{Histogram, HistogramOpts, IntCounter, Opts, Registry};
use tracing::debug;

/// Direction of the message movement, used for consistent logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDirection {
    /// Message published to the bus.
    Outbound,
    /// Message received from the bus.
    Inbound,
    /// Command re-published after a reply timeout.
    Retry,
}

/// Emit a structured log entry for bus activity.
pub fn log_message(direction: MessageDirection, topic: &str, payload: &[u8]) {
    debug!(
        topic,
        bytes = payload.len(),
        direction = ?direction,
        "bus activity"
    );
}

/// Prometheus metric handles for bus and request activity.
pub struct BusMetricsExporter {
    published: IntCounter,
    received: IntCounter,
    dropped: IntCounter,
    retries: IntCounter,
    timeouts: IntCounter,
    latency: Histogram,
}

impl BusMetricsExporter {
    /// Register bus metrics with the provided registry.
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let published = IntCounter::with_opts(Opts::new(
            "gearlink_messages_published_total",
            "Messages handed to the transport",
        ))?;
        let received = IntCounter::with_opts(Opts::new(
            "gearlink_messages_received_total",
            "Messages consumed from the transport",
        ))?;
        let dropped = IntCounter::with_opts(Opts::new(
            "gearlink_messages_dropped_total",
            "Inbound messages discarded as malformed, unexpected or uncorrelated",
        ))?;
        let retries = IntCounter::with_opts(Opts::new(
            "gearlink_request_retries_total",
            "Commands re-published after a reply timeout",
        ))?;
        let timeouts = IntCounter::with_opts(Opts::new(
            "gearlink_request_timeouts_total",
            "Requests abandoned after exhausting every attempt",
        ))?;
        let latency = Histogram::with_opts(HistogramOpts::new(
            "gearlink_request_roundtrip_seconds",
            "Latency between the first publish and the correlated reply",
        ))?;

        registry.register(Box::new(published.clone()))?;
        registry.register(Box::new(received.clone()))?;
        registry.register(Box::new(dropped.clone()))?;
        registry.register(Box::new(retries.clone()))?;
        registry.register(Box::new(timeouts.clone()))?;
        registry.register(Box::new(latency.clone()))?;

        Ok(Self {
            published,
            received,
            dropped,
            retries,
            timeouts,
            latency,
        })
    }

    /// Record a published message.
    pub fn observe_published(&self) {
        self.published.inc();
    }

    /// Record a received message.
    pub fn observe_received(&self) {
        self.received.inc();
    }

    /// Record a dropped inbound message.
    pub fn observe_dropped(&self) {
        self.dropped.inc();
    }

    /// Record a retried command.
    pub fn observe_retry(&self) {
        self.retries.inc();
    }

    /// Record an abandoned request.
    pub fn observe_timeout(&self) {
        self.timeouts.inc();
    }

    /// Record request round-trip latency.
    pub fn observe_latency(&self, duration: Duration) {
        self.latency.observe(duration.as_secs_f64());
    }
}
