//! ---
//! gl_section: "07-entrypoints"
//! gl_subsection: "binary"
//! gl_type: "source"
//! gl_scope: "code"
//! gl_description: "Broker connection, metrics registry and signal helpers for gearlinkd."
//! gl_version: "v0.0.0-prealpha"
//! gl_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use gearlink_common::AppConfig;
use gearlink_msg::{BusMetricsExporter, InboundMessage, LastWill, MqttSettings, MqttTransport, Transport};
use prometheus::{Encoder, Registry, TextEncoder};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const CONNECT_GRACE: Duration = Duration::from_secs(10);

/// Live broker session handed to a peer runtime.
pub struct BusSession {
    pub transport: Arc<dyn Transport>,
    pub inbound: mpsc::UnboundedReceiver<InboundMessage>,
}

/// Connect to the configured MQTT broker as `client_id`.
///
/// Waits up to ten seconds for the first ConnAck. If none arrives the peer
/// starts anyway; subscriptions and presence are replayed once it connects.
pub async fn connect(config: &AppConfig, client_id: String, last_will: Option<LastWill>) -> BusSession {
    let settings = MqttSettings {
        host: config.bus.host.clone(),
        port: config.bus.port,
        client_id,
        keep_alive: config.bus.keep_alive,
        credentials: config.bus.credentials(),
    };
    info!(host = %settings.host, port = settings.port, client_id = %settings.client_id, "connecting to broker");
    let (transport, inbound) = MqttTransport::connect(settings, last_will);
    let mut state = transport.connection_state();
    match tokio::time::timeout(CONNECT_GRACE, state.wait_for(|connected| *connected)).await {
        Ok(Ok(_)) => info!("broker connection established"),
        Ok(Err(_)) => warn!("broker connection task ended before connecting"),
        Err(_) => warn!(grace = ?CONNECT_GRACE, "broker not reachable yet; continuing while reconnecting"),
    }
    BusSession { transport, inbound }
}

/// Fresh registry with the bus metrics registered.
pub fn metrics() -> Result<(Registry, Arc<BusMetricsExporter>)> {
    let registry = Registry::new();
    let exporter = BusMetricsExporter::register(&registry).context("failed to register bus metrics")?;
    Ok((registry, Arc::new(exporter)))
}

/// Emit the current metric values at debug level.
pub fn log_metrics(registry: &Registry) {
    let mut buffer = Vec::new();
    if let Err(err) = TextEncoder::new().encode(&registry.gather(), &mut buffer) {
        warn!(error = %err, "unable to encode metrics");
        return;
    }
    debug!(metrics = %String::from_utf8_lossy(&buffer), "bus metrics");
}

/// Resolve on ctrl-c or SIGTERM.
pub async fn shutdown_signal() {
    tokio::select! {
        result = signal::ctrl_c() => {
            if let Err(err) = result {
                warn!(error = %err, "unable to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        },
        _ = async {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                match signal(SignalKind::terminate()) {
                    Ok(mut term) => {
                        term.recv().await;
                    }
                    Err(err) => {
                        warn!(error = %err, "unable to install SIGTERM handler");
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            std::future::pending::<()>().await;
        } => {},
    }
    info!("termination signal received; shutting down");
}
