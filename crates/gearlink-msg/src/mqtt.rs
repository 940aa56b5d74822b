//! ---
//! gl_section: "02-messaging-wire-model"
//! gl_subsection: "module"
//! gl_type: "source"
//! gl_scope: "code"
//! gl_description: "MQTT transport adapter backed by rumqttc."
//! gl_version: "v0.0.0-prealpha"
//! gl_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::transport::{InboundMessage, LastWill, Transport};
use crate::{MessagingError, QoS, Result};

const RECONNECT_MIN: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(30);
const REQUEST_CAPACITY: usize = 64;

/// Connection parameters for the MQTT adapter.
#[derive(Debug, Clone)]
pub struct MqttSettings {
    /// Broker host name or address.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Client identifier, `A-{ID}` or `B-{ID}`.
    pub client_id: String,
    /// Keep-alive interval.
    pub keep_alive: Duration,
    /// Optional username/password pair.
    pub credentials: Option<(String, String)>,
}

/// Transport speaking MQTT v3.1.1 with a persistent session.
///
/// A background task owns the rumqttc event loop: it forwards publishes to
/// the inbound channel, re-subscribes after every ConnAck and reconnects with
/// exponential back-off.
pub struct MqttTransport {
    client: AsyncClient,
    connected: Arc<watch::Sender<bool>>,
    closing: Arc<AtomicBool>,
    subscriptions: Arc<Mutex<Vec<(String, QoS)>>>,
}

impl MqttTransport {
    /// Start connecting to the broker. Must be called inside a Tokio runtime.
    ///
    /// The last will is registered with the broker as part of the CONNECT packet.
    pub fn connect(
        settings: MqttSettings,
        last_will: Option<LastWill>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<InboundMessage>) {
        let mut options =
            MqttOptions::new(settings.client_id.clone(), settings.host.clone(), settings.port);
        options.set_keep_alive(settings.keep_alive);
        options.set_clean_session(false);
        if let Some((username, password)) = &settings.credentials {
            options.set_credentials(username.clone(), password.clone());
        }
        if let Some(will) = last_will {
            options.set_last_will(rumqttc::LastWill::new(
                will.topic,
                will.payload.to_vec(),
                will.qos.into(),
                will.retain,
            ));
        }

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let (connected, _) = watch::channel(false);
        let transport = Arc::new(Self {
            client,
            connected: Arc::new(connected),
            closing: Arc::new(AtomicBool::new(false)),
            subscriptions: Arc::new(Mutex::new(Vec::new())),
        });
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        info!(host = %settings.host, port = settings.port, client_id = %settings.client_id, "connecting to mqtt broker");
        tokio::spawn(run_event_loop(
            eventloop,
            transport.client.clone(),
            transport.connected.clone(),
            transport.closing.clone(),
            transport.subscriptions.clone(),
            inbound_tx,
        ));
        (transport, inbound_rx)
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    connected: Arc<watch::Sender<bool>>,
    closing: Arc<AtomicBool>,
    subscriptions: Arc<Mutex<Vec<(String, QoS)>>>,
    inbound: mpsc::UnboundedSender<InboundMessage>,
) {
    let mut backoff = RECONNECT_MIN;
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                backoff = RECONNECT_MIN;
                connected.send_replace(true);
                let filters = subscriptions.lock().clone();
                for (filter, qos) in filters {
                    // try_ variant: awaiting here would block the loop that drains the request queue
                    if let Err(err) = client.try_subscribe(filter.clone(), qos.into()) {
                        warn!(filter = %filter, error = %err, "resubscribe failed");
                    }
                }
                info!("mqtt connection established");
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = InboundMessage {
                    topic: publish.topic.clone(),
                    payload: publish.payload.clone(),
                    retain: publish.retain,
                };
                if inbound.send(message).is_err() {
                    debug!("inbound receiver dropped; stopping mqtt event loop");
                    break;
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                connected.send_replace(false);
                info!("mqtt disconnected cleanly");
                break;
            }
            Ok(_) => {}
            Err(err) => {
                connected.send_replace(false);
                if closing.load(Ordering::Acquire) {
                    break;
                }
                warn!(error = %err, retry_in = ?backoff, "mqtt connection error");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(RECONNECT_MAX);
            }
        }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn publish(&self, topic: &str, payload: Bytes, qos: QoS, retain: bool) -> Result<()> {
        if !self.is_connected() {
            return Err(MessagingError::NotConnected(self.name()));
        }
        self.client
            .publish(topic, qos.into(), retain, payload.to_vec())
            .await
            .map_err(|err| MessagingError::Mqtt(err.to_string()))
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<()> {
        {
            let mut subscriptions = self.subscriptions.lock();
            if !subscriptions.iter().any(|(existing, _)| existing == filter) {
                subscriptions.push((filter.to_owned(), qos));
            }
        }
        if self.is_connected() {
            self.client
                .subscribe(filter, qos.into())
                .await
                .map_err(|err| MessagingError::Mqtt(err.to_string()))?;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    fn connection_state(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    async fn disconnect(&self) -> Result<()> {
        self.closing.store(true, Ordering::Release);
        self.client
            .disconnect()
            .await
            .map_err(|err| MessagingError::Mqtt(err.to_string()))
    }

    fn name(&self) -> &'static str {
        "mqtt"
    }
}
