//! Drone transport adapter: MQTT ingest of telemetry/acks and QoS-1
//! command publishing.
//!
//! The broker preserves per-topic order; nothing here deduplicates, so
//! downstream is idempotent via `command_id`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::sync::broadcast;

use skyops_core::models::{AckRecord, TelemetryRecord};

use crate::backoff::Backoff;
use crate::config::Config;
use crate::error::ControlError;
use crate::metrics::Metrics;

pub const TELEMETRY_FILTER: &str = "drones/+/telemetry";
pub const ACK_FILTER: &str = "drones/+/ack";

pub fn command_topic(drone_id: &str) -> String {
    format!("drones/{}/commands", drone_id)
}

/// Where decoded inbound records go. Implemented by the app state, which
/// routes telemetry to the processor pool and acks to the dispatcher.
pub trait IngestSink: Send + Sync {
    fn on_telemetry(&self, rec: TelemetryRecord);
    fn on_ack(&self, ack: AckRecord);
}

/// Outbound command seam; the dispatcher only sees this trait.
#[async_trait]
pub trait CommandTransport: Send + Sync {
    async fn send_command(&self, drone_id: &str, payload: Vec<u8>) -> Result<(), ControlError>;
}

/// MQTT client pair: the publish handle plus the owned event loop.
pub struct MqttTransport {
    client: AsyncClient,
    event_loop: EventLoop,
    connected: Arc<AtomicBool>,
}

impl MqttTransport {
    pub fn connect(config: &Config) -> Self {
        let mut options = MqttOptions::new(
            config.mqtt_client_id.clone(),
            config.mqtt_host.clone(),
            config.mqtt_port,
        );
        options.set_keep_alive(Duration::from_secs(15));
        if let (Some(username), Some(password)) =
            (config.mqtt_username.clone(), config.mqtt_password.clone())
        {
            options.set_credentials(username, password);
        }
        let (client, event_loop) = AsyncClient::new(options, 256);
        Self {
            client,
            event_loop,
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Publish handle for the command dispatcher.
    pub fn command_publisher(&self) -> MqttCommandPublisher {
        MqttCommandPublisher {
            client: self.client.clone(),
            connected: self.connected.clone(),
        }
    }

    /// Run the ingest loop until shutdown, delivering decoded records to
    /// `sink`. Decode failures are counted, never fatal; disconnects back
    /// off and re-poll (rumqttc reconnects on the next poll).
    pub async fn run_ingest(
        mut self,
        sink: Arc<dyn IngestSink>,
        metrics: Arc<Metrics>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(30));

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("Transport ingest shutting down");
                    self.connected.store(false, Ordering::SeqCst);
                    let _ = self.client.disconnect().await;
                    break;
                }
                event = self.event_loop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        tracing::info!("Connected to drone broker");
                        self.connected.store(true, Ordering::SeqCst);
                        backoff.reset();
                        for filter in [TELEMETRY_FILTER, ACK_FILTER] {
                            if let Err(err) = self.client.subscribe(filter, QoS::AtLeastOnce).await {
                                tracing::error!("Subscribe {} failed: {}", filter, err);
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        handle_publish(&publish.topic, &publish.payload, sink.as_ref(), &metrics);
                    }
                    Ok(_) => {}
                    Err(err) => {
                        self.connected.store(false, Ordering::SeqCst);
                        Metrics::incr(&metrics.transport_reconnects);
                        let delay = backoff.next_delay();
                        tracing::warn!(
                            "Broker connection lost: {} (reconnecting in {:?})",
                            err,
                            delay
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }
}

fn handle_publish(topic: &str, payload: &[u8], sink: &dyn IngestSink, metrics: &Metrics) {
    match parse_topic(topic) {
        Some((drone_id, TopicKind::Telemetry)) => {
            match TelemetryRecord::from_wire(drone_id, payload) {
                Ok(rec) => sink.on_telemetry(rec),
                Err(err) => {
                    Metrics::incr(&metrics.transport_decode_errors);
                    tracing::warn!("Telemetry decode failed on {}: {}", topic, err);
                }
            }
        }
        Some((drone_id, TopicKind::Ack)) => match AckRecord::from_wire(drone_id, payload) {
            Ok(ack) => sink.on_ack(ack),
            Err(err) => {
                Metrics::incr(&metrics.transport_decode_errors);
                tracing::warn!("Ack decode failed on {}: {}", topic, err);
            }
        },
        None => {
            tracing::debug!("Ignoring message on unexpected topic {}", topic);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TopicKind {
    Telemetry,
    Ack,
}

fn parse_topic(topic: &str) -> Option<(&str, TopicKind)> {
    let mut parts = topic.split('/');
    if parts.next() != Some("drones") {
        return None;
    }
    let drone_id = parts.next()?;
    if drone_id.is_empty() {
        return None;
    }
    let kind = match parts.next()? {
        "telemetry" => TopicKind::Telemetry,
        "ack" => TopicKind::Ack,
        _ => return None,
    };
    if parts.next().is_some() {
        return None;
    }
    Some((drone_id, kind))
}

/// QoS-1 command publisher; fails fast while the broker is down.
#[derive(Clone)]
pub struct MqttCommandPublisher {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
}

#[async_trait]
impl CommandTransport for MqttCommandPublisher {
    async fn send_command(&self, drone_id: &str, payload: Vec<u8>) -> Result<(), ControlError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ControlError::Transport("drone broker disconnected".into()));
        }
        self.client
            .publish(command_topic(drone_id), QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|err| ControlError::Transport(format!("command publish failed: {}", err)))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// In-memory transport capturing published commands.
    pub struct MemoryTransport {
        pub sent: Mutex<Vec<(String, Vec<u8>)>>,
        pub fail: AtomicBool,
    }

    impl MemoryTransport {
        pub fn new() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                fail: AtomicBool::new(false),
            }
        }

        pub fn sent_to(&self, drone_id: &str) -> Vec<Vec<u8>> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(id, _)| id == drone_id)
                .map(|(_, payload)| payload.clone())
                .collect()
        }
    }

    #[async_trait]
    impl CommandTransport for MemoryTransport {
        async fn send_command(&self, drone_id: &str, payload: Vec<u8>) -> Result<(), ControlError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(ControlError::Transport("injected transport failure".into()));
            }
            self.sent
                .lock()
                .unwrap()
                .push((drone_id.to_string(), payload));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_telemetry_and_ack_topics() {
        assert_eq!(
            parse_topic("drones/D42/telemetry"),
            Some(("D42", TopicKind::Telemetry))
        );
        assert_eq!(parse_topic("drones/D42/ack"), Some(("D42", TopicKind::Ack)));
    }

    #[test]
    fn rejects_unrelated_topics() {
        assert_eq!(parse_topic("drones/D42/commands"), None);
        assert_eq!(parse_topic("drones//telemetry"), None);
        assert_eq!(parse_topic("fleet/D42/telemetry"), None);
        assert_eq!(parse_topic("drones/D42/telemetry/extra"), None);
    }

    #[test]
    fn command_topic_shape() {
        assert_eq!(command_topic("D7"), "drones/D7/commands");
    }
}
