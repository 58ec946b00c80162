//! Kafka-compatible stream client: batch producer and the offset-committed
//! telemetry consumer.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Header, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use tokio::sync::broadcast;

use skyops_core::models::TelemetryRecord;

use crate::config::Config;
use crate::consumer::ConsumerCore;
use crate::metrics::Metrics;
use crate::stream::{decompress_batch, StreamBatch, StreamWriter, TOPIC_TELEMETRY};

/// Consumer group for the secondary-state reconciler.
const CONSUMER_GROUP: &str = "telemetry-processor";
const PRODUCE_TIMEOUT: Duration = Duration::from_secs(5);

fn base_client_config(config: &Config) -> ClientConfig {
    let mut client = ClientConfig::new();
    client.set("bootstrap.servers", &config.stream_brokers);
    if let (Some(username), Some(password)) = (
        config.stream_sasl_username.as_deref(),
        config.stream_sasl_password.as_deref(),
    ) {
        client
            .set("security.protocol", "sasl_ssl")
            .set("sasl.mechanisms", "PLAIN")
            .set("sasl.username", username)
            .set("sasl.password", password);
    }
    client
}

/// Production writer behind the `StreamWriter` seam.
pub struct KafkaStreamWriter {
    producer: FutureProducer,
}

impl KafkaStreamWriter {
    pub fn new(config: &Config) -> Result<Self> {
        let producer = base_client_config(config)
            .set("message.timeout.ms", "5000")
            // Batches are gzip'd by the publisher; don't recompress.
            .set("compression.type", "none")
            .create()
            .context("create stream producer")?;
        Ok(Self { producer })
    }
}

#[async_trait]
impl StreamWriter for KafkaStreamWriter {
    async fn write_batch(&self, batch: &StreamBatch) -> Result<()> {
        let headers = OwnedHeaders::new()
            .insert(Header {
                key: "content-encoding",
                value: Some("gzip"),
            })
            .insert(Header {
                key: "record-count",
                value: Some(&batch.record_count.to_string()),
            });
        let record = FutureRecord::to(&batch.topic)
            .key(&batch.key)
            .payload(&batch.payload_gz)
            .headers(headers);
        self.producer
            .send(record, Timeout::After(PRODUCE_TIMEOUT))
            .await
            .map_err(|(err, _)| anyhow::anyhow!("stream produce failed: {}", err))?;
        Ok(())
    }
}

/// Run the `telemetry` topic consumer until shutdown.
///
/// Offsets commit after each message's records are applied, so a crash
/// replays the batch (at-least-once); the coordinator's terminal-state
/// check makes re-application a no-op.
pub async fn run_telemetry_consumer(
    config: &Config,
    core: ConsumerCore,
    metrics: std::sync::Arc<Metrics>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let consumer: StreamConsumer = base_client_config(config)
        .set("group.id", CONSUMER_GROUP)
        .set("enable.auto.commit", "false")
        .set("auto.offset.reset", "earliest")
        .set("session.timeout.ms", "10000")
        .create()
        .context("create stream consumer")?;
    consumer
        .subscribe(&[TOPIC_TELEMETRY])
        .context("subscribe telemetry topic")?;

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("Telemetry consumer shutting down");
                return Ok(());
            }
            result = consumer.recv() => {
                let message = match result {
                    Ok(message) => message,
                    Err(err) => {
                        tracing::warn!("Telemetry consumer poll failed: {}", err);
                        continue;
                    }
                };

                if let Some(ts_ms) = message.timestamp().to_millis() {
                    let now_ms = chrono::Utc::now().timestamp_millis();
                    metrics.set_consumer_lag_ms(now_ms.saturating_sub(ts_ms).max(0) as u64);
                }

                let records = decode_telemetry_message(
                    message.key().and_then(|k| std::str::from_utf8(k).ok()),
                    message.payload(),
                );
                if !records.is_empty() {
                    metrics
                        .consumer_records
                        .fetch_add(records.len() as u64, std::sync::atomic::Ordering::Relaxed);
                    if let Err(err) = core.apply_batch(&records).await {
                        // Leave the offset uncommitted so the batch replays.
                        tracing::error!("Telemetry batch apply failed: {}", err);
                        continue;
                    }
                }

                if let Err(err) = consumer.commit_message(&message, CommitMode::Async) {
                    tracing::warn!("Offset commit failed: {}", err);
                }
            }
        }
    }
}

fn decode_telemetry_message(key: Option<&str>, payload: Option<&[u8]>) -> Vec<TelemetryRecord> {
    let Some(drone_id) = key else {
        tracing::warn!("Telemetry message without a key; skipping");
        return Vec::new();
    };
    let Some(payload) = payload else {
        return Vec::new();
    };
    let lines = match decompress_batch(payload) {
        Ok(lines) => lines,
        Err(err) => {
            tracing::warn!("Telemetry batch decompression failed: {}", err);
            return Vec::new();
        }
    };
    lines
        .iter()
        .filter_map(|line| match TelemetryRecord::from_wire(drone_id, line) {
            Ok(rec) => Some(rec),
            Err(err) => {
                tracing::warn!("Telemetry stream decode failed: {}", err);
                None
            }
        })
        .collect()
}
