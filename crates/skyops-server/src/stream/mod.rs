//! Durable stream publishing: buffered, batched, gzip-compressed writes to
//! the `telemetry`, `commands`, and `events` topics.
//!
//! Records buffer in a bounded queue and flush at 100 records or 1 s,
//! whichever comes first. A failed batch re-queues at the head; past the
//! retry budget its records are dropped and counted.

pub mod kafka;

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::interval;

use skyops_core::models::{CommandRecord, MissionEvent, TelemetryRecord};

use crate::backoff::Backoff;
use crate::metrics::Metrics;

pub const TOPIC_TELEMETRY: &str = "telemetry";
pub const TOPIC_COMMANDS: &str = "commands";
pub const TOPIC_EVENTS: &str = "events";

const QUEUE_DEPTH: usize = 8_192;

/// One record headed for a durable topic.
#[derive(Debug, Clone)]
pub struct StreamRecord {
    pub topic: &'static str,
    /// Partition key: `drone_id` for telemetry/commands, `mission_id` for events.
    pub key: String,
    pub payload: Vec<u8>,
}

/// A compressed group of records sharing a topic and partition key.
///
/// Grouping by key keeps per-drone ordering while still compressing across
/// the batch; the payload is gzip'd newline-delimited JSON.
#[derive(Debug, Clone)]
pub struct StreamBatch {
    pub topic: String,
    pub key: String,
    pub payload_gz: Vec<u8>,
    pub record_count: usize,
}

/// Seam between the publisher and the broker client, so tests can capture
/// batches in memory.
#[async_trait]
pub trait StreamWriter: Send + Sync {
    async fn write_batch(&self, batch: &StreamBatch) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct StreamPublisherOptions {
    pub max_batch_records: usize,
    pub flush_interval: Duration,
    pub retry_budget: u32,
}

impl Default for StreamPublisherOptions {
    fn default() -> Self {
        Self {
            max_batch_records: 100,
            flush_interval: Duration::from_secs(1),
            retry_budget: 3,
        }
    }
}

/// Handle used by producers to buffer records; the flush loop runs in its
/// own task until shutdown.
#[derive(Clone)]
pub struct StreamPublisher {
    tx: mpsc::Sender<StreamRecord>,
    metrics: Arc<Metrics>,
}

impl StreamPublisher {
    pub fn spawn(
        writer: Arc<dyn StreamWriter>,
        metrics: Arc<Metrics>,
        options: StreamPublisherOptions,
        shutdown: broadcast::Receiver<()>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let loop_metrics = metrics.clone();
        let handle = tokio::spawn(async move {
            run_flush_loop(writer, loop_metrics, options, rx, shutdown).await;
        });
        (Self { tx, metrics }, handle)
    }

    /// Non-blocking enqueue; a full queue drops the record and counts it.
    pub fn buffer(&self, record: StreamRecord) {
        if self.tx.try_send(record).is_err() {
            Metrics::incr(&self.metrics.stream_dropped_records);
        }
    }

    pub fn buffer_telemetry(&self, rec: &TelemetryRecord) {
        match serde_json::to_vec(&rec.to_wire()) {
            Ok(payload) => self.buffer(StreamRecord {
                topic: TOPIC_TELEMETRY,
                key: rec.drone_id.clone(),
                payload,
            }),
            Err(err) => tracing::error!("telemetry stream encode failed: {}", err),
        }
    }

    pub fn buffer_command(&self, cmd: &CommandRecord) {
        match serde_json::to_vec(cmd) {
            Ok(payload) => self.buffer(StreamRecord {
                topic: TOPIC_COMMANDS,
                key: cmd.drone_id.clone(),
                payload,
            }),
            Err(err) => tracing::error!("command stream encode failed: {}", err),
        }
    }

    pub fn buffer_event(&self, event: &MissionEvent) {
        match serde_json::to_vec(event) {
            Ok(payload) => self.buffer(StreamRecord {
                topic: TOPIC_EVENTS,
                key: event.mission_id.clone(),
                payload,
            }),
            Err(err) => tracing::error!("event stream encode failed: {}", err),
        }
    }
}

async fn run_flush_loop(
    writer: Arc<dyn StreamWriter>,
    metrics: Arc<Metrics>,
    options: StreamPublisherOptions,
    mut rx: mpsc::Receiver<StreamRecord>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = interval(options.flush_interval);
    let mut buffered: Vec<StreamRecord> = Vec::new();
    // Failed batches waiting for another attempt, oldest first.
    let mut retry_queue: VecDeque<(StreamBatch, u32)> = VecDeque::new();
    let mut backoff = Backoff::new(Duration::from_millis(200), Duration::from_secs(10));

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("Stream publisher shutting down");
                break;
            }
            maybe_record = rx.recv() => {
                match maybe_record {
                    Some(record) => {
                        buffered.push(record);
                        while buffered.len() < options.max_batch_records {
                            match rx.try_recv() {
                                Ok(record) => buffered.push(record),
                                Err(_) => break,
                            }
                        }
                        if buffered.len() >= options.max_batch_records {
                            flush(&writer, &metrics, &options, &mut buffered, &mut retry_queue, &mut backoff).await;
                        }
                    }
                    None => break,
                }
            }
            _ = ticker.tick() => {
                flush(&writer, &metrics, &options, &mut buffered, &mut retry_queue, &mut backoff).await;
            }
        }
    }

    // Final flush on the way out; whatever still fails is dropped.
    while let Ok(record) = rx.try_recv() {
        buffered.push(record);
    }
    flush(&writer, &metrics, &options, &mut buffered, &mut retry_queue, &mut backoff).await;
    for (batch, _) in retry_queue {
        metrics
            .stream_dropped_records
            .fetch_add(batch.record_count as u64, std::sync::atomic::Ordering::Relaxed);
    }
}

async fn flush(
    writer: &Arc<dyn StreamWriter>,
    metrics: &Arc<Metrics>,
    options: &StreamPublisherOptions,
    buffered: &mut Vec<StreamRecord>,
    retry_queue: &mut VecDeque<(StreamBatch, u32)>,
    backoff: &mut Backoff,
) {
    // Head of the line: batches that already failed once.
    let mut work: Vec<(StreamBatch, u32)> = retry_queue.drain(..).collect();
    work.extend(
        group_batches(std::mem::take(buffered))
            .into_iter()
            .map(|batch| (batch, 0)),
    );

    let mut failed: VecDeque<(StreamBatch, u32)> = VecDeque::new();
    for (batch, attempts) in work {
        if !failed.is_empty() {
            // Preserve order behind an already-failed batch for the same key.
            if failed.iter().any(|(f, _)| f.topic == batch.topic && f.key == batch.key) {
                failed.push_back((batch, attempts));
                continue;
            }
        }
        match writer.write_batch(&batch).await {
            Ok(()) => {
                metrics.stream_published_records.fetch_add(
                    batch.record_count as u64,
                    std::sync::atomic::Ordering::Relaxed,
                );
                backoff.reset();
            }
            Err(err) => {
                let attempts = attempts + 1;
                if attempts > options.retry_budget {
                    tracing::warn!(
                        "Dropping {} stream records for topic {} after {} attempts: {}",
                        batch.record_count,
                        batch.topic,
                        attempts,
                        err
                    );
                    metrics.stream_dropped_records.fetch_add(
                        batch.record_count as u64,
                        std::sync::atomic::Ordering::Relaxed,
                    );
                } else {
                    tracing::warn!(
                        "Stream write failed for topic {} (attempt {}): {}",
                        batch.topic,
                        attempts,
                        err
                    );
                    Metrics::incr(&metrics.stream_retried_batches);
                    failed.push_back((batch, attempts));
                }
            }
        }
    }

    if !failed.is_empty() {
        tokio::time::sleep(backoff.next_delay()).await;
        *retry_queue = failed;
    }
}

/// Group records by (topic, key) preserving arrival order within a group,
/// then gzip each group.
fn group_batches(records: Vec<StreamRecord>) -> Vec<StreamBatch> {
    let mut order: Vec<(String, String)> = Vec::new();
    let mut groups: std::collections::HashMap<(String, String), Vec<Vec<u8>>> =
        std::collections::HashMap::new();
    for record in records {
        let group_key = (record.topic.to_string(), record.key);
        if !groups.contains_key(&group_key) {
            order.push(group_key.clone());
        }
        groups.entry(group_key).or_default().push(record.payload);
    }

    order
        .into_iter()
        .filter_map(|group_key| {
            let payloads = groups.remove(&group_key)?;
            let record_count = payloads.len();
            match compress_payloads(&payloads) {
                Ok(payload_gz) => Some(StreamBatch {
                    topic: group_key.0,
                    key: group_key.1,
                    payload_gz,
                    record_count,
                }),
                Err(err) => {
                    tracing::error!("batch compression failed: {}", err);
                    None
                }
            }
        })
        .collect()
}

fn compress_payloads(payloads: &[Vec<u8>]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    for (index, payload) in payloads.iter().enumerate() {
        if index > 0 {
            encoder.write_all(b"\n")?;
        }
        encoder.write_all(payload)?;
    }
    encoder.finish()
}

/// Inverse of batch compression: newline-delimited payloads.
pub fn decompress_batch(payload_gz: &[u8]) -> std::io::Result<Vec<Vec<u8>>> {
    let mut decoder = GzDecoder::new(payload_gz);
    let mut raw = Vec::new();
    decoder.read_to_end(&mut raw)?;
    Ok(raw
        .split(|b| *b == b'\n')
        .filter(|line| !line.is_empty())
        .map(|line| line.to_vec())
        .collect())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Captures batches in memory; optionally fails the first N writes.
    pub struct MemoryStreamWriter {
        pub batches: Mutex<Vec<StreamBatch>>,
        fail_remaining: AtomicU32,
    }

    impl MemoryStreamWriter {
        pub fn new() -> Self {
            Self {
                batches: Mutex::new(Vec::new()),
                fail_remaining: AtomicU32::new(0),
            }
        }

        pub fn failing(times: u32) -> Self {
            Self {
                batches: Mutex::new(Vec::new()),
                fail_remaining: AtomicU32::new(times),
            }
        }

        pub fn topic_batches(&self, topic: &str) -> Vec<StreamBatch> {
            self.batches
                .lock()
                .unwrap()
                .iter()
                .filter(|b| b.topic == topic)
                .cloned()
                .collect()
        }
    }

    #[async_trait]
    impl StreamWriter for MemoryStreamWriter {
        async fn write_batch(&self, batch: &StreamBatch) -> Result<()> {
            let remaining = self.fail_remaining.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_remaining.store(remaining - 1, Ordering::SeqCst);
                anyhow::bail!("injected write failure");
            }
            self.batches.lock().unwrap().push(batch.clone());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MemoryStreamWriter;
    use super::*;
    use std::sync::atomic::Ordering;

    fn record(topic: &'static str, key: &str, body: &str) -> StreamRecord {
        StreamRecord {
            topic,
            key: key.to_string(),
            payload: body.as_bytes().to_vec(),
        }
    }

    #[test]
    fn grouping_preserves_per_key_order() {
        let batches = group_batches(vec![
            record(TOPIC_TELEMETRY, "D1", "a"),
            record(TOPIC_TELEMETRY, "D2", "x"),
            record(TOPIC_TELEMETRY, "D1", "b"),
        ]);
        assert_eq!(batches.len(), 2);
        let d1 = batches.iter().find(|b| b.key == "D1").unwrap();
        assert_eq!(d1.record_count, 2);
        let lines = decompress_batch(&d1.payload_gz).unwrap();
        assert_eq!(lines, vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[tokio::test]
    async fn publisher_flushes_on_interval() {
        let writer = Arc::new(MemoryStreamWriter::new());
        let metrics = Arc::new(Metrics::new());
        let (shutdown_tx, _) = broadcast::channel(1);
        let options = StreamPublisherOptions {
            max_batch_records: 100,
            flush_interval: Duration::from_millis(20),
            retry_budget: 3,
        };
        let (publisher, handle) = StreamPublisher::spawn(
            writer.clone(),
            metrics.clone(),
            options,
            shutdown_tx.subscribe(),
        );

        publisher.buffer(record(TOPIC_TELEMETRY, "D1", "one"));
        publisher.buffer(record(TOPIC_TELEMETRY, "D1", "two"));
        tokio::time::sleep(Duration::from_millis(120)).await;

        let batches = writer.topic_batches(TOPIC_TELEMETRY);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].record_count, 2);
        assert_eq!(
            metrics.stream_published_records.load(Ordering::Relaxed),
            2
        );

        let _ = shutdown_tx.send(());
        let _ = handle.await;
    }

    #[tokio::test]
    async fn failed_batch_retries_then_lands() {
        let writer = Arc::new(MemoryStreamWriter::failing(1));
        let metrics = Arc::new(Metrics::new());
        let (shutdown_tx, _) = broadcast::channel(1);
        let options = StreamPublisherOptions {
            max_batch_records: 1,
            flush_interval: Duration::from_millis(20),
            retry_budget: 3,
        };
        let (publisher, handle) = StreamPublisher::spawn(
            writer.clone(),
            metrics.clone(),
            options,
            shutdown_tx.subscribe(),
        );

        publisher.buffer(record(TOPIC_EVENTS, "M1", "ev"));
        tokio::time::sleep(Duration::from_millis(600)).await;

        assert_eq!(writer.topic_batches(TOPIC_EVENTS).len(), 1);
        assert_eq!(metrics.stream_retried_batches.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.stream_dropped_records.load(Ordering::Relaxed), 0);

        let _ = shutdown_tx.send(());
        let _ = handle.await;
    }

    #[tokio::test]
    async fn batch_dropped_after_retry_budget() {
        let writer = Arc::new(MemoryStreamWriter::failing(10));
        let metrics = Arc::new(Metrics::new());
        let (shutdown_tx, _) = broadcast::channel(1);
        let options = StreamPublisherOptions {
            max_batch_records: 1,
            flush_interval: Duration::from_millis(10),
            retry_budget: 2,
        };
        let (publisher, handle) = StreamPublisher::spawn(
            writer.clone(),
            metrics.clone(),
            options,
            shutdown_tx.subscribe(),
        );

        publisher.buffer(record(TOPIC_COMMANDS, "D1", "cmd"));
        tokio::time::sleep(Duration::from_millis(900)).await;

        assert!(writer.topic_batches(TOPIC_COMMANDS).is_empty());
        assert_eq!(metrics.stream_dropped_records.load(Ordering::Relaxed), 1);

        let _ = shutdown_tx.send(());
        let _ = handle.await;
    }
}
