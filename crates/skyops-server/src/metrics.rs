//! In-process counters and the ingest latency histogram.
//!
//! Kept allocation-free on the hot path; a JSON snapshot is exposed over
//! the REST surface and asserted on by tests.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;

/// Upper bounds (ms) of the latency histogram buckets; the last bucket is
/// open-ended.
const LATENCY_BUCKETS_MS: [u64; 8] = [5, 10, 25, 50, 100, 250, 500, 1000];

#[derive(Default)]
pub struct LatencyHistogram {
    buckets: [AtomicU64; LATENCY_BUCKETS_MS.len() + 1],
    sum_ms: AtomicU64,
    count: AtomicU64,
}

impl LatencyHistogram {
    pub fn record(&self, latency_ms: u64) {
        let idx = LATENCY_BUCKETS_MS
            .iter()
            .position(|bound| latency_ms <= *bound)
            .unwrap_or(LATENCY_BUCKETS_MS.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> LatencySnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let sum_ms = self.sum_ms.load(Ordering::Relaxed);
        LatencySnapshot {
            count,
            mean_ms: if count == 0 {
                0.0
            } else {
                sum_ms as f64 / count as f64
            },
            buckets: self
                .buckets
                .iter()
                .map(|b| b.load(Ordering::Relaxed))
                .collect(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct LatencySnapshot {
    pub count: u64,
    pub mean_ms: f64,
    pub buckets: Vec<u64>,
}

/// Process-wide metrics registry, injected rather than global.
#[derive(Default)]
pub struct Metrics {
    pub telemetry_accepted: AtomicU64,
    pub telemetry_out_of_order: AtomicU64,
    pub telemetry_stale: AtomicU64,
    pub telemetry_queue_dropped: AtomicU64,
    pub transport_decode_errors: AtomicU64,
    pub transport_reconnects: AtomicU64,
    pub stream_published_records: AtomicU64,
    pub stream_retried_batches: AtomicU64,
    pub stream_dropped_records: AtomicU64,
    pub consumer_records: AtomicU64,
    pub consumer_lag_ms: AtomicU64,
    pub commands_dispatched: AtomicU64,
    pub commands_rejected: AtomicU64,
    pub ws_sessions: AtomicU64,
    pub ws_messages_sent: AtomicU64,
    pub ingest_latency: LatencyHistogram,
    /// Command timeouts labeled by action.
    command_timeouts: DashMap<&'static str, u64>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_command_timeout(&self, action: &'static str) {
        *self.command_timeouts.entry(action).or_insert(0) += 1;
    }

    pub fn command_timeouts(&self, action: &str) -> u64 {
        self.command_timeouts
            .get(action)
            .map(|entry| *entry.value())
            .unwrap_or(0)
    }

    pub fn set_consumer_lag_ms(&self, lag_ms: u64) {
        self.consumer_lag_ms.store(lag_ms, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            telemetry_accepted: self.telemetry_accepted.load(Ordering::Relaxed),
            telemetry_out_of_order: self.telemetry_out_of_order.load(Ordering::Relaxed),
            telemetry_stale: self.telemetry_stale.load(Ordering::Relaxed),
            telemetry_queue_dropped: self.telemetry_queue_dropped.load(Ordering::Relaxed),
            transport_decode_errors: self.transport_decode_errors.load(Ordering::Relaxed),
            transport_reconnects: self.transport_reconnects.load(Ordering::Relaxed),
            stream_published_records: self.stream_published_records.load(Ordering::Relaxed),
            stream_retried_batches: self.stream_retried_batches.load(Ordering::Relaxed),
            stream_dropped_records: self.stream_dropped_records.load(Ordering::Relaxed),
            consumer_records: self.consumer_records.load(Ordering::Relaxed),
            consumer_lag_ms: self.consumer_lag_ms.load(Ordering::Relaxed),
            commands_dispatched: self.commands_dispatched.load(Ordering::Relaxed),
            commands_rejected: self.commands_rejected.load(Ordering::Relaxed),
            command_timeouts: self
                .command_timeouts
                .iter()
                .map(|entry| (entry.key().to_string(), *entry.value()))
                .collect(),
            ws_sessions: self.ws_sessions.load(Ordering::Relaxed),
            ws_messages_sent: self.ws_messages_sent.load(Ordering::Relaxed),
            ingest_latency: self.ingest_latency.snapshot(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub telemetry_accepted: u64,
    pub telemetry_out_of_order: u64,
    pub telemetry_stale: u64,
    pub telemetry_queue_dropped: u64,
    pub transport_decode_errors: u64,
    pub transport_reconnects: u64,
    pub stream_published_records: u64,
    pub stream_retried_batches: u64,
    pub stream_dropped_records: u64,
    pub consumer_records: u64,
    pub consumer_lag_ms: u64,
    pub commands_dispatched: u64,
    pub commands_rejected: u64,
    pub command_timeouts: std::collections::HashMap<String, u64>,
    pub ws_sessions: u64,
    pub ws_messages_sent: u64,
    pub ingest_latency: LatencySnapshot,
}
