//! Telemetry processing: stale/out-of-order filtering, live-state pipeline,
//! fan-out, stream buffering, and critical-condition checks.
//!
//! Work is partitioned over a worker pool by `drone_id` hash, so samples
//! for one drone process serially in arrival order while the fleet runs in
//! parallel.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use skyops_core::models::{MissionEvent, MissionEventType, TelemetryRecord};

use crate::live::{mission_telemetry_channel, LiveStateStore, MissionStateFields, CHANNEL_SYSTEM_ALERTS};
use crate::metrics::Metrics;
use crate::stream::StreamPublisher;

const WORKER_QUEUE_DEPTH: usize = 1_024;

const BATTERY_WARN_PCT: f64 = 15.0;
const BATTERY_CRITICAL_PCT: f64 = 5.0;
const SIGNAL_WARN: f64 = 20.0;

/// Per-record processing, shared by every worker.
pub struct ProcessorCore {
    live: Arc<LiveStateStore>,
    publisher: StreamPublisher,
    metrics: Arc<Metrics>,
    stale_threshold: chrono::Duration,
    /// Monotonicity filter: newest accepted `sent_at` per drone.
    last_sent: DashMap<String, chrono::DateTime<chrono::Utc>>,
}

impl ProcessorCore {
    pub fn new(
        live: Arc<LiveStateStore>,
        publisher: StreamPublisher,
        metrics: Arc<Metrics>,
        stale_threshold: Duration,
    ) -> Self {
        Self {
            live,
            publisher,
            metrics,
            stale_threshold: chrono::Duration::from_std(stale_threshold)
                .unwrap_or_else(|_| chrono::Duration::seconds(60)),
            last_sent: DashMap::new(),
        }
    }

    /// Process one sample. Rejections count and return without side
    /// effects; live-state write failures cannot occur in-process, but the
    /// same record never produces more than one write per key.
    pub fn process(&self, rec: TelemetryRecord) {
        let received_at = Utc::now();

        let age = received_at - rec.sent_at;
        if age > self.stale_threshold {
            Metrics::incr(&self.metrics.telemetry_stale);
            tracing::debug!(
                "Dropping stale sample from {} ({}s old)",
                rec.drone_id,
                age.num_seconds()
            );
            return;
        }

        let mut out_of_order = false;
        self.last_sent
            .entry(rec.drone_id.clone())
            .and_modify(|last| {
                if rec.sent_at <= *last {
                    out_of_order = true;
                } else {
                    *last = rec.sent_at;
                }
            })
            .or_insert(rec.sent_at);
        if out_of_order {
            Metrics::incr(&self.metrics.telemetry_out_of_order);
            return;
        }

        let latency_ms = age.num_milliseconds().max(0) as u64;
        self.metrics.ingest_latency.record(latency_ms);
        Metrics::incr(&self.metrics.telemetry_accepted);

        // Live-state pipeline. Multi-key, intentionally non-atomic; both
        // views re-converge within one telemetry period.
        if let Some(mission_id) = rec.mission_id.as_deref() {
            self.live.set_latest_telemetry(mission_id, rec.clone());
            self.live.set_mission_state(
                mission_id,
                MissionStateFields {
                    status: Some(rec.drone_status.clone()),
                    progress: Some(rec.progress_pct),
                    battery: Some(rec.battery_pct),
                    last_update: Some(rec.sent_at),
                },
            );
        }
        self.live
            .update_drone_location(&rec.drone_id, rec.position, rec.velocity);

        if let Some(mission_id) = rec.mission_id.as_deref() {
            match serde_json::to_string(&rec) {
                Ok(payload) => {
                    self.live
                        .publish(&mission_telemetry_channel(mission_id), payload);
                }
                Err(err) => tracing::error!("telemetry broadcast encode failed: {}", err),
            }
        }

        self.publisher.buffer_telemetry(&rec);
        self.check_critical_conditions(&rec);
    }

    fn check_critical_conditions(&self, rec: &TelemetryRecord) {
        if rec.battery_pct < BATTERY_CRITICAL_PCT {
            // Hint only: issuing RTH stays with the coordinator's callers.
            self.emit_warning(
                rec,
                MissionEventType::BatteryCritical,
                serde_json::json!({
                    "batteryPct": rec.battery_pct,
                    "rthHint": true,
                }),
            );
        } else if rec.battery_pct < BATTERY_WARN_PCT {
            self.emit_warning(
                rec,
                MissionEventType::BatteryLow,
                serde_json::json!({ "batteryPct": rec.battery_pct }),
            );
        }

        if rec.signal < SIGNAL_WARN {
            self.emit_warning(
                rec,
                MissionEventType::SignalWeak,
                serde_json::json!({ "signal": rec.signal }),
            );
        }
    }

    /// Every qualifying sample emits; downstream consumers deduplicate or
    /// aggregate as they see fit.
    fn emit_warning(
        &self,
        rec: &TelemetryRecord,
        event_type: MissionEventType,
        payload: serde_json::Value,
    ) {
        let mission_id = rec.mission_id.clone().unwrap_or_default();
        let event = MissionEvent::new(&mission_id, &rec.drone_id, event_type, payload);
        match serde_json::to_string(&event) {
            Ok(serialized) => {
                self.live.publish(CHANNEL_SYSTEM_ALERTS, serialized);
            }
            Err(err) => tracing::error!("alert encode failed: {}", err),
        }
        self.publisher.buffer_event(&event);
        tracing::warn!(
            "{} for drone {} (mission {:?})",
            event_type.as_str(),
            rec.drone_id,
            rec.mission_id
        );
    }
}

/// Routes inbound samples to the worker owning the drone's partition.
#[derive(Clone)]
pub struct TelemetryRouter {
    senders: Vec<mpsc::Sender<TelemetryRecord>>,
    overflow: Vec<Arc<DashMap<String, TelemetryRecord>>>,
    metrics: Arc<Metrics>,
}

impl TelemetryRouter {
    pub fn dispatch(&self, rec: TelemetryRecord) {
        let index = self.index_for(&rec.drone_id);
        match self.senders[index].try_send(rec) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(rec))
            | Err(mpsc::error::TrySendError::Closed(rec)) => {
                // Queue is saturated: keep only the freshest sample per
                // drone and count the displaced ones.
                if self.overflow[index]
                    .insert(rec.drone_id.clone(), rec)
                    .is_some()
                {
                    Metrics::incr(&self.metrics.telemetry_queue_dropped);
                }
            }
        }
    }

    pub(crate) fn index_for(&self, drone_id: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        drone_id.hash(&mut hasher);
        (hasher.finish() as usize) % self.senders.len()
    }
}

/// Spawn the worker pool; returns the router and worker handles (awaited
/// during drain at shutdown).
pub fn spawn_workers(
    core: Arc<ProcessorCore>,
    worker_count: usize,
    metrics: Arc<Metrics>,
    shutdown: &broadcast::Sender<()>,
) -> (TelemetryRouter, Vec<JoinHandle<()>>) {
    let worker_count = worker_count.max(1);
    let mut senders = Vec::with_capacity(worker_count);
    let mut overflow = Vec::with_capacity(worker_count);
    let mut handles = Vec::with_capacity(worker_count);

    for worker_index in 0..worker_count {
        let (tx, mut rx) = mpsc::channel::<TelemetryRecord>(WORKER_QUEUE_DEPTH);
        let stash: Arc<DashMap<String, TelemetryRecord>> = Arc::new(DashMap::new());
        senders.push(tx);
        overflow.push(stash.clone());

        let core = core.clone();
        let mut shutdown_rx = shutdown.subscribe();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        // Drain in-flight samples before exiting.
                        while let Ok(rec) = rx.try_recv() {
                            core.process(rec);
                        }
                        drain_stash(&core, &stash);
                        tracing::debug!("Telemetry worker {} drained and stopped", worker_index);
                        break;
                    }
                    maybe_rec = rx.recv() => {
                        match maybe_rec {
                            Some(rec) => {
                                core.process(rec);
                                if rx.is_empty() {
                                    drain_stash(&core, &stash);
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
        }));
    }

    (
        TelemetryRouter {
            senders,
            overflow,
            metrics,
        },
        handles,
    )
}

fn drain_stash(core: &ProcessorCore, stash: &DashMap<String, TelemetryRecord>) {
    if stash.is_empty() {
        return;
    }
    let drone_ids: Vec<String> = stash.iter().map(|entry| entry.key().clone()).collect();
    for drone_id in drone_ids {
        if let Some((_, rec)) = stash.remove(&drone_id) {
            core.process(rec);
        }
    }
}
