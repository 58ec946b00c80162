//! Application state: long-lived handles owned by the runtime and
//! injected into components. No module-level singletons.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use skyops_core::models::{AckRecord, TelemetryRecord};

use crate::analytics::AnalyticsEngine;
use crate::api::ws::WsHub;
use crate::config::Config;
use crate::coordinator::MissionCoordinator;
use crate::dispatch::CommandDispatcher;
use crate::live::LiveStateStore;
use crate::metrics::Metrics;
use crate::persistence::Database;
use crate::processor::{spawn_workers, ProcessorCore, TelemetryRouter};
use crate::stream::{StreamPublisher, StreamPublisherOptions, StreamWriter};
use crate::transport::{CommandTransport, IngestSink};

pub struct AppState {
    config: Config,
    db: Database,
    live: Arc<LiveStateStore>,
    metrics: Arc<Metrics>,
    publisher: StreamPublisher,
    coordinator: Arc<MissionCoordinator>,
    dispatcher: Arc<CommandDispatcher>,
    analytics: Arc<AnalyticsEngine>,
    ws_hub: Arc<WsHub>,
    router: TelemetryRouter,
    /// Loop name -> last tick (epoch seconds), for /ready.
    loop_heartbeats: DashMap<&'static str, u64>,
}

/// Background tasks whose drain is awaited during shutdown.
pub struct BackgroundTasks {
    pub telemetry_workers: Vec<JoinHandle<()>>,
    pub stream_flusher: JoinHandle<()>,
}

impl AppState {
    /// Wire every component around the injected transport and stream
    /// writer seams.
    pub fn build(
        config: Config,
        db: Database,
        transport: Arc<dyn CommandTransport>,
        writer: Arc<dyn StreamWriter>,
        shutdown: &broadcast::Sender<()>,
    ) -> (Arc<Self>, BackgroundTasks) {
        let live = Arc::new(LiveStateStore::new());
        let metrics = Arc::new(Metrics::new());

        let (publisher, stream_flusher) = StreamPublisher::spawn(
            writer,
            metrics.clone(),
            StreamPublisherOptions::default(),
            shutdown.subscribe(),
        );

        let coordinator = Arc::new(MissionCoordinator::new(
            db.clone(),
            live.clone(),
            publisher.clone(),
        ));
        let dispatcher = Arc::new(CommandDispatcher::new(
            db.clone(),
            live.clone(),
            transport,
            publisher.clone(),
            coordinator.clone(),
            metrics.clone(),
            config.command_timeout,
        ));
        let analytics = Arc::new(AnalyticsEngine::new(db.clone(), live.clone()));
        let ws_hub = Arc::new(WsHub::new(live.clone(), metrics.clone()));

        let processor = Arc::new(ProcessorCore::new(
            live.clone(),
            publisher.clone(),
            metrics.clone(),
            config.stale_threshold,
        ));
        let (router, telemetry_workers) = spawn_workers(
            processor,
            config.worker_count(),
            metrics.clone(),
            shutdown,
        );

        let state = Arc::new(Self {
            config,
            db,
            live,
            metrics,
            publisher,
            coordinator,
            dispatcher,
            analytics,
            ws_hub,
            router,
            loop_heartbeats: DashMap::new(),
        });

        (
            state,
            BackgroundTasks {
                telemetry_workers,
                stream_flusher,
            },
        )
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn live(&self) -> &Arc<LiveStateStore> {
        &self.live
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn publisher(&self) -> &StreamPublisher {
        &self.publisher
    }

    pub fn coordinator(&self) -> &Arc<MissionCoordinator> {
        &self.coordinator
    }

    pub fn dispatcher(&self) -> &Arc<CommandDispatcher> {
        &self.dispatcher
    }

    pub fn analytics(&self) -> &Arc<AnalyticsEngine> {
        &self.analytics
    }

    pub fn ws_hub(&self) -> Arc<WsHub> {
        self.ws_hub.clone()
    }

    pub fn mark_loop_heartbeat(&self, name: &'static str) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.loop_heartbeats.insert(name, now);
    }

    pub fn loop_last_tick_secs(&self, name: &str) -> Option<u64> {
        self.loop_heartbeats.get(name).map(|entry| *entry.value())
    }
}

/// Transport sink: telemetry to the partitioned worker pool, acks to the
/// dispatcher's waiters.
impl IngestSink for AppState {
    fn on_telemetry(&self, rec: TelemetryRecord) {
        self.router.dispatch(rec);
    }

    fn on_ack(&self, ack: AckRecord) {
        self.dispatcher.handle_ack(ack);
    }
}
