//! Realtime analytics loop.
//!
//! Feeds the engine from the live telemetry channel and recomputes derived
//! metrics on a fixed 5-second tick, independent of ingress rate.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::interval;

use skyops_core::models::TelemetryRecord;

use crate::state::AppState;

const TICK_SECS: u64 = 5;

pub async fn run_analytics_loop(state: Arc<AppState>, mut shutdown: broadcast::Receiver<()>) {
    let engine = state.analytics().clone();
    let mut telemetry_rx = state.live().subscribe("mission:*:telemetry");
    let mut ticker = interval(Duration::from_secs(TICK_SECS));
    state.mark_loop_heartbeat("analytics");

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("Analytics loop shutting down");
                break;
            }
            result = telemetry_rx.recv() => {
                match result {
                    Ok(msg) => {
                        match serde_json::from_str::<TelemetryRecord>(&msg.payload) {
                            Ok(rec) => engine.ingest(rec),
                            Err(err) => tracing::debug!("Analytics ingest decode failed: {}", err),
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Analytics ingest lagged by {} messages", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = ticker.tick() => {
                state.mark_loop_heartbeat("analytics");
                if let Err(err) = engine.tick().await {
                    // Next tick proceeds regardless.
                    tracing::warn!("Analytics tick failed: {}", err);
                }
            }
        }
    }
}
