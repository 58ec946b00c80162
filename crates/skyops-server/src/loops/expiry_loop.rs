//! Live-state expiry loop: sweeps TTL'd keys (latest telemetry, drone
//! locations, pending commands, acks, dispatch guards).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::interval;

use crate::state::AppState;

const SWEEP_SECS: u64 = 5;

pub async fn run_expiry_loop(state: Arc<AppState>, mut shutdown: broadcast::Receiver<()>) {
    let mut ticker = interval(Duration::from_secs(SWEEP_SECS));
    state.mark_loop_heartbeat("expiry");

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("Expiry loop shutting down");
                break;
            }
            _ = ticker.tick() => {
                state.mark_loop_heartbeat("expiry");
                let removed = state.live().sweep_expired();
                if removed > 0 {
                    tracing::debug!("Swept {} expired live-state entries", removed);
                }
            }
        }
    }
}
