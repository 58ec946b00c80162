//! Command dispatch: validate, publish, await ack, apply transition.
//!
//! The ack wait is notification-based: a per-command oneshot waiter is
//! registered before the publish and resolved by the transport's ack sink.
//! The drone stays authoritative: a timeout or rejection leaves the
//! mission untouched.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{broadcast, oneshot};
use uuid::Uuid;

use skyops_core::models::{AckRecord, AckStatus, CommandAction, CommandRecord, Mission};
use skyops_core::state_machine::apply_action;

use crate::coordinator::MissionCoordinator;
use crate::error::ControlError;
use crate::live::LiveStateStore;
use crate::metrics::Metrics;
use crate::persistence::{missions as missions_db, Database};
use crate::stream::StreamPublisher;
use crate::transport::CommandTransport;

pub struct CommandDispatcher {
    db: Database,
    live: Arc<LiveStateStore>,
    transport: Arc<dyn CommandTransport>,
    publisher: StreamPublisher,
    coordinator: Arc<MissionCoordinator>,
    metrics: Arc<Metrics>,
    waiters: DashMap<String, oneshot::Sender<AckRecord>>,
    ack_timeout: Duration,
    cancel_tx: broadcast::Sender<()>,
}

impl CommandDispatcher {
    pub fn new(
        db: Database,
        live: Arc<LiveStateStore>,
        transport: Arc<dyn CommandTransport>,
        publisher: StreamPublisher,
        coordinator: Arc<MissionCoordinator>,
        metrics: Arc<Metrics>,
        ack_timeout: Duration,
    ) -> Self {
        let (cancel_tx, _) = broadcast::channel(1);
        Self {
            db,
            live,
            transport,
            publisher,
            coordinator,
            metrics,
            waiters: DashMap::new(),
            ack_timeout,
            cancel_tx,
        }
    }

    /// Dispatch `action` to the mission's drone and wait for the ack.
    pub async fn send(
        &self,
        mission_id: &str,
        action: CommandAction,
        issued_by: &str,
    ) -> Result<Mission, ControlError> {
        let mission = missions_db::load_mission(self.db.pool(), mission_id)
            .await?
            .ok_or_else(|| ControlError::NotFound(format!("mission {}", mission_id)))?;

        // Reject illegal transitions before anything touches the broker.
        apply_action(mission.status, action)?;

        let command = CommandRecord {
            command_id: Uuid::new_v4().to_string(),
            mission_id: mission.id.clone(),
            drone_id: mission.drone_id.clone(),
            action,
            issued_at: Utc::now(),
            issued_by: issued_by.to_string(),
        };

        if !self.live.try_begin_dispatch(mission_id, &command.command_id) {
            return Err(ControlError::AlreadyDispatching(mission_id.to_string()));
        }
        // Cleans up the waiter, pending window, and dispatch slot on every
        // exit path, including the caller's future being dropped mid-wait.
        let _guard = WaitGuard {
            dispatcher: self,
            command_id: command.command_id.clone(),
            mission_id: command.mission_id.clone(),
        };

        let payload = serde_json::to_vec(&command)
            .map_err(|err| ControlError::Internal(format!("command encode: {}", err)))?;

        self.live.set_pending(command.clone());
        let (ack_tx, ack_rx) = oneshot::channel();
        self.waiters.insert(command.command_id.clone(), ack_tx);

        self.transport
            .send_command(&command.drone_id, payload)
            .await?;

        // Audit copy to the commands topic; never blocks the ack wait.
        self.publisher.buffer_command(&command);
        Metrics::incr(&self.metrics.commands_dispatched);
        tracing::info!(
            "Dispatched {} {} to drone {} (command {})",
            action.as_str(),
            mission_id,
            command.drone_id,
            command.command_id
        );

        let mut cancel_rx = self.cancel_tx.subscribe();
        let ack = tokio::select! {
            result = ack_rx => match result {
                Ok(ack) => ack,
                // Waiter dropped without a send; treat as cancellation.
                Err(_) => return Err(ControlError::Cancelled),
            },
            _ = tokio::time::sleep(self.ack_timeout) => {
                self.metrics.record_command_timeout(action.as_str());
                tracing::warn!(
                    "Command {} ({}) timed out after {:?}",
                    command.command_id,
                    action.as_str(),
                    self.ack_timeout
                );
                return Err(ControlError::Timeout { action: action.as_str() });
            }
            _ = cancel_rx.recv() => {
                return Err(ControlError::Cancelled);
            }
        };

        match ack.status {
            AckStatus::Accepted => self.coordinator.apply_transition(mission_id, action).await,
            AckStatus::Rejected | AckStatus::Failed => {
                Metrics::incr(&self.metrics.commands_rejected);
                Err(ControlError::Rejected {
                    reason: ack
                        .reason
                        .unwrap_or_else(|| format!("drone answered {:?}", ack.status)),
                })
            }
        }
    }

    /// Ack sink for the transport. Late acks (no waiter left) are stored
    /// for audit but have no effect on mission state.
    pub fn handle_ack(&self, ack: AckRecord) {
        self.live.set_ack(ack.clone());
        if let Some((_, waiter)) = self.waiters.remove(&ack.command_id) {
            let _ = waiter.send(ack);
        } else {
            tracing::debug!("Ack for {} arrived with no waiter", ack.command_id);
        }
    }

    /// Abort all in-progress ack waits (graceful shutdown).
    pub fn cancel_all(&self) {
        let _ = self.cancel_tx.send(());
    }
}

struct WaitGuard<'a> {
    dispatcher: &'a CommandDispatcher,
    command_id: String,
    mission_id: String,
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.dispatcher.waiters.remove(&self.command_id);
        self.dispatcher.live.remove_pending(&self.command_id);
        self.dispatcher.live.end_dispatch(&self.mission_id);
    }
}
