//! Mission lifecycle coordination: create, transition, complete.
//!
//! Writes go to the durable store first; live state and events follow only
//! when the persist succeeds, so a failed write never emits a phantom
//! event.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use skyops_core::models::{
    CommandAction, Drone, DroneOpStatus, FlightPattern, Mission, MissionEvent, MissionEventType,
    MissionParameters, MissionStatus,
};
use skyops_core::plan::generate_plan;
use skyops_core::state_machine::apply_action;

use crate::error::ControlError;
use crate::live::{drone_status_channel, LiveStateStore, MissionStateFields};
use crate::persistence::{drones as drones_db, missions as missions_db, Database};
use crate::stream::StreamPublisher;
use std::sync::Arc;

/// Operator input for mission creation.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateMissionInput {
    /// Backfilled from the caller's token claims when empty.
    #[serde(default)]
    pub org_id: String,
    pub site_id: String,
    pub drone_id: String,
    pub name: String,
    pub survey_area: Vec<[f64; 2]>,
    pub flight_pattern: FlightPattern,
    #[serde(default)]
    pub parameters: Option<MissionParameters>,
    #[serde(default)]
    pub scheduled_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_by: String,
}

pub struct MissionCoordinator {
    db: Database,
    live: Arc<LiveStateStore>,
    publisher: StreamPublisher,
}

impl MissionCoordinator {
    pub fn new(db: Database, live: Arc<LiveStateStore>, publisher: StreamPublisher) -> Self {
        Self {
            db,
            live,
            publisher,
        }
    }

    /// Create a mission for an AVAILABLE drone: generate the flight plan,
    /// persist PLANNED, seed live state, emit `MissionCreated`.
    pub async fn create(&self, input: CreateMissionInput) -> Result<Mission, ControlError> {
        if input.survey_area.len() < 3 {
            return Err(ControlError::Validation(
                "survey_area needs at least 3 vertices".into(),
            ));
        }

        let drone = drones_db::load_drone(self.db.pool(), &input.drone_id)
            .await?
            .ok_or_else(|| ControlError::NotFound(format!("drone {}", input.drone_id)))?;
        if drone.status != DroneOpStatus::Available {
            return Err(ControlError::Conflict(format!(
                "drone {} is {}, not AVAILABLE",
                drone.id,
                drone.status.as_str()
            )));
        }
        if let Some(active) =
            missions_db::load_active_mission_for_drone(self.db.pool(), &input.drone_id).await?
        {
            return Err(ControlError::Conflict(format!(
                "drone {} already assigned to mission {}",
                input.drone_id, active.id
            )));
        }

        let parameters = input.parameters.unwrap_or_default();
        let plan = generate_plan(&input.survey_area, input.flight_pattern, &parameters);

        let mission = Mission {
            id: Uuid::new_v4().to_string(),
            org_id: input.org_id,
            site_id: input.site_id,
            drone_id: input.drone_id,
            name: input.name,
            survey_area: input.survey_area,
            flight_pattern: input.flight_pattern,
            parameters,
            waypoints: plan.waypoints,
            estimated_duration_s: plan.estimated_duration_s,
            estimated_distance_m: plan.estimated_distance_m,
            scheduled_start: input.scheduled_start,
            actual_start: None,
            actual_end: None,
            status: MissionStatus::Planned,
            created_by: input.created_by,
            created_at: Utc::now(),
        };

        missions_db::upsert_mission(self.db.pool(), &mission).await?;

        self.live.set_mission_state(
            &mission.id,
            MissionStateFields {
                status: Some(mission.status.as_str().to_string()),
                progress: Some(0.0),
                battery: Some(drone.battery_pct),
                last_update: Some(Utc::now()),
            },
        );

        self.emit(
            &mission,
            MissionEventType::MissionCreated,
            serde_json::json!({
                "waypoints": mission.waypoints.len(),
                "estimatedDurationS": mission.estimated_duration_s,
            }),
        );

        tracing::info!("Created mission {} for drone {}", mission.id, mission.drone_id);
        Ok(mission)
    }

    /// Apply an acknowledged command to the mission record and the drone.
    pub async fn apply_transition(
        &self,
        mission_id: &str,
        action: CommandAction,
    ) -> Result<Mission, ControlError> {
        let mut mission = missions_db::load_mission(self.db.pool(), mission_id)
            .await?
            .ok_or_else(|| ControlError::NotFound(format!("mission {}", mission_id)))?;

        let next = apply_action(mission.status, action)?;
        let now = Utc::now();

        if mission.status == MissionStatus::Planned && next == MissionStatus::InProgress {
            mission.actual_start = Some(now);
        }
        if next.is_terminal() {
            mission.actual_end = Some(now);
        }
        mission.status = next;

        missions_db::upsert_mission(self.db.pool(), &mission).await?;
        self.sync_drone_status(&mission).await?;
        self.update_live_status(&mission);

        let event_type = match action {
            CommandAction::Start => MissionEventType::MissionStarted,
            CommandAction::Pause => MissionEventType::MissionPaused,
            CommandAction::Resume => MissionEventType::MissionResumed,
            CommandAction::Abort | CommandAction::Rth => MissionEventType::MissionAborted,
        };
        self.emit(
            &mission,
            event_type,
            serde_json::json!({ "action": action.as_str(), "status": mission.status.as_str() }),
        );

        Ok(mission)
    }

    /// Idempotent completion: a mission already in a terminal state is left
    /// untouched and no event is re-emitted.
    pub async fn complete(&self, mission_id: &str) -> Result<(), ControlError> {
        let mut mission = missions_db::load_mission(self.db.pool(), mission_id)
            .await?
            .ok_or_else(|| ControlError::NotFound(format!("mission {}", mission_id)))?;

        if mission.status.is_terminal() {
            return Ok(());
        }

        mission.status = MissionStatus::Completed;
        mission.actual_end = Some(Utc::now());

        missions_db::upsert_mission(self.db.pool(), &mission).await?;
        self.sync_drone_status(&mission).await?;
        self.update_live_status(&mission);

        self.emit(
            &mission,
            MissionEventType::MissionCompleted,
            serde_json::json!({ "status": mission.status.as_str() }),
        );

        tracing::info!("Mission {} completed", mission.id);
        Ok(())
    }

    /// Keep the drone record in step with the mission: IN_MISSION while it
    /// runs, back to AVAILABLE on any terminal state.
    async fn sync_drone_status(&self, mission: &Mission) -> Result<(), ControlError> {
        let target = if mission.status.is_terminal() {
            DroneOpStatus::Available
        } else if mission.status == MissionStatus::InProgress
            || mission.status == MissionStatus::Paused
        {
            DroneOpStatus::InMission
        } else {
            return Ok(());
        };

        if let Some(drone) = drones_db::load_drone(self.db.pool(), &mission.drone_id).await? {
            if drone.status != target {
                drones_db::update_drone_status(self.db.pool(), &drone.id, target).await?;
                self.publish_drone_status(&drone, target);
            }
        }
        Ok(())
    }

    fn update_live_status(&self, mission: &Mission) {
        self.live.set_mission_state(
            &mission.id,
            MissionStateFields {
                status: Some(mission.status.as_str().to_string()),
                last_update: Some(Utc::now()),
                ..Default::default()
            },
        );
    }

    fn publish_drone_status(&self, drone: &Drone, status: DroneOpStatus) {
        let payload = serde_json::json!({
            "droneId": drone.id,
            "status": status.as_str(),
        });
        self.live
            .publish(&drone_status_channel(&drone.id), payload.to_string());
    }

    fn emit(&self, mission: &Mission, event_type: MissionEventType, payload: serde_json::Value) {
        let event = MissionEvent::new(&mission.id, &mission.drone_id, event_type, payload);
        self.publisher.buffer_event(&event);
    }
}
