//! Core data models for the mission control plane.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A 3-D position sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub lat: f64,
    pub lon: f64,
    pub alt_m: f64,
}

/// Horizontal velocity of a drone.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Velocity {
    pub speed_mps: f64,
    /// Heading in degrees, 0-360.
    pub heading_deg: f64,
}

/// A ground point without altitude (home locations, survey vertices).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

/// One telemetry sample from one drone at one instant.
///
/// Records are immutable once accepted; the processor drops out-of-order
/// samples per drone instead of reordering them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub drone_id: String,
    /// Empty on the wire when the drone is idle.
    pub mission_id: Option<String>,
    /// Drone-local timestamp.
    pub sent_at: DateTime<Utc>,
    pub position: Position,
    pub velocity: Velocity,
    pub battery_pct: f64,
    pub drone_status: String,
    pub progress_pct: f64,
    /// Transport-defined signal figure (link quality or dBm).
    pub signal: f64,
}

/// Errors produced while decoding wire payloads.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("latitude {0} out of range")]
    Latitude(f64),
    #[error("longitude {0} out of range")]
    Longitude(f64),
}

/// Wire form of a telemetry sample (`drones/{id}/telemetry`).
///
/// The drone id comes from the topic, not the payload.
#[derive(Debug, Serialize, Deserialize)]
pub struct TelemetryWire {
    #[serde(default)]
    pub mission_id: String,
    pub timestamp: DateTime<Utc>,
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
    #[serde(default)]
    pub speed: f64,
    #[serde(default)]
    pub heading: f64,
    pub battery: f64,
    pub status: String,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub signal: f64,
}

impl TelemetryRecord {
    /// Decode a wire payload for the given drone, validating coordinate
    /// ranges and clamping percentages to [0, 100].
    pub fn from_wire(drone_id: &str, payload: &[u8]) -> Result<Self, WireError> {
        let wire: TelemetryWire = serde_json::from_slice(payload)?;
        if !(-90.0..=90.0).contains(&wire.lat) {
            return Err(WireError::Latitude(wire.lat));
        }
        if !(-180.0..=180.0).contains(&wire.lon) {
            return Err(WireError::Longitude(wire.lon));
        }
        let mission_id = if wire.mission_id.is_empty() {
            None
        } else {
            Some(wire.mission_id)
        };
        Ok(Self {
            drone_id: drone_id.to_string(),
            mission_id,
            sent_at: wire.timestamp,
            position: Position {
                lat: wire.lat,
                lon: wire.lon,
                alt_m: wire.alt,
            },
            velocity: Velocity {
                speed_mps: wire.speed,
                heading_deg: wire.heading,
            },
            battery_pct: wire.battery.clamp(0.0, 100.0),
            drone_status: wire.status,
            progress_pct: wire.progress.clamp(0.0, 100.0),
            signal: wire.signal,
        })
    }

    /// Encode back to the wire form (used by the stream topics and the
    /// drone simulator).
    pub fn to_wire(&self) -> TelemetryWire {
        TelemetryWire {
            mission_id: self.mission_id.clone().unwrap_or_default(),
            timestamp: self.sent_at,
            lat: self.position.lat,
            lon: self.position.lon,
            alt: self.position.alt_m,
            speed: self.velocity.speed_mps,
            heading: self.velocity.heading_deg,
            battery: self.battery_pct,
            status: self.drone_status.clone(),
            progress: self.progress_pct,
            signal: self.signal,
        }
    }
}

/// Operator-issued action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandAction {
    Start,
    Pause,
    Resume,
    Abort,
    /// Return to home: ends the mission and flies the drone home.
    Rth,
}

impl CommandAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandAction::Start => "START",
            CommandAction::Pause => "PAUSE",
            CommandAction::Resume => "RESUME",
            CommandAction::Abort => "ABORT",
            CommandAction::Rth => "RTH",
        }
    }
}

/// Command published to `drones/{id}/commands`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRecord {
    pub command_id: String,
    pub mission_id: String,
    pub drone_id: String,
    pub action: CommandAction,
    #[serde(rename = "timestamp")]
    pub issued_at: DateTime<Utc>,
    pub issued_by: String,
}

/// Drone-side response to a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AckStatus {
    Accepted,
    Rejected,
    Failed,
}

/// Wire form of an ack (`drones/{id}/ack`): `{cmd_id, status}`.
#[derive(Debug, Serialize, Deserialize)]
pub struct AckWire {
    pub cmd_id: String,
    pub status: AckStatus,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckRecord {
    pub command_id: String,
    pub drone_id: String,
    pub status: AckStatus,
    #[serde(default)]
    pub reason: Option<String>,
    pub acked_at: DateTime<Utc>,
}

impl AckRecord {
    pub fn from_wire(drone_id: &str, payload: &[u8]) -> Result<Self, WireError> {
        let wire: AckWire = serde_json::from_slice(payload)?;
        Ok(Self {
            command_id: wire.cmd_id,
            drone_id: drone_id.to_string(),
            status: wire.status,
            reason: wire.reason,
            acked_at: Utc::now(),
        })
    }
}

/// Mission lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MissionStatus {
    Planned,
    InProgress,
    Paused,
    Completed,
    Aborted,
    Failed,
}

impl MissionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MissionStatus::Completed | MissionStatus::Aborted | MissionStatus::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MissionStatus::Planned => "PLANNED",
            MissionStatus::InProgress => "IN_PROGRESS",
            MissionStatus::Paused => "PAUSED",
            MissionStatus::Completed => "COMPLETED",
            MissionStatus::Aborted => "ABORTED",
            MissionStatus::Failed => "FAILED",
        }
    }
}

impl std::str::FromStr for MissionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PLANNED" => Ok(MissionStatus::Planned),
            "IN_PROGRESS" => Ok(MissionStatus::InProgress),
            "PAUSED" => Ok(MissionStatus::Paused),
            "COMPLETED" => Ok(MissionStatus::Completed),
            "ABORTED" => Ok(MissionStatus::Aborted),
            "FAILED" => Ok(MissionStatus::Failed),
            other => Err(format!("unknown mission status {:?}", other)),
        }
    }
}

/// Survey sweep pattern for waypoint generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlightPattern {
    Grid,
    Crosshatch,
    Perimeter,
}

/// Flight parameters an operator submits with a mission.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MissionParameters {
    pub altitude_m: f64,
    pub speed_mps: f64,
    /// Distance between sweep lines.
    pub spacing_m: f64,
}

impl Default for MissionParameters {
    fn default() -> Self {
        Self {
            altitude_m: 60.0,
            speed_mps: 8.0,
            spacing_m: 30.0,
        }
    }
}

/// A 3-D point in the flight plan.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    pub lat: f64,
    pub lon: f64,
    pub alt_m: f64,
}

/// A planned survey executed by one drone over a polygon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mission {
    pub id: String,
    pub org_id: String,
    pub site_id: String,
    pub drone_id: String,
    pub name: String,
    /// Survey polygon vertices as [lat, lon] pairs.
    pub survey_area: Vec<[f64; 2]>,
    pub flight_pattern: FlightPattern,
    pub parameters: MissionParameters,
    pub waypoints: Vec<Waypoint>,
    pub estimated_duration_s: f64,
    pub estimated_distance_m: f64,
    pub scheduled_start: Option<DateTime<Utc>>,
    pub actual_start: Option<DateTime<Utc>>,
    pub actual_end: Option<DateTime<Utc>>,
    pub status: MissionStatus,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

/// Operational status of a registered drone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DroneOpStatus {
    Available,
    InMission,
    Charging,
    Maintenance,
    Offline,
}

impl DroneOpStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DroneOpStatus::Available => "AVAILABLE",
            DroneOpStatus::InMission => "IN_MISSION",
            DroneOpStatus::Charging => "CHARGING",
            DroneOpStatus::Maintenance => "MAINTENANCE",
            DroneOpStatus::Offline => "OFFLINE",
        }
    }
}

impl std::str::FromStr for DroneOpStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AVAILABLE" => Ok(DroneOpStatus::Available),
            "IN_MISSION" => Ok(DroneOpStatus::InMission),
            "CHARGING" => Ok(DroneOpStatus::Charging),
            "MAINTENANCE" => Ok(DroneOpStatus::Maintenance),
            "OFFLINE" => Ok(DroneOpStatus::Offline),
            other => Err(format!("unknown drone status {:?}", other)),
        }
    }
}

/// A registered drone asset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Drone {
    pub id: String,
    pub org_id: String,
    pub site_id: String,
    pub serial: String,
    pub model: String,
    pub status: DroneOpStatus,
    pub battery_pct: f64,
    pub home: GeoPoint,
    pub last_seen: Option<DateTime<Utc>>,
}

/// Mission lifecycle / advisory event published to the `events` topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MissionEventType {
    MissionCreated,
    MissionStarted,
    MissionPaused,
    MissionResumed,
    MissionCompleted,
    MissionAborted,
    MissionFailed,
    BatteryLow,
    BatteryCritical,
    SignalWeak,
}

impl MissionEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MissionEventType::MissionCreated => "MissionCreated",
            MissionEventType::MissionStarted => "MissionStarted",
            MissionEventType::MissionPaused => "MissionPaused",
            MissionEventType::MissionResumed => "MissionResumed",
            MissionEventType::MissionCompleted => "MissionCompleted",
            MissionEventType::MissionAborted => "MissionAborted",
            MissionEventType::MissionFailed => "MissionFailed",
            MissionEventType::BatteryLow => "BatteryLow",
            MissionEventType::BatteryCritical => "BatteryCritical",
            MissionEventType::SignalWeak => "SignalWeak",
        }
    }
}

/// Event envelope: `{eventId, missionId, droneId, eventType, payload, timestamp}`.
///
/// `event_id` is globally unique so downstream consumers can deduplicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MissionEvent {
    pub event_id: String,
    pub mission_id: String,
    pub drone_id: String,
    pub event_type: MissionEventType,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl MissionEvent {
    pub fn new(
        mission_id: &str,
        drone_id: &str,
        event_type: MissionEventType,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            mission_id: mission_id.to_string(),
            drone_id: drone_id.to_string(),
            event_type,
            payload,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn telemetry_wire_roundtrip() {
        let payload = serde_json::json!({
            "mission_id": "M1",
            "timestamp": "2026-03-01T12:00:00Z",
            "lat": 33.68,
            "lon": -117.82,
            "alt": 75.0,
            "speed": 9.5,
            "heading": 270.0,
            "battery": 81.0,
            "status": "flying",
            "progress": 42.0,
            "signal": 88.0
        });
        let rec = TelemetryRecord::from_wire("D1", payload.to_string().as_bytes()).unwrap();
        assert_eq!(rec.drone_id, "D1");
        assert_eq!(rec.mission_id.as_deref(), Some("M1"));
        assert_eq!(rec.position.alt_m, 75.0);
        assert_eq!(rec.velocity.heading_deg, 270.0);
    }

    #[test]
    fn telemetry_empty_mission_is_none() {
        let payload = serde_json::json!({
            "mission_id": "",
            "timestamp": "2026-03-01T12:00:00Z",
            "lat": 0.0,
            "lon": 0.0,
            "alt": 0.0,
            "battery": 100.0,
            "status": "idle"
        });
        let rec = TelemetryRecord::from_wire("D1", payload.to_string().as_bytes()).unwrap();
        assert!(rec.mission_id.is_none());
    }

    #[test]
    fn telemetry_rejects_bad_latitude() {
        let payload = serde_json::json!({
            "mission_id": "",
            "timestamp": "2026-03-01T12:00:00Z",
            "lat": 91.0,
            "lon": 0.0,
            "alt": 0.0,
            "battery": 50.0,
            "status": "idle"
        });
        let err = TelemetryRecord::from_wire("D1", payload.to_string().as_bytes()).unwrap_err();
        assert!(matches!(err, WireError::Latitude(_)));
    }

    #[test]
    fn telemetry_clamps_percentages() {
        let payload = serde_json::json!({
            "mission_id": "",
            "timestamp": "2026-03-01T12:00:00Z",
            "lat": 10.0,
            "lon": 10.0,
            "alt": 0.0,
            "battery": 140.0,
            "status": "idle",
            "progress": -3.0
        });
        let rec = TelemetryRecord::from_wire("D1", payload.to_string().as_bytes()).unwrap();
        assert_eq!(rec.battery_pct, 100.0);
        assert_eq!(rec.progress_pct, 0.0);
    }

    #[test]
    fn command_wire_uses_camel_case() {
        let cmd = CommandRecord {
            command_id: "C1".into(),
            mission_id: "M1".into(),
            drone_id: "D1".into(),
            action: CommandAction::Rth,
            issued_at: Utc::now(),
            issued_by: "op-1".into(),
        };
        let value = serde_json::to_value(&cmd).unwrap();
        assert_eq!(value["commandId"], "C1");
        assert_eq!(value["missionId"], "M1");
        assert_eq!(value["action"], "RTH");
        assert!(value["timestamp"].is_string());
        assert_eq!(value["issuedBy"], "op-1");
    }

    #[test]
    fn ack_wire_decodes() {
        let ack = AckRecord::from_wire("D1", br#"{"cmd_id":"C9","status":"REJECTED"}"#).unwrap();
        assert_eq!(ack.command_id, "C9");
        assert_eq!(ack.status, AckStatus::Rejected);
        assert_eq!(ack.drone_id, "D1");
    }
}
