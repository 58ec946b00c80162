//! Core domain logic for the Skyops mission control plane.

pub mod models;
pub mod plan;
pub mod spatial;
pub mod state_machine;

pub use models::{
    AckRecord, AckStatus, CommandAction, CommandRecord, Drone, DroneOpStatus, Mission,
    MissionEvent, MissionEventType, MissionStatus, Position, TelemetryRecord, Velocity,
};
pub use state_machine::{apply_action, legal_actions, TransitionError};
