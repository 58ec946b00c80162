//! REST routes. Thin wrappers: validation and state changes live in the
//! coordinator and dispatcher.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    routing::{get, post},
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use skyops_core::models::{CommandAction, Drone, DroneOpStatus, GeoPoint, Mission};

use crate::api::auth::{self, Claims};
use crate::api::ws;
use crate::coordinator::CreateMissionInput;
use crate::error::ControlError;
use crate::metrics::MetricsSnapshot;
use crate::persistence::{drones as drones_db, missions as missions_db};
use crate::state::AppState;

/// Build the full API router; `/ws` authenticates in the handshake, the
/// `/v1` surface requires an operator bearer token.
pub fn router(state: Arc<AppState>) -> Router {
    let v1 = Router::new()
        .route("/v1/missions", post(create_mission).get(list_missions))
        .route("/v1/missions/:id", get(get_mission))
        .route("/v1/missions/:id/commands", post(dispatch_command))
        .route("/v1/drones", post(register_drone).get(list_drones))
        .route("/v1/drones/nearby", get(nearby_drones))
        .route("/v1/metrics", get(metrics_snapshot))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_operator,
        ));

    Router::new()
        .merge(v1)
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}

// === Request/Response types ===

#[derive(Debug, Deserialize)]
pub struct DispatchCommandRequest {
    pub action: CommandAction,
}

#[derive(Debug, Deserialize)]
pub struct RegisterDroneRequest {
    pub id: String,
    pub org_id: String,
    pub site_id: String,
    #[serde(default)]
    pub serial: String,
    #[serde(default)]
    pub model: String,
    pub home: GeoPoint,
}

#[derive(Debug, Deserialize)]
pub struct NearbyQuery {
    pub lat: f64,
    pub lon: f64,
    pub radius_m: f64,
}

#[derive(Debug, Serialize)]
pub struct NearbyDrone {
    pub drone_id: String,
    pub distance_m: f64,
}

// === Handlers ===

async fn create_mission(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Json(mut input): Json<CreateMissionInput>,
) -> Result<(StatusCode, Json<Mission>), ControlError> {
    if input.created_by.is_empty() {
        input.created_by = claims.sub.clone();
    }
    if input.org_id.is_empty() {
        input.org_id = claims.org_id.clone();
    }
    let mission = state.coordinator().create(input).await?;
    Ok((StatusCode::CREATED, Json(mission)))
}

async fn list_missions(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Mission>>, ControlError> {
    let missions = missions_db::load_all_missions(state.db().pool()).await?;
    Ok(Json(missions))
}

async fn get_mission(
    State(state): State<Arc<AppState>>,
    Path(mission_id): Path<String>,
) -> Result<Json<Mission>, ControlError> {
    let mission = missions_db::load_mission(state.db().pool(), &mission_id)
        .await?
        .ok_or_else(|| ControlError::NotFound(format!("mission {}", mission_id)))?;
    Ok(Json(mission))
}

async fn dispatch_command(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Path(mission_id): Path<String>,
    Json(request): Json<DispatchCommandRequest>,
) -> Result<Json<Mission>, ControlError> {
    let mission = state
        .dispatcher()
        .send(&mission_id, request.action, &claims.sub)
        .await?;
    Ok(Json(mission))
}

async fn register_drone(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RegisterDroneRequest>,
) -> Result<(StatusCode, Json<Drone>), ControlError> {
    if request.id.trim().is_empty() {
        return Err(ControlError::Validation("drone id must not be empty".into()));
    }
    let drone = Drone {
        id: request.id,
        org_id: request.org_id,
        site_id: request.site_id,
        serial: request.serial,
        model: request.model,
        status: DroneOpStatus::Available,
        battery_pct: 100.0,
        home: request.home,
        last_seen: None,
    };
    drones_db::upsert_drone(state.db().pool(), &drone)
        .await
        .map_err(|err| ControlError::Internal(err.to_string()))?;
    tracing::info!("Registered drone {} at site {}", drone.id, drone.site_id);
    Ok((StatusCode::CREATED, Json(drone)))
}

async fn list_drones(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Drone>>, ControlError> {
    let drones = drones_db::load_all_drones(state.db().pool())
        .await
        .map_err(|err| ControlError::Internal(err.to_string()))?;
    Ok(Json(drones))
}

async fn nearby_drones(
    State(state): State<Arc<AppState>>,
    Query(query): Query<NearbyQuery>,
) -> Json<Vec<NearbyDrone>> {
    let hits = state.live().geo_query(
        GeoPoint {
            lat: query.lat,
            lon: query.lon,
        },
        query.radius_m,
    );
    Json(
        hits.into_iter()
            .map(|(drone_id, distance_m)| NearbyDrone {
                drone_id,
                distance_m,
            })
            .collect(),
    )
}

async fn metrics_snapshot(State(state): State<Arc<AppState>>) -> Json<MetricsSnapshot> {
    Json(state.metrics().snapshot())
}
