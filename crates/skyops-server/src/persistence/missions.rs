//! Mission persistence.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use skyops_core::models::{FlightPattern, Mission, MissionParameters, MissionStatus, Waypoint};

pub async fn upsert_mission(pool: &SqlitePool, mission: &Mission) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO missions (
            mission_id, org_id, site_id, drone_id, name,
            survey_area, flight_pattern, parameters, waypoints,
            estimated_duration_s, estimated_distance_m,
            scheduled_start, actual_start, actual_end,
            status, created_by, created_at
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
        ON CONFLICT(mission_id) DO UPDATE SET
            status = ?15,
            actual_start = ?13,
            actual_end = ?14
        "#,
    )
    .bind(&mission.id)
    .bind(&mission.org_id)
    .bind(&mission.site_id)
    .bind(&mission.drone_id)
    .bind(&mission.name)
    .bind(serde_json::to_string(&mission.survey_area)?)
    .bind(serde_json::to_string(&mission.flight_pattern)?)
    .bind(serde_json::to_string(&mission.parameters)?)
    .bind(serde_json::to_string(&mission.waypoints)?)
    .bind(mission.estimated_duration_s)
    .bind(mission.estimated_distance_m)
    .bind(mission.scheduled_start.map(|t| t.to_rfc3339()))
    .bind(mission.actual_start.map(|t| t.to_rfc3339()))
    .bind(mission.actual_end.map(|t| t.to_rfc3339()))
    .bind(mission.status.as_str())
    .bind(&mission.created_by)
    .bind(mission.created_at.to_rfc3339())
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn load_mission(pool: &SqlitePool, mission_id: &str) -> Result<Option<Mission>> {
    let row = sqlx::query_as::<_, MissionRow>(&select_sql("WHERE mission_id = ?1"))
        .bind(mission_id)
        .fetch_optional(pool)
        .await?;
    row.map(Mission::try_from).transpose()
}

pub async fn load_all_missions(pool: &SqlitePool) -> Result<Vec<Mission>> {
    let rows = sqlx::query_as::<_, MissionRow>(&select_sql("ORDER BY created_at DESC"))
        .fetch_all(pool)
        .await?;
    rows.into_iter().map(Mission::try_from).collect()
}

/// The non-terminal mission assigned to a drone, if any. Enforces the
/// one-active-mission-per-drone invariant at create time.
pub async fn load_active_mission_for_drone(
    pool: &SqlitePool,
    drone_id: &str,
) -> Result<Option<Mission>> {
    let row = sqlx::query_as::<_, MissionRow>(&select_sql(
        "WHERE drone_id = ?1 AND status IN ('PLANNED', 'IN_PROGRESS', 'PAUSED') LIMIT 1",
    ))
    .bind(drone_id)
    .fetch_optional(pool)
    .await?;
    row.map(Mission::try_from).transpose()
}

fn select_sql(suffix: &str) -> String {
    format!(
        "SELECT mission_id, org_id, site_id, drone_id, name, survey_area, flight_pattern, \
         parameters, waypoints, estimated_duration_s, estimated_distance_m, scheduled_start, \
         actual_start, actual_end, status, created_by, created_at FROM missions {}",
        suffix
    )
}

#[derive(sqlx::FromRow)]
struct MissionRow {
    mission_id: String,
    org_id: String,
    site_id: String,
    drone_id: String,
    name: String,
    survey_area: String,
    flight_pattern: String,
    parameters: String,
    waypoints: String,
    estimated_duration_s: f64,
    estimated_distance_m: f64,
    scheduled_start: Option<String>,
    actual_start: Option<String>,
    actual_end: Option<String>,
    status: String,
    created_by: String,
    created_at: String,
}

fn parse_ts(value: Option<&str>) -> Option<DateTime<Utc>> {
    value
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

impl TryFrom<MissionRow> for Mission {
    type Error = anyhow::Error;

    fn try_from(row: MissionRow) -> Result<Self> {
        let survey_area: Vec<[f64; 2]> = serde_json::from_str(&row.survey_area)?;
        let flight_pattern: FlightPattern = serde_json::from_str(&row.flight_pattern)?;
        let parameters: MissionParameters = serde_json::from_str(&row.parameters)?;
        let waypoints: Vec<Waypoint> = serde_json::from_str(&row.waypoints)?;
        let status: MissionStatus = row
            .status
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))?;
        let created_at = parse_ts(Some(row.created_at.as_str())).unwrap_or_else(Utc::now);

        Ok(Mission {
            id: row.mission_id,
            org_id: row.org_id,
            site_id: row.site_id,
            drone_id: row.drone_id,
            name: row.name,
            survey_area,
            flight_pattern,
            parameters,
            waypoints,
            estimated_duration_s: row.estimated_duration_s,
            estimated_distance_m: row.estimated_distance_m,
            scheduled_start: parse_ts(row.scheduled_start.as_deref()),
            actual_start: parse_ts(row.actual_start.as_deref()),
            actual_end: parse_ts(row.actual_end.as_deref()),
            status,
            created_by: row.created_by,
            created_at,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::testing::mission;
    use super::*;
    use crate::persistence::init_database;

    #[tokio::test]
    async fn roundtrip_and_status_update() {
        let db = init_database(":memory:", 1).await.unwrap();
        let mut m = mission("M1", "D1", MissionStatus::Planned);
        upsert_mission(db.pool(), &m).await.unwrap();

        m.status = MissionStatus::InProgress;
        m.actual_start = Some(Utc::now());
        upsert_mission(db.pool(), &m).await.unwrap();

        let loaded = load_mission(db.pool(), "M1").await.unwrap().unwrap();
        assert_eq!(loaded.status, MissionStatus::InProgress);
        assert!(loaded.actual_start.is_some());
        assert_eq!(loaded.waypoints.len(), 2);
    }

    #[tokio::test]
    async fn active_mission_lookup_ignores_terminal() {
        let db = init_database(":memory:", 1).await.unwrap();
        upsert_mission(db.pool(), &mission("M1", "D1", MissionStatus::Completed))
            .await
            .unwrap();
        assert!(load_active_mission_for_drone(db.pool(), "D1")
            .await
            .unwrap()
            .is_none());

        upsert_mission(db.pool(), &mission("M2", "D1", MissionStatus::Paused))
            .await
            .unwrap();
        let active = load_active_mission_for_drone(db.pool(), "D1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(active.id, "M2");
    }
}
