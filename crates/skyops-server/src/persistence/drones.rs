//! Drone asset persistence.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use skyops_core::models::{Drone, DroneOpStatus, GeoPoint};

pub async fn upsert_drone(pool: &SqlitePool, drone: &Drone) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO drones (drone_id, org_id, site_id, serial, model, status, battery_pct, home_lat, home_lon, last_seen)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        ON CONFLICT(drone_id) DO UPDATE SET
            org_id = ?2, site_id = ?3, serial = ?4, model = ?5,
            status = ?6, battery_pct = ?7,
            home_lat = ?8, home_lon = ?9, last_seen = ?10
        "#,
    )
    .bind(&drone.id)
    .bind(&drone.org_id)
    .bind(&drone.site_id)
    .bind(&drone.serial)
    .bind(&drone.model)
    .bind(drone.status.as_str())
    .bind(drone.battery_pct)
    .bind(drone.home.lat)
    .bind(drone.home.lon)
    .bind(drone.last_seen.map(|t| t.to_rfc3339()))
    .execute(pool)
    .await?;

    Ok(())
}

/// Update only operational status.
pub async fn update_drone_status(
    pool: &SqlitePool,
    drone_id: &str,
    status: DroneOpStatus,
) -> Result<()> {
    sqlx::query("UPDATE drones SET status = ?2 WHERE drone_id = ?1")
        .bind(drone_id)
        .bind(status.as_str())
        .execute(pool)
        .await?;
    Ok(())
}

/// Battery write from the stream consumer (throttled upstream).
pub async fn update_drone_battery(
    pool: &SqlitePool,
    drone_id: &str,
    battery_pct: f64,
    last_seen: DateTime<Utc>,
) -> Result<()> {
    sqlx::query("UPDATE drones SET battery_pct = ?2, last_seen = ?3 WHERE drone_id = ?1")
        .bind(drone_id)
        .bind(battery_pct)
        .bind(last_seen.to_rfc3339())
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn load_drone(pool: &SqlitePool, drone_id: &str) -> Result<Option<Drone>> {
    let row = sqlx::query_as::<_, DroneRow>(
        "SELECT drone_id, org_id, site_id, serial, model, status, battery_pct, home_lat, home_lon, last_seen FROM drones WHERE drone_id = ?1",
    )
    .bind(drone_id)
    .fetch_optional(pool)
    .await?;
    row.map(Drone::try_from).transpose()
}

pub async fn load_all_drones(pool: &SqlitePool) -> Result<Vec<Drone>> {
    let rows = sqlx::query_as::<_, DroneRow>(
        "SELECT drone_id, org_id, site_id, serial, model, status, battery_pct, home_lat, home_lon, last_seen FROM drones ORDER BY drone_id",
    )
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(Drone::try_from).collect()
}

#[derive(sqlx::FromRow)]
struct DroneRow {
    drone_id: String,
    org_id: String,
    site_id: String,
    serial: String,
    model: String,
    status: String,
    battery_pct: f64,
    home_lat: f64,
    home_lon: f64,
    last_seen: Option<String>,
}

impl TryFrom<DroneRow> for Drone {
    type Error = anyhow::Error;

    fn try_from(row: DroneRow) -> Result<Self> {
        let status: DroneOpStatus = row
            .status
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))?;
        let last_seen = row
            .last_seen
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));
        Ok(Drone {
            id: row.drone_id,
            org_id: row.org_id,
            site_id: row.site_id,
            serial: row.serial,
            model: row.model,
            status,
            battery_pct: row.battery_pct,
            home: GeoPoint {
                lat: row.home_lat,
                lon: row.home_lon,
            },
            last_seen,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::init_database;

    fn drone(id: &str) -> Drone {
        Drone {
            id: id.into(),
            org_id: "org-1".into(),
            site_id: "site-1".into(),
            serial: "SN-100".into(),
            model: "quad-x".into(),
            status: DroneOpStatus::Available,
            battery_pct: 97.0,
            home: GeoPoint {
                lat: 33.68,
                lon: -117.82,
            },
            last_seen: None,
        }
    }

    #[tokio::test]
    async fn upsert_and_reload() {
        let db = init_database(":memory:", 1).await.unwrap();
        upsert_drone(db.pool(), &drone("D1")).await.unwrap();

        update_drone_status(db.pool(), "D1", DroneOpStatus::InMission)
            .await
            .unwrap();
        update_drone_battery(db.pool(), "D1", 64.0, Utc::now())
            .await
            .unwrap();

        let loaded = load_drone(db.pool(), "D1").await.unwrap().unwrap();
        assert_eq!(loaded.status, DroneOpStatus::InMission);
        assert_eq!(loaded.battery_pct, 64.0);
        assert!(loaded.last_seen.is_some());
    }
}
