//! Derived analytics persistence (one row per drone per tick at most).

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

#[derive(Debug, Clone)]
pub struct DroneMetricRow {
    pub drone_id: String,
    pub mission_id: Option<String>,
    pub recorded_at: DateTime<Utc>,
    pub efficiency: f64,
    pub coverage_pct: f64,
    pub battery_pct: f64,
    pub alert_count: u32,
}

pub async fn insert_drone_metric(pool: &SqlitePool, row: &DroneMetricRow) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO drone_metrics (drone_id, mission_id, recorded_at, efficiency, coverage_pct, battery_pct, alert_count)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT(drone_id, recorded_at) DO NOTHING
        "#,
    )
    .bind(&row.drone_id)
    .bind(&row.mission_id)
    .bind(row.recorded_at.to_rfc3339())
    .bind(row.efficiency)
    .bind(row.coverage_pct)
    .bind(row.battery_pct)
    .bind(row.alert_count)
    .execute(pool)
    .await?;
    Ok(())
}
