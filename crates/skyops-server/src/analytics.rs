//! Realtime analytics: per-drone derived metrics, mission progress, and
//! per-org fleet aggregates, recomputed on a fixed tick.
//!
//! The engine feeds from the live telemetry channel and keeps a sliding
//! five-minute sample window per drone. Formulas are deliberately simple
//! and deterministic.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use skyops_core::models::{Mission, TelemetryRecord};
use skyops_core::spatial::haversine_distance;

use crate::live::LiveStateStore;
use crate::persistence::metrics::{insert_drone_metric, DroneMetricRow};
use crate::persistence::{drones as drones_db, missions as missions_db, Database};

pub const CHANNEL_DRONE_METRICS: &str = "drone_metrics";
pub const CHANNEL_MISSION_PROGRESS: &str = "mission_progress";
pub const CHANNEL_FLEET_STATUS: &str = "fleet_status";

/// Samples older than this fall out of the window.
const SAMPLE_WINDOW: chrono::Duration = chrono::Duration::minutes(5);
/// A waypoint counts as covered within this ground radius.
const COVERAGE_RADIUS_M: f64 = 10.0;
/// Per-drone compute budget; overruns are abandoned until the next tick.
const PER_DRONE_BUDGET: Duration = Duration::from_millis(100);

const EFFICIENCY_SPEED_WEIGHT: f64 = 0.4;
const EFFICIENCY_ALTITUDE_WEIGHT: f64 = 0.3;
const EFFICIENCY_BATTERY_WEIGHT: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct DroneAlert {
    pub level: AlertLevel,
    pub kind: &'static str,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DroneMetrics {
    pub drone_id: String,
    pub mission_id: Option<String>,
    pub efficiency: f64,
    pub coverage_pct: f64,
    pub battery_pct: f64,
    pub alerts: Vec<DroneAlert>,
    pub computed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetStatus {
    pub org_id: String,
    pub drones_total: usize,
    pub status_counts: HashMap<String, usize>,
    pub mean_battery_pct: f64,
    pub active_alerts: usize,
    pub computed_at: DateTime<Utc>,
}

pub struct AnalyticsEngine {
    db: Database,
    live: Arc<LiveStateStore>,
    samples: DashMap<String, VecDeque<TelemetryRecord>>,
    /// mission -> waypoint indices already visited.
    visited: DashMap<String, HashSet<usize>>,
}

impl AnalyticsEngine {
    pub fn new(db: Database, live: Arc<LiveStateStore>) -> Self {
        Self {
            db,
            live,
            samples: DashMap::new(),
            visited: DashMap::new(),
        }
    }

    /// Feed one accepted telemetry record into the sample window.
    pub fn ingest(&self, rec: TelemetryRecord) {
        let mut window = self.samples.entry(rec.drone_id.clone()).or_default();
        window.push_back(rec);
        if window.len() > 512 {
            window.pop_front();
        }
    }

    /// One 5-second tick: evict, derive, broadcast, persist.
    pub async fn tick(&self) -> Result<()> {
        let now = Utc::now();
        self.evict(now);

        let drone_ids: Vec<String> = self.samples.iter().map(|e| e.key().clone()).collect();
        let mut computed: Vec<DroneMetrics> = Vec::new();

        for drone_id in drone_ids {
            let started = Instant::now();
            match self.compute_drone(&drone_id, now, started).await {
                Ok(Some(metrics)) => computed.push(metrics),
                Ok(None) => {}
                Err(err) => {
                    // One bad drone never kills the tick.
                    tracing::warn!("Analytics for drone {} failed: {}", drone_id, err);
                }
            }
        }

        for metrics in &computed {
            if let Ok(payload) = serde_json::to_string(metrics) {
                self.live.publish(CHANNEL_DRONE_METRICS, payload);
            }
            let row = DroneMetricRow {
                drone_id: metrics.drone_id.clone(),
                mission_id: metrics.mission_id.clone(),
                recorded_at: metrics.computed_at,
                efficiency: metrics.efficiency,
                coverage_pct: metrics.coverage_pct,
                battery_pct: metrics.battery_pct,
                alert_count: metrics.alerts.len() as u32,
            };
            if let Err(err) = insert_drone_metric(self.db.pool(), &row).await {
                tracing::warn!("Metric persist failed for {}: {}", metrics.drone_id, err);
            }
        }

        self.publish_fleet_status(&computed, now).await?;
        Ok(())
    }

    fn evict(&self, now: DateTime<Utc>) {
        let mut empty: Vec<String> = Vec::new();
        for mut entry in self.samples.iter_mut() {
            let window = entry.value_mut();
            while window
                .front()
                .map(|rec| now - rec.sent_at > SAMPLE_WINDOW)
                .unwrap_or(false)
            {
                window.pop_front();
            }
            if window.is_empty() {
                empty.push(entry.key().clone());
            }
        }
        for drone_id in empty {
            self.samples.remove(&drone_id);
        }
    }

    async fn compute_drone(
        &self,
        drone_id: &str,
        now: DateTime<Utc>,
        started: Instant,
    ) -> Result<Option<DroneMetrics>> {
        let Some(latest) = self
            .samples
            .get(drone_id)
            .and_then(|w| w.back().cloned())
        else {
            return Ok(None);
        };

        let mission = match latest.mission_id.as_deref() {
            Some(mission_id) => missions_db::load_mission(self.db.pool(), mission_id).await?,
            None => None,
        };

        if started.elapsed() > PER_DRONE_BUDGET {
            tracing::debug!("Analytics budget exceeded for {}; retrying next tick", drone_id);
            return Ok(None);
        }

        let coverage_pct = match &mission {
            Some(mission) => self.update_coverage(mission, drone_id),
            None => 0.0,
        };
        let efficiency = efficiency_score(&latest, mission.as_ref());
        let alerts = derive_alerts(&latest);

        let metrics = DroneMetrics {
            drone_id: drone_id.to_string(),
            mission_id: latest.mission_id.clone(),
            efficiency,
            coverage_pct,
            battery_pct: latest.battery_pct,
            alerts,
            computed_at: now,
        };

        if let Some(mission) = &mission {
            let progress = serde_json::json!({
                "missionId": mission.id,
                "progressPct": latest.progress_pct,
                "coveragePct": coverage_pct,
                "status": mission.status.as_str(),
            });
            self.live
                .publish(CHANNEL_MISSION_PROGRESS, progress.to_string());
        }

        Ok(Some(metrics))
    }

    /// Mark waypoints within the coverage radius of any windowed sample,
    /// then return visited / total as a percentage. Zero waypoints is 0%.
    fn update_coverage(&self, mission: &Mission, drone_id: &str) -> f64 {
        if mission.waypoints.is_empty() {
            return 0.0;
        }
        let mut visited = self.visited.entry(mission.id.clone()).or_default();
        if let Some(window) = self.samples.get(drone_id) {
            for rec in window.iter() {
                for (index, wp) in mission.waypoints.iter().enumerate() {
                    if visited.contains(&index) {
                        continue;
                    }
                    let d = haversine_distance(
                        rec.position.lat,
                        rec.position.lon,
                        wp.lat,
                        wp.lon,
                    );
                    if d <= COVERAGE_RADIUS_M {
                        visited.insert(index);
                    }
                }
            }
        }
        visited.len() as f64 / mission.waypoints.len() as f64 * 100.0
    }

    async fn publish_fleet_status(
        &self,
        computed: &[DroneMetrics],
        now: DateTime<Utc>,
    ) -> Result<()> {
        let drones = drones_db::load_all_drones(self.db.pool()).await?;
        if drones.is_empty() {
            return Ok(());
        }

        let alerts_by_drone: HashMap<&str, usize> = computed
            .iter()
            .map(|m| (m.drone_id.as_str(), m.alerts.len()))
            .collect();

        let mut orgs: HashMap<String, Vec<&skyops_core::models::Drone>> = HashMap::new();
        for drone in &drones {
            orgs.entry(drone.org_id.clone()).or_default().push(drone);
        }

        for (org_id, fleet) in orgs {
            let mut status_counts: HashMap<String, usize> = HashMap::new();
            let mut battery_sum = 0.0;
            let mut active_alerts = 0;
            for drone in &fleet {
                *status_counts
                    .entry(drone.status.as_str().to_string())
                    .or_insert(0) += 1;
                battery_sum += drone.battery_pct;
                active_alerts += alerts_by_drone.get(drone.id.as_str()).copied().unwrap_or(0);
            }
            let status = FleetStatus {
                org_id,
                drones_total: fleet.len(),
                status_counts,
                mean_battery_pct: battery_sum / fleet.len() as f64,
                active_alerts,
                computed_at: now,
            };
            if let Ok(payload) = serde_json::to_string(&status) {
                self.live.publish(CHANNEL_FLEET_STATUS, payload);
            }
        }
        Ok(())
    }
}

/// Weighted conformance score in [0, 100].
fn efficiency_score(rec: &TelemetryRecord, mission: Option<&Mission>) -> f64 {
    let (speed_score, altitude_score) = match mission {
        Some(mission) => (
            conformance(rec.velocity.speed_mps, mission.parameters.speed_mps),
            conformance(rec.position.alt_m, mission.parameters.altitude_m),
        ),
        // No plan to conform to; the battery factor still applies.
        None => (100.0, 100.0),
    };
    let battery_score = rec.battery_pct.clamp(0.0, 100.0);

    speed_score * EFFICIENCY_SPEED_WEIGHT
        + altitude_score * EFFICIENCY_ALTITUDE_WEIGHT
        + battery_score * EFFICIENCY_BATTERY_WEIGHT
}

fn conformance(actual: f64, planned: f64) -> f64 {
    if planned.abs() < f64::EPSILON {
        return 100.0;
    }
    (100.0 * (1.0 - (actual - planned).abs() / planned)).clamp(0.0, 100.0)
}

fn derive_alerts(rec: &TelemetryRecord) -> Vec<DroneAlert> {
    let mut alerts = Vec::new();
    if rec.battery_pct < 10.0 {
        alerts.push(DroneAlert {
            level: AlertLevel::Critical,
            kind: "battery",
            value: rec.battery_pct,
        });
    } else if rec.battery_pct < 20.0 {
        alerts.push(DroneAlert {
            level: AlertLevel::High,
            kind: "battery",
            value: rec.battery_pct,
        });
    }
    if rec.position.alt_m > 150.0 {
        alerts.push(DroneAlert {
            level: AlertLevel::Medium,
            kind: "altitude",
            value: rec.position.alt_m,
        });
    }
    if rec.velocity.speed_mps > 20.0 {
        alerts.push(DroneAlert {
            level: AlertLevel::Medium,
            kind: "speed",
            value: rec.velocity.speed_mps,
        });
    }
    if rec.signal < -80.0 {
        alerts.push(DroneAlert {
            level: AlertLevel::High,
            kind: "signal",
            value: rec.signal,
        });
    }
    alerts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::init_database;
    use crate::persistence::missions::testing::mission;
    use skyops_core::models::{
        Drone, DroneOpStatus, GeoPoint, MissionStatus, Position, Velocity, Waypoint,
    };

    fn sample(drone: &str, mission: Option<&str>) -> TelemetryRecord {
        TelemetryRecord {
            drone_id: drone.into(),
            mission_id: mission.map(|m| m.to_string()),
            sent_at: Utc::now(),
            position: Position {
                lat: 33.001,
                lon: -116.999,
                alt_m: 60.0,
            },
            velocity: Velocity {
                speed_mps: 8.0,
                heading_deg: 0.0,
            },
            battery_pct: 100.0,
            drone_status: "flying".into(),
            progress_pct: 40.0,
            signal: -60.0,
        }
    }

    async fn setup() -> (AnalyticsEngine, Database, Arc<LiveStateStore>) {
        let db = init_database(":memory:", 1).await.unwrap();
        let live = Arc::new(LiveStateStore::new());
        let engine = AnalyticsEngine::new(db.clone(), live.clone());
        (engine, db, live)
    }

    async fn seed_drone(db: &Database, id: &str, battery: f64) {
        drones_db::upsert_drone(
            db.pool(),
            &Drone {
                id: id.into(),
                org_id: "org-1".into(),
                site_id: "site-1".into(),
                serial: "SN".into(),
                model: "quad".into(),
                status: DroneOpStatus::InMission,
                battery_pct: battery,
                home: GeoPoint {
                    lat: 33.0,
                    lon: -117.0,
                },
                last_seen: None,
            },
        )
        .await
        .unwrap();
    }

    #[test]
    fn battery_alert_boundaries() {
        let mut rec = sample("D1", None);

        rec.battery_pct = 20.0;
        assert!(derive_alerts(&rec).iter().all(|a| a.kind != "battery"));

        rec.battery_pct = 19.0;
        let alerts = derive_alerts(&rec);
        let battery = alerts.iter().find(|a| a.kind == "battery").unwrap();
        assert_eq!(battery.level, AlertLevel::High);

        rec.battery_pct = 9.0;
        let alerts = derive_alerts(&rec);
        let battery = alerts.iter().find(|a| a.kind == "battery").unwrap();
        assert_eq!(battery.level, AlertLevel::Critical);
    }

    #[test]
    fn altitude_speed_and_signal_alerts() {
        let mut rec = sample("D1", None);
        rec.position.alt_m = 151.0;
        rec.velocity.speed_mps = 21.0;
        rec.signal = -85.0;
        let alerts = derive_alerts(&rec);
        let kinds: Vec<&str> = alerts.iter().map(|a| a.kind).collect();
        assert_eq!(kinds, vec!["altitude", "speed", "signal"]);
    }

    #[test]
    fn perfect_conformance_scores_100() {
        let m = mission("M1", "D1", MissionStatus::InProgress);
        let mut rec = sample("D1", Some("M1"));
        rec.velocity.speed_mps = m.parameters.speed_mps;
        rec.position.alt_m = m.parameters.altitude_m;
        rec.battery_pct = 100.0;
        assert!((efficiency_score(&rec, Some(&m)) - 100.0).abs() < 1e-9);
    }

    #[test]
    fn efficiency_degrades_with_speed_deviation() {
        let m = mission("M1", "D1", MissionStatus::InProgress);
        let mut rec = sample("D1", Some("M1"));
        rec.position.alt_m = m.parameters.altitude_m;
        rec.battery_pct = 100.0;
        rec.velocity.speed_mps = m.parameters.speed_mps * 2.0;
        // Speed conformance collapses to 0; the other weights remain.
        assert!((efficiency_score(&rec, Some(&m)) - 60.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn zero_waypoint_mission_has_zero_coverage() {
        let (engine, db, _live) = setup().await;
        seed_drone(&db, "D1", 90.0).await;
        let mut m = mission("M1", "D1", MissionStatus::InProgress);
        m.waypoints.clear();
        missions_db::upsert_mission(db.pool(), &m).await.unwrap();

        engine.ingest(sample("D1", Some("M1")));
        assert_eq!(engine.update_coverage(&m, "D1"), 0.0);
    }

    #[tokio::test]
    async fn coverage_counts_visited_waypoints() {
        let (engine, db, _live) = setup().await;
        seed_drone(&db, "D1", 90.0).await;
        let mut m = mission("M1", "D1", MissionStatus::InProgress);
        m.waypoints = vec![
            // At the sample position.
            Waypoint {
                lat: 33.001,
                lon: -116.999,
                alt_m: 60.0,
            },
            // Far away.
            Waypoint {
                lat: 33.1,
                lon: -116.9,
                alt_m: 60.0,
            },
        ];
        missions_db::upsert_mission(db.pool(), &m).await.unwrap();

        engine.ingest(sample("D1", Some("M1")));
        assert_eq!(engine.update_coverage(&m, "D1"), 50.0);
    }

    #[tokio::test]
    async fn tick_publishes_metrics_and_fleet_status() {
        let (engine, db, live) = setup().await;
        seed_drone(&db, "D1", 85.0).await;
        missions_db::upsert_mission(db.pool(), &mission("M1", "D1", MissionStatus::InProgress))
            .await
            .unwrap();

        let mut metrics_rx = live.subscribe(CHANNEL_DRONE_METRICS);
        let mut progress_rx = live.subscribe(CHANNEL_MISSION_PROGRESS);
        let mut fleet_rx = live.subscribe(CHANNEL_FLEET_STATUS);

        engine.ingest(sample("D1", Some("M1")));
        engine.tick().await.unwrap();

        let metrics_msg = metrics_rx.try_recv().unwrap();
        let metrics: serde_json::Value = serde_json::from_str(&metrics_msg.payload).unwrap();
        assert_eq!(metrics["droneId"], "D1");
        assert!(metrics["efficiency"].as_f64().unwrap() > 0.0);

        let progress_msg = progress_rx.try_recv().unwrap();
        let progress: serde_json::Value = serde_json::from_str(&progress_msg.payload).unwrap();
        assert_eq!(progress["missionId"], "M1");
        assert_eq!(progress["progressPct"], 40.0);

        let fleet_msg = fleet_rx.try_recv().unwrap();
        let fleet: serde_json::Value = serde_json::from_str(&fleet_msg.payload).unwrap();
        assert_eq!(fleet["orgId"], "org-1");
        assert_eq!(fleet["dronesTotal"], 1);

        // Derived metrics persisted once for the tick.
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM drone_metrics")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn old_samples_are_evicted() {
        let (engine, db, live) = setup().await;
        seed_drone(&db, "D1", 85.0).await;

        let mut rec = sample("D1", None);
        rec.sent_at = Utc::now() - chrono::Duration::minutes(10);
        engine.ingest(rec);

        let mut metrics_rx = live.subscribe(CHANNEL_DRONE_METRICS);
        engine.tick().await.unwrap();
        assert!(metrics_rx.try_recv().is_err());
    }
}
