//! Secondary-state reconciliation from the durable telemetry stream.
//!
//! The Kafka shell lives in `stream::kafka`; this core applies decoded
//! batches so replay behavior is testable without a broker. Applying the
//! same batch twice converges to the same state.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use dashmap::DashMap;

use skyops_core::models::{MissionStatus, TelemetryRecord};

use crate::coordinator::MissionCoordinator;
use crate::persistence::{drones as drones_db, missions as missions_db, Database};

/// At most one battery write per drone per this interval.
const BATTERY_WRITE_INTERVAL: Duration = Duration::from_secs(5);

pub struct ConsumerCore {
    db: Database,
    coordinator: Arc<MissionCoordinator>,
    last_battery_write: DashMap<String, Instant>,
    battery_write_interval: Duration,
}

impl ConsumerCore {
    pub fn new(db: Database, coordinator: Arc<MissionCoordinator>) -> Self {
        Self::with_throttle(db, coordinator, BATTERY_WRITE_INTERVAL)
    }

    pub fn with_throttle(
        db: Database,
        coordinator: Arc<MissionCoordinator>,
        battery_write_interval: Duration,
    ) -> Self {
        Self {
            db,
            coordinator,
            last_battery_write: DashMap::new(),
            battery_write_interval,
        }
    }

    /// Apply one decoded batch. An error leaves the offset uncommitted so
    /// the batch replays.
    pub async fn apply_batch(&self, records: &[TelemetryRecord]) -> Result<()> {
        for rec in records {
            self.apply_record(rec).await?;
        }
        Ok(())
    }

    async fn apply_record(&self, rec: &TelemetryRecord) -> Result<()> {
        if self.should_write_battery(&rec.drone_id) {
            drones_db::update_drone_battery(
                self.db.pool(),
                &rec.drone_id,
                rec.battery_pct,
                rec.sent_at,
            )
            .await?;
        }

        if rec.progress_pct >= 100.0 {
            if let Some(mission_id) = rec.mission_id.as_deref() {
                let mission = missions_db::load_mission(self.db.pool(), mission_id).await?;
                if let Some(mission) = mission {
                    if mission.status == MissionStatus::InProgress {
                        self.coordinator
                            .complete(mission_id)
                            .await
                            .map_err(|err| anyhow::anyhow!("complete {}: {}", mission_id, err))?;
                    }
                }
            }
        }

        Ok(())
    }

    fn should_write_battery(&self, drone_id: &str) -> bool {
        let now = Instant::now();
        let mut write = false;
        self.last_battery_write
            .entry(drone_id.to_string())
            .and_modify(|last| {
                if now.duration_since(*last) >= self.battery_write_interval {
                    *last = now;
                    write = true;
                }
            })
            .or_insert_with(|| {
                write = true;
                now
            });
        write
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live::LiveStateStore;
    use crate::metrics::Metrics;
    use crate::persistence::init_database;
    use crate::persistence::missions::testing::mission;
    use crate::stream::testing::MemoryStreamWriter;
    use crate::stream::{StreamPublisher, StreamPublisherOptions, TOPIC_EVENTS};
    use chrono::Utc;
    use skyops_core::models::{Drone, DroneOpStatus, GeoPoint, Position, Velocity};
    use tokio::sync::broadcast;

    fn sample(drone: &str, mission: Option<&str>, battery: f64, progress: f64) -> TelemetryRecord {
        TelemetryRecord {
            drone_id: drone.into(),
            mission_id: mission.map(|m| m.to_string()),
            sent_at: Utc::now(),
            position: Position {
                lat: 33.0,
                lon: -117.0,
                alt_m: 60.0,
            },
            velocity: Velocity {
                speed_mps: 8.0,
                heading_deg: 0.0,
            },
            battery_pct: battery,
            drone_status: "flying".into(),
            progress_pct: progress,
            signal: 90.0,
        }
    }

    async fn setup(
        throttle: Duration,
    ) -> (ConsumerCore, Database, Arc<MemoryStreamWriter>, broadcast::Sender<()>) {
        let db = init_database(":memory:", 1).await.unwrap();
        let writer = Arc::new(MemoryStreamWriter::new());
        let (shutdown_tx, _) = broadcast::channel(1);
        let (publisher, _) = StreamPublisher::spawn(
            writer.clone(),
            Arc::new(Metrics::new()),
            StreamPublisherOptions {
                max_batch_records: 1,
                flush_interval: Duration::from_millis(10),
                retry_budget: 1,
            },
            shutdown_tx.subscribe(),
        );
        let coordinator = Arc::new(MissionCoordinator::new(
            db.clone(),
            Arc::new(LiveStateStore::new()),
            publisher,
        ));
        let core = ConsumerCore::with_throttle(db.clone(), coordinator, throttle);
        (core, db, writer, shutdown_tx)
    }

    async fn seed_drone(db: &Database, id: &str) {
        drones_db::upsert_drone(
            db.pool(),
            &Drone {
                id: id.into(),
                org_id: "org-1".into(),
                site_id: "site-1".into(),
                serial: "SN".into(),
                model: "quad".into(),
                status: DroneOpStatus::InMission,
                battery_pct: 100.0,
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

    #[tokio::test]
    async fn battery_writes_are_throttled() {
        let (core, db, _writer, _shutdown) = setup(Duration::from_secs(60)).await;
        seed_drone(&db, "D1").await;

        core.apply_batch(&[
            sample("D1", None, 70.0, 0.0),
            sample("D1", None, 69.0, 0.0),
        ])
        .await
        .unwrap();

        let drone = drones_db::load_drone(db.pool(), "D1").await.unwrap().unwrap();
        // Second write suppressed by the throttle window.
        assert_eq!(drone.battery_pct, 70.0);
    }

    #[tokio::test]
    async fn battery_write_resumes_after_interval() {
        let (core, db, _writer, _shutdown) = setup(Duration::from_millis(20)).await;
        seed_drone(&db, "D1").await;

        core.apply_batch(&[sample("D1", None, 70.0, 0.0)]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        core.apply_batch(&[sample("D1", None, 65.0, 0.0)]).await.unwrap();

        let drone = drones_db::load_drone(db.pool(), "D1").await.unwrap().unwrap();
        assert_eq!(drone.battery_pct, 65.0);
    }

    #[tokio::test]
    async fn full_progress_completes_in_progress_mission_once() {
        let (core, db, writer, _shutdown) = setup(Duration::from_secs(60)).await;
        seed_drone(&db, "D1").await;
        missions_db::upsert_mission(db.pool(), &mission("M1", "D1", MissionStatus::InProgress))
            .await
            .unwrap();

        let batch = [sample("D1", Some("M1"), 55.0, 100.0)];
        core.apply_batch(&batch).await.unwrap();
        // At-least-once delivery: the replayed batch must be a no-op.
        core.apply_batch(&batch).await.unwrap();

        let loaded = missions_db::load_mission(db.pool(), "M1").await.unwrap().unwrap();
        assert_eq!(loaded.status, MissionStatus::Completed);
        assert!(loaded.actual_end.is_some());

        let drone = drones_db::load_drone(db.pool(), "D1").await.unwrap().unwrap();
        assert_eq!(drone.status, DroneOpStatus::Available);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(writer.topic_batches(TOPIC_EVENTS).len(), 1);
    }

    #[tokio::test]
    async fn planned_mission_does_not_complete_by_progress() {
        let (core, db, _writer, _shutdown) = setup(Duration::from_secs(60)).await;
        seed_drone(&db, "D1").await;
        missions_db::upsert_mission(db.pool(), &mission("M1", "D1", MissionStatus::Planned))
            .await
            .unwrap();

        core.apply_batch(&[sample("D1", Some("M1"), 55.0, 100.0)])
            .await
            .unwrap();

        let loaded = missions_db::load_mission(db.pool(), "M1").await.unwrap().unwrap();
        assert_eq!(loaded.status, MissionStatus::Planned);
    }

    #[tokio::test]
    async fn replay_converges_to_newest_battery() {
        let (core, db, _writer, _shutdown) = setup(Duration::from_millis(0)).await;
        seed_drone(&db, "D1").await;

        let batch = [
            sample("D1", None, 80.0, 0.0),
            sample("D1", None, 75.0, 0.0),
        ];
        core.apply_batch(&batch).await.unwrap();
        core.apply_batch(&batch).await.unwrap();

        let drone = drones_db::load_drone(db.pool(), "D1").await.unwrap().unwrap();
        assert_eq!(drone.battery_pct, 75.0);
    }
}
