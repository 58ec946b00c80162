//! Live state store: latest per-mission/per-drone views with TTLs, a geo
//! index of live drones, and pattern-matched pub/sub channels.
//!
//! Operations on a single key are linearizable (DashMap entry locking);
//! multi-key updates issued by the telemetry processor are deliberately not
//! atomic across keys; readers may observe `latest` ahead of `state` for
//! at most one telemetry period.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use skyops_core::models::{AckRecord, CommandRecord, GeoPoint, Position, TelemetryRecord, Velocity};
use skyops_core::spatial::haversine_distance;

const CHANNEL_DEPTH: usize = 256;

pub const CHANNEL_SYSTEM_ALERTS: &str = "system:alerts";

pub fn mission_telemetry_channel(mission_id: &str) -> String {
    format!("mission:{}:telemetry", mission_id)
}

pub fn drone_status_channel(drone_id: &str) -> String {
    format!("drone:{}:status", drone_id)
}

/// A message delivered on a pub/sub channel.
#[derive(Debug, Clone)]
pub struct ChannelMessage {
    pub channel: String,
    pub payload: String,
}

/// Merge-update fields for `mission:{id}:state`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MissionStateFields {
    pub status: Option<String>,
    pub progress: Option<f64>,
    pub battery: Option<f64>,
    pub last_update: Option<DateTime<Utc>>,
}

/// Materialized `mission:{id}:state` hash.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MissionLiveState {
    pub status: Option<String>,
    pub progress: Option<f64>,
    pub battery: Option<f64>,
    pub last_update: Option<DateTime<Utc>>,
}

impl MissionLiveState {
    fn merge(&mut self, fields: MissionStateFields) {
        if fields.status.is_some() {
            self.status = fields.status;
        }
        if fields.progress.is_some() {
            self.progress = fields.progress;
        }
        if fields.battery.is_some() {
            self.battery = fields.battery;
        }
        if fields.last_update.is_some() {
            self.last_update = fields.last_update;
        }
    }
}

/// `drone:{id}:location` value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DroneLocation {
    pub position: Position,
    pub velocity: Velocity,
    pub updated_at: DateTime<Utc>,
}

struct Expiring<T> {
    value: T,
    expires_at: Instant,
}

impl<T> Expiring<T> {
    fn new(value: T, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn live(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

struct Subscriber {
    pattern: String,
    tx: broadcast::Sender<ChannelMessage>,
}

/// Process-wide live state, owned by the runtime and injected everywhere.
pub struct LiveStateStore {
    mission_state: DashMap<String, MissionLiveState>,
    latest_telemetry: DashMap<String, Expiring<TelemetryRecord>>,
    drone_locations: DashMap<String, Expiring<DroneLocation>>,
    /// `drones:live` geo index: last known ground position per drone.
    geo_index: DashMap<String, GeoPoint>,
    pending: DashMap<String, Expiring<CommandRecord>>,
    acks: DashMap<String, Expiring<AckRecord>>,
    /// `mission_id -> command_id` dispatch guard.
    in_flight: DashMap<String, Expiring<String>>,
    subscribers: RwLock<Vec<Subscriber>>,
    publish_seq: AtomicU64,
    latest_ttl: Duration,
    location_ttl: Duration,
    pending_ttl: Duration,
    ack_ttl: Duration,
}

impl Default for LiveStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LiveStateStore {
    pub fn new() -> Self {
        Self::with_ttls(
            Duration::from_secs(60),
            Duration::from_secs(30),
            Duration::from_secs(30),
            Duration::from_secs(60),
        )
    }

    /// TTL overrides, used by the expiry tests.
    pub fn with_ttls(
        latest_ttl: Duration,
        location_ttl: Duration,
        pending_ttl: Duration,
        ack_ttl: Duration,
    ) -> Self {
        Self {
            mission_state: DashMap::new(),
            latest_telemetry: DashMap::new(),
            drone_locations: DashMap::new(),
            geo_index: DashMap::new(),
            pending: DashMap::new(),
            acks: DashMap::new(),
            in_flight: DashMap::new(),
            subscribers: RwLock::new(Vec::new()),
            publish_seq: AtomicU64::new(0),
            latest_ttl,
            location_ttl,
            pending_ttl,
            ack_ttl,
        }
    }

    // ========== MISSION STATE ==========

    pub fn set_mission_state(&self, mission_id: &str, fields: MissionStateFields) {
        self.mission_state
            .entry(mission_id.to_string())
            .or_default()
            .merge(fields);
    }

    pub fn get_mission_state(&self, mission_id: &str) -> Option<MissionLiveState> {
        self.mission_state
            .get(mission_id)
            .map(|entry| entry.value().clone())
    }

    pub fn remove_mission_state(&self, mission_id: &str) {
        self.mission_state.remove(mission_id);
    }

    pub fn set_latest_telemetry(&self, mission_id: &str, rec: TelemetryRecord) {
        self.latest_telemetry.insert(
            mission_id.to_string(),
            Expiring::new(rec, self.latest_ttl),
        );
    }

    pub fn get_latest_telemetry(&self, mission_id: &str) -> Option<TelemetryRecord> {
        self.latest_telemetry
            .get(mission_id)
            .filter(|entry| entry.value().live())
            .map(|entry| entry.value().value.clone())
    }

    // ========== DRONE LOCATION / GEO ==========

    pub fn update_drone_location(&self, drone_id: &str, position: Position, velocity: Velocity) {
        self.drone_locations.insert(
            drone_id.to_string(),
            Expiring::new(
                DroneLocation {
                    position,
                    velocity,
                    updated_at: Utc::now(),
                },
                self.location_ttl,
            ),
        );
        self.geo_index.insert(
            drone_id.to_string(),
            GeoPoint {
                lat: position.lat,
                lon: position.lon,
            },
        );
    }

    pub fn get_drone_location(&self, drone_id: &str) -> Option<DroneLocation> {
        self.drone_locations
            .get(drone_id)
            .filter(|entry| entry.value().live())
            .map(|entry| entry.value().value.clone())
    }

    /// Drones within `radius_m` of `center`, nearest first.
    pub fn geo_query(&self, center: GeoPoint, radius_m: f64) -> Vec<(String, f64)> {
        let mut hits: Vec<(String, f64)> = self
            .geo_index
            .iter()
            .filter_map(|entry| {
                let d = haversine_distance(center.lat, center.lon, entry.value().lat, entry.value().lon);
                (d <= radius_m).then(|| (entry.key().clone(), d))
            })
            .collect();
        hits.sort_by(|a, b| a.1.total_cmp(&b.1));
        hits
    }

    // ========== PUB/SUB ==========

    /// Subscribe to channels matching `pattern` (`*` matches one segment).
    pub fn subscribe(&self, pattern: &str) -> broadcast::Receiver<ChannelMessage> {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(existing) = subscribers.iter().find(|s| s.pattern == pattern) {
            return existing.tx.subscribe();
        }
        let (tx, rx) = broadcast::channel(CHANNEL_DEPTH);
        subscribers.push(Subscriber {
            pattern: pattern.to_string(),
            tx,
        });
        rx
    }

    /// Publish `payload` to everyone whose pattern matches `channel`.
    /// Returns the number of matching subscriptions.
    pub fn publish(&self, channel: &str, payload: String) -> usize {
        self.publish_seq.fetch_add(1, Ordering::Relaxed);
        let subscribers = self
            .subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut matched = 0;
        for sub in subscribers.iter() {
            if pattern_matches(&sub.pattern, channel) {
                matched += 1;
                // A send error only means nobody is currently listening.
                let _ = sub.tx.send(ChannelMessage {
                    channel: channel.to_string(),
                    payload: payload.clone(),
                });
            }
        }
        matched
    }

    pub fn publishes(&self) -> u64 {
        self.publish_seq.load(Ordering::Relaxed)
    }

    // ========== COMMAND WINDOWS ==========

    pub fn set_pending(&self, cmd: CommandRecord) {
        self.pending.insert(
            cmd.command_id.clone(),
            Expiring::new(cmd, self.pending_ttl),
        );
    }

    pub fn get_pending(&self, command_id: &str) -> Option<CommandRecord> {
        self.pending
            .get(command_id)
            .filter(|entry| entry.value().live())
            .map(|entry| entry.value().value.clone())
    }

    pub fn remove_pending(&self, command_id: &str) -> Option<CommandRecord> {
        self.pending.remove(command_id).map(|(_, e)| e.value)
    }

    pub fn set_ack(&self, ack: AckRecord) {
        self.acks.insert(
            ack.command_id.clone(),
            Expiring::new(ack, self.ack_ttl),
        );
    }

    pub fn get_ack(&self, command_id: &str) -> Option<AckRecord> {
        self.acks
            .get(command_id)
            .filter(|entry| entry.value().live())
            .map(|entry| entry.value().value.clone())
    }

    /// Claim the per-mission dispatch slot. Returns false when another
    /// command is already in flight for the mission.
    pub fn try_begin_dispatch(&self, mission_id: &str, command_id: &str) -> bool {
        let mut claimed = false;
        let entry = self
            .in_flight
            .entry(mission_id.to_string())
            .and_modify(|existing| {
                if !existing.live() {
                    *existing = Expiring::new(command_id.to_string(), self.pending_ttl);
                    claimed = true;
                }
            })
            .or_insert_with(|| {
                claimed = true;
                Expiring::new(command_id.to_string(), self.pending_ttl)
            });
        drop(entry);
        claimed
    }

    pub fn end_dispatch(&self, mission_id: &str) {
        self.in_flight.remove(mission_id);
    }

    // ========== EXPIRY ==========

    /// Drop expired entries across all TTL'd maps. Returns removals.
    pub fn sweep_expired(&self) -> usize {
        let mut removed = 0;
        removed += sweep(&self.latest_telemetry);
        removed += sweep_with(&self.drone_locations, |drone_id| {
            self.geo_index.remove(drone_id);
        });
        removed += sweep(&self.pending);
        removed += sweep(&self.acks);
        removed += sweep(&self.in_flight);
        removed
    }
}

fn sweep<T>(map: &DashMap<String, Expiring<T>>) -> usize {
    sweep_with(map, |_| {})
}

fn sweep_with<T>(map: &DashMap<String, Expiring<T>>, mut on_remove: impl FnMut(&str)) -> usize {
    let expired: Vec<String> = map
        .iter()
        .filter(|entry| !entry.value().live())
        .map(|entry| entry.key().clone())
        .collect();
    for key in &expired {
        map.remove(key);
        on_remove(key);
    }
    expired.len()
}

/// Segment-wise channel match: `mission:*:telemetry` matches
/// `mission:M1:telemetry`; a lone `*` matches everything.
fn pattern_matches(pattern: &str, channel: &str) -> bool {
    if pattern == "*" || pattern == channel {
        return true;
    }
    let pat: Vec<&str> = pattern.split(':').collect();
    let chan: Vec<&str> = channel.split(':').collect();
    if pat.len() != chan.len() {
        return false;
    }
    pat.iter()
        .zip(chan.iter())
        .all(|(p, c)| *p == "*" || p == c)
}

#[cfg(test)]
mod tests {
    use super::*;
    use skyops_core::models::CommandAction;

    fn record(drone: &str, mission: &str) -> TelemetryRecord {
        TelemetryRecord {
            drone_id: drone.into(),
            mission_id: Some(mission.into()),
            sent_at: Utc::now(),
            position: Position {
                lat: 33.0,
                lon: -117.0,
                alt_m: 50.0,
            },
            velocity: Velocity {
                speed_mps: 5.0,
                heading_deg: 90.0,
            },
            battery_pct: 80.0,
            drone_status: "flying".into(),
            progress_pct: 10.0,
            signal: 90.0,
        }
    }

    fn command(id: &str, mission: &str) -> CommandRecord {
        CommandRecord {
            command_id: id.into(),
            mission_id: mission.into(),
            drone_id: "D1".into(),
            action: CommandAction::Start,
            issued_at: Utc::now(),
            issued_by: "op".into(),
        }
    }

    #[test]
    fn mission_state_merges_fields() {
        let store = LiveStateStore::new();
        store.set_mission_state(
            "M1",
            MissionStateFields {
                status: Some("IN_PROGRESS".into()),
                battery: Some(90.0),
                ..Default::default()
            },
        );
        store.set_mission_state(
            "M1",
            MissionStateFields {
                progress: Some(55.0),
                ..Default::default()
            },
        );
        let state = store.get_mission_state("M1").unwrap();
        assert_eq!(state.status.as_deref(), Some("IN_PROGRESS"));
        assert_eq!(state.battery, Some(90.0));
        assert_eq!(state.progress, Some(55.0));
    }

    #[test]
    fn latest_telemetry_expires() {
        let store = LiveStateStore::with_ttls(
            Duration::from_millis(0),
            Duration::from_secs(30),
            Duration::from_secs(30),
            Duration::from_secs(60),
        );
        store.set_latest_telemetry("M1", record("D1", "M1"));
        assert!(store.get_latest_telemetry("M1").is_none());
    }

    #[test]
    fn geo_query_orders_by_distance() {
        let store = LiveStateStore::new();
        let velocity = Velocity {
            speed_mps: 0.0,
            heading_deg: 0.0,
        };
        store.update_drone_location(
            "near",
            Position {
                lat: 33.0,
                lon: -117.0,
                alt_m: 0.0,
            },
            velocity,
        );
        store.update_drone_location(
            "far",
            Position {
                lat: 33.01,
                lon: -117.0,
                alt_m: 0.0,
            },
            velocity,
        );
        store.update_drone_location(
            "out",
            Position {
                lat: 40.0,
                lon: -117.0,
                alt_m: 0.0,
            },
            velocity,
        );
        let hits = store.geo_query(
            GeoPoint {
                lat: 33.0,
                lon: -117.0,
            },
            5_000.0,
        );
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, "near");
        assert_eq!(hits[1].0, "far");
    }

    #[tokio::test]
    async fn pattern_subscription_receives_matching_publishes() {
        let store = LiveStateStore::new();
        let mut rx = store.subscribe("mission:*:telemetry");
        assert_eq!(store.publish("mission:M1:telemetry", "a".into()), 1);
        assert_eq!(store.publish("drone:D1:status", "b".into()), 0);
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.channel, "mission:M1:telemetry");
        assert_eq!(msg.payload, "a");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn in_flight_guard_blocks_second_dispatch() {
        let store = LiveStateStore::new();
        assert!(store.try_begin_dispatch("M1", "C1"));
        assert!(!store.try_begin_dispatch("M1", "C2"));
        store.end_dispatch("M1");
        assert!(store.try_begin_dispatch("M1", "C3"));
    }

    #[test]
    fn sweep_removes_expired_pending() {
        let store = LiveStateStore::with_ttls(
            Duration::from_secs(60),
            Duration::from_secs(30),
            Duration::from_millis(0),
            Duration::from_secs(60),
        );
        store.set_pending(command("C1", "M1"));
        assert!(store.get_pending("C1").is_none());
        let removed = store.sweep_expired();
        assert!(removed >= 1);
    }

    #[test]
    fn location_sweep_also_clears_geo_index() {
        let store = LiveStateStore::with_ttls(
            Duration::from_secs(60),
            Duration::from_millis(0),
            Duration::from_secs(30),
            Duration::from_secs(60),
        );
        store.update_drone_location(
            "D1",
            Position {
                lat: 33.0,
                lon: -117.0,
                alt_m: 0.0,
            },
            Velocity {
                speed_mps: 0.0,
                heading_deg: 0.0,
            },
        );
        store.sweep_expired();
        assert!(store
            .geo_query(
                GeoPoint {
                    lat: 33.0,
                    lon: -117.0
                },
                1_000_000.0
            )
            .is_empty());
    }
}
