//! WebSocket fan-out: authenticated dashboard sessions, room
//! subscriptions, and bridges from live-state channels to sockets.
//!
//! Per-room telemetry/status bridges are reference-counted: the first
//! subscriber establishes the live-state subscription, the last one tears
//! it down. The analytics and alert channels are bridged once, process
//! wide, and routed by payload.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
};
use dashmap::DashMap;
use futures::{sink::SinkExt, stream::StreamExt};
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::AbortHandle;

use crate::analytics::{CHANNEL_DRONE_METRICS, CHANNEL_FLEET_STATUS, CHANNEL_MISSION_PROGRESS};
use crate::api::auth::{verify_token, Claims};
use crate::live::{LiveStateStore, CHANNEL_SYSTEM_ALERTS};
use crate::metrics::Metrics;
use crate::state::AppState;

const PING_INTERVAL: Duration = Duration::from_secs(25);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

struct Session {
    tx: mpsc::UnboundedSender<Message>,
}

struct Bridge {
    abort: AbortHandle,
}

/// Room registry and channel bridging for all connected sockets.
pub struct WsHub {
    live: Arc<LiveStateStore>,
    metrics: Arc<Metrics>,
    sessions: DashMap<u64, Session>,
    rooms: DashMap<String, HashSet<u64>>,
    bridges: DashMap<String, Bridge>,
    session_seq: AtomicU64,
}

impl WsHub {
    pub fn new(live: Arc<LiveStateStore>, metrics: Arc<Metrics>) -> Self {
        Self {
            live,
            metrics,
            sessions: DashMap::new(),
            rooms: DashMap::new(),
            bridges: DashMap::new(),
            session_seq: AtomicU64::new(1),
        }
    }

    pub fn register_session(self: &Arc<Self>, tx: mpsc::UnboundedSender<Message>) -> u64 {
        let session_id = self.session_seq.fetch_add(1, Ordering::SeqCst);
        self.sessions.insert(session_id, Session { tx });
        Metrics::incr(&self.metrics.ws_sessions);
        session_id
    }

    pub fn unregister_session(self: &Arc<Self>, session_id: u64) {
        self.sessions.remove(&session_id);
        let rooms: Vec<String> = self
            .rooms
            .iter()
            .filter(|entry| entry.value().contains(&session_id))
            .map(|entry| entry.key().clone())
            .collect();
        for room in rooms {
            self.leave(session_id, &room);
        }
    }

    /// Join a room; the first member of a mission/drone room starts the
    /// matching live-state bridge.
    pub fn join(self: &Arc<Self>, session_id: u64, room: &str) {
        let mut members = self.rooms.entry(room.to_string()).or_default();
        if !members.insert(session_id) {
            return;
        }
        let first = members.len() == 1;
        drop(members);

        if first {
            if let Some((channel, event)) = room_channel(room) {
                self.start_bridge(room, &channel, event);
            }
        }
    }

    pub fn leave(self: &Arc<Self>, session_id: u64, room: &str) {
        let mut empty = false;
        if let Some(mut members) = self.rooms.get_mut(room) {
            members.remove(&session_id);
            empty = members.is_empty();
        }
        if empty {
            self.rooms.remove(room);
            if let Some((_, bridge)) = self.bridges.remove(room) {
                bridge.abort.abort();
            }
        }
    }

    /// Deliver an event frame to every session in the room.
    pub fn emit_room(&self, room: &str, event: &str, payload: &str) {
        let Some(members) = self.rooms.get(room) else {
            return;
        };
        let data: serde_json::Value = serde_json::from_str(payload)
            .unwrap_or_else(|_| serde_json::Value::String(payload.to_string()));
        let frame = serde_json::json!({ "event": event, "data": data }).to_string();
        for session_id in members.iter() {
            if let Some(session) = self.sessions.get(session_id) {
                if session.tx.send(Message::Text(frame.clone())).is_ok() {
                    Metrics::incr(&self.metrics.ws_messages_sent);
                }
            }
        }
    }

    /// Emit to every connected session regardless of room.
    fn emit_all(&self, event: &str, payload: &str) {
        let data: serde_json::Value = serde_json::from_str(payload)
            .unwrap_or_else(|_| serde_json::Value::String(payload.to_string()));
        let frame = serde_json::json!({ "event": event, "data": data }).to_string();
        for session in self.sessions.iter() {
            if session.value().tx.send(Message::Text(frame.clone())).is_ok() {
                Metrics::incr(&self.metrics.ws_messages_sent);
            }
        }
    }

    fn start_bridge(self: &Arc<Self>, room: &str, channel: &str, event: &'static str) {
        let mut rx = self.live.subscribe(channel);
        let hub = self.clone();
        let room = room.to_string();
        let task_room = room.clone();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(msg) => hub.emit_room(&task_room, event, &msg.payload),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("WS bridge for {} lagged by {}", task_room, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.bridges.insert(
            room,
            Bridge {
                abort: handle.abort_handle(),
            },
        );
    }

    /// Process-wide bridges for the analytics and alert channels; these
    /// route by payload instead of per-room subscriptions.
    pub fn start_global_bridges(self: &Arc<Self>, shutdown: &broadcast::Sender<()>) {
        self.spawn_routed_bridge(CHANNEL_DRONE_METRICS, shutdown, |hub, payload| {
            route_by_field(hub, payload, "droneId", "drone", "drone_metrics");
        });
        self.spawn_routed_bridge(CHANNEL_MISSION_PROGRESS, shutdown, |hub, payload| {
            route_by_field(hub, payload, "missionId", "mission", "mission_progress");
        });
        self.spawn_routed_bridge(CHANNEL_FLEET_STATUS, shutdown, |hub, payload| {
            route_by_field(hub, payload, "orgId", "org", "fleet_status");
        });
        self.spawn_routed_bridge(CHANNEL_SYSTEM_ALERTS, shutdown, |hub, payload| {
            // Alerts go to the owning org when identifiable, else everyone.
            let value: serde_json::Value = serde_json::from_str(payload).unwrap_or_default();
            match value.get("orgId").and_then(|v| v.as_str()) {
                Some(org_id) => hub.emit_room(&format!("org:{}", org_id), "alert", payload),
                None => hub.emit_all("alert", payload),
            }
        });
    }

    fn spawn_routed_bridge(
        self: &Arc<Self>,
        channel: &str,
        shutdown: &broadcast::Sender<()>,
        route: impl Fn(&WsHub, &str) + Send + Sync + 'static,
    ) {
        let mut rx = self.live.subscribe(channel);
        let mut shutdown_rx = shutdown.subscribe();
        let hub = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    result = rx.recv() => match result {
                        Ok(msg) => route(&hub, &msg.payload),
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });
    }

    /// Close every socket with a normal close code (graceful shutdown).
    pub fn close_all(&self) {
        for session in self.sessions.iter() {
            let _ = session.value().tx.send(Message::Close(Some(CloseFrame {
                code: close_code::NORMAL,
                reason: "server shutting down".into(),
            })));
        }
    }

    #[cfg(test)]
    pub fn room_size(&self, room: &str) -> usize {
        self.rooms.get(room).map(|m| m.len()).unwrap_or(0)
    }
}

fn route_by_field(hub: &WsHub, payload: &str, field: &str, room_kind: &str, event: &str) {
    let value: serde_json::Value = match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(_) => return,
    };
    if let Some(id) = value.get(field).and_then(|v| v.as_str()) {
        hub.emit_room(&format!("{}:{}", room_kind, id), event, payload);
    }
}

/// Channel and event type backing a dynamically bridged room.
fn room_channel(room: &str) -> Option<(String, &'static str)> {
    if let Some(mission_id) = room.strip_prefix("mission:") {
        return Some((
            format!("mission:{}:telemetry", mission_id),
            "telemetry:update",
        ));
    }
    if let Some(drone_id) = room.strip_prefix("drone:") {
        return Some((format!("drone:{}:status", drone_id), "drone:status"));
    }
    None
}

/// Client control message: `subscribe:mission M1`, `unsubscribe:drone D2`.
#[derive(Debug, PartialEq, Eq)]
enum ClientCommand {
    Subscribe(String),
    Unsubscribe(String),
}

fn parse_client_message(text: &str) -> Option<ClientCommand> {
    let mut parts = text.split_whitespace();
    let verb_kind = parts.next()?;
    let id = parts.next()?;
    if id.is_empty() || parts.next().is_some() {
        return None;
    }
    let (verb, kind) = verb_kind.split_once(':')?;
    if !matches!(kind, "mission" | "drone" | "site") {
        return None;
    }
    let room = format!("{}:{}", kind, id);
    match verb {
        "subscribe" => Some(ClientCommand::Subscribe(room)),
        "unsubscribe" => Some(ClientCommand::Unsubscribe(room)),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

/// GET /ws?token=... serves the authenticated dashboard socket.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let claims = query
        .token
        .as_deref()
        .and_then(|token| verify_token(&state.config().jwt_secret, token).ok());
    ws.on_upgrade(move |socket| handle_socket(socket, state, claims))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, claims: Option<Claims>) {
    let (mut sink, mut stream) = socket.split();

    let Some(claims) = claims else {
        let _ = sink
            .send(Message::Close(Some(CloseFrame {
                code: close_code::POLICY,
                reason: "invalid or missing token".into(),
            })))
            .await;
        return;
    };

    let hub = state.ws_hub();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let session_id = hub.register_session(tx.clone());
    hub.join(session_id, &format!("org:{}", claims.org_id));
    tracing::info!(
        "WS session {} connected ({} / org {})",
        session_id,
        claims.sub,
        claims.org_id
    );

    // Writer: everything for this socket funnels through one task.
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if sink.send(message).await.is_err() {
                break;
            }
            if closing {
                break;
            }
        }
    });

    let mut ping = tokio::time::interval(PING_INTERVAL);
    let mut last_heard = Instant::now();

    loop {
        tokio::select! {
            _ = ping.tick() => {
                if last_heard.elapsed() > CLIENT_TIMEOUT {
                    tracing::info!("WS session {} timed out", session_id);
                    break;
                }
                if tx.send(Message::Ping(Vec::new())).is_err() {
                    break;
                }
            }
            maybe_msg = stream.next() => {
                let Some(Ok(message)) = maybe_msg else {
                    break;
                };
                last_heard = Instant::now();
                match message {
                    Message::Text(text) => match parse_client_message(&text) {
                        Some(ClientCommand::Subscribe(room)) => hub.join(session_id, &room),
                        Some(ClientCommand::Unsubscribe(room)) => hub.leave(session_id, &room),
                        None => tracing::debug!("WS session {} sent {:?}", session_id, text),
                    },
                    Message::Close(_) => break,
                    // Pong/Ping/Binary only refresh the liveness clock.
                    _ => {}
                }
            }
        }
    }

    hub.unregister_session(session_id);
    writer.abort();
    tracing::info!("WS session {} disconnected", session_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use skyops_core::models::{Position, TelemetryRecord, Velocity};

    fn hub_fixture() -> (Arc<WsHub>, Arc<LiveStateStore>) {
        let live = Arc::new(LiveStateStore::new());
        let hub = Arc::new(WsHub::new(live.clone(), Arc::new(Metrics::new())));
        (hub, live)
    }

    fn frame(msg: Message) -> serde_json::Value {
        match msg {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected text frame, got {:?}", other),
        }
    }

    #[test]
    fn parses_subscribe_messages() {
        assert_eq!(
            parse_client_message("subscribe:mission M1"),
            Some(ClientCommand::Subscribe("mission:M1".into()))
        );
        assert_eq!(
            parse_client_message("unsubscribe:drone D2"),
            Some(ClientCommand::Unsubscribe("drone:D2".into()))
        );
        assert_eq!(
            parse_client_message("subscribe:site S1"),
            Some(ClientCommand::Subscribe("site:S1".into()))
        );
        assert!(parse_client_message("subscribe:org O1").is_none());
        assert!(parse_client_message("subscribe:mission").is_none());
        assert!(parse_client_message("hello").is_none());
    }

    #[tokio::test]
    async fn emit_room_reaches_only_members() {
        let (hub, _live) = hub_fixture();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = hub.register_session(tx_a);
        let _b = hub.register_session(tx_b);
        hub.join(a, "mission:M1");

        hub.emit_room("mission:M1", "telemetry:update", r#"{"x":1}"#);

        let value = frame(rx_a.try_recv().unwrap());
        assert_eq!(value["event"], "telemetry:update");
        assert_eq!(value["data"]["x"], 1);
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn mission_room_bridges_live_telemetry() {
        let (hub, live) = hub_fixture();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = hub.register_session(tx);
        hub.join(session, "mission:M1");

        let rec = TelemetryRecord {
            drone_id: "D1".into(),
            mission_id: Some("M1".into()),
            sent_at: Utc::now(),
            position: Position {
                lat: 33.0,
                lon: -117.0,
                alt_m: 50.0,
            },
            velocity: Velocity {
                speed_mps: 5.0,
                heading_deg: 0.0,
            },
            battery_pct: 80.0,
            drone_status: "flying".into(),
            progress_pct: 10.0,
            signal: 90.0,
        };
        // Give the bridge task a beat to subscribe, then publish.
        tokio::time::sleep(Duration::from_millis(20)).await;
        live.publish(
            "mission:M1:telemetry",
            serde_json::to_string(&rec).unwrap(),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;

        let value = frame(rx.try_recv().unwrap());
        assert_eq!(value["event"], "telemetry:update");
        assert_eq!(value["data"]["drone_id"], "D1");
    }

    #[tokio::test]
    async fn bridge_stops_when_last_member_leaves() {
        let (hub, live) = hub_fixture();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = hub.register_session(tx);
        hub.join(session, "mission:M1");
        tokio::time::sleep(Duration::from_millis(20)).await;

        hub.leave(session, "mission:M1");
        assert_eq!(hub.room_size("mission:M1"), 0);

        live.publish("mission:M1:telemetry", r#"{"x":1}"#.to_string());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unregister_cleans_rooms() {
        let (hub, _live) = hub_fixture();
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = hub.register_session(tx);
        hub.join(session, "mission:M1");
        hub.join(session, "org:org-1");

        hub.unregister_session(session);
        assert_eq!(hub.room_size("mission:M1"), 0);
        assert_eq!(hub.room_size("org:org-1"), 0);
    }

    #[tokio::test]
    async fn global_bridges_route_by_payload() {
        let (hub, live) = hub_fixture();
        let (shutdown_tx, _) = broadcast::channel(1);
        hub.start_global_bridges(&shutdown_tx);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = hub.register_session(tx);
        hub.join(session, "org:org-1");
        tokio::time::sleep(Duration::from_millis(20)).await;

        live.publish(
            CHANNEL_FLEET_STATUS,
            r#"{"orgId":"org-1","dronesTotal":3}"#.to_string(),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;

        let value = frame(rx.try_recv().unwrap());
        assert_eq!(value["event"], "fleet_status");
        assert_eq!(value["data"]["dronesTotal"], 3);
    }

    #[tokio::test]
    async fn alerts_without_org_reach_everyone() {
        let (hub, live) = hub_fixture();
        let (shutdown_tx, _) = broadcast::channel(1);
        hub.start_global_bridges(&shutdown_tx);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _session = hub.register_session(tx);
        tokio::time::sleep(Duration::from_millis(20)).await;

        live.publish(
            CHANNEL_SYSTEM_ALERTS,
            r#"{"eventType":"BatteryLow","droneId":"D1"}"#.to_string(),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;

        let value = frame(rx.try_recv().unwrap());
        assert_eq!(value["event"], "alert");
        assert_eq!(value["data"]["droneId"], "D1");
    }
}
