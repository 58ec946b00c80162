//! Skyops server - real-time control and telemetry plane for drone missions.

mod analytics;
mod api;
mod backoff;
mod config;
mod consumer;
mod coordinator;
mod dispatch;
mod error;
mod live;
mod loops;
mod metrics;
mod persistence;
mod processor;
mod state;
mod stream;
mod transport;

use anyhow::{bail, Result};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{extract::State, Json};
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::consumer::ConsumerCore;
use crate::state::{AppState, BackgroundTasks};
use crate::stream::kafka::KafkaStreamWriter;
use crate::transport::MqttTransport;

const SHUTDOWN_BUDGET: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
struct LoopStatus {
    name: &'static str,
    ok: bool,
    age_secs: u64,
    max_age_secs: u64,
    last_tick_secs: Option<u64>,
}

#[derive(Debug, Serialize)]
struct ReadyResponse {
    ok: bool,
    db_ok: bool,
    loops_ok: bool,
    db_latency_ms: Option<u128>,
    loops: Vec<LoopStatus>,
    error: Option<String>,
}

async fn ready_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let now_secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let loop_limits: [(&'static str, u64); 2] = [("analytics", 15), ("expiry", 15)];

    let mut loops = Vec::with_capacity(loop_limits.len());
    let mut loops_ok = true;
    for (name, max_age_secs) in loop_limits {
        let last_tick_secs = state.loop_last_tick_secs(name);
        let (ok, age_secs) = match last_tick_secs {
            Some(last) => {
                let age = now_secs.saturating_sub(last);
                (age <= max_age_secs, age)
            }
            None => (false, u64::MAX),
        };
        if !ok {
            loops_ok = false;
        }
        loops.push(LoopStatus {
            name,
            ok,
            age_secs,
            max_age_secs,
            last_tick_secs,
        });
    }

    let started_at = Instant::now();
    let db_result = tokio::time::timeout(
        Duration::from_millis(750),
        sqlx::query("SELECT 1").execute(state.db().pool()),
    )
    .await;
    let (db_ok, db_error) = match db_result {
        Ok(Ok(_)) => (true, None),
        Ok(Err(err)) => (false, Some(err.to_string())),
        Err(_) => (false, Some("database ping timed out".to_string())),
    };
    let db_latency_ms = Some(started_at.elapsed().as_millis());

    let ok = db_ok && loops_ok;
    let status = if ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let error = if let Some(err) = db_error {
        Some(err)
    } else if !loops_ok {
        let stale = loops
            .iter()
            .filter(|entry| !entry.ok)
            .map(|entry| entry.name)
            .collect::<Vec<_>>()
            .join(",");
        Some(format!("stale loops: {}", stale))
    } else {
        None
    };

    (
        status,
        Json(ReadyResponse {
            ok,
            db_ok,
            loops_ok,
            db_latency_ms,
            loops,
            error,
        }),
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("skyops_server=debug".parse()?);
    let log_format = std::env::var("SKYOPS_LOG_FORMAT").unwrap_or_default();
    if log_format.trim().eq_ignore_ascii_case("json") {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    tracing::info!("Starting Skyops server...");

    let config = Config::from_env();
    if config.jwt_secret.trim().is_empty() {
        bail!("SKYOPS_JWT_SECRET must be set");
    }

    tracing::info!("Initializing database: {}", config.database_path);
    let db =
        persistence::init_database(&config.database_path, config.database_max_connections).await?;
    tracing::info!("Database initialized successfully");

    let (shutdown_tx, _) = broadcast::channel(1);

    // Transport and stream clients; their handles are injected, never global.
    let writer = Arc::new(KafkaStreamWriter::new(&config)?);
    let mqtt = MqttTransport::connect(&config);
    let command_publisher = Arc::new(mqtt.command_publisher());

    let (state, background) = AppState::build(
        config.clone(),
        db.clone(),
        command_publisher,
        writer,
        &shutdown_tx,
    );

    // C1 ingest: decoded records land in the worker pool / dispatcher.
    {
        let sink = state.clone();
        let metrics = state.metrics().clone();
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            mqtt.run_ingest(sink, metrics, shutdown).await;
        });
    }

    // C5: durable stream consumer, supervised like the other loops.
    {
        let consumer_config = config.clone();
        let core_db = db.clone();
        let coordinator = state.coordinator().clone();
        let metrics = state.metrics().clone();
        spawn_supervised_loop("stream-consumer", shutdown_tx.clone(), move |shutdown| {
            let config = consumer_config.clone();
            let core = ConsumerCore::new(core_db.clone(), coordinator.clone());
            let metrics = metrics.clone();
            async move {
                if let Err(err) =
                    stream::kafka::run_telemetry_consumer(&config, core, metrics, shutdown).await
                {
                    tracing::error!("Stream consumer failed: {}", err);
                }
            }
        });
    }

    {
        let state = state.clone();
        spawn_supervised_loop("analytics", shutdown_tx.clone(), move |shutdown| {
            loops::analytics_loop::run_analytics_loop(state.clone(), shutdown)
        });
    }
    {
        let state = state.clone();
        spawn_supervised_loop("expiry", shutdown_tx.clone(), move |shutdown| {
            loops::expiry_loop::run_expiry_loop(state.clone(), shutdown)
        });
    }

    state.ws_hub().start_global_bridges(&shutdown_tx);

    let app = api::router(state.clone()).route("/health", get(|| async { "OK" }));
    let app = app.merge(
        axum::Router::new()
            .route("/ready", get(ready_handler))
            .with_state(state.clone()),
    );

    let app = if config.allowed_origins.is_empty() {
        tracing::warn!("No CORS origins configured - CORS disabled (same-origin only)");
        app
    } else {
        let origins: Vec<HeaderValue> = config
            .allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        app.layer(
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
                .allow_headers(Any),
        )
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown(&shutdown_tx, state, background).await;
    Ok(())
}

/// Ordered teardown: stop ingress and drain workers, flush the stream,
/// cancel pending command waits, close sockets. Hard budget, then exit.
async fn shutdown(
    shutdown_tx: &broadcast::Sender<()>,
    state: Arc<AppState>,
    background: BackgroundTasks,
) {
    tracing::info!("Shutting down (budget {:?})", SHUTDOWN_BUDGET);
    let _ = shutdown_tx.send(());
    state.dispatcher().cancel_all();
    state.ws_hub().close_all();

    let drain = async {
        for handle in background.telemetry_workers {
            let _ = handle.await;
        }
        let _ = background.stream_flusher.await;
    };
    if tokio::time::timeout(SHUTDOWN_BUDGET, drain).await.is_err() {
        tracing::error!("Shutdown budget exceeded; exiting unclean");
        std::process::exit(1);
    }
    tracing::info!("Shutdown complete");
}

fn spawn_supervised_loop<F, Fut>(
    name: &'static str,
    shutdown_tx: broadcast::Sender<()>,
    make_future: F,
) where
    F: Fn(broadcast::Receiver<()>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut shutdown_rx = shutdown_tx.subscribe();
        loop {
            let task_shutdown = shutdown_tx.subscribe();
            let handle = tokio::spawn(make_future(task_shutdown));
            tokio::pin!(handle);
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    handle.as_mut().abort();
                    break;
                }
                result = &mut handle => {
                    match result {
                        Ok(_) => tracing::warn!("{} loop exited unexpectedly", name),
                        Err(err) => tracing::error!("{} loop crashed: {}", name, err),
                    }
                }
            }

            if shutdown_rx.try_recv().is_ok() {
                break;
            }

            tracing::warn!("Restarting {} loop in 1s", name);
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    });
}

#[cfg(unix)]
async fn shutdown_signal() {
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {},
                _ = sigterm.recv() => {},
            }
        }
        Err(err) => {
            tracing::warn!("Failed to install SIGTERM handler (CTRL-C only): {}", err);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
    tracing::info!("Shutdown signal received");
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Shutdown signal received");
}
