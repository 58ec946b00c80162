//! Server configuration from environment.

use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub server_port: u16,
    /// MQTT broker for drone telemetry/acks/commands.
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_client_id: String,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    /// Kafka-compatible broker list for the durable stream topics.
    pub stream_brokers: String,
    pub stream_sasl_username: Option<String>,
    pub stream_sasl_password: Option<String>,
    pub database_path: String,
    pub database_max_connections: u32,
    pub jwt_secret: String,
    /// Hard deadline for command ack waits.
    pub command_timeout: Duration,
    /// Samples older than this at receipt are rejected.
    pub stale_threshold: Duration,
    /// Telemetry worker pool size; 0 means `available_parallelism * 2`.
    pub telemetry_workers: usize,
    pub allowed_origins: Vec<String>,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            server_port: env_parse("SKYOPS_PORT", 4000),
            mqtt_host: env::var("SKYOPS_MQTT_HOST").unwrap_or_else(|_| "localhost".to_string()),
            mqtt_port: env_parse("SKYOPS_MQTT_PORT", 1883),
            mqtt_client_id: env::var("SKYOPS_MQTT_CLIENT_ID")
                .unwrap_or_else(|_| "skyops-server".to_string()),
            mqtt_username: env::var("SKYOPS_MQTT_USERNAME").ok(),
            mqtt_password: env::var("SKYOPS_MQTT_PASSWORD").ok(),
            stream_brokers: env::var("SKYOPS_STREAM_BROKERS")
                .unwrap_or_else(|_| "localhost:9092".to_string()),
            stream_sasl_username: env::var("SKYOPS_STREAM_SASL_USERNAME").ok(),
            stream_sasl_password: env::var("SKYOPS_STREAM_SASL_PASSWORD").ok(),
            database_path: env::var("SKYOPS_DB_PATH").unwrap_or_else(|_| "data/skyops.db".to_string()),
            database_max_connections: env_parse("SKYOPS_DB_MAX_CONNECTIONS", 5),
            jwt_secret: env::var("SKYOPS_JWT_SECRET").unwrap_or_default(),
            command_timeout: Duration::from_secs(env_parse("SKYOPS_COMMAND_TIMEOUT_SECS", 30)),
            stale_threshold: Duration::from_secs(env_parse("SKYOPS_STALE_THRESHOLD_SECS", 60)),
            telemetry_workers: env_parse("SKYOPS_TELEMETRY_WORKERS", 0),
            allowed_origins: env::var("SKYOPS_ALLOWED_ORIGINS")
                .map(|raw| {
                    raw.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
        }
    }

    /// Effective telemetry worker count.
    pub fn worker_count(&self) -> usize {
        if self.telemetry_workers > 0 {
            return self.telemetry_workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get() * 2)
            .unwrap_or(4)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}
