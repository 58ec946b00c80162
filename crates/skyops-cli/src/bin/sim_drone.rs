//! Simulated drone: publishes wire-format telemetry over MQTT and
//! acknowledges commands, for end-to-end demos against a live broker.

use anyhow::Result;
use clap::Parser;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde_json::json;
use std::time::Duration;

use skyops_core::models::{AckStatus, CommandRecord, GeoPoint};
use skyops_core::spatial::destination_point;

/// Fly a simulated drone against the Skyops broker
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// MQTT broker host
    #[arg(long, default_value = "localhost")]
    host: String,

    /// MQTT broker port
    #[arg(long, default_value_t = 1883)]
    port: u16,

    /// Drone identifier
    #[arg(long, default_value = "DRONE001")]
    drone: String,

    /// Mission the telemetry reports against (empty = idle)
    #[arg(long, default_value = "")]
    mission: String,

    /// Start latitude
    #[arg(long, default_value_t = 33.6846)]
    lat: f64,

    /// Start longitude
    #[arg(long, default_value_t = -117.8265)]
    lon: f64,

    /// Cruise altitude in meters
    #[arg(long, default_value_t = 60.0)]
    altitude: f64,

    /// Cruise speed in m/s
    #[arg(long, default_value_t = 8.0)]
    speed: f64,

    /// Duration in seconds
    #[arg(long, default_value_t = 120)]
    duration: u64,

    /// Update rate in Hz
    #[arg(long, default_value_t = 1.0)]
    rate: f64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let client_id = format!("sim-{}", args.drone);
    let mut options = MqttOptions::new(client_id, args.host.clone(), args.port);
    options.set_keep_alive(Duration::from_secs(15));
    let (client, mut event_loop) = AsyncClient::new(options, 64);

    let command_topic = format!("drones/{}/commands", args.drone);
    let telemetry_topic = format!("drones/{}/telemetry", args.drone);
    let ack_topic = format!("drones/{}/ack", args.drone);

    // Ack every command we receive; the server treats us as authoritative.
    {
        let client = client.clone();
        let drone = args.drone.clone();
        let command_topic = command_topic.clone();
        let ack_topic = ack_topic.clone();
        tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        tracing::info!("{} connected to broker", drone);
                        if let Err(err) =
                            client.subscribe(&command_topic, QoS::AtLeastOnce).await
                        {
                            tracing::error!("subscribe failed: {}", err);
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let Ok(cmd) =
                            serde_json::from_slice::<CommandRecord>(&publish.payload)
                        else {
                            tracing::warn!("undecodable command payload");
                            continue;
                        };
                        tracing::info!("{} acking {} {:?}", drone, cmd.command_id, cmd.action);
                        let ack = json!({
                            "cmd_id": cmd.command_id,
                            "status": AckStatus::Accepted,
                        });
                        if let Err(err) = client
                            .publish(&ack_topic, QoS::AtLeastOnce, false, ack.to_string())
                            .await
                        {
                            tracing::error!("ack publish failed: {}", err);
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!("connection error: {} (retrying)", err);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });
    }

    let ticks = (args.duration as f64 * args.rate).ceil() as u64;
    let interval = Duration::from_secs_f64(1.0 / args.rate.max(0.1));
    let mut position = GeoPoint {
        lat: args.lat,
        lon: args.lon,
    };
    let mut battery = 100.0_f64;

    for tick in 0..ticks {
        // Drift eastward at cruise speed, slowly draining the battery.
        position = destination_point(position, 90.0, args.speed * interval.as_secs_f64());
        battery = (battery - 0.02).max(0.0);
        let progress = (tick as f64 / ticks as f64 * 100.0).min(100.0);

        let sample = json!({
            "mission_id": args.mission,
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "lat": position.lat,
            "lon": position.lon,
            "alt": args.altitude,
            "speed": args.speed,
            "heading": 90.0,
            "battery": battery,
            "status": if args.mission.is_empty() { "idle" } else { "flying" },
            "progress": progress,
            "signal": 92.0,
        });
        client
            .publish(&telemetry_topic, QoS::AtLeastOnce, false, sample.to_string())
            .await?;
        tokio::time::sleep(interval).await;
    }

    tracing::info!("{} finished after {} samples", args.drone, ticks);
    client.disconnect().await?;
    Ok(())
}
