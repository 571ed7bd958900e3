mod config;
mod experiments;
mod inventory;
mod mqtt;
mod state;
mod web;

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::{env, sync::Arc, time::Duration};
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use vessel_unit::cache::Cache;
use vessel_unit::pubsub::mqtt::MqttConnector;
use vessel_unit::pubsub::{ConnectOptions, Connector, Credentials};

use experiments::Experiments;
use mqtt::Leader;
use state::ClusterState;

fn env_path(var: &str, default: &str) -> PathBuf {
    env::var(var).map_or_else(|_| PathBuf::from(default), PathBuf::from)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let shared_path = env_path("CONFIG_PATH", "/etc/vessel/config.toml");
    let units_dir = env_path("UNIT_CONFIG_DIR", "/etc/vessel/units");
    let inventory_path = env_path("INVENTORY_PATH", "/etc/vessel/inventory.toml");
    let cache_path = env_path("LEADER_CACHE", "/var/lib/vessel/leader.sqlite");
    let web_port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    // ── Inventory + config, validated before anything is published ──
    let inventory = inventory::load(&inventory_path)?;
    let cluster_config = config::load(&shared_path, &units_dir)?;
    cluster_config.validate(inventory.units.iter().map(|u| u.name.as_str()))?;
    let leader_config = vessel_unit::config::from_layers([cluster_config.shared.clone()])?;
    info!(
        units = inventory.units.len(),
        active = inventory.active_units().count(),
        overrides = cluster_config.units.len(),
        "cluster config loaded"
    );

    // ── Experiments ─────────────────────────────────────────────────
    let cache = Cache::open(&cache_path)
        .await
        .with_context(|| format!("failed to open {}", cache_path.display()))?;
    let experiments = Experiments::open(cache).await?;

    // ── Bus ─────────────────────────────────────────────────────────
    let host = env::var("MQTT_HOST").unwrap_or_else(|_| leader_config.mqtt.host.clone());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(leader_config.mqtt.port);
    let mut connector = MqttConnector::new(host.clone(), port);
    connector.keep_alive = Duration::from_secs(leader_config.mqtt.keep_alive_secs);
    connector.connect_timeout = Duration::from_secs(leader_config.mqtt.connect_timeout_secs);
    if let (Some(username), Some(password)) = (
        leader_config.mqtt.username.clone(),
        leader_config.mqtt.password.clone(),
    ) {
        connector.credentials = Some(Credentials { username, password });
    }
    let conn = connector
        .connect(ConnectOptions::new("vessel-leader"))
        .await
        .with_context(|| format!("failed to connect to broker {host}:{port}"))?;

    cluster_config.publish(conn.transport.as_ref()).await?;
    inventory::publish(conn.transport.as_ref(), &inventory).await?;
    experiments.publish(conn.transport.as_ref()).await?;

    // ── Shared state (ephemeral, for the status api) ────────────────
    let mut st = ClusterState::new(&inventory);
    st.latest_experiment = experiments.latest().cloned();
    st.record_system(format!("leader started, broker {host}:{port}"));
    match experiments.latest() {
        Some(l) => info!(experiment = %l.experiment, "active experiment"),
        None => warn!("no experiment yet; units fall back to their default"),
    }
    let shared = Arc::new(RwLock::new(st));

    let leader = Leader {
        transport: conn.transport,
        experiments,
        state: Arc::clone(&shared),
    };
    leader.subscribe().await?;

    tokio::select! {
        r = web::serve(Arc::clone(&shared), web_port) => {
            r?;
        }
        _ = leader.run(conn.inbox) => {
            error!("bus connection closed");
        }
        r = tokio::signal::ctrl_c() => {
            r.context("failed to listen for ctrl-c")?;
            info!("interrupted");
        }
    }
    Ok(())
}
