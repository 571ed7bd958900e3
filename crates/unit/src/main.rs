//! `vessel-unit`: runs one job on this unit until it disconnects or the
//! process is interrupted.
//!
//! ```text
//! vessel-unit [--local] run <job> [key=value ...]
//! ```
//!
//! `--local` uses an in-process broker and in-memory caches, for trying a
//! job out on a machine with no broker.

use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use vessel_unit::cache::Caches;
use vessel_unit::cluster::{self, ClusterView};
use vessel_unit::config;
use vessel_unit::hardware;
use vessel_unit::job::JobEnv;
use vessel_unit::jobs;
use vessel_unit::logs::{self, BusLogLayer};
use vessel_unit::pubsub::memory::MemoryBroker;
use vessel_unit::pubsub::mqtt::MqttConnector;
use vessel_unit::pubsub::{ConnectOptions, Credentials, SharedConnector};

#[derive(Debug, PartialEq)]
struct Args {
    local: bool,
    job: String,
    params: BTreeMap<String, String>,
}

fn usage() -> String {
    format!(
        "usage: vessel-unit [--local] run <job> [key=value ...]\njobs: {}",
        jobs::JOB_NAMES.join(", ")
    )
}

fn parse_args<I: IntoIterator<Item = String>>(args: I) -> Result<Args> {
    let mut local = false;
    let mut rest = Vec::new();
    for a in args {
        if a == "--local" {
            local = true;
        } else {
            rest.push(a);
        }
    }
    let mut rest = rest.into_iter();
    match rest.next().as_deref() {
        Some("run") => {}
        _ => bail!(usage()),
    }
    let Some(job) = rest.next() else {
        bail!(usage());
    };
    let mut params = BTreeMap::new();
    for kv in rest {
        let Some((k, v)) = kv.split_once('=') else {
            bail!("expected key=value, got '{kv}'\n{}", usage());
        };
        params.insert(k.to_string(), v.to_string());
    }
    Ok(Args { local, job, params })
}

fn env_path(var: &str, default: &str) -> PathBuf {
    env::var(var).map_or_else(|_| PathBuf::from(default), PathBuf::from)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args(env::args().skip(1))?;

    let (bus_layer, log_rx) = BusLogLayer::new();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .with(bus_layer)
        .init();

    let unit = env::var("UNIT_NAME").unwrap_or_else(|_| "unit1".to_string());
    let shared_path = env_path("CONFIG_PATH", "/etc/vessel/config.toml");
    let unit_path = env_path("UNIT_CONFIG_PATH", "/etc/vessel/unit_config.toml");

    // Local files first: they say where the broker is.
    let local_config = config::load(Some(&shared_path), Some(&unit_path), None)?;
    let host = env::var("MQTT_HOST").unwrap_or_else(|_| local_config.mqtt.host.clone());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(local_config.mqtt.port);

    let connector: SharedConnector = if args.local {
        Arc::new(MemoryBroker::new())
    } else {
        let mut c = MqttConnector::new(host.clone(), port);
        c.keep_alive = Duration::from_secs(local_config.mqtt.keep_alive_secs);
        c.connect_timeout = Duration::from_secs(local_config.mqtt.connect_timeout_secs);
        if let (Some(username), Some(password)) = (
            local_config.mqtt.username.clone(),
            local_config.mqtt.password.clone(),
        ) {
            c.credentials = Some(Credentials { username, password });
        }
        Arc::new(c)
    };

    let settle = Duration::from_millis(local_config.cluster.settle_ms);
    let view = match cluster::fetch(connector.as_ref(), &unit, settle).await {
        Ok(v) => v,
        Err(e) => {
            warn!("no cluster documents from the leader: {e}");
            ClusterView::new(unit.clone())
        }
    };
    let config = config::load(Some(&shared_path), Some(&unit_path), Some(&view))?;
    let experiment = view
        .latest_experiment()
        .unwrap_or_else(|| config.cluster.default_experiment.clone());

    let caches = if args.local {
        Caches::in_memory().await?
    } else {
        Caches::open(&config.storage.persistent, &config.storage.intermittent)
            .await
            .context("failed to open caches")?
    };

    let log_conn = connector
        .connect(ConnectOptions::new(format!(
            "{unit}_logs_{}",
            std::process::id()
        )))
        .await
        .context("failed to connect log forwarder")?;
    tokio::spawn(logs::forward(
        log_rx,
        log_conn.transport,
        unit.clone(),
        experiment.clone(),
    ));

    info!(%unit, %experiment, broker = %host, port, job = %args.job, "starting");
    let env = JobEnv {
        unit,
        experiment,
        connector,
        caches,
        hardware: hardware::default_provider(&config),
        config: Arc::new(config),
        cluster: view,
    };
    let handle = jobs::start(&env, &args.job, &args.params).await?;

    tokio::select! {
        state = handle.wait() => info!(%state, "job ended"),
        r = tokio::signal::ctrl_c() => {
            r.context("failed to listen for ctrl-c")?;
            info!("interrupted, disconnecting");
            handle.disconnect().await?;
        }
    }
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
