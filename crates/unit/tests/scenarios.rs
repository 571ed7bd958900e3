//! End-to-end job scenarios against the in-memory broker and the simulated
//! bioreactor, driven the way the command line drives them: by job name.

#![cfg(feature = "sim")]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use vessel_unit::cache::{Cache, Caches};
use vessel_unit::calibration::{self, Calibration, Polynomial};
use vessel_unit::cluster::ClusterView;
use vessel_unit::config::Config;
use vessel_unit::estimators::dosing::{DosingEvent, Ledger, Pump};
use vessel_unit::hardware::sim::SimBioreactor;
use vessel_unit::job::JobEnv;
use vessel_unit::jobs::{self, dosing::DosingState};
use vessel_unit::pubsub::memory::MemoryBroker;
use vessel_unit::state::JobState;

async fn sim_env(broker: &MemoryBroker, config: Config) -> (JobEnv, SimBioreactor) {
    let sim = SimBioreactor::from_config(&config);
    let env = JobEnv {
        unit: "unit1".into(),
        experiment: "exp1".into(),
        connector: Arc::new(broker.clone()),
        caches: Caches::in_memory().await.unwrap(),
        config: Arc::new(config),
        cluster: ClusterView::new("unit1"),
        hardware: Arc::new(sim.clone()),
    };
    (env, sim)
}

fn args(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

/// Linear pumps at the simulator's 0.1 mL/s.
async fn calibrate_pumps(cache: &Cache) {
    for pump in [Pump::Media, Pump::AltMedia, Pump::Waste] {
        let cal = Calibration::new(
            "linear",
            pump.device(),
            Polynomial::new(vec![0.0, 0.1]),
            "s",
            "mL",
        );
        calibration::save(cache, &cal).await.unwrap();
        calibration::set_active(cache, pump.device(), "linear")
            .await
            .unwrap();
    }
}

// -- stirring ---------------------------------------------------------------

#[tokio::test]
async fn stirring_sleeps_and_resumes() {
    let broker = MemoryBroker::new();
    let mut config = Config::default();
    config.stirring.use_rpm = false;
    let (env, sim) = sim_env(&broker, config).await;
    tokio::time::pause();

    let handle = jobs::start(&env, "stirring", &args(&[("duty_cycle", "40")]))
        .await
        .unwrap();
    assert_eq!(sim.stirrer_duty(), 40.0);

    broker.inject("unit1/exp1/stirring/$state/set", b"sleeping", false);
    settle().await;
    assert_eq!(handle.state(), JobState::Sleeping);
    assert_eq!(sim.stirrer_duty(), 0.0);
    assert_eq!(
        broker.retained_str("unit1/exp1/stirring/$state").as_deref(),
        Some("sleeping")
    );

    // changed while asleep: remembered, not applied
    handle.set("duty_cycle", "55").await.unwrap();
    assert_eq!(sim.stirrer_duty(), 0.0);

    broker.inject("unit1/exp1/stirring/$state/set", b"ready", false);
    settle().await;
    assert_eq!(handle.state(), JobState::Ready);
    assert_eq!(sim.stirrer_duty(), 55.0);

    handle.disconnect().await.unwrap();
    assert_eq!(sim.stirrer_duty(), 0.0);
    assert_eq!(
        broker.retained_str("unit1/exp1/stirring/$state").as_deref(),
        Some("disconnected")
    );
}

#[tokio::test]
async fn unknown_job_names_are_refused() {
    let broker = MemoryBroker::new();
    let (env, _sim) = sim_env(&broker, Config::default()).await;
    tokio::time::pause();
    let err = jobs::start(&env, "harvesting", &BTreeMap::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("harvesting"));
    assert!(jobs::start(&env, "stirring", &args(&[("duty_cycle", "fast")]))
        .await
        .is_err());
}

// -- supervision ------------------------------------------------------------

#[tokio::test]
async fn controller_disconnects_its_automation_first() {
    let broker = MemoryBroker::new();
    let (env, _sim) = sim_env(&broker, Config::default()).await;
    tokio::time::pause();
    let handle = jobs::start(&env, "dosing_control", &BTreeMap::new())
        .await
        .unwrap();
    assert_eq!(
        broker
            .retained_str("unit1/exp1/dosing_automation/$state")
            .as_deref(),
        Some("ready")
    );

    handle.disconnect().await.unwrap();
    let history = broker.history();
    let disconnected_at = |topic: &str| {
        history
            .iter()
            .position(|m| m.topic == topic && m.payload == b"disconnected")
            .unwrap_or_else(|| panic!("{topic} never disconnected"))
    };
    assert!(
        disconnected_at("unit1/exp1/dosing_automation/$state")
            < disconnected_at("unit1/exp1/dosing_control/$state")
    );
}

#[tokio::test]
async fn parent_loss_is_visible_to_observers() {
    let broker = MemoryBroker::new();
    let (env, _sim) = sim_env(&broker, Config::default()).await;
    tokio::time::pause();
    let handle = jobs::start(&env, "led_control", &BTreeMap::new())
        .await
        .unwrap();
    broker.kill(handle.client_id());
    assert_eq!(handle.wait().await, JobState::Lost);
    assert_eq!(
        broker.retained_str("unit1/exp1/led_control/$state").as_deref(),
        Some("lost")
    );
}

// -- dosing -----------------------------------------------------------------

#[tokio::test]
async fn add_media_moves_alt_media_toward_target() {
    let broker = MemoryBroker::new();
    let (env, _sim) = sim_env(&broker, Config::default()).await;
    tokio::time::pause();
    calibrate_pumps(&env.caches.persistent).await;
    // 10 mL added so far, 30% of it alt media; target is half
    let stored = DosingState {
        ledger: Ledger {
            media_ul: 7000,
            alt_media_ul: 3000,
            waste_ul: 10000,
        },
        vial_volume_ml: 14.0,
        alt_media_fraction: 0.3,
        target_alt_media_fraction: 0.5,
    };
    env.caches
        .persistent
        .set_json("dosing/unit1/exp1", &stored)
        .await
        .unwrap();

    let handle = jobs::start(&env, "dosing_automation", &BTreeMap::new())
        .await
        .unwrap();
    handle
        .set("manual_dose", r#"{"event":"add_media","volume":1.0}"#)
        .await
        .unwrap();

    let events: Vec<DosingEvent> = broker
        .published_to("unit1/exp1/dosing_events")
        .iter()
        .map(|m| serde_json::from_slice(&m.payload).unwrap())
        .collect();
    let additions: Vec<&DosingEvent> = events.iter().filter(|e| e.event != "remove_waste").collect();
    assert_eq!(additions.len(), 2);
    for e in &additions {
        assert_eq!(e.event, "add_alt_media");
        assert!((e.volume_change - 0.5).abs() < 1e-9);
        assert!(e.volume_change <= 0.75);
        assert_eq!(e.source_of_event, "manually");
    }
    let removed: f64 = events
        .iter()
        .filter(|e| e.event == "remove_waste")
        .map(|e| -e.volume_change)
        .sum();
    assert!((removed - 1.0).abs() < 1e-9, "removed {removed}");

    let published = |attr: &str| -> f64 {
        broker
            .retained_str(&format!("unit1/exp1/dosing_automation/{attr}"))
            .unwrap()
            .parse()
            .unwrap()
    };
    assert!((published("alt_media_throughput") - 4.0).abs() < 1e-9);
    assert!((published("media_throughput") - 7.0).abs() < 1e-9);
    assert!((published("vial_volume") - 14.0).abs() < 1e-9);
    let fraction = published("alt_media_fraction");
    assert!(fraction > 0.3 && fraction < 0.5, "alt fraction {fraction}");

    let after: DosingState = env
        .caches
        .persistent
        .get_json("dosing/unit1/exp1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(after.ledger.alt_media_ul, 4000);
    assert_eq!(after.ledger.waste_ul, 11000);
    handle.disconnect().await.unwrap();
}
