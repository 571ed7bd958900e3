//! The jobs a unit can run, and lookup by name for the command line.

pub mod automation;
pub mod controller;
pub mod dosing;
pub mod growth_rate;
pub mod led;
pub mod od_reading;
pub mod stirring;
pub mod temperature;

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::{JobError, Result};
use crate::job::{Job, JobEnv, JobHandle};
use automation::AutomationSpec;

pub const JOB_NAMES: &[&str] = &[
    stirring::Stirring::NAME,
    od_reading::OdReading::NAME,
    growth_rate::GrowthRateCalculating::NAME,
    dosing::DosingControl::NAME,
    temperature::TemperatureControl::NAME,
    led::LedControl::NAME,
    dosing::DosingAutomation::NAME,
    temperature::TemperatureAutomation::NAME,
    led::LedAutomation::NAME,
];

/// `key=value` arguments as an automation spec. `automation_name` picks the
/// automation; every other value is read as JSON when it parses, else kept
/// as a string.
pub fn automation_spec(args: &BTreeMap<String, String>, default: &str) -> AutomationSpec {
    let mut spec = AutomationSpec::new(args.get("automation_name").map_or(default, String::as_str));
    for (k, v) in args.iter().filter(|(k, _)| k.as_str() != "automation_name") {
        let value = serde_json::from_str(v).unwrap_or_else(|_| Value::String(v.clone()));
        spec.args.insert(k.clone(), value);
    }
    spec
}

fn parse_arg<T: std::str::FromStr>(args: &BTreeMap<String, String>, key: &str) -> Result<Option<T>> {
    args.get(key)
        .map(|v| {
            v.parse()
                .map_err(|_| JobError::InvalidArgument(format!("{key}={v}")))
        })
        .transpose()
}

/// Start a job by its published name.
pub async fn start(env: &JobEnv, name: &str, args: &BTreeMap<String, String>) -> Result<JobHandle> {
    let config = &env.config;
    match name {
        n if n == stirring::Stirring::NAME => {
            let mut job = stirring::Stirring::new(&config.stirring)?;
            if let Some(d) = parse_arg::<f64>(args, "duty_cycle")? {
                job = job.with_duty_cycle(d);
            }
            if let Some(rpm) = parse_arg::<f64>(args, "target_rpm")? {
                job = job.with_target_rpm(rpm);
            }
            env.start(job).await
        }
        n if n == od_reading::OdReading::NAME => {
            env.start(od_reading::OdReading::new(&config.od_reading)).await
        }
        n if n == growth_rate::GrowthRateCalculating::NAME => {
            env.start(growth_rate::GrowthRateCalculating::new(&config.growth_rate_kalman))
                .await
        }
        n if n == dosing::DosingControl::NAME => {
            env.start(dosing::DosingControl::new(automation_spec(args, "silent")))
                .await
        }
        n if n == temperature::TemperatureControl::NAME => {
            env.start(temperature::TemperatureControl::new(automation_spec(
                args,
                "only_record_temperature",
            )))
            .await
        }
        n if n == led::LedControl::NAME => {
            env.start(led::LedControl::new(automation_spec(args, "silent"))).await
        }
        n if n == dosing::DosingAutomation::NAME => {
            env.start(dosing::DosingAutomation::from_spec(
                &automation_spec(args, "silent"),
                config,
            )?)
            .await
        }
        n if n == temperature::TemperatureAutomation::NAME => {
            env.start(temperature::TemperatureAutomation::from_spec(
                &automation_spec(args, "only_record_temperature"),
                config,
            )?)
            .await
        }
        n if n == led::LedAutomation::NAME => {
            env.start(led::LedAutomation::from_spec(&automation_spec(args, "silent"), config)?)
                .await
        }
        other => Err(JobError::InvalidArgument(format!(
            "unknown job '{other}', expected one of: {}",
            JOB_NAMES.join(", ")
        ))),
    }
}

#[cfg(all(test, feature = "sim"))]
pub(crate) mod testing {
    use std::sync::Arc;

    use crate::cache::Caches;
    use crate::cluster::ClusterView;
    use crate::config::Config;
    use crate::hardware::sim::SimBioreactor;
    use crate::job::JobEnv;
    use crate::pubsub::memory::MemoryBroker;

    pub async fn sim_env(broker: &MemoryBroker) -> (JobEnv, SimBioreactor) {
        sim_env_with(broker, Config::default()).await
    }

    pub async fn sim_env_with(broker: &MemoryBroker, config: Config) -> (JobEnv, SimBioreactor) {
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

    /// Let spawned tasks run without moving the paused clock.
    pub async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_names_are_unique() {
        let mut names = JOB_NAMES.to_vec();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), JOB_NAMES.len());
    }

    #[test]
    fn cli_args_become_an_automation_spec() {
        let args: BTreeMap<String, String> = [
            ("automation_name", "turbidostat"),
            ("target_od", "1.5"),
            ("volume", "0.5"),
            ("label", "night run"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let spec = automation_spec(&args, "silent");
        assert_eq!(spec.automation_name, "turbidostat");
        assert_eq!(spec.args["target_od"], 1.5);
        assert_eq!(spec.args["label"], "night run");
        assert!(!spec.args.contains_key("automation_name"));
    }
}
