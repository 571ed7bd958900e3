//! Topic grammar and MQTT wildcard matching.
//!
//! Job topics look like `<unit>/<experiment>/<job>/<attribute>[/set]`.
//! `<unit>` may be [`BROADCAST`] and `<experiment>` may be [`EXPERIMENT`];
//! both are resolved by the *receiver* when a message is delivered (see
//! [`crate::cluster::ClusterView`]), never by the publisher.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Unit token addressing every active unit.
pub const BROADCAST: &str = "$broadcast";
/// Experiment token addressing whatever experiment is active at delivery.
pub const EXPERIMENT: &str = "$experiment";
/// Reserved attribute carrying the job's lifecycle state.
pub const STATE: &str = "$state";
/// Reserved attribute carrying the job's discovery document.
pub const PROPERTIES: &str = "$properties";
/// Prefix for leader-published cluster topics.
pub const CLUSTER: &str = "_cluster";

/// Retained leader config layer for every unit.
pub const CONFIG_SHARED: &str = "_cluster/config/$broadcast";
/// Retained `{ "units": [...] }` inventory document.
pub const INVENTORY: &str = "_cluster/inventory";
/// Retained `{ "experiment": ..., "created_at": ... }` document.
pub const LATEST_EXPERIMENT: &str = "_cluster/experiment/latest";
/// Requests for the leader to open a new experiment.
pub const EXPERIMENT_SET: &str = "_cluster/experiment/set";

// ---------------------------------------------------------------------------
// Job identity
// ---------------------------------------------------------------------------

/// `(unit, experiment, job)`: at most one running instance per identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobIdentity {
    pub unit: String,
    pub experiment: String,
    pub job: String,
}

impl JobIdentity {
    pub fn new(unit: impl Into<String>, experiment: impl Into<String>, job: impl Into<String>) -> Self {
        Self {
            unit: unit.into(),
            experiment: experiment.into(),
            job: job.into(),
        }
    }

    /// Same unit and experiment, different job. Used for children and for
    /// subscribing to sibling jobs' attributes.
    pub fn sibling(&self, job: impl Into<String>) -> Self {
        Self::new(self.unit.clone(), self.experiment.clone(), job)
    }

    /// `<unit>/<experiment>/<job>/<attribute>`
    pub fn topic(&self, attribute: &str) -> String {
        format!("{}/{}/{}/{attribute}", self.unit, self.experiment, self.job)
    }

    /// Filters that can carry a remote set for this job: one addressed to the
    /// unit by name and one broadcast. `$`-prefixed first levels are never
    /// matched by a `+` wildcard, so the broadcast filter is spelled out.
    pub fn set_filters(&self) -> [String; 2] {
        [
            format!("{}/+/{}/+/set", self.unit, self.job),
            format!("{BROADCAST}/+/{}/+/set", self.job),
        ]
    }

    /// Key under which the job's metadata lives in the intermittent cache.
    pub fn cache_key(&self) -> String {
        format!("jobs/{}/{}/{}", self.unit, self.experiment, self.job)
    }
}

impl fmt::Display for JobIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.unit, self.experiment, self.job)
    }
}

// ---------------------------------------------------------------------------
// Parsed topic
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPath<'a> {
    pub unit: &'a str,
    pub experiment: &'a str,
    pub job: &'a str,
    /// Everything between the job and an optional trailing `set`, e.g.
    /// `duty_cycle`, `$state` or `od/2`.
    pub attribute: String,
    pub set: bool,
}

impl<'a> TopicPath<'a> {
    /// Parse `<unit>/<experiment>/<job>/<attribute...>[/set]`.
    pub fn parse(topic: &'a str) -> Option<Self> {
        let parts: Vec<&str> = topic.split('/').collect();
        if parts.len() < 4 || parts[..3].iter().any(|p| p.is_empty()) {
            return None;
        }
        let (unit, experiment, job) = (parts[0], parts[1], parts[2]);
        if unit == CLUSTER {
            return None;
        }
        let rest = &parts[3..];
        let (attr_parts, set) = match rest.split_last() {
            Some((&"set", head)) if !head.is_empty() => (head, true),
            _ => (rest, false),
        };
        if attr_parts.iter().any(|p| p.is_empty()) {
            return None;
        }
        Some(Self {
            unit,
            experiment,
            job,
            attribute: attr_parts.join("/"),
            set,
        })
    }
}

/// Extract the unit from `_cluster/config/<unit>`.
pub fn config_target(topic: &str) -> Option<&str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 3 && parts[0] == CLUSTER && parts[1] == "config" && !parts[2].is_empty() {
        Some(parts[2])
    } else {
        None
    }
}

/// `_cluster/config/<unit>`
pub fn unit_config_topic(unit: &str) -> String {
    format!("{CLUSTER}/config/{unit}")
}

/// `<unit>/<experiment>/logs/<task>/<level>`
pub fn logs_topic(unit: &str, experiment: &str, task: &str, level: &str) -> String {
    format!("{unit}/{experiment}/logs/{task}/{level}")
}

// ---------------------------------------------------------------------------
// Wildcards
// ---------------------------------------------------------------------------

/// MQTT filter matching: `+` is exactly one level, a trailing `#` is zero or
/// more levels. As on real brokers, a topic whose first level starts with `$`
/// is not matched by a wildcard in that position.
pub fn filter_matches(filter: &str, topic: &str) -> bool {
    let mut f = filter.split('/');
    let mut t = topic.split('/');
    let mut first = true;

    loop {
        match (f.next(), t.next()) {
            (Some("#"), Some(level)) => return !(first && level.starts_with('$')),
            (Some("#"), None) => return true,
            (Some("+"), Some(level)) => {
                if first && level.starts_with('$') {
                    return false;
                }
            }
            (Some(fl), Some(tl)) => {
                if fl != tl {
                    return false;
                }
            }
            (None, None) => return true,
            _ => return false,
        }
        first = false;
    }
}

// ===========================================================================
// Tests
// ===========================================================================
