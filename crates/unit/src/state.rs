//! Job lifecycle states, modelled on the Homie device states.
//!
//! ```text
//! Init ──▶ Ready ⇄ Sleeping
//!  │         │        │
//!  └─────────┴────────┴──▶ Disconnected
//!
//! any ──(broker last will)──▶ Lost
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Init,
    Ready,
    Sleeping,
    Disconnected,
    Lost,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Ready => "ready",
            Self::Sleeping => "sleeping",
            Self::Disconnected => "disconnected",
            Self::Lost => "lost",
        }
    }

    /// Whether a running process may move from `self` to `next`.
    ///
    /// `Lost` is never reachable from inside the process: only the broker
    /// publishes it, as the connection's last will.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Init, Ready)
                | (Init, Disconnected)
                | (Ready, Sleeping)
                | (Sleeping, Ready)
                | (Ready, Disconnected)
                | (Sleeping, Disconnected)
        )
    }

    /// `Disconnected` and `Lost` end a job identity; anything else counts as
    /// running for the single-writer check.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Lost)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().trim_matches('"').to_ascii_lowercase().as_str() {
            "init" => Ok(Self::Init),
            "ready" => Ok(Self::Ready),
            "sleeping" => Ok(Self::Sleeping),
            "disconnected" => Ok(Self::Disconnected),
            "lost" => Ok(Self::Lost),
            other => Err(format!("unknown job state '{other}'")),
        }
    }
}

/// Ordered record of the states a job went through. Used by tests and by the
/// leader's cluster view to check that a trace is a path in the graph.
#[derive(Debug, Clone, Default)]
pub struct StateTrace(Vec<JobState>);

impl StateTrace {
    pub fn push(&mut self, s: JobState) {
        self.0.push(s);
    }

    pub fn states(&self) -> &[JobState] {
        &self.0
    }

    /// True when every consecutive pair is a legal in-process transition, or
    /// a broker-delivered `Lost`.
    pub fn is_legal(&self) -> bool {
        self.0
            .windows(2)
            .all(|w| w[1] == JobState::Lost || w[0].can_transition_to(w[1]))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
