//! Control-loop timing: drift-free schedules, the tick failure policy and the
//! dodge clock.
//!
//! A loop's n-th deadline is always `start + n·period`, never "last tick plus
//! period", so slow ticks do not accumulate drift. A tick that overruns one or
//! more later deadlines skips them instead of firing a burst.

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::cache::Cache;
use crate::error::{CacheError, JobError, Result};

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Schedule {
    start: Instant,
    period: Duration,
    n: u64,
}

impl Schedule {
    /// First deadline is `start` itself.
    pub fn new(start: Instant, period: Duration) -> Self {
        Self {
            start,
            period,
            n: 0,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn ticks(&self) -> u64 {
        self.n
    }

    fn deadline_of(&self, n: u64) -> Instant {
        // u32 is enough for ~136 years of one-second ticks.
        self.start + self.period * (n.min(u32::MAX as u64) as u32)
    }

    pub fn next_deadline(&self) -> Instant {
        self.deadline_of(self.n)
    }

    /// Move past the deadline just served. Deadlines already in the past at
    /// `now` are skipped; returns how many were.
    pub fn advance(&mut self, now: Instant) -> u64 {
        self.n += 1;
        let mut skipped = 0;
        while self.deadline_of(self.n) <= now && !self.period.is_zero() {
            self.n += 1;
            skipped += 1;
        }
        skipped
    }
}

// ---------------------------------------------------------------------------
// Failure policy
// ---------------------------------------------------------------------------

/// Default number of consecutive failed ticks tolerated before the job is
/// disconnected.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;

#[derive(Debug, Clone)]
pub struct FailurePolicy {
    max_consecutive: u32,
    consecutive: u32,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self::new(MAX_CONSECUTIVE_FAILURES)
    }
}

impl FailurePolicy {
    pub fn new(max_consecutive: u32) -> Self {
        Self {
            max_consecutive: max_consecutive.max(1),
            consecutive: 0,
        }
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    pub fn record_success(&mut self) {
        self.consecutive = 0;
    }

    /// Count a failure; the escalation error once the limit is reached.
    pub fn record_failure(&mut self, err: &JobError) -> Result<()> {
        self.consecutive += 1;
        if self.consecutive >= self.max_consecutive {
            Err(JobError::TooManyTickFailures {
                failures: self.consecutive,
                last: err.to_string(),
            })
        } else {
            Ok(())
        }
    }
}

/// Run one tick under an optional time budget. An overrun is a failed tick.
pub async fn run_tick<F>(budget: Option<Duration>, tick: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    match budget {
        Some(b) => tokio::time::timeout(b, tick)
            .await
            .unwrap_or(Err(JobError::TickTimeout(b))),
        None => tick.await,
    }
}

// ---------------------------------------------------------------------------
// Dodging
// ---------------------------------------------------------------------------

pub fn unix_ms(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub fn now_unix_ms() -> i64 {
    unix_ms(SystemTime::now())
}

/// When a sampling job takes its samples, published in the intermittent
/// cache so jobs that disturb the measurement can step aside. Samples happen
/// at `anchor + k·interval`; dodgers are quiet from `pre` before each sample
/// until `post` after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DodgeSchedule {
    pub anchor_unix_ms: i64,
    pub interval_ms: u64,
    pub pre_ms: u64,
    pub post_ms: u64,
}

/// One quiet window, in unix milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DodgeWindow {
    pub before_ms: i64,
    pub sample_ms: i64,
    pub after_ms: i64,
}

impl DodgeSchedule {
    pub fn cache_key(unit: &str, target_job: &str) -> String {
        format!("dodge/{unit}/{target_job}")
    }

    /// Windows that overlap or touch leave no time to run between samples.
    pub fn is_usable(&self) -> bool {
        self.interval_ms > 0 && self.pre_ms + self.post_ms < self.interval_ms
    }

    /// The first window that has not ended at `now_ms`. If `now_ms` is
    /// already inside it, `before_ms` is in the past.
    pub fn window_at(&self, now_ms: i64) -> Option<DodgeWindow> {
        if !self.is_usable() {
            return None;
        }
        let interval = self.interval_ms as i64;
        let post = self.post_ms as i64;
        // smallest k >= 0 with anchor + k·interval + post > now
        let since = now_ms - self.anchor_unix_ms - post;
        let k = if since < 0 { 0 } else { since / interval + 1 };
        let sample_ms = self.anchor_unix_ms + k * interval;
        Some(DodgeWindow {
            before_ms: sample_ms - self.pre_ms as i64,
            sample_ms,
            after_ms: sample_ms + post,
        })
    }

    pub async fn store(&self, cache: &Cache, unit: &str, target_job: &str) -> std::result::Result<(), CacheError> {
        cache.set_json(&Self::cache_key(unit, target_job), self).await
    }

    pub async fn load(cache: &Cache, unit: &str, target_job: &str) -> std::result::Result<Option<Self>, CacheError> {
        cache.get_json(&Self::cache_key(unit, target_job)).await
    }

    pub async fn remove(cache: &Cache, unit: &str, target_job: &str) -> std::result::Result<(), CacheError> {
        cache.delete(&Self::cache_key(unit, target_job)).await.map(|_| ())
    }
}

/// Convert a unix-ms instant into a tokio deadline relative to now.
pub fn instant_at(unix_ms_target: i64) -> Instant {
    let delta = unix_ms_target - now_unix_ms();
    if delta <= 0 {
        Instant::now()
    } else {
        Instant::now() + Duration::from_millis(delta as u64)
    }
}

/// Where a dodging job is in the current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DodgePhase {
    /// Running normally; `before_dodge` is due at the window's start.
    Waiting(DodgeWindow),
    /// Stepped aside; `after_dodge` is due at the window's end.
    Dodging(DodgeWindow),
}

impl DodgePhase {
    pub fn due_ms(&self) -> i64 {
        match self {
            Self::Waiting(w) => w.before_ms,
            Self::Dodging(w) => w.after_ms,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
