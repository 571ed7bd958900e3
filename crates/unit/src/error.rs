//! Error taxonomy shared by the job framework, transport and caches.
//!
//! `JobError` is what a job's lifecycle reports. Each variant says whether it
//! is fatal at `init`, retryable, or only worth a log line; see
//! [`JobError::is_fatal`].

use std::time::Duration;

use crate::state::JobState;

/// Result alias used throughout the crate.
pub type Result<T, E = JobError> = std::result::Result<T, E>;

// ---------------------------------------------------------------------------
// Job errors
// ---------------------------------------------------------------------------

#[derive(thiserror::Error, Debug)]
pub enum JobError {
    // ── Fatal at init ───────────────────────────────────────────────
    #[error("hardware absent: {0}")]
    HardwareAbsent(String),

    #[error("{job} is already running on {unit} for experiment {experiment}")]
    AlreadyRunning {
        unit: String,
        experiment: String,
        job: String,
    },

    #[error("no active calibration for device '{0}'")]
    CalibrationMissing(String),

    // ── Steady state ────────────────────────────────────────────────
    #[error("resource busy: '{resource}' is held by {holder}")]
    ResourceBusy { resource: String, holder: String },

    #[error("rejected remote set: {0}")]
    RemoteSet(#[from] SetError),

    #[error("tick failed: {0}")]
    TickFailure(String),

    #[error("tick exceeded its {0:?} budget")]
    TickTimeout(Duration),

    #[error("{failures} consecutive tick failures, last: {last}")]
    TooManyTickFailures { failures: u32, last: String },

    #[error("illegal state transition {from} -> {to}")]
    IllegalTransition { from: JobState, to: JobState },

    #[error("invalid job argument: {0}")]
    InvalidArgument(String),

    #[error("job has already stopped")]
    Stopped,

    // ── Plumbing ────────────────────────────────────────────────────
    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Cache(CacheError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl JobError {
    /// Errors that end the job instead of being logged and retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::HardwareAbsent(_)
                | Self::AlreadyRunning { .. }
                | Self::CalibrationMissing(_)
                | Self::TooManyTickFailures { .. }
                | Self::Stopped
        )
    }

    /// Errors a caller may retry later (for example after the holder of a
    /// hardware lock exits).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ResourceBusy { .. } | Self::Bus(BusError::ConnectionLost(_))
        )
    }

    pub fn tick(msg: impl Into<String>) -> Self {
        Self::TickFailure(msg.into())
    }
}

// ---------------------------------------------------------------------------
// Remote-set errors
// ---------------------------------------------------------------------------

/// Why a write to `<job>/<attr>/set` was refused.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum SetError {
    #[error("unknown attribute '{0}'")]
    Unknown(String),

    #[error("attribute '{0}' is read-only")]
    ReadOnly(String),

    #[error("attribute '{name}' expects {expected}, got {got:?}")]
    TypeMismatch {
        name: String,
        expected: &'static str,
        got: String,
    },

    #[error("attribute '{name}': {reason}")]
    OutOfRange { name: String, reason: String },
}

// ---------------------------------------------------------------------------
// Transport errors
// ---------------------------------------------------------------------------

#[derive(thiserror::Error, Debug)]
pub enum BusError {
    #[error("broker connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("client request failed: {0}")]
    Client(String),

    #[error("connection is closed")]
    Closed,
}

// ---------------------------------------------------------------------------
// Cache errors
// ---------------------------------------------------------------------------

#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    #[error("cache database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("cache migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("cache value for '{key}' is not valid json: {source}")]
    Decode {
        key: String,
        source: serde_json::Error,
    },

    #[error("lock '{key}' is held by {holder}")]
    Locked { key: String, holder: String },

    #[error("key '{0}' is immutable once written")]
    Immutable(String),
}

impl From<CacheError> for JobError {
    fn from(e: CacheError) -> Self {
        match e {
            CacheError::Locked { key, holder } => Self::ResourceBusy {
                resource: key,
                holder,
            },
            other => Self::Cache(other),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
