//! Device calibrations: named, immutable curves from raw to physical units.
//!
//! Stored as JSON in the persistent cache under
//! `calibrations/<device>/<name>`; the active one for a device is the name
//! held at `active_calibrations/<device>`. Once written a calibration never
//! changes; a corrected curve is a new calibration with a new name.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::info;

use crate::cache::Cache;
use crate::error::{CacheError, JobError, Result};

/// `c[0] + c[1]·x + c[2]·x² + …`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Polynomial {
    pub coefficients: Vec<f64>,
}

impl Polynomial {
    pub fn new(coefficients: Vec<f64>) -> Self {
        Self { coefficients }
    }

    pub fn eval(&self, x: f64) -> f64 {
        self.coefficients
            .iter()
            .rev()
            .fold(0.0, |acc, c| acc * x + c)
    }

    /// Smallest `x` in `[lo, hi]` with `eval(x) == y`, for a curve that is
    /// increasing on that interval.
    pub fn solve_increasing(&self, y: f64, lo: f64, hi: f64) -> Option<f64> {
        if let [c0, c1] = self.coefficients[..] {
            if c1 > 0.0 {
                let x = (y - c0) / c1;
                return (lo..=hi).contains(&x).then_some(x);
            }
            return None;
        }
        let (mut a, mut b) = (lo, hi);
        if self.eval(a) > y || self.eval(b) < y {
            return None;
        }
        for _ in 0..200 {
            let mid = 0.5 * (a + b);
            if self.eval(mid) < y {
                a = mid;
            } else {
                b = mid;
            }
        }
        Some(b)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub name: String,
    pub device: String,
    pub curve: Polynomial,
    pub x_unit: String,
    pub y_unit: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Longest pump run a dose may translate to.
const MAX_PUMP_SECONDS: f64 = 600.0;

impl Calibration {
    pub fn new(
        name: impl Into<String>,
        device: impl Into<String>,
        curve: Polynomial,
        x_unit: impl Into<String>,
        y_unit: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            device: device.into(),
            curve,
            x_unit: x_unit.into(),
            y_unit: y_unit.into(),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn predict(&self, x: f64) -> f64 {
        self.curve.eval(x)
    }

    /// Pump calibrations map run time (s) to volume (mL); this inverts them.
    pub fn ml_to_duration(&self, ml: f64) -> Result<f64> {
        if ml <= 0.0 {
            return Ok(0.0);
        }
        self.curve
            .solve_increasing(ml, 0.0, MAX_PUMP_SECONDS)
            .ok_or_else(|| {
                JobError::InvalidArgument(format!(
                    "{} mL is outside the range of calibration '{}'",
                    ml, self.name
                ))
            })
    }
}

fn key(device: &str, name: &str) -> String {
    format!("calibrations/{device}/{name}")
}

fn active_key(device: &str) -> String {
    format!("active_calibrations/{device}")
}

/// Store a new calibration. Fails with [`CacheError::Immutable`] if the name
/// is taken for this device.
pub async fn save(cache: &Cache, cal: &Calibration) -> std::result::Result<(), CacheError> {
    let k = key(&cal.device, &cal.name);
    let raw = serde_json::to_string(cal).map_err(|source| CacheError::Decode {
        key: k.clone(),
        source,
    })?;
    cache.insert_new(&k, &raw).await?;
    info!(device = %cal.device, name = %cal.name, "calibration saved");
    Ok(())
}

pub async fn load(cache: &Cache, device: &str, name: &str) -> std::result::Result<Option<Calibration>, CacheError> {
    cache.get_json(&key(device, name)).await
}

pub async fn list(cache: &Cache, device: &str) -> std::result::Result<Vec<String>, CacheError> {
    let prefix = format!("calibrations/{device}/");
    Ok(cache
        .keys(&prefix)
        .await?
        .into_iter()
        .filter_map(|k| k.strip_prefix(&prefix).map(str::to_string))
        .collect())
}

/// Point the device at an existing calibration.
pub async fn set_active(cache: &Cache, device: &str, name: &str) -> Result<()> {
    if load(cache, device, name).await?.is_none() {
        return Err(JobError::InvalidArgument(format!(
            "no calibration '{name}' for device '{device}'"
        )));
    }
    cache.set(&active_key(device), name).await?;
    info!(device, name, "calibration activated");
    Ok(())
}

pub async fn active(cache: &Cache, device: &str) -> std::result::Result<Option<Calibration>, CacheError> {
    match cache.get(&active_key(device)).await? {
        Some(name) => load(cache, device, &name).await,
        None => Ok(None),
    }
}

/// Active calibration or [`JobError::CalibrationMissing`].
pub async fn require_active(cache: &Cache, device: &str) -> Result<Calibration> {
    active(cache, device)
        .await?
        .ok_or_else(|| JobError::CalibrationMissing(device.to_string()))
}

// ===========================================================================
// Tests
// ===========================================================================
