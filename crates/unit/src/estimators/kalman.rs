//! Augmented extended Kalman filter for growth rate.
//!
//! State is `[od, r, a]`: normalised optical density, growth rate (per hour)
//! and its rate of change. The process model is exponential growth,
//!
//! ```text
//! od' = od·exp(r·dt)     r' = r + a·dt     a' = a
//! ```
//!
//! and every observation channel measures `od` directly. A dosing event
//! makes `od` jump, so for a configurable number of samples afterwards the
//! OD process noise is inflated (decaying geometrically back to normal), letting
//! the filter absorb the jump as a level change instead of a rate change.
//! Residuals beyond `outlier_std_threshold` standard deviations are
//! down-weighted by inflating that observation's noise, never dropped.

use serde::{Deserialize, Serialize};

use super::linalg::{diag, mul, transpose, Mat3, Vec3};
use crate::config::KalmanConfig;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KalmanParams {
    pub obs_std: f64,
    pub od_std: f64,
    pub rate_std: f64,
    pub acc_std: f64,
    pub outlier_std_threshold: f64,
    pub dosing_window_samples: u32,
    pub dosing_inflation: f64,
}

impl From<&KalmanConfig> for KalmanParams {
    fn from(c: &KalmanConfig) -> Self {
        Self {
            obs_std: c.obs_std,
            od_std: c.od_std,
            rate_std: c.rate_std,
            acc_std: c.acc_std,
            outlier_std_threshold: c.outlier_std_threshold,
            dosing_window_samples: c.dosing_window_samples,
            dosing_inflation: c.dosing_inflation,
        }
    }
}

impl Default for KalmanParams {
    fn default() -> Self {
        Self::from(&KalmanConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FilterState {
    pub od_filtered: f64,
    pub growth_rate: f64,
    pub acceleration: f64,
}

#[derive(Debug, Clone)]
pub struct GrowthRateFilter {
    x: Vec3,
    p: Mat3,
    params: KalmanParams,
    /// Samples left in the current post-dosing inflation window.
    inflation_left: u32,
}

impl GrowthRateFilter {
    pub fn new(params: KalmanParams, initial_od: f64) -> Self {
        Self {
            x: [initial_od, 0.0, 0.0],
            p: diag([params.obs_std.powi(2), 0.1, 0.01]),
            params,
            inflation_left: 0,
        }
    }

    pub fn state(&self) -> FilterState {
        FilterState {
            od_filtered: self.x[0],
            growth_rate: self.x[1],
            acceleration: self.x[2],
        }
    }

    pub fn covariance(&self) -> Mat3 {
        self.p
    }

    pub fn in_dosing_window(&self) -> bool {
        self.inflation_left > 0
    }

    /// Start (or restart) the post-dosing inflation window.
    pub fn dosing_event(&mut self) {
        self.inflation_left = self.params.dosing_window_samples;
    }

    /// Multiplier on the OD process noise for the next prediction. Starts at
    /// `dosing_inflation` and shrinks by the same ratio every sample, so it
    /// is `dosing_inflation^(left / window)` and reaches 1 with the window.
    pub fn inflation_factor(&self) -> f64 {
        if self.inflation_left == 0 {
            return 1.0;
        }
        let window = self.params.dosing_window_samples.max(1) as f64;
        let inflation = self.params.dosing_inflation.max(1.0);
        inflation.powf(self.inflation_left as f64 / window)
    }

    fn predict(&mut self, dt_hours: f64) {
        let [od, r, a] = self.x;
        let e = (r * dt_hours).exp();
        self.x = [od * e, r + a * dt_hours, a];

        let f: Mat3 = [
            [e, od * dt_hours * e, 0.0],
            [0.0, 1.0, dt_hours],
            [0.0, 0.0, 1.0],
        ];
        self.p = mul(&mul(&f, &self.p), &transpose(&f));

        let od_q = self.params.od_std.powi(2) * self.inflation_factor();
        self.inflation_left = self.inflation_left.saturating_sub(1);
        self.p[0][0] += od_q;
        self.p[1][1] += self.params.rate_std.powi(2);
        self.p[2][2] += self.params.acc_std.powi(2);
    }

    fn correct(&mut self, z: f64) {
        let base_r = self.params.obs_std.powi(2);
        let y = z - self.x[0];
        let mut s = self.p[0][0] + base_r;
        let score = y.abs() / s.sqrt();
        let threshold = self.params.outlier_std_threshold;
        if score > threshold && self.inflation_left == 0 {
            s = self.p[0][0] + base_r * (score / threshold).powi(2);
        }
        let k = [self.p[0][0] / s, self.p[1][0] / s, self.p[2][0] / s];
        for (xi, ki) in self.x.iter_mut().zip(k) {
            *xi += ki * y;
        }
        let row0 = self.p[0];
        for (i, ki) in k.iter().enumerate() {
            for (j, r0) in row0.iter().enumerate() {
                self.p[i][j] -= ki * r0;
            }
        }
    }

    /// Advance by `dt_hours` and fold in one reading per channel. Non-finite
    /// readings are skipped; with none left only the prediction is applied.
    pub fn update(&mut self, observations: &[f64], dt_hours: f64) -> FilterState {
        if dt_hours.is_finite() && dt_hours > 0.0 {
            self.predict(dt_hours);
        }
        for z in observations.iter().copied().filter(|z| z.is_finite()) {
            self.correct(z);
        }
        self.state()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const DT: f64 = 5.0 / 3600.0;
    const RATE: f64 = 0.3;

    /// Exponential culture sampled every 5 s with a small deterministic
    /// dither; at sample 1500 a dosing event dilutes it to 80 %.
    fn run(params: KalmanParams, notify_dosing: bool) -> Vec<f64> {
        let mut f = GrowthRateFilter::new(params, 1.0);
        let mut od = 1.0;
        let mut errors = Vec::with_capacity(3000);
        for n in 0..3000 {
            od *= (RATE * DT).exp();
            if n == 1500 {
                od *= 0.8;
                if notify_dosing {
                    f.dosing_event();
                }
            }
            let z = od + 0.002 * (1.7 * n as f64).sin();
            let s = f.update(&[z], DT);
            errors.push(s.growth_rate - RATE);
        }
        errors
    }

    fn max_abs(v: &[f64]) -> f64 {
        v.iter().fold(0.0, |m, e| m.max(e.abs()))
    }

    #[test]
    fn converges_before_dosing() {
        let e = run(KalmanParams::default(), true);
        assert!(max_abs(&e[1000..1500]) < 0.01);
    }

    #[test]
    fn reconverges_after_dosing_step() {
        let e = run(KalmanParams::default(), true);
        assert!(max_abs(&e[1500..1560]) < 0.01, "during window: {}", max_abs(&e[1500..1560]));
        assert!(max_abs(&e[1860..]) < 0.01, "after window: {}", max_abs(&e[1860..]));
    }

    #[test]
    fn without_inflation_the_jump_corrupts_the_rate() {
        let params = KalmanParams {
            dosing_inflation: 1.0,
            ..KalmanParams::default()
        };
        let e = run(params, true);
        assert!(max_abs(&e[1500..1560]) > 0.05);
    }

    #[test]
    fn dosing_window_counts_down() {
        let params = KalmanParams {
            dosing_window_samples: 3,
            ..KalmanParams::default()
        };
        let mut f = GrowthRateFilter::new(params, 1.0);
        f.dosing_event();
        for _ in 0..3 {
            assert!(f.in_dosing_window());
            f.update(&[1.0], DT);
        }
        assert!(!f.in_dosing_window());
    }

    #[test]
    fn inflation_decays_geometrically_to_one() {
        let params = KalmanParams {
            dosing_window_samples: 4,
            dosing_inflation: 16.0,
            ..KalmanParams::default()
        };
        let mut f = GrowthRateFilter::new(params, 1.0);
        assert_eq!(f.inflation_factor(), 1.0);
        f.dosing_event();
        let mut factors = Vec::new();
        for _ in 0..5 {
            factors.push(f.inflation_factor());
            f.update(&[1.0], DT);
        }
        let want = [16.0, 8.0, 4.0, 2.0, 1.0];
        for (got, want) in factors.iter().zip(want) {
            assert!((got - want).abs() < 1e-9, "{factors:?}");
        }
    }

    #[test]
    fn outlier_is_down_weighted_not_dropped() {
        let mut f = GrowthRateFilter::new(KalmanParams::default(), 1.0);
        for _ in 0..500 {
            f.update(&[1.0], DT);
        }
        let before = f.state().od_filtered;
        let after = f.update(&[5.0], DT).od_filtered;
        assert!(after > before, "outlier should still move the estimate");
        assert!(after - before < 0.5, "outlier moved od by {}", after - before);
    }

    #[test]
    fn non_finite_readings_are_ignored() {
        let mut f = GrowthRateFilter::new(KalmanParams::default(), 1.0);
        let s = f.update(&[f64::NAN], DT);
        assert!(s.od_filtered.is_finite());
        assert!(s.growth_rate.is_finite());
    }

    #[test]
    fn covariance_stays_symmetric() {
        let mut f = GrowthRateFilter::new(KalmanParams::default(), 1.0);
        for n in 0..200 {
            f.update(&[1.0 + 0.001 * n as f64, 1.0 + 0.0011 * n as f64], DT);
        }
        let p = f.covariance();
        for i in 0..3 {
            for j in 0..3 {
                assert!((p[i][j] - p[j][i]).abs() < 1e-9);
            }
        }
    }
}
