//! Mains hum removal for photodiode reads.
//!
//! The photodiode signal picks up interference at the mains frequency. A
//! batch of timestamped ADC reads is fitted with `c + a·sin(2πft) +
//! b·cos(2πft)` for both 50 Hz and 60 Hz; `c` is the hum-free level. The RMS
//! residual of each candidate is smoothed across batches and the candidate
//! with the lower smoothed residual is taken as the line frequency.

use std::f64::consts::PI;

use super::ema::Ema;
use super::linalg::{solve, Mat3, Vec3};

pub const CANDIDATE_HZ: [f64; 2] = [50.0, 60.0];

/// Fit of one batch at one frequency.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HumFit {
    pub dc: f64,
    pub amplitude: f64,
    pub rms_residual: f64,
}

/// Least-squares fit at `freq_hz`. `None` with fewer than four samples or a
/// degenerate design (all samples at one phase).
pub fn fit(times: &[f64], values: &[f64], freq_hz: f64) -> Option<HumFit> {
    let n = times.len().min(values.len());
    if n < 4 {
        return None;
    }
    let w = 2.0 * PI * freq_hz;
    let mut ata: Mat3 = [[0.0; 3]; 3];
    let mut atb: Vec3 = [0.0; 3];
    for (&t, &v) in times.iter().zip(values).take(n) {
        let row = [1.0, (w * t).sin(), (w * t).cos()];
        for i in 0..3 {
            atb[i] += row[i] * v;
            for j in 0..3 {
                ata[i][j] += row[i] * row[j];
            }
        }
    }
    let [dc, a, b] = solve(&ata, &atb)?;
    let sse: f64 = times
        .iter()
        .zip(values)
        .take(n)
        .map(|(&t, &v)| {
            let r = v - (dc + a * (w * t).sin() + b * (w * t).cos());
            r * r
        })
        .sum();
    Some(HumFit {
        dc,
        amplitude: a.hypot(b),
        rms_residual: (sse / n as f64).sqrt(),
    })
}

#[derive(Debug, Clone)]
pub struct AcHumEstimator {
    residuals: [Ema; 2],
}

impl AcHumEstimator {
    pub fn new(smoothing: f64) -> Self {
        Self {
            residuals: [Ema::new(smoothing), Ema::new(smoothing)],
        }
    }

    /// Line frequency currently believed in, once any batch has been fitted.
    pub fn line_frequency(&self) -> Option<f64> {
        let [r50, r60] = [self.residuals[0].value()?, self.residuals[1].value()?];
        Some(if r60 < r50 { CANDIDATE_HZ[1] } else { CANDIDATE_HZ[0] })
    }

    /// Hum-free level of one batch. Falls back to the plain mean when the
    /// batch cannot be fitted.
    pub fn estimate(&mut self, times: &[f64], values: &[f64]) -> f64 {
        let fits = CANDIDATE_HZ.map(|f| fit(times, values, f));
        for (ema, fit) in self.residuals.iter_mut().zip(&fits) {
            if let Some(fit) = fit {
                ema.update(fit.rms_residual);
            }
        }
        let chosen = match self.line_frequency() {
            Some(f) if f == CANDIDATE_HZ[1] => fits[1],
            Some(_) => fits[0],
            None => None,
        };
        match chosen {
            Some(fit) => fit.dc,
            None if values.is_empty() => f64::NAN,
            None => values.iter().sum::<f64>() / values.len() as f64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn times() -> Vec<f64> {
        // ~3 ms spacing with jitter, as an ADC in single-shot mode gives.
        (0..32).map(|i| i as f64 * 0.0031 + 0.0005 * (i as f64).sin()).collect()
    }

    fn hum(freq: f64, phase: f64) -> Vec<f64> {
        times()
            .iter()
            .map(|t| 0.5 + 0.1 * (2.0 * PI * freq * t + phase).sin())
            .collect()
    }

    #[test]
    fn fit_recovers_dc_under_60hz_hum() {
        let f = fit(&times(), &hum(60.0, 0.3), 60.0).unwrap();
        assert!((f.dc - 0.5).abs() < 1e-9);
        assert!((f.amplitude - 0.1).abs() < 1e-9);
        assert!(f.rms_residual < 1e-9);
    }

    #[test]
    fn estimator_picks_50hz_and_beats_the_mean() {
        let v = hum(50.0, 1.1);
        let mean = v.iter().sum::<f64>() / v.len() as f64;
        let mut est = AcHumEstimator::new(0.5);
        let dc = est.estimate(&times(), &v);
        assert_eq!(est.line_frequency(), Some(50.0));
        assert!((dc - 0.5).abs() < 1e-9);
        assert!((mean - 0.5).abs() > 1e-3);
    }

    #[test]
    fn estimator_picks_60hz() {
        let mut est = AcHumEstimator::new(0.5);
        for phase in [0.0, 0.7, 2.0] {
            est.estimate(&times(), &hum(60.0, phase));
        }
        assert_eq!(est.line_frequency(), Some(60.0));
    }

    #[test]
    fn short_batch_falls_back_to_mean() {
        let mut est = AcHumEstimator::new(0.5);
        assert_eq!(est.estimate(&[0.0, 0.1], &[1.0, 3.0]), 2.0);
        assert!(est.line_frequency().is_none());
    }
}
