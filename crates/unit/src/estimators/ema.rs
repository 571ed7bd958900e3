//! Exponential moving average and its windowed counterpart.
//!
//! Smoothing is given as `s` in (0, 1); the EMA weight of a new sample is
//! `α = 1 − s`, so `ema_t = α·x_t + (1−α)·ema_{t−1}`. The first sample seeds
//! the average.

use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct Ema {
    alpha: f64,
    value: Option<f64>,
}

impl Ema {
    pub fn new(smoothing: f64) -> Self {
        let s = smoothing.clamp(0.0, 1.0);
        Self {
            alpha: 1.0 - s,
            value: None,
        }
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }

    /// Fold in a sample; non-finite samples are ignored.
    pub fn update(&mut self, x: f64) -> Option<f64> {
        if x.is_finite() {
            self.value = Some(match self.value {
                Some(prev) => self.alpha * x + (1.0 - self.alpha) * prev,
                None => x,
            });
        }
        self.value
    }

    pub fn reset(&mut self) {
        self.value = None;
    }
}

/// Window of the simple moving average with the same memory horizon as an
/// EMA of this smoothing: the number of samples after which an old sample's
/// EMA weight has decayed below 1 %.
pub fn equivalent_window(smoothing: f64) -> usize {
    let s = smoothing.clamp(1e-9, 1.0 - 1e-9);
    ((0.01f64).ln() / s.ln()).ceil().max(1.0) as usize
}

#[derive(Debug, Clone)]
pub struct MovingAverage {
    window: usize,
    buf: VecDeque<f64>,
    sum: f64,
}

impl MovingAverage {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            buf: VecDeque::with_capacity(window),
            sum: 0.0,
        }
    }

    pub fn update(&mut self, x: f64) -> f64 {
        if self.buf.len() == self.window {
            if let Some(old) = self.buf.pop_front() {
                self.sum -= old;
            }
        }
        self.buf.push_back(x);
        self.sum += x;
        self.sum / self.buf.len() as f64
    }
}
