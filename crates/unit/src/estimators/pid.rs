//! PID controller with bounded output and anti-windup.
//!
//! The derivative acts on the measurement rather than the error, so a
//! setpoint change does not kick the actuator. The integral term is clamped
//! to the output range.

use serde::{Deserialize, Serialize};

use crate::error::{JobError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tunings {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

#[derive(Debug, Clone)]
pub struct Pid {
    tunings: Tunings,
    setpoint: f64,
    min: f64,
    max: f64,
    integral: f64,
    last_measurement: Option<f64>,
    last_output: f64,
}

impl Pid {
    /// `limits` is the actuator's range and is fixed for the controller's
    /// lifetime.
    pub fn new(tunings: Tunings, setpoint: f64, limits: (f64, f64)) -> Result<Self> {
        let (min, max) = limits;
        if !(min.is_finite() && max.is_finite() && min < max) {
            return Err(JobError::InvalidArgument(format!(
                "pid output limits must satisfy min < max, got ({min}, {max})"
            )));
        }
        Ok(Self {
            tunings,
            setpoint,
            min,
            max,
            integral: 0.0,
            last_measurement: None,
            last_output: min.max(0.0).min(max),
        })
    }

    pub fn tunings(&self) -> Tunings {
        self.tunings
    }

    pub fn setpoint(&self) -> f64 {
        self.setpoint
    }

    pub fn limits(&self) -> (f64, f64) {
        (self.min, self.max)
    }

    pub fn integral(&self) -> f64 {
        self.integral
    }

    pub fn set_setpoint(&mut self, setpoint: f64) {
        self.setpoint = setpoint;
    }

    /// Swap all three gains at once and forget accumulated state.
    pub fn set_tunings(&mut self, tunings: Tunings) {
        self.tunings = tunings;
        self.reset();
    }

    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.last_measurement = None;
    }

    /// One controller step. `dt` is the time since the previous step in
    /// seconds. Non-finite input leaves the state untouched and repeats the
    /// previous output.
    pub fn update(&mut self, measurement: f64, dt: f64) -> f64 {
        if !measurement.is_finite() || !dt.is_finite() || dt < 0.0 {
            return self.last_output;
        }
        let Tunings { kp, ki, kd } = self.tunings;
        let error = self.setpoint - measurement;

        self.integral = (self.integral + ki * error * dt).clamp(self.min, self.max);

        let derivative = match self.last_measurement {
            Some(prev) if dt > 0.0 => -(measurement - prev) / dt,
            _ => 0.0,
        };
        self.last_measurement = Some(measurement);

        let raw = kp * error + self.integral + kd * derivative;
        self.last_output = if raw.is_finite() {
            raw.clamp(self.min, self.max)
        } else {
            self.last_output
        };
        self.last_output
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn tunings(kp: f64, ki: f64, kd: f64) -> Tunings {
        Tunings { kp, ki, kd }
    }

    #[test]
    fn rejects_inverted_limits() {
        assert!(Pid::new(tunings(1.0, 0.0, 0.0), 0.0, (10.0, 0.0)).is_err());
        assert!(Pid::new(tunings(1.0, 0.0, 0.0), 0.0, (0.0, f64::NAN)).is_err());
    }

    #[test]
    fn output_stays_within_limits_for_any_input() {
        let mut pid = Pid::new(tunings(50.0, 10.0, 5.0), 37.0, (0.0, 100.0)).unwrap();
        let inputs = [
            -1e12, 1e12, 0.0, 37.0, 1e-9, -5.0, 500.0, f64::NAN, f64::INFINITY, 36.9,
        ];
        for (i, m) in inputs.iter().cycle().take(500).enumerate() {
            let dt = [0.0, 0.001, 1.0, 60.0][i % 4];
            let out = pid.update(*m, dt);
            assert!((0.0..=100.0).contains(&out), "output {out} escaped limits");
            assert!((0.0..=100.0).contains(&pid.integral()));
        }
    }

    #[test]
    fn integral_does_not_wind_up() {
        let mut pid = Pid::new(tunings(0.0, 1.0, 0.0), 100.0, (0.0, 10.0)).unwrap();
        for _ in 0..10_000 {
            pid.update(0.0, 1.0);
        }
        assert_eq!(pid.integral(), 10.0);
        // Recovers as soon as the error flips sign.
        let out = pid.update(200.0, 1.0);
        assert!(out < 10.0);
    }

    #[test]
    fn proportional_response_sign() {
        let mut pid = Pid::new(tunings(2.0, 0.0, 0.0), 30.0, (-100.0, 100.0)).unwrap();
        assert_eq!(pid.update(25.0, 1.0), 10.0);
        assert_eq!(pid.update(35.0, 1.0), -10.0);
    }

    #[test]
    fn setpoint_change_does_not_kick_derivative() {
        let mut pid = Pid::new(tunings(0.0, 0.0, 10.0), 30.0, (-100.0, 100.0)).unwrap();
        pid.update(30.0, 1.0);
        pid.set_setpoint(40.0);
        assert_eq!(pid.update(30.0, 1.0), 0.0);
    }

    #[test]
    fn swapping_tunings_resets_memory() {
        let mut pid = Pid::new(tunings(0.0, 1.0, 0.0), 10.0, (0.0, 100.0)).unwrap();
        pid.update(0.0, 1.0);
        assert!(pid.integral() > 0.0);
        pid.set_tunings(tunings(1.0, 0.5, 0.0));
        assert_eq!(pid.integral(), 0.0);
        assert_eq!(pid.tunings().kp, 1.0);
    }

    #[test]
    fn closed_loop_heater_settles() {
        // First-order plant: dT/dt = (u·0.05) - (T - 20)·0.01
        let mut pid = Pid::new(tunings(3.0, 0.01, 0.0), 37.0, (0.0, 100.0)).unwrap();
        let mut temp = 20.0;
        for _ in 0..5_000 {
            let u = pid.update(temp, 1.0);
            temp += u * 0.05 - (temp - 20.0) * 0.01;
        }
        assert!((temp - 37.0).abs() < 0.5, "temperature settled at {temp}");
    }
}
