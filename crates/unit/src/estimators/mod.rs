//! Numeric estimators used inside control loops.
//!
//! None of these hold references to jobs, the bus or the caches; each is a
//! plain value owned by one job and mutated only through its own methods.

pub mod ac;
pub mod dosing;
pub mod ema;
pub mod kalman;
pub mod linalg;
pub mod pid;
