//! Everything that runs on a bioreactor unit: the bus transport, the job
//! runtime and its supervision, the caches, numeric estimators, hardware
//! access and the jobs themselves.

pub mod cache;
pub mod calibration;
pub mod cluster;
pub mod config;
pub mod error;
pub mod estimators;
pub mod hardware;
pub mod job;
pub mod jobs;
pub mod kernel;
pub mod logs;
pub mod pubsub;
pub mod settings;
pub mod state;
pub mod supervisor;
pub mod topic;
