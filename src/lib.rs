//! Scheduler-and-worker subsystem for on-device heterogeneous ML inference
//! dispatch: a planner thread ranks and places requests against a pool of
//! CPU/GPU/DSP/NPU workers, each running its own dispatch thread, according
//! to one or two pluggable scheduling policies.

pub mod backend;
pub mod config;
pub mod cpu_affinity;
pub mod engine;
pub mod error;
pub mod ids;
pub mod job;
pub mod latency;
pub mod model;
pub mod planner;
pub mod resource_monitor;
pub mod scheduler;
pub mod trace;
pub mod worker;

pub use engine::Engine;
pub use error::{BandError, Result};
pub use job::{Job, JobBuilder, JobStatus};
