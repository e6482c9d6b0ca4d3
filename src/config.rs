//! On-disk configuration tree, loaded from TOML via `toml`/`serde`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{BandError, Result};
use crate::ids::{CPUMaskFlag, DeviceFlag};

/// How a scheduler recovers when a model has no unit subgraph matching a
/// worker's supported op set exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FallbackPolicy {
    None,
    PerWorker,
    Unit,
    MergeUnit,
}

impl Default for FallbackPolicy {
    fn default() -> Self {
        FallbackPolicy::None
    }
}

/// One of the six scheduling policies a planner's local queue can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SchedulerKind {
    FixedWorker,
    FixedWorkerGlobalQueue,
    RoundRobin,
    ShortestExpectedLatency,
    LeastSlackTimeFirst,
    Heft,
    HeftReserved,
}

impl SchedulerKind {
    /// Global-queue-topology policies need a single shared worker queue
    /// instead of one queue per device.
    pub fn uses_global_queue(&self) -> bool {
        matches!(self, SchedulerKind::FixedWorkerGlobalQueue)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub device: DeviceFlag,
    #[serde(default = "default_cpu_mask")]
    pub cpu_mask: CPUMaskFlag,
    #[serde(default = "default_num_threads")]
    pub num_threads: u32,
    #[serde(default = "default_availability_check_interval_ms")]
    pub availability_check_interval_ms: u64,
}

fn default_cpu_mask() -> CPUMaskFlag {
    CPUMaskFlag::All
}

fn default_num_threads() -> u32 {
    1
}

fn default_availability_check_interval_ms() -> u64 {
    50
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            device: DeviceFlag::CPU,
            cpu_mask: default_cpu_mask(),
            num_threads: default_num_threads(),
            availability_check_interval_ms: default_availability_check_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerConfig {
    #[serde(default = "default_schedule_window_size")]
    pub schedule_window_size: usize,
    #[serde(default)]
    pub cpu_mask: CPUMaskFlag,
    #[serde(default = "default_scheduler_kinds")]
    pub scheduler_kinds: Vec<SchedulerKind>,
    #[serde(default)]
    pub fallback_policy: FallbackPolicy,
    #[serde(default = "default_minimum_subgraph_size")]
    pub minimum_subgraph_size: usize,
}

fn default_schedule_window_size() -> usize {
    4
}

fn default_scheduler_kinds() -> Vec<SchedulerKind> {
    vec![SchedulerKind::FixedWorker]
}

fn default_minimum_subgraph_size() -> usize {
    1
}

impl Default for CPUMaskFlag {
    fn default() -> Self {
        CPUMaskFlag::All
    }
}

impl Default for PlannerConfig {
    fn default() -> Self {
        PlannerConfig {
            schedule_window_size: default_schedule_window_size(),
            cpu_mask: CPUMaskFlag::default(),
            scheduler_kinds: default_scheduler_kinds(),
            fallback_policy: FallbackPolicy::default(),
            minimum_subgraph_size: default_minimum_subgraph_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileConfig {
    pub path: PathBuf,
    #[serde(default)]
    pub online: bool,
    #[serde(default = "default_num_warmups")]
    pub num_warmups: u32,
    #[serde(default = "default_num_runs")]
    pub num_runs: u32,
    #[serde(default = "default_smoothing_factor")]
    pub smoothing_factor: f64,
}

fn default_num_warmups() -> u32 {
    1
}

fn default_num_runs() -> u32 {
    1
}

fn default_smoothing_factor() -> f64 {
    0.1
}

impl Default for ProfileConfig {
    fn default() -> Self {
        ProfileConfig {
            path: PathBuf::from("profile.json"),
            online: false,
            num_warmups: default_num_warmups(),
            num_runs: default_num_runs(),
            smoothing_factor: default_smoothing_factor(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceMonitorConfig {
    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    /// Device -> sysfs devfreq node, for devices whose frequency is not
    /// discoverable from a fixed well-known path.
    #[serde(default)]
    pub devfreq_paths: BTreeMap<DeviceFlag, PathBuf>,
}

fn default_monitor_interval_ms() -> u64 {
    1000
}

impl Default for ResourceMonitorConfig {
    fn default() -> Self {
        ResourceMonitorConfig {
            monitor_interval_ms: default_monitor_interval_ms(),
            log_path: None,
            devfreq_paths: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub planner: PlannerConfig,
    #[serde(default)]
    pub workers: Vec<WorkerConfig>,
    #[serde(default)]
    pub profile: ProfileConfig,
    #[serde(default)]
    pub resource_monitor: ResourceMonitorConfig,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            BandError::not_found(format!("config file {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text)
            .map_err(|e| BandError::invalid_argument(format!("malformed config: {e}")))
    }

    pub fn validate(&self) -> Result<()> {
        if self.planner.scheduler_kinds.is_empty() {
            return Err(BandError::invalid_argument(
                "at least one scheduler kind is required",
            ));
        }
        if self.planner.scheduler_kinds.len() > 2 {
            return Err(BandError::invalid_argument(
                "at most two scheduler kinds may coexist in a planner",
            ));
        }
        if self.workers.is_empty() {
            return Err(BandError::invalid_argument("at least one worker is required"));
        }
        let global = self
            .planner
            .scheduler_kinds
            .iter()
            .map(|k| k.uses_global_queue())
            .collect::<Vec<_>>();
        if let (Some(first), true) = (global.first(), global.len() == 2) {
            if global[1] != *first {
                return Err(BandError::invalid_argument(
                    "mixed schedulers must agree on worker-queue topology",
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = Config {
            workers: vec![WorkerConfig::default()],
            ..Config::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn more_than_two_scheduler_kinds_rejected() {
        let cfg = Config {
            planner: PlannerConfig {
                scheduler_kinds: vec![
                    SchedulerKind::FixedWorker,
                    SchedulerKind::RoundRobin,
                    SchedulerKind::Heft,
                ],
                ..PlannerConfig::default()
            },
            workers: vec![WorkerConfig::default()],
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn mismatched_queue_topology_rejected() {
        let cfg = Config {
            planner: PlannerConfig {
                scheduler_kinds: vec![
                    SchedulerKind::FixedWorkerGlobalQueue,
                    SchedulerKind::FixedWorker,
                ],
                ..PlannerConfig::default()
            },
            workers: vec![WorkerConfig::default()],
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn parses_minimal_toml() {
        let text = r#"
            [planner]
            scheduler_kinds = ["round-robin"]

            [[workers]]
            device = "CPU"
        "#;
        let cfg = Config::from_toml_str(text).unwrap();
        assert_eq!(cfg.workers.len(), 1);
        assert_eq!(cfg.planner.scheduler_kinds, vec![SchedulerKind::RoundRobin]);
    }
}
