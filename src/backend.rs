//! The narrow trait boundary to the external model-executor and
//! tensor-buffer collaborators. The core never constructs tensors or
//! decodes model files itself; it only calls through these traits.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::Mutex;

use crate::error::{BandError, Result};
use crate::ids::SubgraphKey;
use crate::job::Job;
use crate::model::ModelSpec;

/// Consumed once per model registration, then repeatedly for execution.
pub trait BackendAdapter: Send + Sync {
    /// Parses the model file at `path` and reports its op/tensor graph.
    fn investigate_model_spec(&self, path: &str) -> Result<ModelSpec>;

    /// Prepares an executable subgraph for `key` covering `ops`. Called once
    /// per materialized subgraph.
    fn prepare_subgraph(&self, key: SubgraphKey, ops: &BTreeSet<usize>) -> Result<()>;

    /// Runs the subgraph for `key`. A `DeviceError` is retriable and must
    /// never be surfaced to the client; any other error is terminal.
    fn execute_subgraph(&self, key: SubgraphKey) -> Result<()>;

    fn has_subgraph(&self, key: SubgraphKey) -> bool;

    fn for_each_subgraph(&self, visitor: &mut dyn FnMut(SubgraphKey));

    /// The subgraph covering the most unit subgraphs for `model_id` on
    /// `worker_id`, used by fixed-worker scheduling.
    fn largest_subgraph_key(&self, model_id: i32, worker_id: i32) -> Option<SubgraphKey>;
}

/// Opaque to the core: copies a job's input/output tensors in or out of the
/// backend's buffers.
pub trait TensorBroker: Send + Sync {
    fn copy_input(&self, job: &Job) -> Result<()>;
    fn copy_output(&self, job: &Job) -> Result<()>;
}

/// Per-subgraph behavior the stub backend should exhibit for one `execute`
/// call: how long it pretends to take, and what (if anything) it fails with.
#[derive(Debug, Clone, Copy)]
pub struct StubLatency {
    pub micros: i64,
}

#[derive(Debug, Clone)]
enum FaultPlan {
    /// Fail this many times with `DeviceError` before succeeding.
    DeviceErrorsThenOk(u32),
    Fatal,
}

struct SubgraphEntry {
    ops: BTreeSet<usize>,
    latency: StubLatency,
}

/// A deterministic in-memory fake standing in for a real TFLite/ONNX
/// executor: the benchmark harness and test suite register subgraphs with a
/// configured latency and optional fault plan, then drive the planner
/// exactly as they would against a real backend.
pub struct StubBackend {
    subgraphs: Mutex<BTreeMap<SubgraphKey, SubgraphEntry>>,
    fault_plans: Mutex<BTreeMap<SubgraphKey, FaultPlan>>,
    invoke_log: Mutex<Vec<SubgraphKey>>,
}

impl StubBackend {
    pub fn new() -> Self {
        StubBackend {
            subgraphs: Mutex::new(BTreeMap::new()),
            fault_plans: Mutex::new(BTreeMap::new()),
            invoke_log: Mutex::new(Vec::new()),
        }
    }

    pub fn register_subgraph(&self, key: SubgraphKey, ops: BTreeSet<usize>, latency: StubLatency) {
        self.subgraphs.lock().insert(key, SubgraphEntry { ops, latency });
    }

    /// Makes the next `count` invokes of `key` fail with a retriable
    /// `DeviceError`, then succeed from then on.
    pub fn fail_with_device_error(&self, key: SubgraphKey, count: u32) {
        self.fault_plans
            .lock()
            .insert(key, FaultPlan::DeviceErrorsThenOk(count));
    }

    pub fn fail_fatally(&self, key: SubgraphKey) {
        self.fault_plans.lock().insert(key, FaultPlan::Fatal);
    }

    pub fn invoke_log(&self) -> Vec<SubgraphKey> {
        self.invoke_log.lock().clone()
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendAdapter for StubBackend {
    fn investigate_model_spec(&self, _path: &str) -> Result<ModelSpec> {
        Err(BandError::not_found(
            "StubBackend does not parse model files; register a ModelSpec directly",
        ))
    }

    fn prepare_subgraph(&self, key: SubgraphKey, ops: &BTreeSet<usize>) -> Result<()> {
        self.register_subgraph(key, ops.clone(), StubLatency { micros: 1000 });
        Ok(())
    }

    fn execute_subgraph(&self, key: SubgraphKey) -> Result<()> {
        self.invoke_log.lock().push(key);

        let mut plans = self.fault_plans.lock();
        if let Some(plan) = plans.get_mut(&key) {
            match plan {
                FaultPlan::DeviceErrorsThenOk(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    return Err(BandError::device_error(format!(
                        "stub backend injected device error for {key}"
                    )));
                }
                FaultPlan::Fatal => {
                    return Err(BandError::fatal_invoke(format!(
                        "stub backend injected fatal error for {key}"
                    )));
                }
                _ => {}
            }
        }
        drop(plans);

        let entry = self
            .subgraphs
            .lock()
            .get(&key)
            .map(|e| e.latency)
            .ok_or_else(|| BandError::not_found(format!("no subgraph registered for {key}")))?;
        std::thread::sleep(std::time::Duration::from_micros(entry.micros.max(0) as u64));
        Ok(())
    }

    fn has_subgraph(&self, key: SubgraphKey) -> bool {
        self.subgraphs.lock().contains_key(&key)
    }

    fn for_each_subgraph(&self, visitor: &mut dyn FnMut(SubgraphKey)) {
        for key in self.subgraphs.lock().keys() {
            visitor(*key);
        }
    }

    fn largest_subgraph_key(&self, model_id: i32, worker_id: i32) -> Option<SubgraphKey> {
        self.subgraphs
            .lock()
            .iter()
            .filter(|(k, _)| k.model_id() == model_id && k.worker_id() == worker_id)
            .max_by_key(|(_, entry)| entry.ops.len())
            .map(|(k, _)| *k)
    }
}

/// A tensor broker that always succeeds; the stub backend has no real
/// buffers to copy.
pub struct NullTensorBroker;

impl TensorBroker for NullTensorBroker {
    fn copy_input(&self, _job: &Job) -> Result<()> {
        Ok(())
    }

    fn copy_output(&self, _job: &Job) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_plan_recovers_after_configured_failures() {
        let backend = StubBackend::new();
        let key = SubgraphKey::new(0, 0, 0b1);
        backend.register_subgraph(key, BTreeSet::from([0]), StubLatency { micros: 0 });
        backend.fail_with_device_error(key, 2);

        assert!(matches!(backend.execute_subgraph(key), Err(BandError::DeviceError(_))));
        assert!(matches!(backend.execute_subgraph(key), Err(BandError::DeviceError(_))));
        assert!(backend.execute_subgraph(key).is_ok());
    }

    #[test]
    fn largest_subgraph_key_picks_widest_op_set() {
        let backend = StubBackend::new();
        let small = SubgraphKey::new(0, 0, 0b01);
        let large = SubgraphKey::new(0, 0, 0b11);
        backend.register_subgraph(small, BTreeSet::from([0]), StubLatency { micros: 0 });
        backend.register_subgraph(large, BTreeSet::from([0, 1]), StubLatency { micros: 0 });

        assert_eq!(backend.largest_subgraph_key(0, 0), Some(large));
    }
}
