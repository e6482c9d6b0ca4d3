//! Per-subgraph latency table: profiling, exponential-moving-average
//! updates, and disk persistence.

use std::collections::BTreeMap;
use std::path::Path;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::config::ProfileConfig;
use crate::cpu_affinity;
use crate::error::{BandError, Result};
use crate::ids::{CPUMaskFlag, DeviceFlag, ModelId, SubgraphKey, WorkerId};

/// Collaborator the estimator drives during `ProfileModel`: pause/resume a
/// worker, wait for it to go idle, then invoke a subgraph from an isolated
/// thread. Implemented by the engine facade; kept as a trait here so the
/// estimator does not depend on the worker/engine modules directly.
pub trait ProfilingHost: Sync {
    fn num_workers(&self) -> usize;
    fn worker_device(&self, worker_id: WorkerId) -> DeviceFlag;
    fn worker_num_threads(&self, worker_id: WorkerId) -> u32;
    fn worker_cpu_mask_ordinal(&self, worker_id: WorkerId) -> u32;
    fn worker_cpu_mask(&self, worker_id: WorkerId) -> CPUMaskFlag;
    fn pause_worker(&self, worker_id: WorkerId);
    fn resume_worker(&self, worker_id: WorkerId);
    fn wait_worker_idle(&self, worker_id: WorkerId);
    /// Every materialized subgraph key for `model_id` bound to `worker_id`.
    fn subgraphs_for(&self, model_id: ModelId, worker_id: WorkerId) -> Vec<SubgraphKey>;
    /// Runs on an isolated profiling thread pinned to the worker's affinity.
    fn invoke(&self, key: SubgraphKey) -> Result<()>;
    fn model_path(&self, model_id: ModelId) -> Option<String>;
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct Latency {
    profiled: f64,
    moving_averaged: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PersistedProfile {
    hash: u64,
    #[serde(default)]
    models: BTreeMap<String, BTreeMap<String, BTreeMap<WorkerId, Latency>>>,
}

/// The sentinel `GetExpected` returns for an unprofiled key, steering
/// schedulers away from unprofiled paths without special-casing them.
pub const UNKNOWN_LATENCY_SENTINEL: i64 = i32::MAX as i64;

pub struct LatencyEstimator {
    config: ProfileConfig,
    table: RwLock<BTreeMap<SubgraphKey, Latency>>,
}

impl LatencyEstimator {
    pub fn new(config: ProfileConfig) -> Self {
        LatencyEstimator {
            config,
            table: RwLock::new(BTreeMap::new()),
        }
    }

    /// Warns (does not error) when `key` has never been profiled, matching
    /// the original's tolerant update semantics.
    pub fn update(&self, key: SubgraphKey, latency_us: i64) {
        let mut table = self.table.write();
        match table.get_mut(&key) {
            Some(entry) => {
                let alpha = self.config.smoothing_factor;
                let prev = entry.moving_averaged;
                entry.moving_averaged = alpha * latency_us as f64 + (1.0 - alpha) * prev;
            }
            None => {
                log::warn!("latency update for unprofiled subgraph key {key}");
            }
        }
    }

    pub fn get_profiled(&self, key: SubgraphKey) -> i64 {
        match self.table.read().get(&key) {
            Some(entry) => entry.profiled as i64,
            None => {
                log::warn!("GetProfiled: subgraph key {key} not found");
                -1
            }
        }
    }

    pub fn get_expected(&self, key: SubgraphKey) -> i64 {
        match self.table.read().get(&key) {
            Some(entry) => entry.moving_averaged as i64,
            None => UNKNOWN_LATENCY_SENTINEL,
        }
    }

    pub fn get_worst(&self, model_id: ModelId) -> i64 {
        self.table
            .read()
            .iter()
            .filter(|(key, _)| key.model_id() == model_id)
            .map(|(_, v)| v.moving_averaged as i64)
            .max()
            .unwrap_or(0)
    }

    /// Computes the hash that gates profile reuse: XOR of per-worker
    /// `(device, thread count, cpu mask)` hashes, seeded by worker count.
    pub fn profile_hash(host: &dyn ProfilingHost) -> u64 {
        use std::hash::{Hash, Hasher};
        let n = host.num_workers();
        let mut hash = {
            let mut h = std::collections::hash_map::DefaultHasher::new();
            n.hash(&mut h);
            h.finish()
        };
        for worker_id in 0..n as WorkerId {
            let mut h = std::collections::hash_map::DefaultHasher::new();
            (host.worker_device(worker_id) as u32).hash(&mut h);
            hash ^= h.finish();

            let mut h = std::collections::hash_map::DefaultHasher::new();
            host.worker_num_threads(worker_id).hash(&mut h);
            hash ^= h.finish();

            let mut h = std::collections::hash_map::DefaultHasher::new();
            host.worker_cpu_mask_ordinal(worker_id).hash(&mut h);
            hash ^= h.finish();
        }
        hash
    }

    /// Warms up then times every subgraph of `model_id`, one worker at a
    /// time, pausing the worker for the duration and invoking from an
    /// isolated thread so the timed call never contends with the worker's
    /// own loop.
    pub fn profile_model(&self, model_id: ModelId, host: &dyn ProfilingHost) -> Result<()> {
        if !self.config.online {
            return self.load_offline_profile(model_id, host);
        }
        for worker_id in 0..host.num_workers() as WorkerId {
            host.pause_worker(worker_id);
            host.wait_worker_idle(worker_id);

            let keys = host.subgraphs_for(model_id, worker_id);
            let cores = cpu_affinity::topology().cores_for(host.worker_cpu_mask(worker_id)).to_vec();
            let num_warmups = self.config.num_warmups;
            let num_runs = self.config.num_runs;

            let timings = std::thread::scope(|scope| {
                scope
                    .spawn(|| {
                        if let Err(e) = cpu_affinity::pin_thread(&cores) {
                            log::debug!("profiling thread affinity pin skipped: {e}");
                        }
                        let mut timings = Vec::with_capacity(keys.len());
                        for key in &keys {
                            for _ in 0..num_warmups {
                                if let Err(e) = host.invoke(*key) {
                                    log::error!("profiler warmup invoke failed for {key}: {e}");
                                }
                            }
                            let mut total = 0i64;
                            for _ in 0..num_runs {
                                let start = std::time::Instant::now();
                                if let Err(e) = host.invoke(*key) {
                                    log::error!("profiler timed invoke failed for {key}: {e}");
                                }
                                total += start.elapsed().as_micros() as i64;
                            }
                            let runs = num_runs.max(1) as i64;
                            timings.push((*key, total / runs));
                        }
                        timings
                    })
                    .join()
                    .unwrap_or_default()
            });

            let mut table = self.table.write();
            for (key, latency) in timings {
                table.insert(
                    key,
                    Latency {
                        profiled: latency as f64,
                        moving_averaged: latency as f64,
                    },
                );
            }

            host.resume_worker(worker_id);
        }
        Ok(())
    }

    fn load_offline_profile(&self, model_id: ModelId, host: &dyn ProfilingHost) -> Result<()> {
        let Some(model_path) = host.model_path(model_id) else {
            return Ok(());
        };
        let persisted = match Self::read_persisted(&self.config.path) {
            Ok(p) => p,
            Err(_) => return Ok(()),
        };
        if persisted.hash != Self::profile_hash(host) {
            log::warn!(
                "profile hash mismatch for {}; ignoring persisted profile",
                self.config.path.display()
            );
            return Ok(());
        }
        let Some(unit_profiles) = persisted.models.get(&model_path) else {
            log::warn!("no persisted profile entries for model {model_path}");
            return Ok(());
        };
        let mut table = self.table.write();
        let mut found = 0;
        for (csv, by_worker) in unit_profiles {
            let mask = SubgraphKey::from_unit_indices_csv(csv);
            for (&worker_id, latency) in by_worker {
                if latency.profiled <= 0.0 {
                    continue;
                }
                let key = SubgraphKey::new(model_id, worker_id, mask);
                table.insert(key, *latency);
                found += 1;
            }
        }
        log::debug!("loaded {found} profile entries for model {model_path}");
        Ok(())
    }

    pub fn dump_profile(&self, host: &dyn ProfilingHost) -> Result<()> {
        let mut models: BTreeMap<String, BTreeMap<String, BTreeMap<WorkerId, Latency>>> =
            BTreeMap::new();
        for (key, latency) in self.table.read().iter() {
            let Some(path) = host.model_path(key.model_id()) else {
                log::error!("cannot find model {} while dumping profile; skipping", key.model_id());
                continue;
            };
            models
                .entry(path)
                .or_default()
                .entry(key.unit_indices_csv())
                .or_default()
                .insert(key.worker_id(), *latency);
        }
        let persisted = PersistedProfile {
            hash: Self::profile_hash(host),
            models,
        };
        let text = serde_json::to_string_pretty(&persisted)
            .map_err(|e| BandError::internal(format!("failed to serialize profile: {e}")))?;
        std::fs::write(&self.config.path, text)
            .map_err(|e| BandError::internal(format!("failed to write profile file: {e}")))?;
        Ok(())
    }

    fn read_persisted(path: &Path) -> Result<PersistedProfile> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| BandError::not_found(format!("profile file {}: {}", path.display(), e)))?;
        serde_json::from_str(&text)
            .map_err(|e| BandError::invalid_argument(format!("malformed profile file: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakeHost {
        workers: Vec<(DeviceFlag, u32, u32)>,
        subgraphs: Vec<SubgraphKey>,
        invocations: AtomicU32,
        model_paths: BTreeMap<ModelId, String>,
    }

    impl ProfilingHost for FakeHost {
        fn num_workers(&self) -> usize {
            self.workers.len()
        }
        fn worker_device(&self, worker_id: WorkerId) -> DeviceFlag {
            self.workers[worker_id as usize].0
        }
        fn worker_num_threads(&self, worker_id: WorkerId) -> u32 {
            self.workers[worker_id as usize].1
        }
        fn worker_cpu_mask_ordinal(&self, worker_id: WorkerId) -> u32 {
            self.workers[worker_id as usize].2
        }
        fn worker_cpu_mask(&self, _worker_id: WorkerId) -> CPUMaskFlag {
            CPUMaskFlag::All
        }
        fn pause_worker(&self, _worker_id: WorkerId) {}
        fn resume_worker(&self, _worker_id: WorkerId) {}
        fn wait_worker_idle(&self, _worker_id: WorkerId) {}
        fn subgraphs_for(&self, model_id: ModelId, worker_id: WorkerId) -> Vec<SubgraphKey> {
            self.subgraphs
                .iter()
                .filter(|k| k.model_id() == model_id && k.worker_id() == worker_id)
                .copied()
                .collect()
        }
        fn invoke(&self, _key: SubgraphKey) -> Result<()> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn model_path(&self, model_id: ModelId) -> Option<String> {
            self.model_paths.get(&model_id).cloned()
        }
    }

    fn host_with_one_subgraph() -> FakeHost {
        let mut model_paths = BTreeMap::new();
        model_paths.insert(0, "model.tflite".to_string());
        FakeHost {
            workers: vec![(DeviceFlag::CPU, 1, 0)],
            subgraphs: vec![SubgraphKey::new(0, 0, 0b1)],
            invocations: AtomicU32::new(0),
            model_paths,
        }
    }

    fn profile_config() -> ProfileConfig {
        ProfileConfig {
            path: std::env::temp_dir().join("band_test_profile_unused.json"),
            online: true,
            num_warmups: 1,
            num_runs: 2,
            smoothing_factor: 0.5,
        }
    }

    #[test]
    fn unprofiled_key_returns_sentinel() {
        let est = LatencyEstimator::new(profile_config());
        assert_eq!(est.get_expected(SubgraphKey::new(0, 0, 0b1)), UNKNOWN_LATENCY_SENTINEL);
        assert_eq!(est.get_profiled(SubgraphKey::new(0, 0, 0b1)), -1);
    }

    #[test]
    fn profile_model_populates_expected_latency() {
        let host = host_with_one_subgraph();
        let est = LatencyEstimator::new(profile_config());
        est.profile_model(0, &host).unwrap();
        let key = SubgraphKey::new(0, 0, 0b1);
        assert!(est.get_expected(key) > 0);
        assert!(host.invocations.load(Ordering::SeqCst) >= 3); // 1 warmup + 2 runs
    }

    #[test]
    fn update_moves_expected_toward_observed() {
        let host = host_with_one_subgraph();
        let est = LatencyEstimator::new(profile_config());
        est.profile_model(0, &host).unwrap();
        let key = SubgraphKey::new(0, 0, 0b1);
        let before = est.get_expected(key);
        est.update(key, before + 1000);
        let after = est.get_expected(key);
        assert!((after - (before + 1000)).abs() <= (before - (before + 1000)).abs());
    }

    #[test]
    fn dump_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.json");

        let host = host_with_one_subgraph();
        let mut cfg = profile_config();
        cfg.path = path.clone();
        let est = LatencyEstimator::new(cfg.clone());
        est.profile_model(0, &host).unwrap();
        est.dump_profile(&host).unwrap();

        let mut cfg2 = cfg;
        cfg2.online = false;
        let est2 = LatencyEstimator::new(cfg2);
        est2.load_offline_profile(0, &host).unwrap();

        let key = SubgraphKey::new(0, 0, 0b1);
        assert_eq!(est.get_expected(key), est2.get_expected(key));
    }
}
