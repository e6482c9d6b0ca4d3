//! The facade aggregating the resource monitor, latency estimator, worker
//! pool, and planner behind the interfaces workers, the latency estimator,
//! and scheduler policies call into.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::backend::{BackendAdapter, TensorBroker};
use crate::config::{Config, SchedulerKind};
use crate::error::{BandError, Result};
use crate::ids::{CPUMaskFlag, DeviceFlag, JobId, ModelId, SubgraphKey, WorkerId};
use crate::job::{Job, JobStatus};
use crate::latency::{LatencyEstimator, ProfilingHost};
use crate::model::ModelSpec;
use crate::planner::Planner;
use crate::resource_monitor::ResourceMonitor;
use crate::scheduler::{
    better_candidate, FixedWorkerGlobalQueueScheduler, FixedWorkerScheduler, HeftScheduler,
    LeastSlackTimeFirstScheduler, RoundRobinScheduler, Scheduler, SchedulingContext,
    ShortestExpectedLatencyScheduler,
};
use crate::trace::{TraceEvent, Tracer};
use crate::worker::{QueueMode, Worker, WorkerEngineHost};

fn now_micros() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

fn make_scheduler(kind: SchedulerKind, window: usize) -> Box<dyn Scheduler> {
    match kind {
        SchedulerKind::FixedWorker => Box::new(FixedWorkerScheduler),
        SchedulerKind::FixedWorkerGlobalQueue => Box::new(FixedWorkerGlobalQueueScheduler),
        SchedulerKind::RoundRobin => Box::new(RoundRobinScheduler::new()),
        SchedulerKind::ShortestExpectedLatency => {
            Box::new(ShortestExpectedLatencyScheduler { schedule_window_size: window })
        }
        SchedulerKind::LeastSlackTimeFirst => Box::new(LeastSlackTimeFirstScheduler),
        SchedulerKind::Heft => Box::new(HeftScheduler { reserved: false }),
        SchedulerKind::HeftReserved => Box::new(HeftScheduler { reserved: true }),
    }
}

struct RegisteredModel {
    spec: ModelSpec,
}

/// Aggregates the resource monitor, latency estimator, worker pool, backend
/// adapter, tensor broker, and planner. Constructed with `Engine::new`, which
/// wires every worker and the planner to call back into the engine through
/// the narrow host traits rather than holding direct references to each
/// other (breaking what would otherwise be a reference cycle).
pub struct Engine {
    config: Config,
    backend: Arc<dyn BackendAdapter>,
    tensor_broker: Arc<dyn TensorBroker>,
    latency: LatencyEstimator,
    resource_monitor: Option<Arc<ResourceMonitor>>,
    workers: Vec<Arc<Worker>>,
    planner: Arc<Planner>,
    models: RwLock<BTreeMap<ModelId, RegisteredModel>>,
    next_model_id: AtomicI32,
    /// `None` means tracing is disabled; set by `enable_tracing`.
    tracer: Mutex<Option<Tracer>>,
}

impl Engine {
    pub fn new(
        config: Config,
        backend: Arc<dyn BackendAdapter>,
        tensor_broker: Arc<dyn TensorBroker>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let scheduler_kinds = config.planner.scheduler_kinds.clone();
        let schedulers: Vec<Box<dyn Scheduler>> = scheduler_kinds
            .iter()
            .map(|k| make_scheduler(*k, config.planner.schedule_window_size))
            .collect();
        let requires_global = schedulers.iter().any(|s| s.requires_global_queue());

        let planner = Planner::new(schedulers)?;

        // `ResourceMonitor::new` itself fails with `Unavailable` off Linux;
        // the resource monitor is an optional collaborator, so that failure
        // just leaves the engine without one rather than refusing to start.
        let resource_monitor = ResourceMonitor::new(config.resource_monitor.clone()).ok();

        let engine = Arc::new(Engine {
            latency: LatencyEstimator::new(config.profile.clone()),
            workers: Vec::new(),
            planner,
            models: RwLock::new(BTreeMap::new()),
            next_model_id: AtomicI32::new(0),
            resource_monitor,
            backend,
            tensor_broker,
            config: config.clone(),
            tracer: Mutex::new(None),
        });

        // `workers` is populated post-construction since each worker needs a
        // `Weak<Engine>`-backed host handle; `Arc::get_mut` is safe here
        // because no other strong reference escapes until `start()`.
        let weak = Arc::downgrade(&engine);

        let mut workers = Vec::with_capacity(config.workers.len());
        for (idx, wc) in config.workers.iter().enumerate() {
            let queue_mode = if requires_global { QueueMode::Global } else { QueueMode::Device };
            let host: Arc<dyn WorkerEngineHost> = Arc::new(EngineWorkerHost { engine: weak.clone() });
            workers.push(Worker::new(
                idx as WorkerId,
                wc.device,
                queue_mode,
                wc.num_threads,
                wc.cpu_mask,
                wc.availability_check_interval_ms,
                host,
            ));
        }

        // SAFETY net for the `Arc::get_mut` pattern: this only works while
        // `engine` is the sole strong reference, which holds here since we
        // have not yet returned it to the caller.
        let engine = {
            let mut engine = engine;
            match Arc::get_mut(&mut engine) {
                Some(inner) => inner.workers = workers,
                None => return Err(BandError::internal("engine Arc unexpectedly shared during construction")),
            }
            engine
        };

        Ok(engine)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn start(self: &Arc<Self>) -> Result<()> {
        for worker in &self.workers {
            worker.start();
        }
        self.planner.start(self.clone());
        if let Some(rm) = &self.resource_monitor {
            rm.start();
        }
        Ok(())
    }

    pub fn stop(&self) {
        self.planner.stop();
        for worker in &self.workers {
            worker.end();
        }
        if let Some(rm) = &self.resource_monitor {
            rm.stop();
        }
    }

    /// Registers a model by asking the backend to investigate `path`. The
    /// `StubBackend` cannot parse real files, so callers exercising it
    /// register a hand-built `ModelSpec` with `register_model_spec` instead.
    pub fn register_model(&self, path: &str) -> Result<ModelId> {
        let spec = self.backend.investigate_model_spec(path)?;
        Ok(self.register_model_spec(spec))
    }

    pub fn register_model_spec(&self, spec: ModelSpec) -> ModelId {
        let model_id = self.next_model_id.fetch_add(1, Ordering::SeqCst);
        self.models.write().insert(model_id, RegisteredModel { spec });
        model_id
    }

    pub fn model_spec(&self, model_id: ModelId) -> Option<ModelSpec> {
        self.models.read().get(&model_id).map(|m| m.spec.clone())
    }

    pub fn enqueue_request(&self, job: Job) -> JobId {
        self.planner.enqueue_request(job, false)
    }

    pub fn enqueue_batch(&self, jobs: Vec<Job>) -> Vec<JobId> {
        self.planner.enqueue_batch(jobs, false)
    }

    pub fn wait(&self, job_ids: &[JobId]) {
        self.planner.wait(job_ids);
    }

    pub fn wait_all(&self) {
        self.planner.wait_all();
    }

    pub fn get_finished_job(&self, job_id: JobId) -> Option<Job> {
        self.planner.get_finished_job(job_id)
    }

    pub fn profile_model(&self, model_id: ModelId) -> Result<()> {
        self.latency.profile_model(model_id, self)
    }

    pub fn dump_profile(&self) -> Result<()> {
        self.latency.dump_profile(self)
    }

    /// Starts recording a begin/end duration event for every job this
    /// engine reports finished. A no-op if already enabled.
    pub fn enable_tracing(&self) {
        let mut tracer = self.tracer.lock();
        if tracer.is_none() {
            *tracer = Some(Tracer::new());
        }
    }

    pub fn dump_trace(&self, path: impl AsRef<std::path::Path>) -> Result<()> {
        match self.tracer.lock().as_ref() {
            Some(tracer) => tracer.write_to(path),
            None => Err(BandError::invalid_argument("tracing was never enabled")),
        }
    }

    fn record_trace_event(&self, job: &Job) {
        if !job.subgraph_key.is_valid() {
            return;
        }
        if let Some(tracer) = self.tracer.lock().as_mut() {
            tracer.record(TraceEvent {
                worker_id: job.subgraph_key.worker_id(),
                job: job.clone(),
            });
        }
    }

    fn worker(&self, worker_id: WorkerId) -> Option<&Arc<Worker>> {
        self.workers.get(worker_id as usize)
    }

    /// Continuation search: the materialized subgraph, among those whose
    /// dependencies are already satisfied by `job.resolved_unit_subgraphs`,
    /// minimizing `waiting_time(worker) + expected_execution_time(key)`.
    /// Mirrors `GetSubgraphWithShortestLatency`/`GetShortestLatency`, folded
    /// into one non-recursive scan since only a single hop is chosen per
    /// scheduling tick (the next hop's continuation is itself re-evaluated
    /// on the follow-up job's own scheduling pass).
    fn best_continuation(&self, job: &Job, worker_waiting: &BTreeMap<WorkerId, i64>) -> Option<(SubgraphKey, i64)> {
        let models = self.models.read();
        let spec = models.get(&job.model_id)?;

        let mut best: Option<(SubgraphKey, i64)> = None;
        self.backend.for_each_subgraph(&mut |key| {
            if key.model_id() != job.model_id {
                return;
            }
            if job.target_worker_id >= 0 && key.worker_id() != job.target_worker_id {
                return;
            }
            if key.unit_indices() & job.resolved_unit_subgraphs != 0 {
                return;
            }
            let deps = spec.unit_subgraph_dependency_mask(key.unit_indices());
            if deps & !job.resolved_unit_subgraphs != 0 {
                return;
            }
            let waiting = worker_waiting.get(&key.worker_id()).copied().unwrap_or(0);
            let expected = self.latency.get_expected(key);
            let finish = waiting.saturating_add(expected);
            let candidate = (key, finish);
            best = Some(match best {
                None => candidate,
                Some(cur) => {
                    if finish < cur.1
                        || (finish == cur.1
                            && better_candidate((key.worker_id(), key), (cur.0.worker_id(), cur.0)))
                    {
                        candidate
                    } else {
                        cur
                    }
                }
            });
        });
        best
    }

    /// Declared on the facade per its full operation surface but not called
    /// by any shipped scheduler; returns `NotFound` unconditionally until a
    /// caller exists.
    pub fn get_subgraph_idx_satisfying_slo(
        &self,
        _job: &Job,
        _worker_waiting: &BTreeMap<WorkerId, i64>,
        _idle_workers: &[WorkerId],
    ) -> Result<SubgraphKey> {
        Err(BandError::not_found("GetSubgraphIdxSatisfyingSLO has no caller"))
    }
}

/// Bridges `Worker`'s calls back into the engine without the worker holding
/// a strong reference (which would keep the engine alive past `stop()`).
struct EngineWorkerHost {
    engine: Weak<Engine>,
}

impl EngineWorkerHost {
    fn engine(&self) -> Arc<Engine> {
        self.engine
            .upgrade()
            .expect("worker outlived its engine")
    }
}

impl WorkerEngineHost for EngineWorkerHost {
    fn try_copy_input_tensors(&self, job: &Job) -> Result<()> {
        self.engine().tensor_broker.copy_input(job)
    }

    fn try_copy_output_tensors(&self, job: &Job) -> Result<()> {
        self.engine().tensor_broker.copy_output(job)
    }

    fn invoke(&self, key: SubgraphKey) -> Result<()> {
        self.engine().backend.execute_subgraph(key)
    }

    fn update_latency(&self, key: SubgraphKey, latency_us: i64) {
        self.engine().latency.update(key, latency_us);
    }

    fn enqueue_batch(&self, jobs: Vec<Job>, push_front: bool) {
        self.engine().planner.enqueue_batch(jobs, push_front);
    }

    fn enqueue_request(&self, job: Job, push_front: bool) {
        self.engine().planner.enqueue_request(job, push_front);
    }

    fn enqueue_finished_job(&self, job: Job) {
        let engine = self.engine();
        engine.record_trace_event(&job);
        engine.planner.enqueue_finished_job(job);
    }

    fn trigger(&self) {
        // The planner's own request_cv wakes on every enqueue; nothing
        // further is needed since this engine never pauses the planner.
    }
}

impl ProfilingHost for Engine {
    fn num_workers(&self) -> usize {
        self.workers.len()
    }

    fn worker_device(&self, worker_id: WorkerId) -> DeviceFlag {
        self.worker(worker_id).map(|w| w.device_flag()).unwrap_or(DeviceFlag::CPU)
    }

    fn worker_num_threads(&self, worker_id: WorkerId) -> u32 {
        self.worker(worker_id).map(|w| w.num_threads()).unwrap_or(1)
    }

    fn worker_cpu_mask_ordinal(&self, worker_id: WorkerId) -> u32 {
        match self.worker(worker_id).map(|w| w.cpu_mask()) {
            Some(CPUMaskFlag::All) => 0,
            Some(CPUMaskFlag::Little) => 1,
            Some(CPUMaskFlag::Big) => 2,
            Some(CPUMaskFlag::Primary) => 3,
            None => 0,
        }
    }

    fn worker_cpu_mask(&self, worker_id: WorkerId) -> CPUMaskFlag {
        self.worker(worker_id).map(|w| w.cpu_mask()).unwrap_or(CPUMaskFlag::All)
    }

    fn pause_worker(&self, worker_id: WorkerId) {
        if let Some(w) = self.worker(worker_id) {
            w.pause();
        }
    }

    fn resume_worker(&self, worker_id: WorkerId) {
        if let Some(w) = self.worker(worker_id) {
            w.resume();
        }
    }

    fn wait_worker_idle(&self, worker_id: WorkerId) {
        if let Some(w) = self.worker(worker_id) {
            w.wait_idle();
        }
    }

    fn subgraphs_for(&self, model_id: ModelId, worker_id: WorkerId) -> Vec<SubgraphKey> {
        let mut out = Vec::new();
        self.backend.for_each_subgraph(&mut |key| {
            if key.model_id() == model_id && key.worker_id() == worker_id {
                out.push(key);
            }
        });
        out
    }

    fn invoke(&self, key: SubgraphKey) -> Result<()> {
        self.backend.execute_subgraph(key)
    }

    fn model_path(&self, model_id: ModelId) -> Option<String> {
        self.models.read().get(&model_id).map(|m| m.spec.path.clone())
    }
}

impl SchedulingContext for Engine {
    fn worker_ids(&self) -> Vec<WorkerId> {
        (0..self.workers.len() as WorkerId).collect()
    }

    fn worker_queue_mode(&self, worker_id: WorkerId) -> QueueMode {
        self.worker(worker_id).map(|w| w.queue_mode()).unwrap_or(QueueMode::Device)
    }

    fn worker_waiting_time(&self, worker_id: WorkerId) -> i64 {
        match self.worker(worker_id) {
            Some(w) => w.waiting_time(|key| self.latency.get_expected(key)),
            None => crate::worker::LARGE_WAITING_TIME,
        }
    }

    fn expected_latency(&self, key: SubgraphKey) -> i64 {
        self.latency.get_expected(key)
    }

    fn largest_subgraph_key(&self, model_id: ModelId, worker_id: WorkerId) -> Option<SubgraphKey> {
        self.backend.largest_subgraph_key(model_id, worker_id)
    }

    fn model_worst_latency(&self, model_id: ModelId) -> i64 {
        self.latency.get_worst(model_id)
    }

    fn shortest_latency(&self, job: &Job, worker_waiting: &BTreeMap<WorkerId, i64>) -> Option<(SubgraphKey, i64)> {
        self.best_continuation(job, worker_waiting)
    }

    fn is_model_end(&self, job: &Job, key: SubgraphKey) -> bool {
        let models = self.models.read();
        match models.get(&job.model_id) {
            Some(model) => {
                let resolved = job.resolved_unit_subgraphs | key.unit_indices();
                resolved == model.spec.full_mask()
            }
            None => true,
        }
    }

    /// Implements the planner's `EnqueueToWorker` re-check: an invalid
    /// worker id is a scheduling failure handed back to the caller; an SLO
    /// already blown is resolved here (not handed back) by failing the job
    /// directly; a busy worker is resolved here by requeueing at the
    /// planner's request-queue front; otherwise the job (with any residual
    /// follow-up split off) is dispatched to the worker.
    ///
    /// The SLO check uses `expected_latency(key)` rather than
    /// `job.expected_execution_time`, which is unset for a job's first
    /// dispatch attempt — using the stale field would make the check a
    /// no-op on every first-pass enqueue.
    fn enqueue_to_worker(&self, mut job: Job, key: SubgraphKey) -> std::result::Result<(), (Job, BandError)> {
        let Some(worker) = self.worker(key.worker_id()).cloned() else {
            return Err((job, BandError::invalid_argument(format!("no worker {}", key.worker_id()))));
        };

        let now = self.now();
        if job.slo_us > 0 {
            let elapsed = now - job.enqueue_time;
            let expected = self.expected_latency(key);
            let waiting = self.worker_waiting_time(key.worker_id());
            if waiting.saturating_add(expected) > job.slo_us - elapsed {
                job.status = JobStatus::SLOViolation;
                job.invoke_time = -1;
                job.end_time = now;
                self.record_trace_event(&job);
                self.planner.enqueue_finished_job(job);
                return Ok(());
            }
        }

        if !worker.is_enqueue_ready() {
            self.planner.enqueue_request(job, true);
            return Ok(());
        }

        job.subgraph_key = key;
        job.expected_latency = self.expected_latency(key);
        job.expected_execution_time = job.expected_latency;

        let model_ends = self.is_model_end(&job, key);
        let resolved_after = job.resolved_unit_subgraphs | key.unit_indices();
        if !model_ends {
            let mut follow_up = job.clone();
            follow_up.resolved_unit_subgraphs = resolved_after;
            follow_up.previous_subgraph_keys.push(key);
            follow_up.subgraph_key = SubgraphKey::invalid();
            follow_up.invoke_time = 0;
            follow_up.end_time = 0;
            follow_up.following_jobs = Vec::new();
            job.following_jobs = vec![follow_up];
        }
        // Recorded regardless of `model_ends`: a finished job's mask must
        // reflect the dispatch that just completed, not just prior hops.
        job.resolved_unit_subgraphs = resolved_after;

        match worker.enqueue_job(job) {
            Ok(()) => Ok(()),
            Err(job) => {
                self.planner.enqueue_request(job, true);
                Ok(())
            }
        }
    }

    fn fail_job(&self, mut job: Job, status: JobStatus) {
        job.status = status;
        job.end_time = self.now();
        self.record_trace_event(&job);
        self.planner.enqueue_finished_job(job);
    }

    fn now(&self) -> i64 {
        now_micros()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{NullTensorBroker, StubBackend, StubLatency};
    use crate::config::{PlannerConfig, ProfileConfig, WorkerConfig};
    use crate::job::JobBuilder;
    use crate::model::TensorType;
    use std::collections::{BTreeMap, BTreeSet};

    fn btree(v: &[usize]) -> BTreeSet<usize> {
        v.iter().copied().collect()
    }

    fn two_unit_spec() -> ModelSpec {
        ModelSpec::new(
            "two_unit.model",
            2,
            2,
            vec![TensorType::Float32; 2],
            btree(&[]),
            btree(&[1]),
            vec![btree(&[]), btree(&[0])],
            vec![btree(&[0]), btree(&[1])],
            BTreeMap::new(),
            BTreeSet::new(),
            vec![btree(&[0]), btree(&[1])],
        )
        .unwrap()
    }

    fn one_worker_config() -> Config {
        Config {
            planner: PlannerConfig {
                scheduler_kinds: vec![SchedulerKind::FixedWorker],
                ..PlannerConfig::default()
            },
            workers: vec![WorkerConfig { device: DeviceFlag::CPU, ..WorkerConfig::default() }],
            profile: ProfileConfig { path: std::env::temp_dir().join("engine_test_unused.json"), ..ProfileConfig::default() },
            ..Config::default()
        }
    }

    #[test]
    fn fixed_worker_happy_path_runs_both_units_on_target_worker() {
        let backend = Arc::new(StubBackend::new());
        let key0 = SubgraphKey::new(0, 0, 0b01);
        let key1 = SubgraphKey::new(0, 0, 0b10);
        backend.register_subgraph(key0, btree(&[0]), StubLatency { micros: 100 });
        backend.register_subgraph(key1, btree(&[1]), StubLatency { micros: 100 });

        let engine = Engine::new(one_worker_config(), backend.clone(), Arc::new(NullTensorBroker)).unwrap();
        let model_id = engine.register_model_spec(two_unit_spec());
        assert_eq!(model_id, 0);

        engine.start().unwrap();

        let job = JobBuilder::new(model_id).target_worker(0).build();
        let ids = engine.enqueue_batch(vec![job]);
        engine.wait(&ids);
        engine.stop();

        let finished = engine.get_finished_job(ids[0]).unwrap();
        assert_eq!(finished.status, JobStatus::Success);
        assert_eq!(finished.subgraph_key.worker_id(), 0);
        assert_eq!(finished.resolved_unit_subgraphs, 0b11);
        assert_eq!(backend.invoke_log().len(), 2);
    }

    #[test]
    fn residual_dispatch_carries_previous_subgraph_keys() {
        let backend = Arc::new(StubBackend::new());
        let key0 = SubgraphKey::new(0, 0, 0b01);
        let key1 = SubgraphKey::new(0, 0, 0b10);
        backend.register_subgraph(key0, btree(&[0]), StubLatency { micros: 0 });
        backend.register_subgraph(key1, btree(&[1]), StubLatency { micros: 0 });

        let engine = Engine::new(one_worker_config(), backend, Arc::new(NullTensorBroker)).unwrap();
        let model_id = engine.register_model_spec(two_unit_spec());
        engine.start().unwrap();

        let job = JobBuilder::new(model_id).target_worker(0).build();
        let ids = engine.enqueue_batch(vec![job]);
        engine.wait(&ids);
        engine.stop();

        let finished = engine.get_finished_job(ids[0]).unwrap();
        assert_eq!(finished.previous_subgraph_keys, vec![key0]);
        assert_eq!(finished.subgraph_key, key1);
    }

    #[test]
    fn batch_runs_in_enqueue_order_on_a_single_device_queue_worker() {
        let backend = Arc::new(StubBackend::new());
        let key = SubgraphKey::new(0, 0, 0b01);
        backend.register_subgraph(key, btree(&[0]), StubLatency { micros: 500 });

        let model = ModelSpec::new(
            "single_unit.model",
            1,
            0,
            Vec::new(),
            btree(&[]),
            btree(&[]),
            vec![btree(&[])],
            vec![btree(&[])],
            BTreeMap::new(),
            BTreeSet::new(),
            vec![btree(&[0])],
        )
        .unwrap();

        let engine = Engine::new(one_worker_config(), backend, Arc::new(NullTensorBroker)).unwrap();
        let model_id = engine.register_model_spec(model);
        engine.start().unwrap();

        let jobs: Vec<_> = (0..3).map(|_| JobBuilder::new(model_id).target_worker(0).build()).collect();
        let ids = engine.enqueue_batch(jobs);
        engine.wait(&ids);
        engine.stop();

        let finished: Vec<_> = ids.iter().map(|id| engine.get_finished_job(*id).unwrap()).collect();
        assert!(finished.iter().all(|j| j.status == JobStatus::Success));
        assert!(finished[0].invoke_time < finished[1].invoke_time);
        assert!(finished[1].invoke_time < finished[2].invoke_time);
    }

    #[test]
    fn unknown_target_worker_fails_the_job() {
        let backend = Arc::new(StubBackend::new());
        let engine = Engine::new(one_worker_config(), backend, Arc::new(NullTensorBroker)).unwrap();
        let model_id = engine.register_model_spec(two_unit_spec());
        engine.start().unwrap();

        let job = JobBuilder::new(model_id).target_worker(7).build();
        let ids = engine.enqueue_batch(vec![job]);
        engine.wait(&ids);
        engine.stop();

        assert_eq!(engine.get_finished_job(ids[0]).unwrap().status, JobStatus::EnqueueFailed);
    }

    #[test]
    fn slo_violation_skips_invoke() {
        let backend = Arc::new(StubBackend::new());
        let key0 = SubgraphKey::new(0, 0, 0b01);
        let key1 = SubgraphKey::new(0, 0, 0b10);
        backend.register_subgraph(key0, btree(&[0]), StubLatency { micros: 0 });
        backend.register_subgraph(key1, btree(&[1]), StubLatency { micros: 0 });

        let engine = Engine::new(one_worker_config(), backend.clone(), Arc::new(NullTensorBroker)).unwrap();
        let model_id = engine.register_model_spec(two_unit_spec());
        // key0 is never profiled, so `expected_latency` falls back to the
        // "unknown" sentinel, which alone blows a 1us SLO.
        engine.start().unwrap();

        let job = JobBuilder::new(model_id).target_worker(0).slo_us(1).build();
        let ids = engine.enqueue_batch(vec![job]);
        engine.wait(&ids);
        engine.stop();

        let finished = engine.get_finished_job(ids[0]).unwrap();
        assert_eq!(finished.status, JobStatus::SLOViolation);
        assert_eq!(finished.invoke_time, -1);
        assert!(backend.invoke_log().is_empty());
    }

    #[test]
    fn tracing_records_a_begin_end_pair_per_dispatch() {
        let backend = Arc::new(StubBackend::new());
        let key0 = SubgraphKey::new(0, 0, 0b01);
        let key1 = SubgraphKey::new(0, 0, 0b10);
        backend.register_subgraph(key0, btree(&[0]), StubLatency { micros: 0 });
        backend.register_subgraph(key1, btree(&[1]), StubLatency { micros: 0 });

        let engine = Engine::new(one_worker_config(), backend, Arc::new(NullTensorBroker)).unwrap();
        let model_id = engine.register_model_spec(two_unit_spec());
        engine.enable_tracing();
        engine.start().unwrap();

        let job = JobBuilder::new(model_id).target_worker(0).build();
        let ids = engine.enqueue_batch(vec![job]);
        engine.wait(&ids);
        engine.stop();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.json");
        engine.dump_trace(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&text).unwrap();
        // Two unit subgraphs dispatched on the same worker: one begin/end pair each.
        assert_eq!(doc["traceEvents"].as_array().unwrap().len(), 4);
    }
}
