//! Scheduling policies. Each policy consumes a snapshot of per-worker
//! waiting time from the engine and hands `(job, subgraph_key)` pairs to
//! `SchedulingContext::enqueue_to_worker`.

mod fixed_worker;
mod fixed_worker_global_queue;
mod heft;
mod least_slack_time_first;
mod round_robin;
mod shortest_expected_latency;

pub use fixed_worker::FixedWorkerScheduler;
pub use fixed_worker_global_queue::FixedWorkerGlobalQueueScheduler;
pub use heft::HeftScheduler;
pub use least_slack_time_first::LeastSlackTimeFirstScheduler;
pub use round_robin::RoundRobinScheduler;
pub use shortest_expected_latency::ShortestExpectedLatencyScheduler;

use std::collections::{BTreeMap, VecDeque};

use crate::error::Result;
use crate::ids::{ModelId, SubgraphKey, WorkerId};
use crate::job::{Job, JobStatus};
use crate::worker::QueueMode;

/// The view of engine/worker state a scheduler needs to make decisions,
/// implemented by the engine facade.
pub trait SchedulingContext: Send + Sync {
    fn worker_ids(&self) -> Vec<WorkerId>;
    fn worker_queue_mode(&self, worker_id: WorkerId) -> QueueMode;
    fn worker_waiting_time(&self, worker_id: WorkerId) -> i64;
    fn expected_latency(&self, key: SubgraphKey) -> i64;
    fn largest_subgraph_key(&self, model_id: ModelId, worker_id: WorkerId) -> Option<SubgraphKey>;
    fn model_worst_latency(&self, model_id: ModelId) -> i64;
    /// Best `(subgraph_key, finish_time)` continuation for `job`, given a
    /// snapshot of per-worker waiting time, restricted to subgraphs whose
    /// dependencies are already in `job.resolved_unit_subgraphs`.
    fn shortest_latency(
        &self,
        job: &Job,
        worker_waiting: &BTreeMap<WorkerId, i64>,
    ) -> Option<(SubgraphKey, i64)>;
    /// Whether dispatching `key` would resolve every unit subgraph of the
    /// job's model.
    fn is_model_end(&self, job: &Job, key: SubgraphKey) -> bool;
    /// Hands the job to the chosen worker's queue. On failure the job is
    /// handed back so the caller can retry or fail it; `Unavailable` means
    /// try again next tick, any other error is a scheduling failure.
    fn enqueue_to_worker(&self, job: Job, key: SubgraphKey) -> std::result::Result<(), (Job, crate::error::BandError)>;
    /// Records a job that could not be scheduled at all.
    fn fail_job(&self, job: Job, status: JobStatus);
    fn now(&self) -> i64;
}

/// A scheduling policy mutates `queue` in place, leaving unscheduled jobs
/// behind for the next tick. The return value is `true` iff everything this
/// tick durably either dispatched or failed — `false` asks the planner to
/// re-run immediately without waiting for a new notification.
pub trait Scheduler: Send + Sync {
    fn schedule(&self, ctx: &dyn SchedulingContext, queue: &mut VecDeque<Job>) -> bool;

    /// Whether this policy requires every worker it targets to run in
    /// `QueueMode::Global`.
    fn requires_global_queue(&self) -> bool {
        false
    }
}

/// Deterministic tie-break required of every policy: prefer the lower
/// worker id, then the lower unit-index bitmask.
pub(crate) fn better_candidate(a: (WorkerId, SubgraphKey), b: (WorkerId, SubgraphKey)) -> bool {
    (a.0, a.1.unit_indices()) < (b.0, b.1.unit_indices())
}

/// Dispatches via the context, which handles SLO-drop and busy-worker
/// requeue internally; only a genuinely invalid worker id surfaces as
/// `Failed` here.
pub(crate) fn try_enqueue(ctx: &dyn SchedulingContext, job: Job, key: SubgraphKey) -> EnqueueOutcome {
    match ctx.enqueue_to_worker(job, key) {
        Ok(()) => EnqueueOutcome::Dispatched,
        Err((job, _)) => EnqueueOutcome::Failed(job),
    }
}

pub(crate) enum EnqueueOutcome {
    Dispatched,
    Failed(Job),
}
