use std::collections::VecDeque;

use crate::job::{Job, JobStatus};

use super::{try_enqueue, EnqueueOutcome, Scheduler, SchedulingContext};

/// Same decision rule as `FixedWorkerScheduler`, but every targeted worker
/// advertises readiness through a single-slot (global) queue instead of a
/// per-device FIFO.
pub struct FixedWorkerGlobalQueueScheduler;

impl Scheduler for FixedWorkerGlobalQueueScheduler {
    fn schedule(&self, ctx: &dyn SchedulingContext, queue: &mut VecDeque<Job>) -> bool {
        while let Some(job) = queue.pop_front() {
            if job.target_worker_id < 0 || !ctx.worker_ids().contains(&job.target_worker_id) {
                ctx.fail_job(job, JobStatus::EnqueueFailed);
                continue;
            }
            let Some(key) = ctx.largest_subgraph_key(job.model_id, job.target_worker_id) else {
                ctx.fail_job(job, JobStatus::EnqueueFailed);
                continue;
            };
            if let EnqueueOutcome::Failed(job) = try_enqueue(ctx, job, key) {
                ctx.fail_job(job, JobStatus::EnqueueFailed);
            }
        }
        true
    }

    fn requires_global_queue(&self) -> bool {
        true
    }
}
