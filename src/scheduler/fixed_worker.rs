use std::collections::VecDeque;

use crate::job::{Job, JobStatus};

use super::{try_enqueue, EnqueueOutcome, Scheduler, SchedulingContext};

/// Every job names its own `target_worker_id`; pair it with the largest
/// materialized subgraph on that worker. Fails with `EnqueueFailed` when the
/// target worker id does not exist.
pub struct FixedWorkerScheduler;

impl Scheduler for FixedWorkerScheduler {
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
}
