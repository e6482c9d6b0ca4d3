use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::job::{Job, JobStatus};

use super::{try_enqueue, EnqueueOutcome, Scheduler, SchedulingContext};

/// Cycles through the worker pool, assigning each job any materialized
/// subgraph of its model on the worker whose turn it is.
pub struct RoundRobinScheduler {
    next: AtomicUsize,
}

impl RoundRobinScheduler {
    pub fn new() -> Self {
        RoundRobinScheduler {
            next: AtomicUsize::new(0),
        }
    }
}

impl Default for RoundRobinScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for RoundRobinScheduler {
    fn schedule(&self, ctx: &dyn SchedulingContext, queue: &mut VecDeque<Job>) -> bool {
        let mut workers = ctx.worker_ids();
        workers.sort_unstable();
        if workers.is_empty() {
            return true;
        }

        while let Some(job) = queue.pop_front() {
            let idx = self.next.fetch_add(1, Ordering::Relaxed) % workers.len();
            let worker_id = workers[idx];
            let Some(key) = ctx.largest_subgraph_key(job.model_id, worker_id) else {
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
