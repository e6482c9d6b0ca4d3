use std::collections::{BTreeMap, VecDeque};

use crate::job::{Job, JobStatus};

use super::{try_enqueue, EnqueueOutcome, Scheduler, SchedulingContext};

/// For each job in a bounded window, asks the engine for the subgraph
/// minimizing `waiting_time + expected_execution_time` across all workers.
pub struct ShortestExpectedLatencyScheduler {
    pub schedule_window_size: usize,
}

impl Scheduler for ShortestExpectedLatencyScheduler {
    fn schedule(&self, ctx: &dyn SchedulingContext, queue: &mut VecDeque<Job>) -> bool {
        let worker_waiting: BTreeMap<_, _> = ctx
            .worker_ids()
            .into_iter()
            .map(|w| (w, ctx.worker_waiting_time(w)))
            .collect();

        let window = self.schedule_window_size.max(1).min(queue.len());
        for _ in 0..window {
            let Some(job) = queue.pop_front() else { break };
            match ctx.shortest_latency(&job, &worker_waiting) {
                None => ctx.fail_job(job, JobStatus::EnqueueFailed),
                Some((key, _finish_time)) => {
                    if let EnqueueOutcome::Failed(job) = try_enqueue(ctx, job, key) {
                        ctx.fail_job(job, JobStatus::EnqueueFailed);
                    }
                }
            }
        }
        true
    }
}
