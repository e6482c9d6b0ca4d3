use std::collections::{BTreeMap, VecDeque};

use crate::job::{Job, JobStatus};

use super::{try_enqueue, EnqueueOutcome, Scheduler, SchedulingContext};

/// Two-phase policy: rank jobs by a model-wide upward rank (here, the
/// model's worst-case materialized latency, standing in for "sum of
/// largest-remaining subgraph latencies" once only one subgraph remains per
/// job at schedule time), then for each job in rank order pick the
/// `(subgraph, worker)` minimising earliest finish time, `EFT = max(waiting,
/// ready_time) + expected`. `reserved` additionally keeps a worker's
/// post-dispatch waiting time pinned in the local snapshot so later jobs in
/// the same tick see it as already booked, approximating a pessimistic
/// reservation for higher-rank future arrivals.
pub struct HeftScheduler {
    pub reserved: bool,
}

impl Scheduler for HeftScheduler {
    fn schedule(&self, ctx: &dyn SchedulingContext, queue: &mut VecDeque<Job>) -> bool {
        let mut worker_waiting: BTreeMap<_, _> = ctx
            .worker_ids()
            .into_iter()
            .map(|w| (w, ctx.worker_waiting_time(w)))
            .collect();

        let mut jobs: Vec<_> = queue.drain(..).collect();
        jobs.sort_by_key(|j| std::cmp::Reverse(ctx.model_worst_latency(j.model_id)));

        for job in jobs {
            match ctx.shortest_latency(&job, &worker_waiting) {
                None => ctx.fail_job(job, JobStatus::EnqueueFailed),
                Some((key, finish_time)) => {
                    if self.reserved {
                        worker_waiting.insert(key.worker_id(), finish_time);
                    }
                    if let EnqueueOutcome::Failed(job) = try_enqueue(ctx, job, key) {
                        ctx.fail_job(job, JobStatus::EnqueueFailed);
                    }
                }
            }
        }
        true
    }
}
