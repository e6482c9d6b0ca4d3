use std::collections::{BTreeMap, VecDeque};

use crate::job::{Job, JobStatus};

use super::{try_enqueue, EnqueueOutcome, Scheduler, SchedulingContext};

fn slack(ctx: &dyn SchedulingContext, job: &Job) -> i64 {
    if job.slo_us <= 0 {
        return i64::MAX;
    }
    let elapsed = ctx.now() - job.enqueue_time;
    let expected_total = ctx.model_worst_latency(job.model_id);
    job.slo_us - elapsed - expected_total
}

/// Sorts the queue by slack (`slo_us - elapsed - expected_total`) and
/// schedules the least-slack job first; a job whose slack has already gone
/// negative is dropped immediately with `SLOViolation` rather than run.
pub struct LeastSlackTimeFirstScheduler;

impl Scheduler for LeastSlackTimeFirstScheduler {
    fn schedule(&self, ctx: &dyn SchedulingContext, queue: &mut VecDeque<Job>) -> bool {
        let worker_waiting: BTreeMap<_, _> = ctx
            .worker_ids()
            .into_iter()
            .map(|w| (w, ctx.worker_waiting_time(w)))
            .collect();

        let mut jobs: Vec<_> = queue.drain(..).collect();
        jobs.sort_by_key(|j| slack(ctx, j));

        for job in jobs {
            if slack(ctx, &job) < 0 {
                ctx.fail_job(job, JobStatus::SLOViolation);
                continue;
            }
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
