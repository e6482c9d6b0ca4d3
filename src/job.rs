//! The scheduling/executing unit — one `Job` per request lifetime.

use std::fmt;

use crate::ids::{JobId, ModelId, SubgraphKey, UnitMask, WorkerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// Sitting in a queue, not yet terminal.
    Queued,
    Success,
    SLOViolation,
    EnqueueFailed,
    InputCopyFailure,
    OutputCopyFailure,
    InvokeFailure,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Queued)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Queued => "Queued",
            JobStatus::Success => "Success",
            JobStatus::SLOViolation => "SLOViolation",
            JobStatus::EnqueueFailed => "EnqueueFailed",
            JobStatus::InputCopyFailure => "InputCopyFailure",
            JobStatus::OutputCopyFailure => "OutputCopyFailure",
            JobStatus::InvokeFailure => "InvokeFailure",
        };
        f.write_str(s)
    }
}

/// One request's lifetime: created by a client, moved through the request
/// queue, a scheduler's local queue, a worker queue, then recorded finished.
/// A job with unresolved units spawns a residual `Job` in `following_jobs`,
/// which the worker re-enqueues at the request-queue front on success.
#[derive(Debug, Clone)]
pub struct Job {
    pub model_id: ModelId,
    pub job_id: JobId,
    pub input_handle: i64,
    pub output_handle: i64,

    /// 0 means request-scoped timestamps are unset; stamped by the planner.
    pub enqueue_time: i64,
    pub invoke_time: i64,
    pub end_time: i64,

    /// 0 = no SLO.
    pub slo_us: i64,
    /// -1 = any worker.
    pub target_worker_id: WorkerId,
    /// Set once the scheduler has chosen a subgraph for this dispatch.
    pub subgraph_key: SubgraphKey,

    pub profiled_execution_time: i64,
    pub expected_execution_time: i64,
    pub expected_latency: i64,

    /// Bitmask of unit subgraphs already executed for this request.
    pub resolved_unit_subgraphs: UnitMask,
    pub previous_subgraph_keys: Vec<SubgraphKey>,
    /// Residual work representing the unresolved remainder of the model,
    /// attached when the scheduler's pick does not finish the model.
    pub following_jobs: Vec<Job>,

    pub status: JobStatus,
    /// Whether a finished job should invoke registered callbacks. Default
    /// true; set false by callers doing bulk throughput runs that don't
    /// need per-request notification.
    pub require_callback: bool,
}

impl Job {
    pub fn new(model_id: ModelId) -> Self {
        Job {
            model_id,
            job_id: -1,
            input_handle: -1,
            output_handle: -1,
            enqueue_time: 0,
            invoke_time: 0,
            end_time: 0,
            slo_us: 0,
            target_worker_id: -1,
            subgraph_key: SubgraphKey::invalid(),
            profiled_execution_time: 0,
            expected_execution_time: 0,
            expected_latency: 0,
            resolved_unit_subgraphs: 0,
            previous_subgraph_keys: Vec::new(),
            following_jobs: Vec::new(),
            status: JobStatus::Queued,
            require_callback: true,
        }
    }

    /// Reset the progress fields so this job can be safely re-dispatched
    /// after a retriable device error.
    pub fn prepare_reenqueue(&mut self) {
        self.invoke_time = 0;
        self.end_time = 0;
        self.resolved_unit_subgraphs = 0;
        self.following_jobs.clear();
    }

    /// A job is ready to be handed to a worker once it carries a valid
    /// subgraph key and has not already been invoked.
    pub fn is_valid_for_dispatch(&self) -> bool {
        self.model_id >= 0
            && self.subgraph_key.is_valid()
            && self.enqueue_time > 0
            && self.invoke_time == 0
            && self.end_time == 0
    }
}

/// Builder for the idiomatic-Rust replacement of the C++ `RequestOption`
/// default-argument struct.
#[derive(Debug, Clone)]
pub struct JobBuilder {
    job: Job,
}

impl JobBuilder {
    pub fn new(model_id: ModelId) -> Self {
        JobBuilder {
            job: Job::new(model_id),
        }
    }

    pub fn target_worker(mut self, worker_id: WorkerId) -> Self {
        self.job.target_worker_id = worker_id;
        self
    }

    pub fn slo_us(mut self, slo_us: i64) -> Self {
        self.job.slo_us = slo_us;
        self
    }

    pub fn input_handle(mut self, handle: i64) -> Self {
        self.job.input_handle = handle;
        self
    }

    pub fn output_handle(mut self, handle: i64) -> Self {
        self.job.output_handle = handle;
        self
    }

    pub fn require_callback(mut self, require: bool) -> Self {
        self.job.require_callback = require;
        self
    }

    pub fn build(self) -> Job {
        self.job
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults_match_job_new() {
        let built = JobBuilder::new(3).build();
        let direct = Job::new(3);
        assert_eq!(built.model_id, direct.model_id);
        assert_eq!(built.target_worker_id, direct.target_worker_id);
        assert_eq!(built.slo_us, direct.slo_us);
    }

    #[test]
    fn prepare_reenqueue_clears_progress_but_not_identity() {
        let mut job = Job::new(1);
        job.job_id = 42;
        job.invoke_time = 100;
        job.end_time = 200;
        job.resolved_unit_subgraphs = 0b11;
        job.following_jobs.push(Job::new(1));

        job.prepare_reenqueue();

        assert_eq!(job.job_id, 42);
        assert_eq!(job.invoke_time, 0);
        assert_eq!(job.end_time, 0);
        assert_eq!(job.resolved_unit_subgraphs, 0);
        assert!(job.following_jobs.is_empty());
    }
}
