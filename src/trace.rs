//! Chrome-trace-format JSON emission: one "stream" per worker, with a
//! `begin_subgraph`/`end_subgraph` duration-event pair per dispatched job
//! whose `args` field carries the job record.

use serde::Serialize;
use serde_json::json;

use crate::error::{BandError, Result};
use crate::ids::WorkerId;
use crate::job::Job;

/// One completed dispatch, as handed to the tracer by the engine once a job
/// is recorded finished.
#[derive(Debug, Clone)]
pub struct TraceEvent {
    pub worker_id: WorkerId,
    pub job: Job,
}

#[derive(Serialize)]
struct DurationEvent {
    name: String,
    cat: &'static str,
    ph: &'static str,
    ts: i64,
    pid: i32,
    tid: WorkerId,
    args: serde_json::Value,
}

/// Accumulates `TraceEvent`s and serializes them as a Chrome-trace-format
/// `{"traceEvents": [...]}` document. Not thread-synchronized itself; the
/// engine hands events to one collector instance from the planner's
/// completion path, which already serializes access to finished jobs.
#[derive(Default)]
pub struct Tracer {
    events: Vec<TraceEvent>,
}

impl Tracer {
    pub fn new() -> Self {
        Tracer { events: Vec::new() }
    }

    pub fn record(&mut self, event: TraceEvent) {
        self.events.push(event);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Renders every recorded event as a begin/end duration-event pair on
    /// the job's worker stream, named after the resolved subgraph key.
    pub fn to_json(&self) -> Result<String> {
        let mut out = Vec::with_capacity(self.events.len() * 2);
        for event in &self.events {
            let job = &event.job;
            let name = job.subgraph_key.to_string();
            let args = json!({
                "job_id": job.job_id,
                "model_id": job.model_id,
                "status": job.status.to_string(),
                "resolved_unit_subgraphs": job.resolved_unit_subgraphs,
            });

            let begin = job.invoke_time.max(0);
            let end = job.end_time.max(begin);

            out.push(DurationEvent {
                name: name.clone(),
                cat: "subgraph",
                ph: "B",
                ts: begin,
                pid: 1,
                tid: event.worker_id,
                args: args.clone(),
            });
            out.push(DurationEvent {
                name,
                cat: "subgraph",
                ph: "E",
                ts: end,
                pid: 1,
                tid: event.worker_id,
                args,
            });
        }

        serde_json::to_string_pretty(&json!({ "traceEvents": out }))
            .map_err(|e| BandError::internal(format!("failed to serialize trace: {e}")))
    }

    pub fn write_to(&self, path: impl AsRef<std::path::Path>) -> Result<()> {
        let text = self.to_json()?;
        std::fs::write(path, text).map_err(|e| BandError::internal(format!("failed to write trace file: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::SubgraphKey;
    use crate::job::JobStatus;

    fn finished_job(job_id: i64, invoke_time: i64, end_time: i64) -> Job {
        let mut job = Job::new(0);
        job.job_id = job_id;
        job.subgraph_key = SubgraphKey::new(0, 0, 0b1);
        job.invoke_time = invoke_time;
        job.end_time = end_time;
        job.status = JobStatus::Success;
        job
    }

    #[test]
    fn empty_tracer_emits_empty_event_list() {
        let tracer = Tracer::new();
        let doc: serde_json::Value = serde_json::from_str(&tracer.to_json().unwrap()).unwrap();
        assert_eq!(doc["traceEvents"].as_array().unwrap().len(), 0);
    }

    #[test]
    fn each_event_becomes_a_begin_end_pair_on_its_worker_thread() {
        let mut tracer = Tracer::new();
        tracer.record(TraceEvent { worker_id: 2, job: finished_job(7, 100, 150) });

        let doc: serde_json::Value = serde_json::from_str(&tracer.to_json().unwrap()).unwrap();
        let events = doc["traceEvents"].as_array().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["ph"], "B");
        assert_eq!(events[0]["ts"], 100);
        assert_eq!(events[1]["ph"], "E");
        assert_eq!(events[1]["ts"], 150);
        assert_eq!(events[0]["tid"], 2);
        assert_eq!(events[0]["args"]["job_id"], 7);
    }
}
