//! Owns the request queue, the per-scheduler local queues, the finished-job
//! ring buffer, and the callback registry. Runs its own thread that drains
//! requests into local queues and asks each scheduler to place them.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

use crate::error::{BandError, Result};
use crate::ids::{CallbackId, JobId};
use crate::job::Job;
use crate::scheduler::{Scheduler, SchedulingContext};

/// Power-of-two ring size; a job's record index is `job_id % NUM_FINISHED_RECORDS`.
pub const NUM_FINISHED_RECORDS: usize = 1024;

fn now_micros() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

type EndRequestCallback = Box<dyn Fn(JobId, std::result::Result<(), ()>) + Send + 'static>;

struct Requests {
    queue: VecDeque<Job>,
}

pub struct Planner {
    requests: Mutex<Requests>,
    request_cv: Condvar,
    num_submitted_jobs: AtomicI64,
    num_finished_jobs: AtomicI64,

    local_queues: Mutex<Vec<VecDeque<Job>>>,
    schedulers: Vec<Box<dyn Scheduler>>,

    finished: Mutex<Vec<Job>>,
    finished_cv: Condvar,

    callbacks: Mutex<BTreeMap<CallbackId, EndRequestCallback>>,
    next_callback_id: AtomicI64,

    thread: Mutex<Option<JoinHandle<()>>>,
    kill: Arc<Mutex<bool>>,
}

impl Planner {
    pub fn new(schedulers: Vec<Box<dyn Scheduler>>) -> Result<Arc<Self>> {
        if schedulers.is_empty() || schedulers.len() > 2 {
            return Err(BandError::invalid_argument(
                "a planner accepts one or two schedulers",
            ));
        }
        let local_queues = schedulers.iter().map(|_| VecDeque::new()).collect();
        let mut finished = Vec::with_capacity(NUM_FINISHED_RECORDS);
        finished.resize_with(NUM_FINISHED_RECORDS, || {
            let mut j = Job::new(-1);
            j.job_id = -1;
            j
        });

        Ok(Arc::new(Planner {
            requests: Mutex::new(Requests { queue: VecDeque::new() }),
            request_cv: Condvar::new(),
            num_submitted_jobs: AtomicI64::new(0),
            num_finished_jobs: AtomicI64::new(0),
            local_queues: Mutex::new(local_queues),
            schedulers,
            finished: Mutex::new(finished),
            finished_cv: Condvar::new(),
            callbacks: Mutex::new(BTreeMap::new()),
            next_callback_id: AtomicI64::new(0),
            thread: Mutex::new(None),
            kill: Arc::new(Mutex::new(false)),
        }))
    }

    pub fn start(self: &Arc<Self>, ctx: Arc<dyn SchedulingContext>) {
        let mut guard = self.thread.lock();
        if guard.is_some() {
            return;
        }
        let this = Arc::clone(self);
        *guard = Some(std::thread::spawn(move || this.plan_loop(ctx)));
    }

    pub fn stop(&self) {
        *self.kill.lock() = true;
        self.request_cv.notify_all();
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }

    pub fn enqueue_request(&self, job: Job, push_front: bool) -> JobId {
        self.enqueue_batch(vec![job], push_front)[0]
    }

    pub fn enqueue_batch(&self, mut jobs: Vec<Job>, push_front: bool) -> Vec<JobId> {
        let enqueue_time = now_micros();
        let mut ids = Vec::with_capacity(jobs.len());
        {
            let mut requests = self.requests.lock();
            for job in &mut jobs {
                if job.enqueue_time == 0 {
                    job.enqueue_time = enqueue_time;
                }
                if job.job_id == -1 {
                    job.job_id = self.num_submitted_jobs.fetch_add(1, Ordering::SeqCst);
                }
                ids.push(job.job_id);
            }
            if push_front {
                for job in jobs.into_iter().rev() {
                    requests.queue.push_front(job);
                }
            } else {
                requests.queue.extend(jobs);
            }
        }
        self.request_cv.notify_all();
        ids
    }

    pub fn wait(&self, job_ids: &[JobId]) {
        if job_ids.is_empty() {
            return;
        }
        let mut finished = self.finished.lock();
        self.finished_cv.wait_while(&mut finished, |records| {
            job_ids.iter().any(|&id| {
                if !self.is_job_id_valid(id) {
                    return false;
                }
                records[Self::record_index(id)].job_id != id
            })
        });
    }

    pub fn wait_all(&self) {
        let mut finished = self.finished.lock();
        self.finished_cv.wait_while(&mut finished, |_| {
            self.num_finished_jobs.load(Ordering::SeqCst) < self.num_submitted_jobs.load(Ordering::SeqCst)
        });
    }

    pub fn get_finished_job(&self, job_id: JobId) -> Option<Job> {
        if !self.is_job_id_valid(job_id) {
            return None;
        }
        let finished = self.finished.lock();
        let record = &finished[Self::record_index(job_id)];
        if record.job_id == job_id {
            Some(record.clone())
        } else {
            None
        }
    }

    /// Writes a terminal job into the finished ring and fires callbacks
    /// outside any lock. The caller (a worker, or the engine failing a job
    /// outright) has already decided this job's lifetime is over — for a
    /// successful dispatch that spawned follow-up jobs for the unresolved
    /// remainder of a model, the caller does not call this at all.
    pub fn enqueue_finished_job(&self, job: Job) {
        {
            let mut finished = self.finished.lock();
            let idx = Self::record_index(job.job_id);
            finished[idx] = job.clone();
            self.num_finished_jobs.fetch_add(1, Ordering::SeqCst);
            drop(finished);
            self.finished_cv.notify_all();
        }

        if job.require_callback {
            let ok = job.status == crate::job::JobStatus::Success;
            for cb in self.callbacks.lock().values() {
                cb(job.job_id, if ok { Ok(()) } else { Err(()) });
            }
        }
    }

    pub fn set_on_end_request(&self, callback: impl Fn(JobId, std::result::Result<(), ()>) + Send + 'static) -> CallbackId {
        let id = self.next_callback_id.fetch_add(1, Ordering::SeqCst) as CallbackId;
        self.callbacks.lock().insert(id, Box::new(callback));
        id
    }

    pub fn unset_on_end_request(&self, callback_id: CallbackId) -> Result<()> {
        if self.callbacks.lock().remove(&callback_id).is_none() {
            return Err(BandError::not_found("callback id not found"));
        }
        Ok(())
    }

    pub fn num_submitted_jobs(&self) -> i64 {
        self.num_submitted_jobs.load(Ordering::SeqCst)
    }

    pub fn num_finished_jobs(&self) -> i64 {
        self.num_finished_jobs.load(Ordering::SeqCst)
    }

    fn is_job_id_valid(&self, job_id: JobId) -> bool {
        self.num_submitted_jobs.load(Ordering::SeqCst) - job_id <= NUM_FINISHED_RECORDS as i64
    }

    fn record_index(job_id: JobId) -> usize {
        (job_id.rem_euclid(NUM_FINISHED_RECORDS as i64)) as usize
    }

    fn plan_loop(self: Arc<Self>, ctx: Arc<dyn SchedulingContext>) {
        loop {
            {
                let mut requests = self.requests.lock();
                self.request_cv
                    .wait_while(&mut requests, |r| r.queue.is_empty() && !*self.kill.lock());
            }
            if *self.kill.lock() {
                return;
            }

            self.copy_to_local_queues();

            let mut need_reschedule = false;
            let mut local_queues = self.local_queues.lock();
            for (scheduler, queue) in self.schedulers.iter().zip(local_queues.iter_mut()) {
                if !scheduler.schedule(ctx.as_ref(), queue) {
                    need_reschedule = true;
                }
            }
            drop(local_queues);

            if need_reschedule {
                self.request_cv.notify_all();
            }
        }
    }

    fn copy_to_local_queues(&self) {
        let mut requests = self.requests.lock();
        if requests.queue.is_empty() {
            return;
        }
        let drained: Vec<Job> = requests.queue.drain(..).collect();
        drop(requests);

        let mut local_queues = self.local_queues.lock();
        if local_queues.len() == 1 {
            local_queues[0].extend(drained);
        } else {
            for job in drained {
                if job.slo_us > 0 {
                    local_queues[0].push_back(job);
                } else {
                    local_queues[1].push_back(job);
                }
            }
        }
    }
}

impl Drop for Planner {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{ModelId, SubgraphKey, WorkerId};
    use crate::job::JobStatus;
    use crate::worker::QueueMode;

    struct NullContext;
    impl SchedulingContext for NullContext {
        fn worker_ids(&self) -> Vec<WorkerId> {
            vec![0]
        }
        fn worker_queue_mode(&self, _worker_id: WorkerId) -> QueueMode {
            QueueMode::Device
        }
        fn worker_waiting_time(&self, _worker_id: WorkerId) -> i64 {
            0
        }
        fn expected_latency(&self, _key: SubgraphKey) -> i64 {
            1000
        }
        fn largest_subgraph_key(&self, model_id: ModelId, worker_id: WorkerId) -> Option<SubgraphKey> {
            Some(SubgraphKey::new(model_id, worker_id, 0b1))
        }
        fn model_worst_latency(&self, _model_id: ModelId) -> i64 {
            1000
        }
        fn shortest_latency(
            &self,
            job: &Job,
            _worker_waiting: &BTreeMap<WorkerId, i64>,
        ) -> Option<(SubgraphKey, i64)> {
            Some((SubgraphKey::new(job.model_id, 0, 0b1), 1000))
        }
        fn is_model_end(&self, _job: &Job, _key: SubgraphKey) -> bool {
            true
        }
        fn enqueue_to_worker(
            &self,
            _job: Job,
            _key: SubgraphKey,
        ) -> std::result::Result<(), (Job, BandError)> {
            Ok(())
        }
        fn fail_job(&self, _job: Job, _status: JobStatus) {}
        fn now(&self) -> i64 {
            0
        }
    }

    #[test]
    fn fresh_job_ids_are_sequential() {
        let planner = Planner::new(vec![Box::new(crate::scheduler::RoundRobinScheduler::new())]).unwrap();
        let ids = planner.enqueue_batch(vec![Job::new(0), Job::new(0)], false);
        assert_eq!(ids, vec![0, 1]);
    }

    #[test]
    fn rejects_more_than_two_schedulers() {
        let result = Planner::new(vec![
            Box::new(crate::scheduler::RoundRobinScheduler::new()),
            Box::new(crate::scheduler::RoundRobinScheduler::new()),
            Box::new(crate::scheduler::RoundRobinScheduler::new()),
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn enqueue_finished_job_notifies_wait() {
        let planner = Planner::new(vec![Box::new(crate::scheduler::RoundRobinScheduler::new())]).unwrap();
        let ids = planner.enqueue_batch(vec![Job::new(0)], false);
        let mut job = Job::new(0);
        job.job_id = ids[0];
        job.status = JobStatus::Success;
        planner.enqueue_finished_job(job);
        planner.wait(&ids);
        assert_eq!(planner.num_finished_jobs(), 1);
    }

    #[test]
    fn planner_thread_starts_and_stops_cleanly() {
        let planner = Planner::new(vec![Box::new(crate::scheduler::RoundRobinScheduler::new())]).unwrap();
        planner.start(Arc::new(NullContext));
        planner.enqueue_batch(vec![Job::new(0)], false);
        std::thread::sleep(std::time::Duration::from_millis(20));
        planner.stop();
    }
}
