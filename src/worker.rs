//! One OS thread per worker, bound to a single device, running the
//! predicate-tested wait/invoke loop shared by both queue topologies.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::BandError;
use crate::ids::{CPUMaskFlag, DeviceFlag, JobId, SubgraphKey, WorkerId};
use crate::job::{Job, JobStatus};

/// Returned by `GetWaitingTime` for an unavailable (paused/throttled)
/// worker, steering schedulers away from it without a separate branch.
pub const LARGE_WAITING_TIME: i64 = i64::MAX / 2;

fn now_micros() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

/// The collaborator a worker calls into: the engine facade, which in turn
/// delegates to the tensor broker, backend adapter, latency estimator, and
/// planner request queue.
pub trait WorkerEngineHost: Send + Sync {
    fn try_copy_input_tensors(&self, job: &Job) -> Result<(), BandError>;
    fn try_copy_output_tensors(&self, job: &Job) -> Result<(), BandError>;
    fn invoke(&self, key: SubgraphKey) -> Result<(), BandError>;
    fn update_latency(&self, key: SubgraphKey, latency_us: i64);
    /// Pushes onto the planner's request queue (not this worker's own
    /// queue), `push_front` controlling which end.
    fn enqueue_batch(&self, jobs: Vec<Job>, push_front: bool);
    fn enqueue_request(&self, job: Job, push_front: bool);
    fn enqueue_finished_job(&self, job: Job);
    /// Wakes the planner thread to re-run scheduling.
    fn trigger(&self);
}

enum QueueState {
    Device(VecDeque<Job>),
    Global { job: Option<Job>, busy: bool },
}

struct WorkerState {
    paused: bool,
    throttling: bool,
    kill: bool,
    queue: QueueState,
    num_threads: u32,
    cpu_mask: CPUMaskFlag,
    need_cpu_update: bool,
}

pub struct Worker {
    worker_id: WorkerId,
    device_flag: DeviceFlag,
    availability_check_interval_ms: u64,
    state: Mutex<WorkerState>,
    request_cv: Condvar,
    wait_cv: Condvar,
    host: Arc<dyn WorkerEngineHost>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// Which per-worker queue topology a worker uses. Fixed-worker-global-queue
/// scheduling requires every worker it targets to run in `Global` mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMode {
    Device,
    Global,
}

impl Worker {
    pub fn new(
        worker_id: WorkerId,
        device_flag: DeviceFlag,
        queue_mode: QueueMode,
        num_threads: u32,
        cpu_mask: CPUMaskFlag,
        availability_check_interval_ms: u64,
        host: Arc<dyn WorkerEngineHost>,
    ) -> Arc<Self> {
        let queue = match queue_mode {
            QueueMode::Device => QueueState::Device(VecDeque::new()),
            QueueMode::Global => QueueState::Global { job: None, busy: false },
        };
        Arc::new(Worker {
            worker_id,
            device_flag,
            availability_check_interval_ms,
            state: Mutex::new(WorkerState {
                paused: false,
                throttling: false,
                kill: false,
                queue,
                num_threads,
                cpu_mask,
                need_cpu_update: true,
            }),
            request_cv: Condvar::new(),
            wait_cv: Condvar::new(),
            host,
            thread: Mutex::new(None),
        })
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    pub fn device_flag(&self) -> DeviceFlag {
        self.device_flag
    }

    pub fn num_threads(&self) -> u32 {
        self.state.lock().num_threads
    }

    pub fn cpu_mask(&self) -> CPUMaskFlag {
        self.state.lock().cpu_mask
    }

    pub fn queue_mode(&self) -> QueueMode {
        match self.state.lock().queue {
            QueueState::Device(_) => QueueMode::Device,
            QueueState::Global { .. } => QueueMode::Global,
        }
    }

    pub fn update_worker_thread(&self, num_threads: u32, cpu_mask: CPUMaskFlag) {
        let mut state = self.state.lock();
        if state.num_threads != num_threads || state.cpu_mask != cpu_mask {
            state.num_threads = num_threads;
            state.cpu_mask = cpu_mask;
            state.need_cpu_update = true;
        }
    }

    pub fn start(self: &Arc<Self>) {
        let mut guard = self.thread.lock();
        if guard.is_some() {
            return;
        }
        let this = Arc::clone(self);
        *guard = Some(std::thread::spawn(move || this.work_loop()));
    }

    pub fn end(&self) {
        {
            let mut state = self.state.lock();
            state.kill = true;
        }
        self.request_cv.notify_all();
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }

    pub fn pause(&self) {
        self.state.lock().paused = true;
    }

    pub fn resume(&self) {
        self.state.lock().paused = false;
        self.request_cv.notify_one();
    }

    /// Blocks until the worker has no job in flight.
    pub fn wait_idle(&self) {
        let mut state = self.state.lock();
        self.wait_cv.wait_while(&mut state, |s| has_job(&s.queue));
    }

    pub fn is_available(&self) -> bool {
        let state = self.state.lock();
        !state.throttling && !state.paused
    }

    pub fn has_job(&self) -> bool {
        has_job(&self.state.lock().queue)
    }

    pub fn is_enqueue_ready(&self) -> bool {
        let state = self.state.lock();
        match &state.queue {
            QueueState::Device(_) => !state.throttling && !state.paused,
            QueueState::Global { busy, .. } => !busy && !state.throttling && !state.paused,
        }
    }

    /// Not exercised by any shipped policy; a documented no-op extension
    /// point for a device queue worker to pull work from a busier sibling.
    pub fn allow_work_steal(&self) -> bool {
        false
    }

    pub fn current_job_id(&self) -> JobId {
        match &self.state.lock().queue {
            QueueState::Device(q) => q.front().map(|j| j.job_id).unwrap_or(-1),
            QueueState::Global { job, .. } => job.as_ref().map(|j| j.job_id).unwrap_or(-1),
        }
    }

    /// Queues `job` onto this worker and wakes its thread. Hands `job` back
    /// (without mutating state) if the worker cannot currently accept it, so
    /// the caller can requeue rather than lose it.
    pub fn enqueue_job(&self, job: Job) -> Result<(), Job> {
        let mut state = self.state.lock();
        match &mut state.queue {
            QueueState::Device(q) => {
                if state.throttling || state.paused {
                    return Err(job);
                }
                q.push_back(job);
            }
            QueueState::Global { job: slot, busy } => {
                if *busy || state.throttling || state.paused {
                    return Err(job);
                }
                *slot = Some(job);
                *busy = true;
            }
        }
        drop(state);
        self.request_cv.notify_one();
        Ok(())
    }

    /// Sum of expected latencies queued ahead, minus progress already made
    /// on the in-flight head (device queue), or remaining time on the single
    /// in-flight job (global queue).
    pub fn waiting_time(&self, expected: impl Fn(SubgraphKey) -> i64) -> i64 {
        let state = self.state.lock();
        if state.throttling || state.paused {
            return LARGE_WAITING_TIME;
        }
        match &state.queue {
            QueueState::Device(q) => {
                let mut total = 0i64;
                let now = now_micros();
                for (i, job) in q.iter().enumerate() {
                    let latency = expected(job.subgraph_key);
                    total += latency;
                    if i == 0 && job.invoke_time > 0 && now > job.invoke_time {
                        let progress = (now - job.invoke_time).min(latency);
                        total -= progress;
                    }
                }
                total
            }
            QueueState::Global { job, busy } => {
                if !*busy {
                    return 0;
                }
                let Some(job) = job else { return 0 };
                let latency = expected(job.subgraph_key);
                if job.invoke_time == 0 {
                    return latency;
                }
                let progress = now_micros() - job.invoke_time;
                (latency - progress).max(0)
            }
        }
    }

    fn work_loop(self: Arc<Self>) {
        loop {
            {
                let mut state = self.state.lock();
                if !has_job(&state.queue) {
                    self.wait_cv.notify_all();
                }
                self.request_cv
                    .wait_while(&mut state, |s| !(s.kill || has_job(&s.queue)) || s.paused);
                if state.kill {
                    return;
                }
            }

            let Some(current) = self.snapshot_current_job() else {
                log::error!("worker {} woke with no current job", self.worker_id);
                continue;
            };
            if !current.is_valid_for_dispatch() {
                log::error!(
                    "worker {} spotted an invalid job (model {}, job {})",
                    self.worker_id,
                    current.model_id,
                    current.job_id
                );
                continue;
            }

            self.apply_pending_cpu_update();

            if let Err(e) = self.host.try_copy_input_tensors(&current) {
                log::error!("worker {} failed to copy input: {e}", self.worker_id);
                self.finish_current(JobStatus::InputCopyFailure, None, true);
                self.host.trigger();
                continue;
            }

            let invoke_time = now_micros();
            self.stamp_invoke_time(invoke_time);

            match self.host.invoke(current.subgraph_key) {
                Ok(()) => {
                    let end_time = now_micros();
                    self.host
                        .update_latency(current.subgraph_key, end_time - invoke_time);
                    let following = self.take_following_jobs();
                    let model_ended = following.is_empty();
                    if !model_ended {
                        self.host.enqueue_batch(following, true);
                    }
                    if let Err(e) = self.host.try_copy_output_tensors(&current) {
                        log::warn!("worker {} output copy warning: {e}", self.worker_id);
                    }
                    self.finish_current(JobStatus::Success, Some(end_time), model_ended);
                    self.host.trigger();
                }
                Err(BandError::DeviceError(msg)) => {
                    log::error!("worker {} device error: {msg}", self.worker_id);
                    self.handle_device_error(current.subgraph_key);
                    self.host.trigger();
                    continue;
                }
                Err(_other) => {
                    let end_time = now_micros();
                    self.finish_current(JobStatus::InvokeFailure, Some(end_time), true);
                    self.host.trigger();
                }
            }
        }
    }

    fn snapshot_current_job(&self) -> Option<Job> {
        match &self.state.lock().queue {
            QueueState::Device(q) => q.front().cloned(),
            QueueState::Global { job, .. } => job.clone(),
        }
    }

    fn stamp_invoke_time(&self, invoke_time: i64) {
        let mut state = self.state.lock();
        match &mut state.queue {
            QueueState::Device(q) => {
                if let Some(job) = q.front_mut() {
                    job.invoke_time = invoke_time;
                }
            }
            QueueState::Global { job, .. } => {
                if let Some(job) = job {
                    job.invoke_time = invoke_time;
                }
            }
        }
    }

    fn take_following_jobs(&self) -> Vec<Job> {
        let mut state = self.state.lock();
        match &mut state.queue {
            QueueState::Device(q) => q
                .front_mut()
                .map(|j| std::mem::take(&mut j.following_jobs))
                .unwrap_or_default(),
            QueueState::Global { job, .. } => job
                .as_mut()
                .map(|j| std::mem::take(&mut j.following_jobs))
                .unwrap_or_default(),
        }
    }

    fn apply_pending_cpu_update(&self) {
        let cpu_mask = {
            let mut state = self.state.lock();
            if !state.need_cpu_update {
                return;
            }
            state.need_cpu_update = false;
            state.cpu_mask
        };
        let cores = crate::cpu_affinity::topology().cores_for(cpu_mask);
        match crate::cpu_affinity::pin_thread(cores) {
            Ok(()) => log::debug!("worker {} pinned to cores {:?} ({:?})", self.worker_id, cores, cpu_mask),
            Err(e) => log::warn!("worker {} failed to set thread affinity to {:?}: {e}", self.worker_id, cpu_mask),
        }
    }

    /// Pops the dispatched job off this worker's queue. `record` is false
    /// only for a successful dispatch that spawned follow-up jobs for the
    /// unresolved remainder of the model — the request lives on through
    /// those follow-ups, so this step is not yet reported as finished.
    fn finish_current(&self, status: JobStatus, end_time: Option<i64>, record: bool) {
        let finished = {
            let mut state = self.state.lock();
            let job = match &mut state.queue {
                QueueState::Device(q) => q.pop_front(),
                QueueState::Global { job, busy } => {
                    *busy = false;
                    job.take()
                }
            };
            job
        };
        self.wait_cv.notify_all();
        if let Some(mut job) = finished {
            job.status = status;
            if let Some(end_time) = end_time {
                job.end_time = end_time;
            }
            if record {
                self.host.enqueue_finished_job(job);
            }
        }
    }

    /// Retriable backend failure: throttle, rewind, push the affected job(s)
    /// back onto the planner's request queue, then probe the backend until
    /// it recovers.
    fn handle_device_error(&self, subgraph_key: SubgraphKey) {
        let requeued = {
            let mut state = self.state.lock();
            state.throttling = true;
            match &mut state.queue {
                QueueState::Device(q) => {
                    let mut jobs: Vec<Job> = q.drain(..).collect();
                    for job in &mut jobs {
                        job.prepare_reenqueue();
                    }
                    jobs
                }
                QueueState::Global { job, busy } => {
                    *busy = false;
                    if let Some(mut job) = job.take() {
                        job.prepare_reenqueue();
                        vec![job]
                    } else {
                        Vec::new()
                    }
                }
            }
        };
        if !requeued.is_empty() {
            self.host.enqueue_batch(requeued, true);
        }
        self.wait_until_device_available(subgraph_key);
        self.state.lock().throttling = false;
    }

    fn wait_until_device_available(&self, subgraph_key: SubgraphKey) {
        loop {
            std::thread::sleep(Duration::from_millis(self.availability_check_interval_ms.max(1)));
            if self.host.invoke(subgraph_key).is_ok() {
                return;
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if !self.state.lock().kill {
            log::error!("worker {} dropped without being stopped first", self.worker_id);
        }
    }
}

fn has_job(queue: &QueueState) -> bool {
    match queue {
        QueueState::Device(q) => !q.is_empty(),
        QueueState::Global { busy, .. } => *busy,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PMutex;
    use std::sync::atomic::{AtomicI64, Ordering};

    struct FakeHost {
        finished: PMutex<Vec<Job>>,
        requeued: PMutex<Vec<Job>>,
        fail_once: AtomicI64,
    }

    impl WorkerEngineHost for FakeHost {
        fn try_copy_input_tensors(&self, _job: &Job) -> Result<(), BandError> {
            Ok(())
        }
        fn try_copy_output_tensors(&self, _job: &Job) -> Result<(), BandError> {
            Ok(())
        }
        fn invoke(&self, _key: SubgraphKey) -> Result<(), BandError> {
            if self.fail_once.load(Ordering::SeqCst) > 0 {
                self.fail_once.fetch_sub(1, Ordering::SeqCst);
                return Err(BandError::device_error("injected"));
            }
            Ok(())
        }
        fn update_latency(&self, _key: SubgraphKey, _latency_us: i64) {}
        fn enqueue_batch(&self, jobs: Vec<Job>, _push_front: bool) {
            self.requeued.lock().extend(jobs);
        }
        fn enqueue_request(&self, job: Job, _push_front: bool) {
            self.requeued.lock().push(job);
        }
        fn enqueue_finished_job(&self, job: Job) {
            self.finished.lock().push(job);
        }
        fn trigger(&self) {}
    }

    fn ready_job(model_id: i32, worker_id: WorkerId) -> Job {
        let mut job = Job::new(model_id);
        job.job_id = 1;
        job.enqueue_time = 1;
        job.subgraph_key = SubgraphKey::new(model_id, worker_id, 0b1);
        job
    }

    #[test]
    fn device_queue_worker_completes_happy_path() {
        let host = Arc::new(FakeHost {
            finished: PMutex::new(Vec::new()),
            requeued: PMutex::new(Vec::new()),
            fail_once: AtomicI64::new(0),
        });
        let worker = Worker::new(
            0,
            DeviceFlag::CPU,
            QueueMode::Device,
            1,
            CPUMaskFlag::All,
            5,
            host.clone(),
        );
        worker.start();
        assert!(worker.enqueue_job(ready_job(0, 0)).is_ok());
        worker.wait_idle();
        worker.end();

        let finished = host.finished.lock();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].status, JobStatus::Success);
    }

    #[test]
    fn device_error_requeues_then_recovers() {
        let host = Arc::new(FakeHost {
            finished: PMutex::new(Vec::new()),
            requeued: PMutex::new(Vec::new()),
            fail_once: AtomicI64::new(1),
        });
        let worker = Worker::new(
            0,
            DeviceFlag::CPU,
            QueueMode::Device,
            1,
            CPUMaskFlag::All,
            1,
            host.clone(),
        );
        worker.start();
        assert!(worker.enqueue_job(ready_job(0, 0)).is_ok());
        worker.wait_idle();
        worker.end();

        assert_eq!(host.requeued.lock().len(), 1);
    }

    #[test]
    fn global_queue_waiting_time_is_zero_when_idle() {
        let host = Arc::new(FakeHost {
            finished: PMutex::new(Vec::new()),
            requeued: PMutex::new(Vec::new()),
            fail_once: AtomicI64::new(0),
        });
        let worker = Worker::new(
            1,
            DeviceFlag::GPU,
            QueueMode::Global,
            1,
            CPUMaskFlag::All,
            5,
            host,
        );
        assert_eq!(worker.waiting_time(|_| 1000), 0);
    }
}
