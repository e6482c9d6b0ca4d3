//! Benchmark harness: builds an `Engine` against `StubBackend`, registers a
//! synthetic single-unit-subgraph model, enqueues a batch of jobs under a
//! chosen scheduler kind, and reports completion latencies as JSON.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use serde::Serialize;

use band_core::backend::{NullTensorBroker, StubBackend, StubLatency};
use band_core::config::{Config, PlannerConfig, SchedulerKind as CoreSchedulerKind, WorkerConfig};
use band_core::engine::Engine;
use band_core::ids::{DeviceFlag, SubgraphKey};
use band_core::job::JobBuilder;
use band_core::model::{ModelSpec, TensorType};

#[derive(Parser, Debug)]
#[command(name = "band_bench")]
#[command(about = "Scheduler-and-worker subsystem benchmark harness", long_about = None)]
struct Cli {
    /// Number of workers, all bound to --device
    #[arg(long, default_value_t = 1)]
    workers: u32,

    /// Device every worker is bound to
    #[arg(long, value_enum, default_value_t = CliDevice::Cpu)]
    device: CliDevice,

    /// Scheduling policy to run the batch under
    #[arg(long, value_enum, default_value_t = CliScheduler::FixedWorker)]
    scheduler: CliScheduler,

    /// Number of jobs to enqueue
    #[arg(long, default_value_t = 16)]
    jobs: u32,

    /// Per-job SLO in microseconds; 0 means no SLO
    #[arg(long, default_value_t = 0)]
    slo_us: i64,

    /// Simulated per-invoke latency for the stub backend, in microseconds
    #[arg(long, default_value_t = 1000)]
    subgraph_latency_us: i64,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum CliDevice {
    Cpu,
    Gpu,
    Dsp,
    Npu,
}

impl std::fmt::Display for CliDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CliDevice::Cpu => "cpu",
            CliDevice::Gpu => "gpu",
            CliDevice::Dsp => "dsp",
            CliDevice::Npu => "npu",
        };
        f.write_str(s)
    }
}

impl From<CliDevice> for DeviceFlag {
    fn from(d: CliDevice) -> Self {
        match d {
            CliDevice::Cpu => DeviceFlag::CPU,
            CliDevice::Gpu => DeviceFlag::GPU,
            CliDevice::Dsp => DeviceFlag::DSP,
            CliDevice::Npu => DeviceFlag::NPU,
        }
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum CliScheduler {
    FixedWorker,
    FixedWorkerGlobalQueue,
    RoundRobin,
    ShortestExpectedLatency,
    LeastSlackTimeFirst,
    Heft,
    HeftReserved,
}

impl std::fmt::Display for CliScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CliScheduler::FixedWorker => "fixed-worker",
            CliScheduler::FixedWorkerGlobalQueue => "fixed-worker-global-queue",
            CliScheduler::RoundRobin => "round-robin",
            CliScheduler::ShortestExpectedLatency => "shortest-expected-latency",
            CliScheduler::LeastSlackTimeFirst => "least-slack-time-first",
            CliScheduler::Heft => "heft",
            CliScheduler::HeftReserved => "heft-reserved",
        };
        f.write_str(s)
    }
}

impl From<CliScheduler> for CoreSchedulerKind {
    fn from(s: CliScheduler) -> Self {
        match s {
            CliScheduler::FixedWorker => CoreSchedulerKind::FixedWorker,
            CliScheduler::FixedWorkerGlobalQueue => CoreSchedulerKind::FixedWorkerGlobalQueue,
            CliScheduler::RoundRobin => CoreSchedulerKind::RoundRobin,
            CliScheduler::ShortestExpectedLatency => CoreSchedulerKind::ShortestExpectedLatency,
            CliScheduler::LeastSlackTimeFirst => CoreSchedulerKind::LeastSlackTimeFirst,
            CliScheduler::Heft => CoreSchedulerKind::Heft,
            CliScheduler::HeftReserved => CoreSchedulerKind::HeftReserved,
        }
    }
}

#[derive(Debug, Serialize)]
struct BenchReport {
    scheduler: String,
    workers: u32,
    jobs_submitted: u32,
    jobs_succeeded: u32,
    jobs_slo_violated: u32,
    jobs_failed: u32,
    latencies_us: Vec<i64>,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    eprintln!("BAND_BENCH:STARTED");

    let cli = Cli::parse();
    let report = run(&cli)?;

    eprintln!(
        "BAND_BENCH:COMPLETE:succeeded={} slo_violated={} failed={}",
        report.jobs_succeeded, report.jobs_slo_violated, report.jobs_failed
    );
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn run(cli: &Cli) -> anyhow::Result<BenchReport> {
    let device: DeviceFlag = cli.device.into();
    let scheduler_kind: CoreSchedulerKind = cli.scheduler.into();

    let config = Config {
        planner: PlannerConfig {
            scheduler_kinds: vec![scheduler_kind],
            ..PlannerConfig::default()
        },
        workers: (0..cli.workers.max(1))
            .map(|_| WorkerConfig { device, ..WorkerConfig::default() })
            .collect(),
        ..Config::default()
    };

    let backend = Arc::new(StubBackend::new());
    let engine = Engine::new(config.clone(), backend.clone(), Arc::new(NullTensorBroker))
        .map_err(|e| anyhow::anyhow!("engine construction failed: {e}"))?;

    let model_id = engine.register_model_spec(synthetic_model());
    for worker_id in 0..config.workers.len() as i32 {
        backend.register_subgraph(
            SubgraphKey::new(model_id, worker_id, 0b1),
            BTreeSet::from([0]),
            StubLatency { micros: cli.subgraph_latency_us },
        );
    }

    engine.start().map_err(|e| anyhow::anyhow!("engine start failed: {e}"))?;

    let num_workers = config.workers.len() as i32;
    let jobs: Vec<_> = (0..cli.jobs)
        .map(|i| {
            let mut builder = JobBuilder::new(model_id).target_worker(i as i32 % num_workers);
            if cli.slo_us > 0 {
                builder = builder.slo_us(cli.slo_us);
            }
            builder.build()
        })
        .collect();
    let ids = engine.enqueue_batch(jobs);
    engine.wait(&ids);
    engine.stop();

    let mut latencies_us = Vec::with_capacity(ids.len());
    let mut by_status: BTreeMap<String, u32> = BTreeMap::new();
    for id in &ids {
        let Some(job) = engine.get_finished_job(*id) else { continue };
        *by_status.entry(job.status.to_string()).or_default() += 1;
        if job.invoke_time > 0 && job.end_time > 0 {
            latencies_us.push(job.end_time - job.invoke_time);
        }
    }

    Ok(BenchReport {
        scheduler: format!("{scheduler_kind:?}"),
        workers: cli.workers.max(1),
        jobs_submitted: cli.jobs,
        jobs_succeeded: by_status.get("Success").copied().unwrap_or(0),
        jobs_slo_violated: by_status.get("SLOViolation").copied().unwrap_or(0),
        jobs_failed: cli.jobs - by_status.get("Success").copied().unwrap_or(0) - by_status.get("SLOViolation").copied().unwrap_or(0),
        latencies_us,
    })
}

fn synthetic_model() -> ModelSpec {
    ModelSpec::new(
        "synthetic.bench",
        1,
        0,
        Vec::new(),
        BTreeSet::new(),
        BTreeSet::new(),
        vec![BTreeSet::new()],
        vec![BTreeSet::new()],
        BTreeMap::new(),
        BTreeSet::new(),
        vec![BTreeSet::from([0])],
    )
    .expect("synthetic model partition is trivially valid")
}
