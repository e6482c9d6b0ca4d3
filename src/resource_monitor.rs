//! Double-buffered sysfs resource snapshot: thermal zones and per-device
//! frequency endpoints, sampled by a single monitor thread.

use std::collections::BTreeMap;
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::ResourceMonitorConfig;
use crate::error::{BandError, Result};
use crate::ids::{CPUMaskFlag, DeviceFlag};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ThermalFlag {
    TzTemperature,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DevFreqFlag {
    CurFreq,
    TargetFreq,
    MinFreq,
    MaxFreq,
    PollingInterval,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CpuFreqFlag {
    CurFreq,
    TargetFreq,
    MinFreq,
    MaxFreq,
    UpTransitionLatency,
    DownTransitionLatency,
    TransitionCount,
}

type ThermalKey = (ThermalFlag, usize);
type CpuFreqKey = (CpuFreqFlag, CPUMaskFlag);
type DevFreqKey = (DevFreqFlag, DeviceFlag);

const THERMAL_BASE_PATH: &str = "/sys/class/thermal";
const CPU_FREQ_BASE_PATH: &str = "/sys/devices/system/cpu";

struct Registered {
    path: String,
    multiplier: f64,
}

#[derive(Default)]
struct Snapshot {
    thermal: BTreeMap<ThermalKey, usize>,
    cpu_freq: BTreeMap<CpuFreqKey, usize>,
    dev_freq: BTreeMap<DevFreqKey, usize>,
}

type UpdateListener = Box<dyn Fn() + Send + 'static>;

/// Samples sysfs thermal/frequency files on a background thread and exposes
/// blocking, lock-protected lookups against the most recently flipped
/// snapshot. Construction fails with `Unavailable` on non-Linux targets,
/// since there is no sysfs to read.
pub struct ResourceMonitor {
    config: ResourceMonitorConfig,
    thermal_resources: Mutex<BTreeMap<ThermalKey, Registered>>,
    cpu_freq_resources: Mutex<BTreeMap<CpuFreqKey, Registered>>,
    dev_freq_resources: Mutex<BTreeMap<DevFreqKey, Registered>>,
    buffers: [Mutex<Snapshot>; 2],
    head: AtomicUsize,
    listeners: Mutex<Vec<UpdateListener>>,
    log_path: Option<std::path::PathBuf>,
    monitor_thread: Mutex<Option<JoinHandle<()>>>,
    kill: Arc<Mutex<bool>>,
}

impl ResourceMonitor {
    pub fn new(config: ResourceMonitorConfig) -> Result<Arc<Self>> {
        if !cfg!(target_os = "linux") {
            return Err(BandError::unavailable(
                "resource monitor requires a Linux sysfs tree",
            ));
        }
        let log_path = config.log_path.clone();
        let monitor = Arc::new(ResourceMonitor {
            config,
            thermal_resources: Mutex::new(BTreeMap::new()),
            cpu_freq_resources: Mutex::new(BTreeMap::new()),
            dev_freq_resources: Mutex::new(BTreeMap::new()),
            buffers: [Mutex::new(Snapshot::default()), Mutex::new(Snapshot::default())],
            head: AtomicUsize::new(0),
            listeners: Mutex::new(Vec::new()),
            log_path,
            monitor_thread: Mutex::new(None),
            kill: Arc::new(Mutex::new(false)),
        });
        Ok(monitor)
    }

    pub fn add_thermal_resource(&self, flag: ThermalFlag, id: usize) -> Result<()> {
        let path = format!("{THERMAL_BASE_PATH}/thermal_zone{id}/temp");
        let mut resources = self.thermal_resources.lock();
        if resources.contains_key(&(flag, id)) {
            return Err(BandError::internal("thermal resource already registered"));
        }
        resources.insert(
            (flag, id),
            Registered {
                path,
                multiplier: 1.0,
            },
        );
        Ok(())
    }

    pub fn add_cpu_freq_resource(&self, cpu_flag: CPUMaskFlag, flag: CpuFreqFlag) -> Result<()> {
        let mut resources = self.cpu_freq_resources.lock();
        let key = (flag, cpu_flag);
        if resources.contains_key(&key) {
            return Err(BandError::internal("cpu freq resource already registered"));
        }
        let core = crate::cpu_affinity::topology().representative_core(cpu_flag);
        let file = cpu_freq_filename(flag);
        let path = format!("{CPU_FREQ_BASE_PATH}/cpufreq/policy{core}/{file}");
        resources.insert(key, Registered { path, multiplier: 1.0 });
        Ok(())
    }

    pub fn add_dev_freq_resource(&self, device: DeviceFlag, flag: DevFreqFlag) -> Result<()> {
        let mut resources = self.dev_freq_resources.lock();
        let key = (flag, device);
        if resources.contains_key(&key) {
            return Err(BandError::internal("dev freq resource already registered"));
        }
        let base = self
            .config
            .devfreq_paths
            .get(&device)
            .ok_or_else(|| BandError::not_found(format!("no devfreq path configured for {device}")))?;
        let file = dev_freq_filename(flag);
        let path = format!("{}/{file}", base.display());
        resources.insert(key, Registered { path, multiplier: 1.0 });
        Ok(())
    }

    pub fn add_on_update(&self, callback: impl Fn() + Send + 'static) {
        self.listeners.lock().push(Box::new(callback));
    }

    pub fn get_thermal(&self, flag: ThermalFlag, id: usize) -> Result<usize> {
        let head = self.head.load(Ordering::Acquire);
        let snap = self.buffers[head].lock();
        snap.thermal
            .get(&(flag, id))
            .copied()
            .ok_or_else(|| BandError::not_found("thermal resource not sampled yet"))
    }

    pub fn get_cpu_freq(&self, cpu_flag: CPUMaskFlag, flag: CpuFreqFlag) -> Result<usize> {
        let head = self.head.load(Ordering::Acquire);
        let snap = self.buffers[head].lock();
        snap.cpu_freq
            .get(&(flag, cpu_flag))
            .copied()
            .ok_or_else(|| BandError::not_found("cpu freq resource not sampled yet"))
    }

    pub fn get_dev_freq(&self, device: DeviceFlag, flag: DevFreqFlag) -> Result<usize> {
        let head = self.head.load(Ordering::Acquire);
        let snap = self.buffers[head].lock();
        snap.dev_freq
            .get(&(flag, device))
            .copied()
            .ok_or_else(|| BandError::not_found("dev freq resource not sampled yet"))
    }

    /// Spawn the monitor thread. Idempotent: a second call is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut guard = self.monitor_thread.lock();
        if guard.is_some() {
            return;
        }
        let this = Arc::clone(self);
        *guard = Some(std::thread::spawn(move || this.monitor_loop()));
    }

    pub fn stop(&self) {
        *self.kill.lock() = true;
        if let Some(handle) = self.monitor_thread.lock().take() {
            let _ = handle.join();
        }
    }

    fn monitor_loop(self: Arc<Self>) {
        let interval = Duration::from_millis(self.config.monitor_interval_ms.max(1));
        loop {
            if *self.kill.lock() {
                return;
            }
            self.sample_once();
            std::thread::sleep(interval);
        }
    }

    fn sample_once(&self) {
        let head = self.head.load(Ordering::Acquire);
        let inactive = 1 - head;
        {
            let mut snap = self.buffers[inactive].lock();
            *snap = self.read_snapshot();
        }
        self.head.store(inactive, Ordering::Release);
        for listener in self.listeners.lock().iter() {
            listener();
        }
    }

    fn read_snapshot(&self) -> Snapshot {
        let mut snap = Snapshot::default();
        for (key, reg) in self.thermal_resources.lock().iter() {
            if let Some(v) = read_value(&reg.path, reg.multiplier, &self.log_path) {
                snap.thermal.insert(*key, v);
            }
        }
        for (key, reg) in self.cpu_freq_resources.lock().iter() {
            if let Some(v) = read_value(&reg.path, reg.multiplier, &self.log_path) {
                snap.cpu_freq.insert(*key, v);
            }
        }
        for (key, reg) in self.dev_freq_resources.lock().iter() {
            if let Some(v) = read_value(&reg.path, reg.multiplier, &self.log_path) {
                snap.dev_freq.insert(*key, v);
            }
        }
        snap
    }
}

impl Drop for ResourceMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn read_value(path: &str, multiplier: f64, log_path: &Option<std::path::PathBuf>) -> Option<usize> {
    match fs::read_to_string(path) {
        Ok(text) => match text.trim().parse::<f64>() {
            Ok(v) => Some((v * multiplier) as usize),
            Err(e) => {
                log::warn!("resource monitor: unparsable value at {path}: {e}");
                None
            }
        },
        Err(e) => {
            log::warn!("resource monitor: read failed for {path}: {e}");
            if let Some(log_path) = log_path {
                let _ = fs::write(log_path, format!("read failed: {path}: {e}\n"));
            }
            None
        }
    }
}

fn cpu_freq_filename(flag: CpuFreqFlag) -> &'static str {
    match flag {
        CpuFreqFlag::CurFreq => "scaling_cur_freq",
        CpuFreqFlag::TargetFreq => "scaling_target_freq",
        CpuFreqFlag::MinFreq => "scaling_min_freq",
        CpuFreqFlag::MaxFreq => "scaling_max_freq",
        CpuFreqFlag::UpTransitionLatency => "up_transition_latency",
        CpuFreqFlag::DownTransitionLatency => "down_transition_latency",
        CpuFreqFlag::TransitionCount => "transition_count",
    }
}

fn dev_freq_filename(flag: DevFreqFlag) -> &'static str {
    match flag {
        DevFreqFlag::CurFreq => "cur_freq",
        DevFreqFlag::TargetFreq => "target_freq",
        DevFreqFlag::MinFreq => "min_freq",
        DevFreqFlag::MaxFreq => "max_freq",
        DevFreqFlag::PollingInterval => "polling_interval",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_os = "linux")]
    #[test]
    fn duplicate_thermal_registration_is_internal_error() {
        let monitor = ResourceMonitor::new(ResourceMonitorConfig::default()).unwrap();
        monitor.add_thermal_resource(ThermalFlag::TzTemperature, 0).unwrap();
        let err = monitor
            .add_thermal_resource(ThermalFlag::TzTemperature, 0)
            .unwrap_err();
        assert!(matches!(err, BandError::Internal(_)));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn unsampled_key_is_not_found() {
        let monitor = ResourceMonitor::new(ResourceMonitorConfig::default()).unwrap();
        let err = monitor.get_thermal(ThermalFlag::TzTemperature, 0).unwrap_err();
        assert!(matches!(err, BandError::NotFound(_)));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn dev_freq_without_configured_path_is_not_found() {
        let monitor = ResourceMonitor::new(ResourceMonitorConfig::default()).unwrap();
        let err = monitor
            .add_dev_freq_resource(DeviceFlag::GPU, DevFreqFlag::CurFreq)
            .unwrap_err();
        assert!(matches!(err, BandError::NotFound(_)));
    }
}
