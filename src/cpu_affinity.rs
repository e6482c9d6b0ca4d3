//! CPU core classification (Little/Big/Primary) by max frequency, and
//! thread-affinity pinning. Topology is read from sysfs once, on first use.

use std::sync::OnceLock;

use crate::error::{BandError, Result};
use crate::ids::CPUMaskFlag;

const SYSFS_CPU_ROOT: &str = "/sys/devices/system/cpu";

#[derive(Debug, Clone, Default)]
pub struct CpuTopology {
    pub all: Vec<usize>,
    pub little: Vec<usize>,
    pub big: Vec<usize>,
    pub primary: Vec<usize>,
}

impl CpuTopology {
    pub fn cores_for(&self, flag: CPUMaskFlag) -> &[usize] {
        match flag {
            CPUMaskFlag::All => &self.all,
            CPUMaskFlag::Little => &self.little,
            CPUMaskFlag::Big => &self.big,
            CPUMaskFlag::Primary => &self.primary,
        }
    }

    /// The lowest-indexed core in a tier, used to pick a representative
    /// `policyN` sysfs path for per-tier frequency sampling. Falls back to
    /// core 0 if the tier is empty (e.g. no `Primary` cluster).
    pub fn representative_core(&self, flag: CPUMaskFlag) -> usize {
        self.cores_for(flag).first().copied().unwrap_or(0)
    }
}

static TOPOLOGY: OnceLock<CpuTopology> = OnceLock::new();

pub fn topology() -> &'static CpuTopology {
    TOPOLOGY.get_or_init(detect)
}

/// Classifies cores the way `band::SetupThreadAffinityMasks` does: read each
/// core's `cpuinfo_max_freq`, split at the midpoint between the lowest and
/// highest values. Cores below the midpoint are `Little`, cores at the max
/// are `Primary`, everything else is `Big`. If there's no split (single
/// cluster) or no `Big` core ended up with a frequency strictly between the
/// two extremes, everything lands in `Big` and `Little`/`Primary` are empty.
fn detect() -> CpuTopology {
    let all = online_cpu_ids();
    if all.is_empty() {
        return CpuTopology {
            all: vec![0],
            big: vec![0],
            little: Vec::new(),
            primary: Vec::new(),
        };
    }

    let freqs: Vec<(usize, i64)> = all.iter().map(|&id| (id, read_max_freq_khz(id).unwrap_or(0))).collect();
    let min_freq = freqs.iter().map(|(_, f)| *f).min().unwrap_or(0);
    let max_freq = freqs.iter().map(|(_, f)| *f).max().unwrap_or(0);

    if min_freq == max_freq {
        return CpuTopology {
            big: all.clone(),
            all,
            little: Vec::new(),
            primary: Vec::new(),
        };
    }

    let midpoint = (min_freq + max_freq) / 2;
    let mut little = Vec::new();
    let mut big = Vec::new();
    let mut primary = Vec::new();
    for (id, freq) in &freqs {
        if *freq < midpoint {
            little.push(*id);
        } else if *freq == max_freq {
            primary.push(*id);
        } else {
            big.push(*id);
        }
    }
    if big.is_empty() {
        big = std::mem::take(&mut primary);
    }

    CpuTopology { all, little, big, primary }
}

fn online_cpu_ids() -> Vec<usize> {
    let Ok(entries) = std::fs::read_dir(SYSFS_CPU_ROOT) else {
        return Vec::new();
    };
    let mut ids: Vec<usize> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().into_string().ok())
        .filter_map(|name| name.strip_prefix("cpu")?.parse::<usize>().ok())
        .collect();
    ids.sort_unstable();
    ids
}

fn read_max_freq_khz(cpu_id: usize) -> Option<i64> {
    let path = format!("{SYSFS_CPU_ROOT}/cpu{cpu_id}/cpufreq/cpuinfo_max_freq");
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Pins the calling OS thread's affinity to every core in `cores`. A no-op
/// (returns `Ok`) if `cores` is empty, since that means the tier has no
/// dedicated cores to pin to.
#[cfg(target_os = "linux")]
pub fn pin_thread(cores: &[usize]) -> Result<()> {
    if cores.is_empty() {
        return Ok(());
    }
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        for &core in cores {
            libc::CPU_SET(core, &mut set);
        }
        let ret = libc::pthread_setaffinity_np(libc::pthread_self(), std::mem::size_of::<libc::cpu_set_t>(), &set);
        if ret != 0 {
            return Err(BandError::device_error(format!("pthread_setaffinity_np failed: errno {ret}")));
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn pin_thread(_cores: &[usize]) -> Result<()> {
    Err(BandError::unavailable("thread affinity is not supported on this platform"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topology_all_tier_is_never_empty() {
        assert!(!topology().all.is_empty());
    }

    #[test]
    fn every_core_is_classified_into_exactly_one_non_all_tier() {
        let t = topology();
        let classified = t.little.len() + t.big.len() + t.primary.len();
        assert_eq!(classified, t.all.len());
    }

    #[test]
    fn representative_core_falls_back_to_zero_for_empty_tier() {
        let t = CpuTopology { all: vec![3, 4], big: vec![3, 4], little: Vec::new(), primary: Vec::new() };
        assert_eq!(t.representative_core(CPUMaskFlag::Primary), 0);
        assert_eq!(t.representative_core(CPUMaskFlag::Big), 3);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn pinning_to_the_current_cpu_set_succeeds() {
        let cores = topology().all.clone();
        assert!(pin_thread(&cores).is_ok());
    }
}
