//! Identifiers and small value types shared across the crate.

use std::fmt;

pub type ModelId = i32;
pub type WorkerId = i32;
pub type JobId = i64;
pub type CallbackId = u64;

/// A bitmask over a model's unit subgraphs, capped at 64 per model, so a
/// plain `u64` is the natural representation (mirrors
/// `band::BitMask = std::bitset<64>`).
pub type UnitMask = u64;

/// The device a worker is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub enum DeviceFlag {
    CPU,
    GPU,
    DSP,
    NPU,
}

impl DeviceFlag {
    pub const ALL: [DeviceFlag; 4] = [
        DeviceFlag::CPU,
        DeviceFlag::GPU,
        DeviceFlag::DSP,
        DeviceFlag::NPU,
    ];
}

impl fmt::Display for DeviceFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceFlag::CPU => "CPU",
            DeviceFlag::GPU => "GPU",
            DeviceFlag::DSP => "DSP",
            DeviceFlag::NPU => "NPU",
        };
        f.write_str(s)
    }
}

/// Which subset of logical CPUs a CPU-device worker is pinned to.
///
/// Tiers are derived once at startup from `cpuinfo_max_freq`: the lowest
/// frequency tier is `Little`, the highest single-core tier is `Primary`,
/// everything else is `Big`. If only one tier exists, all enabled cores are
/// `Big` and `Primary` is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub enum CPUMaskFlag {
    All,
    Little,
    Big,
    Primary,
}

/// `(model_id, worker_id, unit_indices)`. Equality, ordering, and hashing
/// are defined over all three fields. Valid iff both ids are non-negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubgraphKey {
    model_id: ModelId,
    worker_id: WorkerId,
    unit_indices: UnitMask,
}

impl SubgraphKey {
    pub fn new(model_id: ModelId, worker_id: WorkerId, unit_indices: UnitMask) -> Self {
        Self {
            model_id,
            worker_id,
            unit_indices,
        }
    }

    /// The invalid/unassigned key, matching `SubgraphKey()`'s default ids.
    pub fn invalid() -> Self {
        Self::new(-1, -1, 0)
    }

    pub fn model_id(&self) -> ModelId {
        self.model_id
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    pub fn unit_indices(&self) -> UnitMask {
        self.unit_indices
    }

    pub fn is_valid(&self) -> bool {
        self.model_id >= 0 && self.worker_id >= 0
    }

    /// Set bits as a sorted vector of unit indices, for display/serialization.
    pub fn unit_indices_vec(&self) -> Vec<u32> {
        (0..64).filter(|b| self.unit_indices & (1u64 << b) != 0).collect()
    }

    /// Comma-separated unit indices, the format used as a JSON object key in
    /// the persisted latency profile.
    pub fn unit_indices_csv(&self) -> String {
        self.unit_indices_vec()
            .iter()
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn from_unit_indices_csv(csv: &str) -> UnitMask {
        let mut mask: UnitMask = 0;
        for tok in csv.split(',') {
            let tok = tok.trim();
            if tok.is_empty() {
                continue;
            }
            if let Ok(idx) = tok.parse::<u32>() {
                if idx < 64 {
                    mask |= 1u64 << idx;
                }
            }
        }
        mask
    }
}

impl fmt::Display for SubgraphKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(model={}, worker={}, units=[{}])",
            self.model_id,
            self.worker_id,
            self.unit_indices_csv()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_key_has_negative_ids() {
        assert!(!SubgraphKey::invalid().is_valid());
    }

    #[test]
    fn equality_and_ordering_cover_all_fields() {
        let a = SubgraphKey::new(0, 1, 0b011);
        let b = SubgraphKey::new(0, 1, 0b011);
        let c = SubgraphKey::new(0, 1, 0b111);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a < c);
    }

    #[test]
    fn csv_round_trips() {
        let key = SubgraphKey::new(2, 3, 0b1011);
        let csv = key.unit_indices_csv();
        assert_eq!(csv, "0,1,3");
        assert_eq!(SubgraphKey::from_unit_indices_csv(&csv), 0b1011);
    }
}
