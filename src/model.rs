//! Immutable per-model description and the derived unit-subgraph partition.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{BandError, Result};
use crate::ids::{DeviceFlag, UnitMask};

/// Tensor element type. Only a name is needed by the core; actual buffer
/// handling is the tensor broker's concern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorType {
    Float32,
    Int32,
    UInt8,
    Int64,
    Bool,
    Int8,
    Float16,
}

/// Immutable per-model description, built once at registration time from the
/// backend adapter's `InvestigateModelSpec` contract.
#[derive(Debug, Clone)]
pub struct ModelSpec {
    pub path: String,
    pub num_ops: usize,
    pub num_tensors: usize,
    pub tensor_types: Vec<TensorType>,
    pub input_tensors: BTreeSet<usize>,
    pub output_tensors: BTreeSet<usize>,
    /// Non-constant input tensors consumed by each op, indexed by op.
    pub op_input_tensors: Vec<BTreeSet<usize>>,
    /// Non-constant output tensors produced by each op, indexed by op.
    pub op_output_tensors: Vec<BTreeSet<usize>>,
    pub unsupported_ops: BTreeMap<DeviceFlag, BTreeSet<usize>>,
    pub unavailable_devices: BTreeSet<DeviceFlag>,

    unit_subgraph_ops: Vec<BTreeSet<usize>>,
    unit_subgraph_dependencies: Vec<UnitMask>,
}

impl ModelSpec {
    /// Construct from the fields the backend adapter reports and a
    /// unit-subgraph partition (a partition of `[0, num_ops)` where each
    /// element is either fully executable or fully inexecutable on any one
    /// device). Dependency bitmasks are derived here.
    pub fn new(
        path: impl Into<String>,
        num_ops: usize,
        num_tensors: usize,
        tensor_types: Vec<TensorType>,
        input_tensors: BTreeSet<usize>,
        output_tensors: BTreeSet<usize>,
        op_input_tensors: Vec<BTreeSet<usize>>,
        op_output_tensors: Vec<BTreeSet<usize>>,
        unsupported_ops: BTreeMap<DeviceFlag, BTreeSet<usize>>,
        unavailable_devices: BTreeSet<DeviceFlag>,
        unit_subgraph_ops: Vec<BTreeSet<usize>>,
    ) -> Result<Self> {
        if unit_subgraph_ops.len() > 64 {
            return Err(BandError::invalid_argument(
                "a model may not have more than 64 unit subgraphs",
            ));
        }

        let mut spec = ModelSpec {
            path: path.into(),
            num_ops,
            num_tensors,
            tensor_types,
            input_tensors,
            output_tensors,
            op_input_tensors,
            op_output_tensors,
            unsupported_ops,
            unavailable_devices,
            unit_subgraph_ops: Vec::new(),
            unit_subgraph_dependencies: Vec::new(),
        };
        spec.set_unit_subgraphs(unit_subgraph_ops)?;
        Ok(spec)
    }

    /// {all input tensors of `op_indices`} - {all output tensors of
    /// `op_indices`}: the inputs of a unit subgraph that must come from
    /// outside it.
    pub fn pure_input_tensors(&self, op_indices: &BTreeSet<usize>) -> BTreeSet<usize> {
        let mut inputs = BTreeSet::new();
        for &op in op_indices {
            inputs.extend(self.op_input_tensors[op].iter().copied());
        }
        for &op in op_indices {
            for out in &self.op_output_tensors[op] {
                inputs.remove(out);
            }
        }
        inputs
    }

    pub fn output_tensors_of(&self, op_indices: &BTreeSet<usize>) -> BTreeSet<usize> {
        let mut outputs = BTreeSet::new();
        for &op in op_indices {
            outputs.extend(self.op_output_tensors[op].iter().copied());
        }
        outputs
    }

    fn set_unit_subgraphs(&mut self, ops: Vec<BTreeSet<usize>>) -> Result<()> {
        let mut all_ops = BTreeSet::new();
        for unit in &ops {
            all_ops.extend(unit.iter().copied());
        }
        let max_op = all_ops.iter().next_back().copied();
        if all_ops.len() != self.num_ops || max_op != Some(self.num_ops.saturating_sub(1)) {
            return Err(BandError::internal(
                "unit subgraph partition does not cover all operators",
            ));
        }

        let mut dependencies = vec![0u64; ops.len()];
        for child in 0..ops.len() {
            let child_inputs = self.pure_input_tensors(&ops[child]);
            for parent in 0..child {
                let parent_outputs = self.output_tensors_of(&ops[parent]);
                if child_inputs.intersection(&parent_outputs).next().is_some() {
                    dependencies[child] |= 1u64 << parent;
                }
            }
        }

        self.unit_subgraph_ops = ops;
        self.unit_subgraph_dependencies = dependencies;
        Ok(())
    }

    pub fn num_unit_subgraphs(&self) -> usize {
        self.unit_subgraph_ops.len()
    }

    pub fn unit_subgraph_ops(&self, index: usize) -> &BTreeSet<usize> {
        &self.unit_subgraph_ops[index]
    }

    pub fn unit_subgraph_dependency(&self, index: usize) -> UnitMask {
        self.unit_subgraph_dependencies[index]
    }

    /// External dependencies required to run `unit_subgraphs` (a mask of
    /// units), i.e. the union of each member's direct dependencies with the
    /// internal members removed.
    pub fn unit_subgraph_dependency_mask(&self, unit_subgraphs: UnitMask) -> UnitMask {
        let mut external = 0u64;
        for i in 0..self.num_unit_subgraphs() {
            if unit_subgraphs & (1u64 << i) != 0 {
                external |= self.unit_subgraph_dependency(i);
            }
        }
        external & !unit_subgraphs
    }

    /// The bitmask covering every unit subgraph, i.e. the "whole model"
    /// resolved state.
    pub fn full_mask(&self) -> UnitMask {
        if self.num_unit_subgraphs() == 64 {
            u64::MAX
        } else {
            (1u64 << self.num_unit_subgraphs()) - 1
        }
    }

    pub fn is_supported_on(&self, op: usize, device: DeviceFlag) -> bool {
        if self.unavailable_devices.contains(&device) {
            return false;
        }
        !self
            .unsupported_ops
            .get(&device)
            .map(|s| s.contains(&op))
            .unwrap_or(false)
    }

    /// Whether every op in `unit` is executable on `device`.
    pub fn unit_supported_on(&self, unit: usize, device: DeviceFlag) -> bool {
        self.unit_subgraph_ops(unit)
            .iter()
            .all(|&op| self.is_supported_on(op, device))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn btree(v: &[usize]) -> BTreeSet<usize> {
        v.iter().copied().collect()
    }

    fn two_unit_model() -> ModelSpec {
        // op0 -> tensor0 -> op1. Unit 0 = {op0}, unit 1 = {op1}.
        ModelSpec::new(
            "test.model",
            2,
            2,
            vec![TensorType::Float32; 2],
            btree(&[]),
            btree(&[1]),
            vec![btree(&[]), btree(&[0])],
            vec![btree(&[0]), btree(&[1])],
            BTreeMap::new(),
            BTreeSet::new(),
            vec![btree(&[0]), btree(&[1])],
        )
        .unwrap()
    }

    #[test]
    fn dependency_bitmask_is_strictly_lower_triangular() {
        let spec = two_unit_model();
        assert_eq!(spec.unit_subgraph_dependency(0), 0);
        assert_eq!(spec.unit_subgraph_dependency(1), 0b01);
    }

    #[test]
    fn external_dependency_mask_strips_internal_bits() {
        let spec = two_unit_model();
        // requesting both units together has no external dependency left
        assert_eq!(spec.unit_subgraph_dependency_mask(0b11), 0);
        // requesting unit 1 alone still depends on unit 0
        assert_eq!(spec.unit_subgraph_dependency_mask(0b10), 0b01);
    }

    #[test]
    fn rejects_partition_that_does_not_cover_all_ops() {
        let result = ModelSpec::new(
            "bad.model",
            2,
            2,
            vec![TensorType::Float32; 2],
            btree(&[]),
            btree(&[1]),
            vec![btree(&[]), btree(&[0])],
            vec![btree(&[0]), btree(&[1])],
            BTreeMap::new(),
            BTreeSet::new(),
            vec![btree(&[0])],
        );
        assert!(result.is_err());
    }
}
