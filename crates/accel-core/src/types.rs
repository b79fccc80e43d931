//! Shared types used across AccelGrid crates.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Accelerator specialization of a cluster template.
///
/// Closed set: every template in the catalog carries exactly one of these,
/// and every kind exposes the same capability descriptor
/// ([`ResourceShape`] + [`CostProfile`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcceleratorKind {
    GpuIntensive,
    NpuOptimized,
    HybridBalanced,
    CpuOnly,
}

impl AcceleratorKind {
    pub const ALL: [AcceleratorKind; 4] = [
        AcceleratorKind::GpuIntensive,
        AcceleratorKind::NpuOptimized,
        AcceleratorKind::HybridBalanced,
        AcceleratorKind::CpuOnly,
    ];

    pub fn has_gpu(&self) -> bool {
        matches!(self, AcceleratorKind::GpuIntensive | AcceleratorKind::HybridBalanced)
    }

    pub fn has_npu(&self) -> bool {
        matches!(self, AcceleratorKind::NpuOptimized | AcceleratorKind::HybridBalanced)
    }

    pub fn label(&self) -> &'static str {
        match self {
            AcceleratorKind::GpuIntensive => "gpu-intensive",
            AcceleratorKind::NpuOptimized => "npu-optimized",
            AcceleratorKind::HybridBalanced => "hybrid-balanced",
            AcceleratorKind::CpuOnly => "cpu-only",
        }
    }
}

impl fmt::Display for AcceleratorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A resource vector: per-node shape of a template, a cluster's capacity,
/// or a workload's demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ResourceShape {
    /// CPU cores.
    #[serde(default)]
    pub cpu: u32,
    /// Memory in GiB.
    #[serde(default)]
    pub memory_gib: u32,
    #[serde(default)]
    pub gpu: u32,
    #[serde(default)]
    pub npu: u32,
}

impl ResourceShape {
    pub const ZERO: ResourceShape = ResourceShape {
        cpu: 0,
        memory_gib: 0,
        gpu: 0,
        npu: 0,
    };

    pub fn new(cpu: u32, memory_gib: u32, gpu: u32, npu: u32) -> Self {
        Self {
            cpu,
            memory_gib,
            gpu,
            npu,
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// Multiply every dimension by `n` (e.g. per-node shape × node count).
    pub fn scale(&self, n: u32) -> Self {
        Self {
            cpu: self.cpu.saturating_mul(n),
            memory_gib: self.memory_gib.saturating_mul(n),
            gpu: self.gpu.saturating_mul(n),
            npu: self.npu.saturating_mul(n),
        }
    }

    pub fn saturating_add(&self, other: &Self) -> Self {
        Self {
            cpu: self.cpu.saturating_add(other.cpu),
            memory_gib: self.memory_gib.saturating_add(other.memory_gib),
            gpu: self.gpu.saturating_add(other.gpu),
            npu: self.npu.saturating_add(other.npu),
        }
    }

    pub fn saturating_sub(&self, other: &Self) -> Self {
        Self {
            cpu: self.cpu.saturating_sub(other.cpu),
            memory_gib: self.memory_gib.saturating_sub(other.memory_gib),
            gpu: self.gpu.saturating_sub(other.gpu),
            npu: self.npu.saturating_sub(other.npu),
        }
    }

    /// True when every dimension of `demand` fits in `self`.
    pub fn covers(&self, demand: &Self) -> bool {
        self.cpu >= demand.cpu
            && self.memory_gib >= demand.memory_gib
            && self.gpu >= demand.gpu
            && self.npu >= demand.npu
    }

    /// Dimension-wise `(self, other)` pairs in a fixed order.
    pub fn dims(&self, other: &Self) -> [(u32, u32); 4] {
        [
            (self.cpu, other.cpu),
            (self.memory_gib, other.memory_gib),
            (self.gpu, other.gpu),
            (self.npu, other.npu),
        ]
    }

    /// Largest per-dimension ratio `self / capacity`, over dimensions where
    /// the capacity is non-zero. Returns 0.0 for an all-zero capacity.
    pub fn dominant_share(&self, capacity: &Self) -> f64 {
        self.dims(capacity)
            .iter()
            .filter(|(_, cap)| *cap > 0)
            .map(|(used, cap)| f64::from(*used) / f64::from(*cap))
            .fold(0.0, f64::max)
    }

    /// Normalized size used when comparing idle capacity across shapes.
    ///
    /// Accelerators dominate cost, so one GPU/NPU weighs as much as
    /// 8 cores or 64 GiB.
    pub fn weighted_units(&self) -> f64 {
        f64::from(self.cpu) / 8.0
            + f64::from(self.memory_gib) / 64.0
            + f64::from(self.gpu)
            + f64::from(self.npu)
    }
}

impl fmt::Display for ResourceShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cpu={} mem={}GiB gpu={} npu={}",
            self.cpu, self.memory_gib, self.gpu, self.npu
        )
    }
}

/// Cost and power profile of one node of a template.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostProfile {
    /// Hourly cost of one node (currency-agnostic).
    pub hourly_cost_per_node: f64,
    /// Estimated power draw of one node under load, in watts.
    pub watts_per_node: f64,
}

impl CostProfile {
    /// Cost per normalized capacity unit of one node of `shape`.
    pub fn cost_per_unit(&self, shape: &ResourceShape) -> f64 {
        let units = shape.weighted_units();
        if units > 0.0 {
            self.hourly_cost_per_node / units
        } else {
            f64::INFINITY
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_capabilities() {
        assert!(AcceleratorKind::GpuIntensive.has_gpu());
        assert!(!AcceleratorKind::GpuIntensive.has_npu());
        assert!(AcceleratorKind::HybridBalanced.has_gpu());
        assert!(AcceleratorKind::HybridBalanced.has_npu());
        assert!(!AcceleratorKind::CpuOnly.has_gpu());
        assert_eq!(AcceleratorKind::NpuOptimized.to_string(), "npu-optimized");
    }

    #[test]
    fn shape_arithmetic() {
        let node = ResourceShape::new(8, 64, 1, 0);
        let four = node.scale(4);
        assert_eq!(four, ResourceShape::new(32, 256, 4, 0));
        assert!(four.covers(&ResourceShape::new(16, 128, 4, 0)));
        assert!(!four.covers(&ResourceShape::new(16, 128, 5, 0)));
        assert_eq!(four.saturating_sub(&node.scale(5)), ResourceShape::ZERO);
    }

    #[test]
    fn dominant_share_uses_tightest_dimension() {
        let cap = ResourceShape::new(32, 256, 4, 0);
        let used = ResourceShape::new(8, 32, 3, 0);
        assert!((used.dominant_share(&cap) - 0.75).abs() < 1e-9);
        assert_eq!(used.dominant_share(&ResourceShape::ZERO), 0.0);
    }

    #[test]
    fn cost_per_unit_prefers_denser_nodes() {
        let cheap = CostProfile {
            hourly_cost_per_node: 1.0,
            watts_per_node: 100.0,
        };
        let small = ResourceShape::new(8, 64, 0, 0);
        let big = ResourceShape::new(16, 128, 0, 0);
        assert!(cheap.cost_per_unit(&big) < cheap.cost_per_unit(&small));
        assert!(cheap.cost_per_unit(&ResourceShape::ZERO).is_infinite());
    }
}
