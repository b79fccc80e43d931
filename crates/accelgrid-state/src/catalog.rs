//! ClusterTypeCatalog — registry of cluster templates.
//!
//! Read-mostly: built once at startup from the built-in templates plus the
//! `[[catalog]]` entries of `accelgrid.toml`, then shared immutably.

use std::collections::BTreeMap;

use accel_core::config::TemplateConfig;
use accel_core::{AcceleratorKind, CostProfile, ResourceShape};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::types::{ClusterType, ClusterTypeId};

#[derive(Debug, Clone, Default)]
pub struct ClusterTypeCatalog {
    types: BTreeMap<ClusterTypeId, ClusterType>,
}

impl ClusterTypeCatalog {
    /// An empty catalog. Mostly useful in tests.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The four built-in templates.
    pub fn builtin() -> Self {
        let mut catalog = Self::empty();
        for t in builtin_types() {
            catalog.types.insert(t.id.clone(), t);
        }
        catalog
    }

    /// Built-ins overlaid with configured templates. A configured template
    /// with a built-in id replaces it.
    pub fn from_config(templates: &[TemplateConfig]) -> StateResult<Self> {
        let mut catalog = Self::builtin();
        for tc in templates {
            catalog.register(ClusterType::from(tc))?;
        }
        Ok(catalog)
    }

    /// Validate and insert a template, replacing any with the same id.
    pub fn register(&mut self, cluster_type: ClusterType) -> StateResult<()> {
        validate(&cluster_type)?;
        debug!(template = %cluster_type.id, kind = %cluster_type.kind, "cluster template registered");
        self.types.insert(cluster_type.id.clone(), cluster_type);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&ClusterType> {
        self.types.get(id)
    }

    pub fn by_kind(&self, kind: AcceleratorKind) -> Vec<&ClusterType> {
        self.types.values().filter(|t| t.kind == kind).collect()
    }

    /// All templates in id order.
    pub fn iter(&self) -> impl Iterator<Item = &ClusterType> {
        self.types.values()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Smallest draw any template can be created at (`min_nodes` × watts).
    pub fn minimal_cluster_draw(&self) -> Option<f64> {
        self.types
            .values()
            .map(|t| t.power_for(t.min_nodes))
            .min_by(|a, b| a.total_cmp(b))
    }
}

impl From<&TemplateConfig> for ClusterType {
    fn from(tc: &TemplateConfig) -> Self {
        ClusterType {
            id: tc.id.clone(),
            kind: tc.kind,
            shape: ResourceShape::new(tc.cpu, tc.memory_gib, tc.gpu, tc.npu),
            cost: CostProfile {
                hourly_cost_per_node: tc.hourly_cost_per_node,
                watts_per_node: tc.watts_per_node,
            },
            min_nodes: tc.min_nodes,
            max_nodes: tc.max_nodes,
        }
    }
}

fn validate(t: &ClusterType) -> StateResult<()> {
    let fail = |msg: &str| Err(StateError::InvalidTemplate(format!("{}: {msg}", t.id)));
    if t.id.trim().is_empty() {
        return Err(StateError::InvalidTemplate("template id must not be empty".to_string()));
    }
    if t.min_nodes == 0 {
        return fail("min_nodes must be at least 1");
    }
    if t.max_nodes < t.min_nodes {
        return fail("max_nodes is below min_nodes");
    }
    if !(t.cost.watts_per_node.is_finite() && t.cost.watts_per_node > 0.0) {
        return fail("watts_per_node must be positive");
    }
    if !(t.cost.hourly_cost_per_node.is_finite() && t.cost.hourly_cost_per_node >= 0.0) {
        return fail("hourly_cost_per_node must not be negative");
    }
    if t.shape.is_zero() {
        return fail("node shape is empty");
    }
    if t.kind.has_gpu() != (t.shape.gpu > 0) {
        return fail("GPU count does not match accelerator kind");
    }
    if t.kind.has_npu() != (t.shape.npu > 0) {
        return fail("NPU count does not match accelerator kind");
    }
    Ok(())
}

fn builtin_types() -> Vec<ClusterType> {
    let template = |id: &str, kind, shape, cost: f64, watts: f64| ClusterType {
        id: id.to_string(),
        kind,
        shape,
        cost: CostProfile {
            hourly_cost_per_node: cost,
            watts_per_node: watts,
        },
        min_nodes: 1,
        max_nodes: 32,
    };
    vec![
        template(
            "gpu-intensive",
            AcceleratorKind::GpuIntensive,
            ResourceShape::new(8, 64, 1, 0),
            1.20,
            450.0,
        ),
        template(
            "npu-optimized",
            AcceleratorKind::NpuOptimized,
            ResourceShape::new(8, 32, 0, 1),
            0.80,
            250.0,
        ),
        template(
            "hybrid-balanced",
            AcceleratorKind::HybridBalanced,
            ResourceShape::new(16, 64, 1, 1),
            1.50,
            600.0,
        ),
        template(
            "cpu-only",
            AcceleratorKind::CpuOnly,
            ResourceShape::new(16, 64, 0, 0),
            0.15,
            200.0,
        ),
    ]
}
