//! accelgrid.toml configuration parser.
//!
//! Every section and field has a default, so an empty file is a valid
//! configuration. Durations are human strings (`"30s"`, `"5m"`, `"500ms"`).

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::types::AcceleratorKind;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GridConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub matcher: MatcherConfig,
    #[serde(default)]
    pub consolidation: ConsolidationConfig,
    #[serde(default)]
    pub power: PowerConfig,
    #[serde(default)]
    pub provisioning: ProvisioningConfig,
    #[serde(default)]
    pub forecast: ForecastConfig,
    /// Extra or overriding cluster templates.
    #[serde(default)]
    pub catalog: Vec<TemplateConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Interval between decision-loop ticks.
    #[serde(default = "default_tick_interval")]
    pub tick_interval: String,
    /// Minimum gap between non-forced transitions on one cluster.
    #[serde(default = "default_cooldown")]
    pub cooldown_period: String,
    #[serde(default = "default_max_clusters")]
    pub max_clusters_per_group: u32,
    /// Consolidation never shrinks a group below this many clusters.
    #[serde(default)]
    pub min_clusters_per_group: u32,
    /// Number of audit records retained in memory.
    #[serde(default = "default_audit_capacity")]
    pub audit_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatcherConfig {
    /// Minimum fit score (0–100) for reusing an existing cluster.
    #[serde(default = "default_reuse_threshold")]
    pub reuse_fit_threshold: f64,
    #[serde(default)]
    pub weights: MatchWeights,
}

/// Weights of the candidate score components. They need not sum to 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchWeights {
    pub capacity_fit: f64,
    pub idle: f64,
    pub cost: f64,
    pub headroom: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsolidationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Utilization (0.0–1.0) below which an observation window counts as low.
    #[serde(default = "default_low_utilization")]
    pub low_utilization_threshold: f64,
    /// Consecutive low windows before a group starts rebalancing.
    #[serde(default = "default_observation_windows")]
    pub observation_windows: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerConfig {
    /// Site-wide power ceiling in watts.
    #[serde(default = "default_site_ceiling")]
    pub site_ceiling_watts: f64,
    /// Per-group ceilings keyed by group id. Groups without an entry use the
    /// site ceiling.
    #[serde(default)]
    pub group_ceilings: HashMap<String, f64>,
    /// Fraction of a ceiling above which scale-out is rejected.
    #[serde(default = "default_scale_out_threshold")]
    pub scale_out_threshold: f64,
    /// Fraction of a ceiling a forced correction scales down to.
    #[serde(default = "default_scale_in_threshold")]
    pub scale_in_threshold: f64,
    /// How long a ceiling breach must persist before a forced correction.
    #[serde(default = "default_violation_sustain")]
    pub violation_sustain: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisioningConfig {
    /// Retries after the first failed attempt before a cluster enters `Error`.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff: String,
    #[serde(default = "default_max_backoff")]
    pub max_backoff: String,
    /// Timeout applied to each individual gateway call.
    #[serde(default = "default_call_timeout")]
    pub call_timeout: String,
    /// Deadline for an operation to complete once accepted by the gateway.
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastConfig {
    #[serde(default = "default_forecast_horizon")]
    pub horizon: String,
    #[serde(default = "default_forecast_timeout")]
    pub call_timeout: String,
}

/// A cluster template declared in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateConfig {
    pub id: String,
    pub kind: AcceleratorKind,
    #[serde(default)]
    pub cpu: u32,
    #[serde(default)]
    pub memory_gib: u32,
    #[serde(default)]
    pub gpu: u32,
    #[serde(default)]
    pub npu: u32,
    pub hourly_cost_per_node: f64,
    pub watts_per_node: f64,
    #[serde(default = "default_min_nodes")]
    pub min_nodes: u32,
    #[serde(default = "default_max_nodes")]
    pub max_nodes: u32,
}

fn default_tick_interval() -> String {
    "30s".to_string()
}
fn default_cooldown() -> String {
    "5m".to_string()
}
fn default_max_clusters() -> u32 {
    10
}
fn default_audit_capacity() -> usize {
    1024
}
fn default_reuse_threshold() -> f64 {
    60.0
}
fn default_true() -> bool {
    true
}
fn default_low_utilization() -> f64 {
    0.10
}
fn default_observation_windows() -> u32 {
    3
}
fn default_site_ceiling() -> f64 {
    20_000.0
}
fn default_scale_out_threshold() -> f64 {
    0.85
}
fn default_scale_in_threshold() -> f64 {
    0.60
}
fn default_violation_sustain() -> String {
    "5m".to_string()
}
fn default_max_retries() -> u32 {
    3
}
fn default_initial_backoff() -> String {
    "2s".to_string()
}
fn default_max_backoff() -> String {
    "60s".to_string()
}
fn default_call_timeout() -> String {
    "30s".to_string()
}
fn default_operation_timeout() -> String {
    "30m".to_string()
}
fn default_forecast_horizon() -> String {
    "15m".to_string()
}
fn default_forecast_timeout() -> String {
    "5s".to_string()
}
fn default_min_nodes() -> u32 {
    1
}
fn default_max_nodes() -> u32 {
    32
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            tick_interval: default_tick_interval(),
            cooldown_period: default_cooldown(),
            max_clusters_per_group: default_max_clusters(),
            min_clusters_per_group: 0,
            audit_capacity: default_audit_capacity(),
        }
    }
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            reuse_fit_threshold: default_reuse_threshold(),
            weights: MatchWeights::default(),
        }
    }
}

impl Default for MatchWeights {
    fn default() -> Self {
        Self {
            capacity_fit: 0.4,
            idle: 0.3,
            cost: 0.2,
            headroom: 0.1,
        }
    }
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            low_utilization_threshold: default_low_utilization(),
            observation_windows: default_observation_windows(),
        }
    }
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            site_ceiling_watts: default_site_ceiling(),
            group_ceilings: HashMap::new(),
            scale_out_threshold: default_scale_out_threshold(),
            scale_in_threshold: default_scale_in_threshold(),
            violation_sustain: default_violation_sustain(),
        }
    }
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
            call_timeout: default_call_timeout(),
            operation_timeout: default_operation_timeout(),
        }
    }
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            horizon: default_forecast_horizon(),
            call_timeout: default_forecast_timeout(),
        }
    }
}

impl OrchestratorConfig {
    pub fn tick_interval(&self) -> Duration {
        parse_duration(&self.tick_interval).unwrap_or(Duration::from_secs(30))
    }

    pub fn cooldown(&self) -> Duration {
        parse_duration(&self.cooldown_period).unwrap_or(Duration::from_secs(300))
    }
}

impl PowerConfig {
    /// Ceiling for a group: its explicit entry, else the site ceiling.
    pub fn ceiling_for(&self, group_id: &str) -> f64 {
        self.group_ceilings
            .get(group_id)
            .copied()
            .unwrap_or(self.site_ceiling_watts)
    }

    pub fn violation_sustain(&self) -> Duration {
        parse_duration(&self.violation_sustain).unwrap_or(Duration::from_secs(300))
    }
}

impl ProvisioningConfig {
    pub fn initial_backoff(&self) -> Duration {
        parse_duration(&self.initial_backoff).unwrap_or(Duration::from_secs(2))
    }

    pub fn max_backoff(&self) -> Duration {
        parse_duration(&self.max_backoff).unwrap_or(Duration::from_secs(60))
    }

    pub fn call_timeout(&self) -> Duration {
        parse_duration(&self.call_timeout).unwrap_or(Duration::from_secs(30))
    }

    pub fn operation_timeout(&self) -> Duration {
        parse_duration(&self.operation_timeout).unwrap_or(Duration::from_secs(1800))
    }
}

impl ForecastConfig {
    pub fn horizon(&self) -> Duration {
        parse_duration(&self.horizon).unwrap_or(Duration::from_secs(900))
    }

    pub fn call_timeout(&self) -> Duration {
        parse_duration(&self.call_timeout).unwrap_or(Duration::from_secs(5))
    }
}

impl GridConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config = Self::from_toml_str(&content)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: GridConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject internally inconsistent settings.
    pub fn validate(&self) -> anyhow::Result<()> {
        let p = &self.power;
        if !(p.site_ceiling_watts.is_finite() && p.site_ceiling_watts > 0.0) {
            bail!("power.site_ceiling_watts must be positive");
        }
        for (group, ceiling) in &p.group_ceilings {
            if !(ceiling.is_finite() && *ceiling > 0.0) {
                bail!("power.group_ceilings.{group} must be positive");
            }
        }
        if !(0.0 < p.scale_out_threshold && p.scale_out_threshold <= 1.0) {
            bail!("power.scale_out_threshold must be in (0, 1]");
        }
        if !(0.0 < p.scale_in_threshold && p.scale_in_threshold < p.scale_out_threshold) {
            bail!("power.scale_in_threshold must be positive and below scale_out_threshold");
        }
        let c = &self.consolidation;
        if c.observation_windows == 0 {
            bail!("consolidation.observation_windows must be at least 1");
        }
        if !(0.0..1.0).contains(&c.low_utilization_threshold) {
            bail!("consolidation.low_utilization_threshold must be in [0, 1)");
        }
        if !(0.0..=100.0).contains(&self.matcher.reuse_fit_threshold) {
            bail!("matcher.reuse_fit_threshold must be in [0, 100]");
        }
        let o = &self.orchestrator;
        if o.max_clusters_per_group == 0 {
            bail!("orchestrator.max_clusters_per_group must be at least 1");
        }
        if o.min_clusters_per_group > o.max_clusters_per_group {
            bail!("orchestrator.min_clusters_per_group exceeds max_clusters_per_group");
        }
        for (field, value) in [
            ("orchestrator.tick_interval", &o.tick_interval),
            ("orchestrator.cooldown_period", &o.cooldown_period),
            ("power.violation_sustain", &p.violation_sustain),
            ("provisioning.initial_backoff", &self.provisioning.initial_backoff),
            ("provisioning.max_backoff", &self.provisioning.max_backoff),
            ("provisioning.call_timeout", &self.provisioning.call_timeout),
            ("provisioning.operation_timeout", &self.provisioning.operation_timeout),
            ("forecast.horizon", &self.forecast.horizon),
            ("forecast.call_timeout", &self.forecast.call_timeout),
        ] {
            if parse_duration(value).is_none() {
                bail!("{field}: invalid duration '{value}'");
            }
        }
        Ok(())
    }
}

/// Parse a duration string like "5s", "500ms", "2m", "1h".
/// A bare number is taken as seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else if let Some(hours) = s.strip_suffix('h') {
        hours.parse::<u64>().ok().map(|h| Duration::from_secs(h * 3600))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}
