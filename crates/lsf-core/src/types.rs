//! Domain types for function apps, compositions and layouts.
//!
//! `Component`/`ComponentLink` describe an application's call graph as the
//! user declared it. `LayoutScenario`, `ComponentProfile` and `Layout` are
//! the transient planning state recomputed on every planning cycle, and
//! `FunctionApp` → `FunctionComposition` → `Deployment` is the owned tree
//! that gets persisted.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique identifier for a function app.
pub type AppId = String;

/// Content-derived identifier for a function composition.
pub type CompositionId = String;

/// Identifier of a platform node that hosts one composition group.
pub type NodeId = String;

// ── Call graph ─────────────────────────────────────────────────────

/// A unit of application logic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Component {
    pub name: String,
    /// Memory requirement in MB.
    pub memory_mb: u32,
    /// Execution time of one invocation in milliseconds.
    pub runtime_ms: u32,
    /// Source files the component needs at build time.
    #[serde(default)]
    pub files: Vec<String>,
}

/// Invocation rate range in requests per second.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct InvocationRate {
    pub min: f64,
    pub max: f64,
}

/// Directed edge of the application call graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComponentLink {
    pub from: String,
    pub to: String,
    pub invocation_rate: InvocationRate,
    /// Delay caused by data transfer in milliseconds.
    #[serde(default)]
    pub data_delay_ms: u32,
}

/// A link resolved to a single invocation rate for one scenario.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScenarioLink {
    pub from: String,
    pub to: String,
    pub invocation_rate: f64,
    pub data_delay_ms: u32,
}

/// Which reading of a link's rate range a scenario uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RateStrategy {
    #[serde(rename = "min_rate")]
    Min,
    #[serde(rename = "avg_rate")]
    Avg,
    #[serde(rename = "max_rate")]
    Max,
}

impl RateStrategy {
    /// Layout candidate key for this strategy.
    pub fn key(&self) -> &'static str {
        match self {
            RateStrategy::Min => "min_rate",
            RateStrategy::Avg => "avg_rate",
            RateStrategy::Max => "max_rate",
        }
    }

    /// Resolve a rate range to the scalar this strategy assumes.
    pub fn select(&self, rate: &InvocationRate) -> f64 {
        match self {
            RateStrategy::Min => rate.min,
            RateStrategy::Avg => (rate.min + rate.max) * 0.5,
            RateStrategy::Max => rate.max,
        }
    }

    /// Look up a strategy by its candidate key.
    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "min_rate" => Some(RateStrategy::Min),
            "avg_rate" => Some(RateStrategy::Avg),
            "max_rate" => Some(RateStrategy::Max),
            _ => None,
        }
    }
}

impl fmt::Display for RateStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

// ── Planning state ─────────────────────────────────────────────────

/// Per-scenario working state of a component.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ComponentProfile {
    pub name: String,
    pub runtime_ms: u32,
    pub memory_mb: u32,
    /// Always at least 1.
    pub required_replicas: u32,
}

impl ComponentProfile {
    /// Starting profile for a declared component (one replica).
    pub fn from_component(component: &Component) -> Self {
        Self {
            name: component.name.clone(),
            runtime_ms: component.runtime_ms,
            memory_mb: component.memory_mb,
            required_replicas: 1,
        }
    }

    /// Memory needed by one replica serving `target_concurrency` requests.
    ///
    /// `shared_ratio` of the raw memory is shared between concurrent
    /// invocations; the rest scales with concurrency.
    pub fn effective_memory(&self, shared_ratio: f64, target_concurrency: u32) -> u64 {
        let per_request = 1.0 - shared_ratio;
        let effective =
            f64::from(self.memory_mb) * (shared_ratio + per_request * f64::from(target_concurrency));
        effective.max(0.0) as u64
    }
}

/// One fully parameterized planning input.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LayoutScenario {
    /// Name of the strategy this scenario was built with.
    pub key: String,
    pub profiles: Vec<ComponentProfile>,
    pub links: Vec<ScenarioLink>,
    pub latency_requirement_ms: u32,
    pub available_node_memory_mb: u64,
    pub target_concurrency: u32,
    pub invocation_shared_memory_ratio: f64,
    /// Millicores reserved per concurrent request.
    pub component_mcpu_allocation: u32,
}

impl LayoutScenario {
    /// Sum of the effective memory of every profile.
    pub fn memory_signature(&self) -> u64 {
        self.profiles
            .iter()
            .map(|p| p.effective_memory(self.invocation_shared_memory_ratio, self.target_concurrency))
            .sum()
    }
}

/// The components a single platform node hosts, with sizing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompositionInfo {
    pub component_profiles: Vec<ComponentProfile>,
    pub required_replicas: u32,
    /// Effective memory of one replica of the group in MB.
    pub total_effective_memory: u64,
    pub total_mcpu: u32,
    pub target_concurrency: u32,
}

impl CompositionInfo {
    pub fn component_names(&self) -> Vec<String> {
        self.component_profiles.iter().map(|p| p.name.clone()).collect()
    }

    /// Memory for all replicas of the group.
    pub fn total_memory(&self) -> u64 {
        self.total_effective_memory * u64::from(self.required_replicas)
    }
}

/// Platform node → the composition it hosts.
pub type Layout = BTreeMap<NodeId, CompositionInfo>;

// ── Apps, compositions, deployments ────────────────────────────────

/// Registration input for a function app.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionAppSpec {
    pub name: String,
    pub components: Vec<Component>,
    #[serde(default)]
    pub links: Vec<ComponentLink>,
    /// End-to-end latency budget in milliseconds; 0 disables latency control.
    #[serde(default)]
    pub latency_limit_ms: u32,
}

/// A registered application.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionApp {
    pub id: AppId,
    pub name: String,
    pub components: Vec<Component>,
    pub links: Vec<ComponentLink>,
    pub latency_limit_ms: u32,
    pub compositions: Vec<FunctionComposition>,
    /// Strategy key → layout computed for it.
    #[serde(default)]
    pub layout_candidates: BTreeMap<String, Layout>,
    #[serde(default)]
    pub active_layout_key: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl FunctionApp {
    pub fn composition(&self, id: &str) -> Option<&FunctionComposition> {
        self.compositions.iter().find(|c| c.id == id)
    }

    pub fn composition_mut(&mut self, id: &str) -> Option<&mut FunctionComposition> {
        self.compositions.iter_mut().find(|c| c.id == id)
    }

    pub fn has_component(&self, name: &str) -> bool {
        self.components.iter().any(|c| c.name == name)
    }

    /// The layout currently selected for deployment, if any.
    pub fn active_layout(&self) -> Option<&Layout> {
        self.active_layout_key
            .as_ref()
            .and_then(|k| self.layout_candidates.get(k))
    }
}

/// Build status of a function composition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Pending,
    Built,
    Error,
}

/// Artifact produced by a successful build.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Build {
    pub image: String,
    /// Unix timestamp (seconds) of the build.
    pub timestamp: u64,
}

/// Request to add a composition to an app.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompositionSpec {
    pub components: Vec<String>,
    /// Platform node to deploy onto, if already known.
    #[serde(default)]
    pub node: Option<NodeId>,
}

/// A deployable group of components built as a single artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionComposition {
    pub id: CompositionId,
    pub function_app_id: AppId,
    pub components: Vec<String>,
    pub status: BuildStatus,
    pub build: Option<Build>,
    pub deployments: Vec<Deployment>,
}

impl FunctionComposition {
    /// Content-derived id: sorted component names joined with `-`, then the app id.
    pub fn content_id(app_id: &str, components: &[String]) -> CompositionId {
        let mut names = components.to_vec();
        names.sort();
        format!("{}-{}", names.join("-"), app_id)
    }
}

/// Lifecycle status of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    WaitingForBuild,
    Pending,
    Deployed,
    Error,
}

/// Where a component forwards its calls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Route {
    /// Target component name.
    pub to: String,
    /// Deployment id serving the target, or `local`.
    pub function: String,
}

/// Component name → outgoing routes.
pub type RoutingTable = HashMap<String, Vec<Route>>;

/// A composition running on one platform node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Deployment {
    pub id: String,
    pub function_composition_id: CompositionId,
    pub node: NodeId,
    pub namespace: String,
    #[serde(default)]
    pub routing_table: RoutingTable,
    pub status: DeploymentStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(name: &str, memory_mb: u32) -> ComponentProfile {
        ComponentProfile {
            name: name.to_string(),
            runtime_ms: 100,
            memory_mb,
            required_replicas: 1,
        }
    }

    #[test]
    fn effective_memory_splits_shared_and_per_request() {
        // 128 * (0.5 + 0.5 * 2) = 192
        assert_eq!(profile("a", 128).effective_memory(0.5, 2), 192);
        // Fully shared memory does not scale with concurrency.
        assert_eq!(profile("a", 128).effective_memory(1.0, 8), 128);
        // Nothing shared: linear in concurrency.
        assert_eq!(profile("a", 100).effective_memory(0.0, 3), 300);
    }

    #[test]
    fn memory_signature_sums_profiles() {
        let scenario = LayoutScenario {
            key: "min_rate".to_string(),
            profiles: vec![profile("a", 128), profile("b", 64)],
            links: Vec::new(),
            latency_requirement_ms: 200,
            available_node_memory_mb: 1024,
            target_concurrency: 1,
            invocation_shared_memory_ratio: 0.5,
            component_mcpu_allocation: 500,
        };
        assert_eq!(scenario.memory_signature(), 192);
    }

    #[test]
    fn rate_strategy_selects_bound() {
        let rate = InvocationRate { min: 5.0, max: 20.0 };
        assert_eq!(RateStrategy::Min.select(&rate), 5.0);
        assert_eq!(RateStrategy::Avg.select(&rate), 12.5);
        assert_eq!(RateStrategy::Max.select(&rate), 20.0);
        assert_eq!(RateStrategy::from_key("avg_rate"), Some(RateStrategy::Avg));
        assert_eq!(RateStrategy::from_key("p50"), None);
    }

    #[test]
    fn content_id_ignores_component_order() {
        let a = FunctionComposition::content_id("app-1", &["b".to_string(), "a".to_string()]);
        let b = FunctionComposition::content_id("app-1", &["a".to_string(), "b".to_string()]);
        assert_eq!(a, "a-b-app-1");
        assert_eq!(a, b);
    }

    #[test]
    fn rate_strategy_serializes_as_key() {
        let json = serde_json::to_string(&RateStrategy::Max).unwrap();
        assert_eq!(json, "\"max_rate\"");
    }

    #[test]
    fn deployment_status_uses_snake_case() {
        let json = serde_json::to_string(&DeploymentStatus::WaitingForBuild).unwrap();
        assert_eq!(json, "\"waiting_for_build\"");
    }
}
