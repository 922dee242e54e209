//! Scenario builder: one layout per rate strategy.
//!
//! Link rates are uncertain, so each configured [`RateStrategy`] resolves
//! every link's range to a single rate and the resulting scenario is
//! planned on its own. The caller picks between the candidates.

use std::collections::BTreeMap;
use std::sync::Arc;

use lsf_core::{
    Component, ComponentLink, ComponentProfile, Layout, LayoutConfig, LayoutScenario,
    RateStrategy, ScenarioLink,
};
use tracing::{debug, warn};

use crate::calculator::LayoutCalculator;
use crate::error::{LayoutError, LayoutResult};
use crate::orderer::{order_call_graph, order_components};

/// Strategy key → layout planned under that strategy.
pub type LayoutCandidates = BTreeMap<String, Layout>;

/// Global parameters attached to every scenario.
#[derive(Debug, Clone)]
pub struct ScenarioParams {
    pub target_concurrency: u32,
    pub invocation_shared_memory_ratio: f64,
    pub component_mcpu_allocation: u32,
    /// Planned strategies; the order is also the upgrade path.
    pub strategies: Vec<RateStrategy>,
}

impl From<&LayoutConfig> for ScenarioParams {
    fn from(config: &LayoutConfig) -> Self {
        Self {
            target_concurrency: config.target_concurrency,
            invocation_shared_memory_ratio: config.invocation_shared_memory_ratio,
            component_mcpu_allocation: config.component_mcpu_allocation,
            strategies: config.strategies.clone(),
        }
    }
}

pub struct ScenarioBuilder {
    calculator: Arc<LayoutCalculator>,
    params: ScenarioParams,
}

impl ScenarioBuilder {
    pub fn new(calculator: Arc<LayoutCalculator>, params: ScenarioParams) -> Self {
        Self { calculator, params }
    }

    pub fn strategies(&self) -> &[RateStrategy] {
        &self.params.strategies
    }

    pub fn params(&self) -> &ScenarioParams {
        &self.params
    }

    /// Build the scenario `strategy` describes, without planning it.
    pub fn build_scenario(
        &self,
        strategy: RateStrategy,
        components: &[Component],
        links: &[ComponentLink],
        latency_requirement_ms: u32,
        available_node_memory_mb: u64,
    ) -> LayoutScenario {
        let order = order_call_graph(links);
        let scenario_links: Vec<ScenarioLink> = order
            .apply(links)
            .into_iter()
            .map(|link| ScenarioLink {
                invocation_rate: strategy.select(&link.invocation_rate),
                from: link.from,
                to: link.to,
                data_delay_ms: link.data_delay_ms,
            })
            .collect();
        let profiles: Vec<ComponentProfile> = order_components(components, &order)
            .into_iter()
            .map(ComponentProfile::from_component)
            .collect();

        LayoutScenario {
            key: strategy.key().to_string(),
            profiles,
            links: scenario_links,
            latency_requirement_ms,
            available_node_memory_mb,
            target_concurrency: self.params.target_concurrency,
            invocation_shared_memory_ratio: self.params.invocation_shared_memory_ratio,
            component_mcpu_allocation: self.params.component_mcpu_allocation,
        }
    }

    /// Plan every configured strategy. Any failure aborts the whole call
    /// and names the strategy that failed.
    pub fn generate_layout_candidates(
        &self,
        components: &[Component],
        links: &[ComponentLink],
        latency_requirement_ms: u32,
        available_node_memory_mb: u64,
    ) -> LayoutResult<LayoutCandidates> {
        let mut candidates = LayoutCandidates::new();
        for &strategy in &self.params.strategies {
            let scenario = self.build_scenario(
                strategy,
                components,
                links,
                latency_requirement_ms,
                available_node_memory_mb,
            );
            let layout = self
                .calculator
                .calculate_layout(&scenario)
                .map_err(|e| {
                    warn!(%strategy, error = %e, "layout strategy failed");
                    LayoutError::Strategy {
                        strategy: strategy.key().to_string(),
                        source: Box::new(e),
                    }
                })?;
            debug!(%strategy, groups = layout.len(), "layout candidate ready");
            candidates.insert(strategy.key().to_string(), layout);
        }
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use lsf_core::InvocationRate;

    use super::*;
    use crate::calculator::CalculatorConfig;
    use crate::error::SolverError;
    use crate::solver::{PlacementSolver, SolverNodeId, SolverRequest, SolverResponse};

    /// Puts every profile on its own node.
    struct SplitSolver;

    impl PlacementSolver for SplitSolver {
        fn solve(&self, request: &SolverRequest) -> Result<SolverResponse, SolverError> {
            Ok(SolverResponse {
                layout: (1..=request.params.cp_end)
                    .map(|id| vec![SolverNodeId::Profile(id)])
                    .collect(),
                opt_cost: 1.0,
                latency: 10.0,
            })
        }
    }

    /// Infeasible whenever any edge carries more than `limit` req/s.
    struct RateCapSolver {
        limit: f64,
    }

    impl PlacementSolver for RateCapSolver {
        fn solve(&self, request: &SolverRequest) -> Result<SolverResponse, SolverError> {
            let latency = if request.edges.iter().any(|e| e.attr.rate > self.limit) {
                -1.0
            } else {
                10.0
            };
            SplitSolver.solve(request).map(|r| SolverResponse { latency, ..r })
        }
    }

    fn builder(solver: Arc<dyn PlacementSolver>, strategies: Vec<RateStrategy>) -> ScenarioBuilder {
        let calculator = LayoutCalculator::new(
            solver,
            CalculatorConfig {
                platform_nodes: vec!["n1".into(), "n2".into(), "n3".into()],
                platform_delay_ms: 0,
                max_iterations: 10,
            },
        );
        ScenarioBuilder::new(
            Arc::new(calculator),
            ScenarioParams {
                target_concurrency: 1,
                invocation_shared_memory_ratio: 0.5,
                component_mcpu_allocation: 500,
                strategies,
            },
        )
    }

    fn component(name: &str, runtime_ms: u32, memory_mb: u32) -> Component {
        Component {
            name: name.to_string(),
            memory_mb,
            runtime_ms,
            files: Vec::new(),
        }
    }

    fn link(from: &str, to: &str, min: f64, max: f64) -> ComponentLink {
        ComponentLink {
            from: from.to_string(),
            to: to.to_string(),
            invocation_rate: InvocationRate { min, max },
            data_delay_ms: 0,
        }
    }

    fn replicas_of(layout: &Layout, name: &str) -> u32 {
        layout
            .values()
            .flat_map(|info| &info.component_profiles)
            .find(|p| p.name == name)
            .map(|p| p.required_replicas)
            .unwrap()
    }

    #[test]
    fn min_and_max_differ_for_callee_only() {
        let components = vec![component("a", 100, 128), component("b", 500, 64)];
        let links = vec![link("a", "b", 5.0, 20.0)];
        let builder = builder(
            Arc::new(SplitSolver),
            vec![RateStrategy::Min, RateStrategy::Max],
        );

        let candidates = builder
            .generate_layout_candidates(&components, &links, 1000, 4096)
            .unwrap();

        assert_eq!(
            candidates.keys().collect::<Vec<_>>(),
            vec!["max_rate", "min_rate"]
        );
        let min = &candidates["min_rate"];
        let max = &candidates["max_rate"];
        assert_eq!(replicas_of(min, "a"), 1);
        assert_eq!(replicas_of(max, "a"), 1);
        assert_eq!(replicas_of(min, "b"), 3);
        assert_eq!(replicas_of(max, "b"), 10);
    }

    #[test]
    fn fixed_rates_give_identical_candidates() {
        let components = vec![
            component("a", 100, 128),
            component("b", 250, 64),
            component("c", 40, 256),
        ];
        let links = vec![link("a", "b", 8.0, 8.0), link("b", "c", 3.0, 3.0)];
        let builder = builder(
            Arc::new(SplitSolver),
            vec![RateStrategy::Min, RateStrategy::Avg, RateStrategy::Max],
        );

        let candidates = builder
            .generate_layout_candidates(&components, &links, 1000, 4096)
            .unwrap();

        assert_eq!(candidates.len(), 3);
        assert_eq!(candidates["min_rate"], candidates["max_rate"]);
        assert_eq!(candidates["min_rate"], candidates["avg_rate"]);
    }

    #[test]
    fn scenario_follows_call_order() {
        let components = vec![
            component("store", 10, 64),
            component("lonely", 10, 64),
            component("api", 10, 64),
            component("auth", 10, 64),
        ];
        let links = vec![link("auth", "store", 1.0, 4.0), link("api", "auth", 2.0, 6.0)];
        let builder = builder(Arc::new(SplitSolver), vec![RateStrategy::Avg]);

        let scenario = builder.build_scenario(RateStrategy::Avg, &components, &links, 300, 2048);

        let names: Vec<&str> = scenario.profiles.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["api", "auth", "store", "lonely"]);
        assert!(scenario.profiles.iter().all(|p| p.required_replicas == 1));
        assert_eq!(scenario.links[0].from, "api");
        assert_eq!(scenario.links[0].invocation_rate, 4.0);
        assert_eq!(scenario.links[1].invocation_rate, 2.5);
        assert_eq!(scenario.key, "avg_rate");
        assert_eq!(scenario.latency_requirement_ms, 300);
        assert_eq!(scenario.available_node_memory_mb, 2048);
        assert_eq!(scenario.target_concurrency, 1);
    }

    #[test]
    fn failing_strategy_is_named() {
        let components = vec![component("a", 100, 128), component("b", 500, 64)];
        let links = vec![link("a", "b", 5.0, 20.0)];
        let builder = builder(
            Arc::new(RateCapSolver { limit: 10.0 }),
            vec![RateStrategy::Min, RateStrategy::Max],
        );

        let err = builder
            .generate_layout_candidates(&components, &links, 1000, 4096)
            .unwrap_err();

        match err {
            LayoutError::Strategy { strategy, source } => {
                assert_eq!(strategy, "max_rate");
                assert!(matches!(*source, LayoutError::Infeasible { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
