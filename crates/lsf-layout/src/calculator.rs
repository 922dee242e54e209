//! Layout calculator: fixed-point loop around the placement solver.
//!
//! Each iteration sends the scenario to the solver, estimates replicas for
//! the groups it returns and feeds the refreshed profiles back in. The loop
//! stops once two consecutive iterations produce the same
//! [`ConvergenceKey`].
//!
//! Replica counts carried between iterations only ever grow (the maximum
//! seen so far per component), which keeps the loop from oscillating
//! between two layouts. The returned layout is sized from a fresh estimate
//! of the converged grouping, not from those maxima.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use lsf_core::{
    ComponentProfile, CompositionInfo, Layout, LayoutScenario, LsfConfig, NodeId, ScenarioLink,
};
use tracing::{debug, info};

use crate::error::{LayoutError, LayoutResult};
use crate::sizing::{DEFAULT_ARRIVAL_RATE, group_arrival_rate, required_replicas};
use crate::solver::{
    EdgeAttr, PlacementSolver, SolverEdge, SolverNode, SolverNodeId, SolverParams, SolverRequest,
};

/// Platform parameters the calculator plans against.
#[derive(Debug, Clone)]
pub struct CalculatorConfig {
    /// Nodes in the order solver groups are assigned to them.
    pub platform_nodes: Vec<NodeId>,
    /// Delay for every call that crosses nodes (ms).
    pub platform_delay_ms: u32,
    pub max_iterations: u32,
}

impl CalculatorConfig {
    pub fn from_config(config: &LsfConfig) -> Self {
        Self {
            platform_nodes: config.platform.nodes.clone(),
            platform_delay_ms: config.platform.delay_ms,
            max_iterations: config.layout.max_iterations,
        }
    }
}

/// Shape summary of one iteration's outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvergenceKey {
    pub groups: usize,
    /// Solver cost, truncated toward zero.
    pub opt_cost: i64,
    pub memory_signature: u64,
}

impl fmt::Display for ConvergenceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.groups, self.opt_cost, self.memory_signature)
    }
}

/// A solver group resolved to profile indices and the node hosting it.
#[derive(Debug, Clone)]
struct Group {
    node: NodeId,
    members: Vec<usize>,
}

pub struct LayoutCalculator {
    solver: Arc<dyn PlacementSolver>,
    config: CalculatorConfig,
}

impl LayoutCalculator {
    pub fn new(solver: Arc<dyn PlacementSolver>, config: CalculatorConfig) -> Self {
        Self { solver, config }
    }

    pub fn config(&self) -> &CalculatorConfig {
        &self.config
    }

    /// Compute a stable layout for `scenario`.
    pub fn calculate_layout(&self, scenario: &LayoutScenario) -> LayoutResult<Layout> {
        if scenario.profiles.is_empty() {
            return Err(LayoutError::EmptyScenario {
                scenario: scenario.key.clone(),
            });
        }

        let mut working = scenario.clone();
        let mut max_seen: HashMap<String, u32> = scenario
            .profiles
            .iter()
            .map(|p| (p.name.clone(), p.required_replicas.max(1)))
            .collect();
        let mut previous: Option<ConvergenceKey> = None;

        for iteration in 0..self.config.max_iterations {
            let request = self.build_request(&working);
            let response =
                self.solver
                    .solve(&request)
                    .map_err(|source| LayoutError::Solver {
                        scenario: scenario.key.clone(),
                        iteration,
                        source,
                    })?;

            if response.latency < 0.0 {
                return Err(LayoutError::Infeasible {
                    scenario: scenario.key.clone(),
                    latency_ms: scenario.latency_requirement_ms,
                });
            }
            if response.layout.len() > self.config.platform_nodes.len() {
                return Err(LayoutError::InsufficientCapacity {
                    scenario: scenario.key.clone(),
                    groups: response.layout.len(),
                    nodes: self.config.platform_nodes.len(),
                });
            }

            let groups = self.resolve_groups(&working, &response.layout, iteration)?;
            let estimated = estimate_replicas(&working, &groups);

            let mut next = working.clone();
            for (profile, replicas) in next.profiles.iter_mut().zip(&estimated) {
                let seen = max_seen.entry(profile.name.clone()).or_insert(1);
                *seen = (*seen).max(*replicas);
                profile.required_replicas = *seen;
            }

            let key = ConvergenceKey {
                groups: groups.len(),
                opt_cost: response.opt_cost as i64,
                memory_signature: next.memory_signature(),
            };
            debug!(
                scenario = %scenario.key,
                iteration,
                %key,
                latency = response.latency,
                "layout iteration"
            );

            if previous == Some(key) {
                let layout = materialize(&working, &groups, &estimated);
                info!(
                    scenario = %scenario.key,
                    iterations = iteration + 1,
                    groups = layout.len(),
                    "layout converged"
                );
                return Ok(layout);
            }

            previous = Some(key);
            working = next;
        }

        Err(LayoutError::NoConvergence {
            scenario: scenario.key.clone(),
            iterations: self.config.max_iterations,
        })
    }

    fn build_request(&self, scenario: &LayoutScenario) -> SolverRequest {
        let index: HashMap<&str, usize> = scenario
            .profiles
            .iter()
            .enumerate()
            .map(|(i, p)| (p.name.as_str(), i + 1))
            .collect();

        let mut nodes = Vec::with_capacity(scenario.profiles.len() + 1);
        nodes.push(SolverNode {
            id: SolverNodeId::root(),
            mem: 0,
            runtime: 0,
        });
        for (i, profile) in scenario.profiles.iter().enumerate() {
            nodes.push(SolverNode {
                id: SolverNodeId::Profile(i + 1),
                mem: profile.effective_memory(
                    scenario.invocation_shared_memory_ratio,
                    scenario.target_concurrency,
                ),
                runtime: profile.runtime_ms,
            });
        }

        let mut edges = Vec::with_capacity(scenario.links.len() + 1);
        edges.push(SolverEdge {
            from: SolverNodeId::root(),
            to: SolverNodeId::Profile(1),
            attr: root_edge_attr(&scenario.profiles[0], &scenario.links),
        });
        for link in &scenario.links {
            let (Some(&from), Some(&to)) = (
                index.get(link.from.as_str()),
                index.get(link.to.as_str()),
            ) else {
                continue;
            };
            edges.push(SolverEdge {
                from: SolverNodeId::Profile(from),
                to: SolverNodeId::Profile(to),
                attr: EdgeAttr {
                    rate: link.invocation_rate,
                    data: link.data_delay_ms,
                },
            });
        }

        SolverRequest {
            params: SolverParams {
                root: 1,
                memory: scenario.available_node_memory_mb,
                latency: scenario.latency_requirement_ms,
                cp_end: scenario.profiles.len(),
                delay: self.config.platform_delay_ms,
            },
            nodes,
            edges,
        }
    }

    /// Map solver groups onto platform nodes. Group `i` lands on node `i`;
    /// the root label is ignored and empty groups are dropped.
    fn resolve_groups(
        &self,
        scenario: &LayoutScenario,
        layout: &[Vec<SolverNodeId>],
        iteration: u32,
    ) -> LayoutResult<Vec<Group>> {
        let mut groups = Vec::with_capacity(layout.len());
        for (node, ids) in self.config.platform_nodes.iter().zip(layout) {
            let mut members = Vec::with_capacity(ids.len());
            for id in ids {
                match id {
                    SolverNodeId::Profile(n) if (1..=scenario.profiles.len()).contains(n) => {
                        if !members.contains(&(n - 1)) {
                            members.push(n - 1);
                        }
                    }
                    SolverNodeId::Label(_) => {}
                    other => {
                        return Err(LayoutError::UnknownNode {
                            scenario: scenario.key.clone(),
                            iteration,
                            node: other.to_string(),
                        });
                    }
                }
            }
            if !members.is_empty() {
                members.sort_unstable();
                groups.push(Group {
                    node: node.clone(),
                    members,
                });
            }
        }
        Ok(groups)
    }
}

/// Rate and delay of the synthetic edge feeding the first profile.
fn root_edge_attr(first: &ComponentProfile, links: &[ScenarioLink]) -> EdgeAttr {
    links
        .iter()
        .find(|l| l.from == first.name)
        .or_else(|| links.first())
        .map(|l| EdgeAttr {
            rate: l.invocation_rate,
            data: l.data_delay_ms,
        })
        .unwrap_or(EdgeAttr {
            rate: DEFAULT_ARRIVAL_RATE,
            data: 0,
        })
}

/// Replica estimate per profile, aligned with `scenario.profiles`.
///
/// Profiles the solver left out of every group keep their current count.
fn estimate_replicas(scenario: &LayoutScenario, groups: &[Group]) -> Vec<u32> {
    let mut replicas: Vec<u32> = scenario
        .profiles
        .iter()
        .map(|p| p.required_replicas.max(1))
        .collect();

    for group in groups {
        let names: Vec<&str> = group
            .members
            .iter()
            .map(|&i| scenario.profiles[i].name.as_str())
            .collect();
        let total_runtime: u64 = group
            .members
            .iter()
            .map(|&i| u64::from(scenario.profiles[i].runtime_ms))
            .sum();
        let rate = group_arrival_rate(&names, &scenario.links);
        let needed = required_replicas(total_runtime, scenario.target_concurrency, rate);
        for &i in &group.members {
            replicas[i] = needed;
        }
    }
    replicas
}

fn materialize(scenario: &LayoutScenario, groups: &[Group], replicas: &[u32]) -> Layout {
    let mut layout = Layout::new();
    for group in groups {
        let profiles: Vec<ComponentProfile> = group
            .members
            .iter()
            .map(|&i| ComponentProfile {
                required_replicas: replicas[i],
                ..scenario.profiles[i].clone()
            })
            .collect();
        let total_effective_memory = profiles
            .iter()
            .map(|p| {
                p.effective_memory(
                    scenario.invocation_shared_memory_ratio,
                    scenario.target_concurrency,
                )
            })
            .sum();
        let required_replicas = profiles
            .iter()
            .map(|p| p.required_replicas)
            .max()
            .unwrap_or(1);

        layout.insert(
            group.node.clone(),
            CompositionInfo {
                component_profiles: profiles,
                required_replicas,
                total_effective_memory,
                total_mcpu: scenario.component_mcpu_allocation * scenario.target_concurrency,
                target_concurrency: scenario.target_concurrency,
            },
        );
    }
    layout
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::error::SolverError;
    use crate::solver::SolverResponse;

    /// Replays `responses` in order, repeating the last one.
    struct ScriptedSolver {
        responses: Vec<SolverResponse>,
        calls: AtomicU32,
        last_request: Mutex<Option<SolverRequest>>,
    }

    impl ScriptedSolver {
        fn new(responses: Vec<SolverResponse>) -> Arc<Self> {
            Arc::new(Self {
                responses,
                calls: AtomicU32::new(0),
                last_request: Mutex::new(None),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl PlacementSolver for ScriptedSolver {
        fn solve(&self, request: &SolverRequest) -> Result<SolverResponse, SolverError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            *self.last_request.lock().unwrap() = Some(request.clone());
            Ok(self.responses[n.min(self.responses.len() - 1)].clone())
        }
    }

    /// Returns a fresh cost on every call so the key never repeats.
    struct DriftingSolver {
        calls: AtomicU32,
    }

    impl PlacementSolver for DriftingSolver {
        fn solve(&self, _request: &SolverRequest) -> Result<SolverResponse, SolverError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(response(vec![vec![1, 2]], f64::from(n) * 10.0, 100.0))
        }
    }

    struct BrokenSolver;

    impl PlacementSolver for BrokenSolver {
        fn solve(&self, _request: &SolverRequest) -> Result<SolverResponse, SolverError> {
            Err(SolverError::Unavailable("connection refused".to_string()))
        }
    }

    fn response(groups: Vec<Vec<usize>>, opt_cost: f64, latency: f64) -> SolverResponse {
        SolverResponse {
            layout: groups
                .into_iter()
                .map(|g| g.into_iter().map(SolverNodeId::Profile).collect())
                .collect(),
            opt_cost,
            latency,
        }
    }

    fn profile(name: &str, runtime_ms: u32, memory_mb: u32) -> ComponentProfile {
        ComponentProfile {
            name: name.to_string(),
            runtime_ms,
            memory_mb,
            required_replicas: 1,
        }
    }

    /// `a` (100ms, 128MB) calls `b` (500ms, 64MB) at `rate` req/s.
    fn scenario(rate: f64) -> LayoutScenario {
        LayoutScenario {
            key: "min_rate".to_string(),
            profiles: vec![profile("a", 100, 128), profile("b", 500, 64)],
            links: vec![ScenarioLink {
                from: "a".to_string(),
                to: "b".to_string(),
                invocation_rate: rate,
                data_delay_ms: 3,
            }],
            latency_requirement_ms: 1000,
            available_node_memory_mb: 4096,
            target_concurrency: 1,
            invocation_shared_memory_ratio: 0.5,
            component_mcpu_allocation: 500,
        }
    }

    fn calculator(solver: Arc<dyn PlacementSolver>) -> LayoutCalculator {
        LayoutCalculator::new(
            solver,
            CalculatorConfig {
                platform_nodes: vec!["node-a".to_string(), "node-b".to_string()],
                platform_delay_ms: 5,
                max_iterations: 10,
            },
        )
    }

    #[test]
    fn split_layout_sizes_callee_by_rate() {
        for (rate, expected_b) in [(5.0, 3), (20.0, 10)] {
            let solver = ScriptedSolver::new(vec![response(vec![vec![1], vec![2]], 42.0, 300.0)]);
            let layout = calculator(solver.clone())
                .calculate_layout(&scenario(rate))
                .unwrap();

            assert_eq!(solver.calls(), 2);
            assert_eq!(layout.len(), 2);
            let a = &layout["node-a"];
            let b = &layout["node-b"];
            assert_eq!(a.component_names(), vec!["a"]);
            assert_eq!(a.required_replicas, 1);
            assert_eq!(b.component_names(), vec!["b"]);
            assert_eq!(b.required_replicas, expected_b);
            assert_eq!(b.component_profiles[0].required_replicas, expected_b);
        }
    }

    #[test]
    fn composition_info_totals() {
        let solver = ScriptedSolver::new(vec![response(vec![vec![1, 2]], 1.0, 300.0)]);
        let mut input = scenario(5.0);
        input.target_concurrency = 2;
        let layout = calculator(solver).calculate_layout(&input).unwrap();

        let info = &layout["node-a"];
        // 128*(0.5+0.5*2) + 64*(0.5+0.5*2)
        assert_eq!(info.total_effective_memory, 192 + 96);
        assert_eq!(info.total_mcpu, 1000);
        assert_eq!(info.target_concurrency, 2);
        // Root group without external callers: default rate, one replica.
        assert_eq!(info.required_replicas, 1);
    }

    #[test]
    fn request_carries_root_edge_and_params() {
        let solver = ScriptedSolver::new(vec![response(vec![vec![1], vec![2]], 0.0, 10.0)]);
        calculator(solver.clone())
            .calculate_layout(&scenario(5.0))
            .unwrap();

        let request = solver.last_request.lock().unwrap().clone().unwrap();
        assert_eq!(request.params.root, 1);
        assert_eq!(request.params.memory, 4096);
        assert_eq!(request.params.latency, 1000);
        assert_eq!(request.params.cp_end, 2);
        assert_eq!(request.params.delay, 5);

        assert_eq!(request.nodes[0].id, SolverNodeId::root());
        assert_eq!(request.nodes[1].id, SolverNodeId::Profile(1));
        assert_eq!(request.nodes[1].mem, 128);
        assert_eq!(request.nodes[2].runtime, 500);

        assert_eq!(request.edges.len(), 2);
        assert_eq!(request.edges[0].from, SolverNodeId::root());
        assert_eq!(request.edges[0].to, SolverNodeId::Profile(1));
        assert_eq!(request.edges[0].attr, EdgeAttr { rate: 5.0, data: 3 });
        assert_eq!(request.edges[1].from, SolverNodeId::Profile(1));
        assert_eq!(request.edges[1].to, SolverNodeId::Profile(2));
    }

    #[test]
    fn root_edge_defaults_without_links() {
        let solver = ScriptedSolver::new(vec![response(vec![vec![1]], 0.0, 10.0)]);
        let mut input = scenario(5.0);
        input.profiles.truncate(1);
        input.links.clear();
        calculator(solver.clone()).calculate_layout(&input).unwrap();

        let request = solver.last_request.lock().unwrap().clone().unwrap();
        assert_eq!(request.edges.len(), 1);
        assert_eq!(request.edges[0].attr, EdgeAttr { rate: 1.0, data: 0 });
    }

    #[test]
    fn converged_layout_uses_fresh_replicas() {
        // First a split grouping inflates b to 3 replicas; the solver then
        // settles on a single group where nothing arrives from outside.
        let solver = ScriptedSolver::new(vec![
            response(vec![vec![1], vec![2]], 5.0, 300.0),
            response(vec![vec![1, 2]], 3.0, 300.0),
        ]);
        let layout = calculator(solver.clone())
            .calculate_layout(&scenario(5.0))
            .unwrap();

        assert_eq!(solver.calls(), 3);
        assert_eq!(layout.len(), 1);
        let info = &layout["node-a"];
        assert_eq!(info.component_names(), vec!["a", "b"]);
        assert_eq!(info.required_replicas, 1);
    }

    #[test]
    fn never_stabilizing_solver_fails_after_budget() {
        let solver = Arc::new(DriftingSolver {
            calls: AtomicU32::new(0),
        });
        let err = calculator(solver.clone())
            .calculate_layout(&scenario(5.0))
            .unwrap_err();

        assert!(matches!(
            err,
            LayoutError::NoConvergence { iterations: 10, .. }
        ));
        assert_eq!(solver.calls.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn negative_latency_is_infeasible() {
        let solver = ScriptedSolver::new(vec![response(vec![], -1.0, -1.0)]);
        let err = calculator(solver.clone())
            .calculate_layout(&scenario(5.0))
            .unwrap_err();

        assert!(matches!(
            err,
            LayoutError::Infeasible {
                latency_ms: 1000,
                ..
            }
        ));
        assert_eq!(solver.calls(), 1);
    }

    #[test]
    fn more_groups_than_nodes_is_rejected() {
        let solver = ScriptedSolver::new(vec![response(vec![vec![1], vec![2], vec![]], 0.0, 10.0)]);
        let err = calculator(solver)
            .calculate_layout(&scenario(5.0))
            .unwrap_err();

        assert!(matches!(
            err,
            LayoutError::InsufficientCapacity {
                groups: 3,
                nodes: 2,
                ..
            }
        ));
    }

    #[test]
    fn unknown_profile_id_is_rejected() {
        let solver = ScriptedSolver::new(vec![response(vec![vec![1, 7]], 0.0, 10.0)]);
        let err = calculator(solver)
            .calculate_layout(&scenario(5.0))
            .unwrap_err();

        match err {
            LayoutError::UnknownNode {
                node, iteration, ..
            } => {
                assert_eq!(node, "7");
                assert_eq!(iteration, 0);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn root_label_in_group_is_ignored() {
        let solver = ScriptedSolver::new(vec![SolverResponse {
            layout: vec![vec![
                SolverNodeId::root(),
                SolverNodeId::Profile(1),
                SolverNodeId::Profile(2),
            ]],
            opt_cost: 0.0,
            latency: 10.0,
        }]);
        let layout = calculator(solver)
            .calculate_layout(&scenario(5.0))
            .unwrap();
        assert_eq!(layout["node-a"].component_names(), vec!["a", "b"]);
    }

    #[test]
    fn solver_errors_carry_context() {
        let err = calculator(Arc::new(BrokenSolver))
            .calculate_layout(&scenario(5.0))
            .unwrap_err();

        let message = err.to_string();
        assert!(message.contains("min_rate"), "{message}");
        assert!(message.contains("iteration 0"), "{message}");
        assert!(message.contains("connection refused"), "{message}");
    }

    #[test]
    fn empty_scenario_is_rejected() {
        let mut input = scenario(5.0);
        input.profiles.clear();
        let solver = ScriptedSolver::new(vec![response(vec![], 0.0, 0.0)]);
        let err = calculator(solver.clone()).calculate_layout(&input).unwrap_err();

        assert!(matches!(err, LayoutError::EmptyScenario { .. }));
        assert_eq!(solver.calls(), 0);
    }

    #[test]
    fn layouts_respect_replica_and_node_bounds() {
        let groupings = [
            vec![vec![1, 2]],
            vec![vec![1], vec![2]],
            vec![vec![2], vec![1]],
        ];
        for rate in [0.0, 0.5, 5.0, 250.0] {
            for grouping in &groupings {
                let solver = ScriptedSolver::new(vec![response(grouping.clone(), 1.0, 10.0)]);
                let layout = calculator(solver)
                    .calculate_layout(&scenario(rate))
                    .unwrap();

                assert!(layout.len() <= 2);
                for info in layout.values() {
                    assert!(info.required_replicas >= 1);
                    assert!(info.component_profiles.iter().all(|p| p.required_replicas >= 1));
                }
            }
        }
    }
}
