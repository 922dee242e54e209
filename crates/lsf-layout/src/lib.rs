//! lsf layout planner.
//!
//! Turns an application's call graph into layout candidates: which
//! components share a platform node and how many replicas each group
//! needs. The partitioning itself is done by an external placement
//! solver; this crate feeds it and makes its output stable.
//!
//! # Components
//!
//! - **`orderer`**: Deterministic ordering of links and components
//! - **`scenario`**: Rate-strategy scenarios and layout candidates
//! - **`calculator`**: Fixed-point loop around the solver
//! - **`sizing`**: Arrival rates and replica counts per group
//! - **`solver`**: Solver wire contract and the subprocess binding

pub mod calculator;
pub mod error;
pub mod orderer;
pub mod scenario;
pub mod sizing;
pub mod solver;

pub use calculator::{CalculatorConfig, ConvergenceKey, LayoutCalculator};
pub use error::{LayoutError, LayoutResult, SolverError};
pub use orderer::{CallEdge, CallGraphOrder, order_call_graph, order_components};
pub use scenario::{LayoutCandidates, ScenarioBuilder, ScenarioParams};
pub use sizing::{group_arrival_rate, required_replicas};
pub use solver::{
    EdgeAttr, PlacementSolver, ProcessSolver, ROOT_NODE, SolverEdge, SolverNode, SolverNodeId,
    SolverParams, SolverRequest, SolverResponse,
};
