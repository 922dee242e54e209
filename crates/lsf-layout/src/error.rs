//! Layout planning error types.

use thiserror::Error;

pub type LayoutResult<T> = Result<T, LayoutError>;

/// Errors raised while talking to the placement solver.
#[derive(Debug, Error)]
pub enum SolverError {
    #[error("failed to start solver `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("solver i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("solver `{command}` killed after {after:?}")]
    Timeout {
        command: String,
        after: std::time::Duration,
    },

    #[error("solver exited with {status}: {stderr}")]
    Exit { status: String, stderr: String },

    #[error("failed to encode solver request: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode solver response: {source} (stdout: {stdout})")]
    Decode {
        #[source]
        source: serde_json::Error,
        stdout: String,
    },

    #[error("solver unavailable: {0}")]
    Unavailable(String),
}

/// Errors that end a planning attempt.
#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("scenario {scenario} has no component profiles")]
    EmptyScenario { scenario: String },

    #[error("solver failed for scenario {scenario} at iteration {iteration}: {source}")]
    Solver {
        scenario: String,
        iteration: u32,
        #[source]
        source: SolverError,
    },

    #[error("no valid layout within latency requirement of {latency_ms}ms (scenario {scenario})")]
    Infeasible { scenario: String, latency_ms: u32 },

    #[error(
        "insufficient capacity for scenario {scenario}: layout has {groups} groups but only {nodes} platform nodes"
    )]
    InsufficientCapacity {
        scenario: String,
        groups: usize,
        nodes: usize,
    },

    #[error("solver returned unknown node {node} for scenario {scenario} at iteration {iteration}")]
    UnknownNode {
        scenario: String,
        iteration: u32,
        node: String,
    },

    #[error("failed to converge layout for scenario {scenario} after {iterations} iterations")]
    NoConvergence { scenario: String, iterations: u32 },

    #[error("layout strategy {strategy} failed: {source}")]
    Strategy {
        strategy: String,
        #[source]
        source: Box<LayoutError>,
    },
}
