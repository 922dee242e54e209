//! Placement solver contract.
//!
//! The solver partitions the call graph into groups that fit a node's
//! memory while meeting the latency budget. It is consumed as a black box:
//! one synchronous request/response per convergence iteration.
//!
//! ```text
//! request:  {params: {root, M, L, cp_end, delay}, nodes: [{id, mem, runtime}],
//!            edges: [{from, to, attr: {rate, data}}]}
//! response: {layout: [[id, ...], ...], opt_cost, latency}   latency < 0 → infeasible
//! ```

use std::fmt;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::SolverError;

/// Id of the synthetic root node that feeds the first component.
pub const ROOT_NODE: &str = "P";

/// Node id on the wire: profiles are numbered from 1, the root is `"P"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SolverNodeId {
    Profile(usize),
    Label(String),
}

impl SolverNodeId {
    pub fn root() -> Self {
        SolverNodeId::Label(ROOT_NODE.to_string())
    }
}

impl fmt::Display for SolverNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SolverNodeId::Profile(id) => write!(f, "{id}"),
            SolverNodeId::Label(label) => f.write_str(label),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverParams {
    /// Id of the first real node.
    pub root: usize,
    /// Memory available per group (MB).
    #[serde(rename = "M")]
    pub memory: u64,
    /// Latency budget (ms).
    #[serde(rename = "L")]
    pub latency: u32,
    /// Number of component nodes.
    pub cp_end: usize,
    /// Delay for every call that crosses groups (ms).
    pub delay: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverNode {
    pub id: SolverNodeId,
    pub mem: u64,
    pub runtime: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeAttr {
    pub rate: f64,
    pub data: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverEdge {
    pub from: SolverNodeId,
    pub to: SolverNodeId,
    pub attr: EdgeAttr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverRequest {
    pub params: SolverParams,
    pub nodes: Vec<SolverNode>,
    pub edges: Vec<SolverEdge>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverResponse {
    /// One entry per group, each listing the node ids it contains.
    pub layout: Vec<Vec<SolverNodeId>>,
    pub opt_cost: f64,
    /// End-to-end latency of the layout; negative when infeasible.
    pub latency: f64,
}

/// A synchronous placement solver.
pub trait PlacementSolver: Send + Sync {
    fn solve(&self, request: &SolverRequest) -> Result<SolverResponse, SolverError>;
}

/// How often a solver run with a deadline is polled for exit.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Runs the solver as a child process speaking JSON over stdin/stdout.
#[derive(Debug, Clone)]
pub struct ProcessSolver {
    command: String,
    script: Option<PathBuf>,
    timeout: Option<Duration>,
}

impl ProcessSolver {
    pub fn new(command: impl Into<String>, script: Option<PathBuf>) -> Self {
        Self {
            command: command.into(),
            script,
            timeout: None,
        }
    }

    /// Kill runs that take longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Wait for the child, killing it once the deadline passes. The child
    /// is always reaped.
    fn wait(&self, child: &mut Child) -> Result<ExitStatus, SolverError> {
        let Some(limit) = self.timeout else {
            return Ok(child.wait()?);
        };
        let deadline = Instant::now() + limit;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) if Instant::now() < deadline => thread::sleep(POLL_INTERVAL),
                Ok(None) => {
                    kill(child);
                    return Err(SolverError::Timeout {
                        command: self.command.clone(),
                        after: limit,
                    });
                }
                Err(e) => {
                    kill(child);
                    return Err(e.into());
                }
            }
        }
    }
}

fn kill(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn drain(pipe: Option<impl Read>) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buf)?;
    }
    Ok(buf)
}

fn joined<T>(handle: thread::ScopedJoinHandle<'_, io::Result<T>>) -> io::Result<T> {
    handle
        .join()
        .unwrap_or_else(|_| Err(io::Error::other("solver pipe thread panicked")))
}

impl PlacementSolver for ProcessSolver {
    fn solve(&self, request: &SolverRequest) -> Result<SolverResponse, SolverError> {
        let input = serde_json::to_vec(request).map_err(SolverError::Encode)?;

        let mut cmd = Command::new(&self.command);
        if let Some(script) = &self.script {
            cmd.arg(script);
        }
        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| SolverError::Spawn {
                command: self.command.clone(),
                source,
            })?;

        // Pipes are pumped on their own threads so a solver that stops
        // reading or fills its output can still be timed out and reaped.
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (written, status, stdout, stderr) = thread::scope(|scope| {
            let writer = scope.spawn(|| match stdin {
                // stdin is closed on drop
                Some(mut stdin) => stdin.write_all(&input),
                None => Ok(()),
            });
            let out = scope.spawn(move || drain(stdout));
            let err = scope.spawn(move || drain(stderr));
            let status = self.wait(&mut child);
            (joined(writer), status, joined(out), joined(err))
        });

        let status = status?;
        if !status.success() {
            return Err(SolverError::Exit {
                status: status.to_string(),
                stderr: String::from_utf8_lossy(&stderr.unwrap_or_default())
                    .trim()
                    .to_string(),
            });
        }
        written?;
        let stdout = stdout?;

        debug!(bytes = stdout.len(), "solver responded");
        serde_json::from_slice(&stdout).map_err(|source| SolverError::Decode {
            source,
            stdout: String::from_utf8_lossy(&stdout).trim().to_string(),
        })
    }
}
