//! lsf.toml configuration parser.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::RateStrategy;

/// Errors reported by [`LsfConfig::validate`].
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("platform.nodes must list at least one node")]
    NoPlatformNodes,

    #[error("layout.strategies must not be empty")]
    NoStrategies,

    #[error("layout.{0} must be greater than zero")]
    ZeroLayoutValue(&'static str),

    #[error("layout.invocation_shared_memory_ratio must be within [0, 1], got {0}")]
    SharedMemoryRatio(f64),

    #[error("scheduler.{0} must be greater than zero")]
    ZeroSchedulerValue(&'static str),

    #[error("controller.tick_interval_secs must be greater than zero")]
    ZeroTickInterval,

    #[error("controller.downgrade_factor must be within [0, 1), got {0}")]
    DowngradeFactor(f64),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LsfConfig {
    pub platform: PlatformConfig,
    pub layout: LayoutConfig,
    pub solver: SolverConfig,
    pub scheduler: SchedulerConfig,
    pub controller: ControllerConfig,
    pub deploy: DeployConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    /// Node ids, in the order solver groups are assigned to them.
    pub nodes: Vec<String>,
    /// Delay added for every call that crosses nodes, in milliseconds.
    pub delay_ms: u32,
    /// Memory available on each node, in GB.
    pub available_node_memory_gb: u32,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            delay_ms: 0,
            available_node_memory_gb: 4,
        }
    }
}

impl PlatformConfig {
    pub fn available_node_memory_mb(&self) -> u64 {
        u64::from(self.available_node_memory_gb) * 1024
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    pub max_iterations: u32,
    pub target_concurrency: u32,
    pub component_mcpu_allocation: u32,
    /// Fraction of component memory shared between concurrent invocations.
    pub invocation_shared_memory_ratio: f64,
    /// Candidate strategies; the order is also the upgrade path.
    pub strategies: Vec<RateStrategy>,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            target_concurrency: 2,
            component_mcpu_allocation: 500,
            invocation_shared_memory_ratio: 0.5,
            strategies: vec![RateStrategy::Min, RateStrategy::Max],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    /// Interpreter or binary that runs the solver.
    pub command: String,
    /// Script passed as the first argument to `command`.
    pub script: Option<PathBuf>,
    /// Kill a solver run after this many seconds; 0 waits forever.
    pub timeout_secs: u64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            command: "python3".to_string(),
            script: None,
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub workers: usize,
    pub queue_size: usize,
    pub max_retries: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 100,
            queue_size: 200,
            max_retries: 0,
        }
    }
}

/// Which aggregate of app runtime the latency controller compares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    #[default]
    P95,
    Avg,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub tick_interval_secs: u64,
    pub metric: MetricKind,
    /// Minimum time between two layout changes of one app; 0 disables it.
    pub cooldown_secs: u64,
    /// Runtimes below `limit * downgrade_factor` count towards a downgrade.
    /// 0 only downgrades apps that report no runtime.
    pub downgrade_factor: f64,
    /// Consecutive low ticks before an app steps down its upgrade path.
    pub min_consecutive_downgrade: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 1,
            metric: MetricKind::P95,
            cooldown_secs: 0,
            downgrade_factor: 0.5,
            min_consecutive_downgrade: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployConfig {
    pub namespace: String,
    pub image_registry: String,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            namespace: "application".to_string(),
            image_registry: "localhost:5000".to_string(),
        }
    }
}

impl LsfConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: LsfConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.platform.nodes.is_empty() {
            return Err(ConfigError::NoPlatformNodes);
        }
        if self.layout.strategies.is_empty() {
            return Err(ConfigError::NoStrategies);
        }
        if self.layout.max_iterations == 0 {
            return Err(ConfigError::ZeroLayoutValue("max_iterations"));
        }
        if self.layout.target_concurrency == 0 {
            return Err(ConfigError::ZeroLayoutValue("target_concurrency"));
        }
        let ratio = self.layout.invocation_shared_memory_ratio;
        if !(0.0..=1.0).contains(&ratio) {
            return Err(ConfigError::SharedMemoryRatio(ratio));
        }
        if self.scheduler.workers == 0 {
            return Err(ConfigError::ZeroSchedulerValue("workers"));
        }
        if self.scheduler.queue_size == 0 {
            return Err(ConfigError::ZeroSchedulerValue("queue_size"));
        }
        if self.controller.tick_interval_secs == 0 {
            return Err(ConfigError::ZeroTickInterval);
        }
        let factor = self.controller.downgrade_factor;
        if !(0.0..1.0).contains(&factor) {
            return Err(ConfigError::DowngradeFactor(factor));
        }
        Ok(())
    }
}
