pub mod config;
pub mod types;

pub use config::{
    ConfigError, ControllerConfig, DeployConfig, LayoutConfig, LsfConfig, MetricKind,
    PlatformConfig, SchedulerConfig, SolverConfig,
};
pub use types::*;
