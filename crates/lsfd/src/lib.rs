//! lsfd: the lsf daemon.
//!
//! Assembles the planner, composer and latency controller around the
//! collaborators that ship with the daemon:
//! - [`backend::LocalBackend`] records image tags and logs deployments
//! - [`telemetry::FileTelemetry`] reads app runtimes from a JSON file
//! - `lsf_layout::ProcessSolver` runs the configured solver script

pub mod backend;
pub mod daemon;
pub mod telemetry;

pub use backend::LocalBackend;
pub use daemon::{
    DaemonOptions, build_planner, load_app_specs, plan_app, planner_with_solver, run_daemon,
};
pub use telemetry::FileTelemetry;
