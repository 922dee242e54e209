//! lsf-controller: closed-loop latency control.
//!
//! On every tick the controller reads aggregated app runtimes from the
//! telemetry source. An app whose runtime exceeds its latency limit is
//! re-planned and stepped up the strategy path. One that stays well under
//! its limit, or reports nothing at all, steps back down. The `Composer`
//! builds and deploys the chosen layout.
//!
//! # Components
//!
//! - **`controller`**: `LatencyController`: tick loop, remediation, registration
//! - **`telemetry`**: `Telemetry`: the runtime metrics collaborator

pub mod controller;
pub mod error;
pub mod telemetry;

pub use controller::{
    LatencyController, LatencyControllerConfig, Remediation, next_layout_key, previous_layout_key,
};
pub use error::{ControllerError, ControllerResult};
pub use telemetry::{Telemetry, TelemetryFuture};
