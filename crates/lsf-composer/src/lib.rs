//! lsf-composer: function app lifecycle and the build→deploy pipeline.
//!
//! The `Composer` owns every registered `FunctionApp`. Adding a
//! composition schedules two tasks on the shared `TaskPool`: a build, and
//! only if that succeeds, a deploy. Status changes are written back to the
//! registry (and through to the state store when one is attached).
//!
//! # Components
//!
//! - **`registry`**: `AppRegistry`: shared-read / exclusive-write app map
//! - **`composer`**: `Composer`: app and composition operations, pipelines
//! - **`backend`**: `FunctionBackend`: the build/deploy collaborator

pub mod backend;
pub mod composer;
pub mod error;
pub mod registry;

pub use backend::{BackendFuture, FunctionBackend};
pub use composer::{AppliedLayout, Composer, PipelineHandle, PipelineOutcome};
pub use error::{ComposerError, ComposerResult};
pub use registry::AppRegistry;
