//! Controller error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("tick interval must be greater than zero")]
    ZeroInterval,

    #[error("function app not found: {0}")]
    AppNotFound(String),

    #[error("layout planning failed for app {app_id}: {source}")]
    Layout {
        app_id: String,
        #[source]
        source: lsf_layout::LayoutError,
    },

    #[error("layout planning for app {app_id} did not finish: {reason}")]
    Planner { app_id: String, reason: String },

    #[error(transparent)]
    Composer(#[from] lsf_composer::ComposerError),
}

pub type ControllerResult<T> = Result<T, ControllerError>;
