//! Composer error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ComposerError {
    #[error("function app not found: {0}")]
    AppNotFound(String),

    #[error("function app {app_id} has no component named {component}")]
    UnknownComponent { app_id: String, component: String },

    #[error("layout {key} is not a candidate of app {app_id}")]
    UnknownLayout { app_id: String, key: String },

    #[error("composition for app {0} lists no components")]
    EmptyComposition(String),

    #[error("invalid function app: {0}")]
    InvalidApp(String),

    #[error("state store error: {0}")]
    State(#[from] lsf_state::StateError),
}

pub type ComposerResult<T> = Result<T, ComposerError>;
