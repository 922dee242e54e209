//! lsf-state: embedded persistence for function apps.
//!
//! Backed by [redb](https://docs.rs/redb). A `FunctionApp` is stored as a
//! single JSON document keyed by its id, so its compositions, deployments
//! and layout candidates are written and deleted together with it.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;

pub use error::{StateError, StateResult};
pub use store::StateStore;
