//! Build/deploy collaborator.

use std::future::Future;
use std::pin::Pin;

use lsf_core::FunctionComposition;

/// Boxed future returned by [`FunctionBackend`] operations.
pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send + 'a>>;

/// Turns a composition into a running artifact.
///
/// Implementations are injected into the `Composer`; tests use mocks.
pub trait FunctionBackend: Send + Sync {
    /// Build the composition's artifact. The returned composition carries
    /// the resulting `build` record.
    fn build<'a>(&'a self, composition: &'a FunctionComposition)
    -> BackendFuture<'a, FunctionComposition>;

    /// Roll the built composition out to its deployments.
    fn deploy<'a>(&'a self, composition: &'a FunctionComposition) -> BackendFuture<'a, ()>;
}
