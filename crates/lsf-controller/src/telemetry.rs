//! Runtime telemetry collaborator.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by [`Telemetry`] queries.
pub type TelemetryFuture<'a, T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send + 'a>>;

/// Source of aggregated app runtimes, in milliseconds.
pub trait Telemetry: Send + Sync {
    /// 95th-percentile runtime of every app with recent traffic, keyed by app id.
    fn query_p95_app_runtimes(&self) -> TelemetryFuture<'_, HashMap<String, f64>>;

    /// Average runtime of one app.
    fn query_average_app_runtime<'a>(&'a self, app_id: &'a str) -> TelemetryFuture<'a, f64>;
}
