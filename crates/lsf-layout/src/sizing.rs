//! Arrival rates and replica counts for composition groups.

use lsf_core::ScenarioLink;

/// Arrival rate assumed for a group with no incoming external links.
pub const DEFAULT_ARRIVAL_RATE: f64 = 1.0;

/// Total invocation rate of links entering `group` from outside it.
///
/// Links between two members of the group are internal calls and do not
/// count. The root group has no such links and falls back to
/// [`DEFAULT_ARRIVAL_RATE`].
pub fn group_arrival_rate(group: &[&str], links: &[ScenarioLink]) -> f64 {
    let rate: f64 = links
        .iter()
        .filter(|l| group.contains(&l.to.as_str()) && !group.contains(&l.from.as_str()))
        .map(|l| l.invocation_rate)
        .sum();
    if rate > 0.0 { rate } else { DEFAULT_ARRIVAL_RATE }
}

/// Replicas needed to serve `arrival_rate` requests per second.
///
/// One replica completes `1000 / runtime` requests per second per
/// concurrent slot. Never returns less than 1.
pub fn required_replicas(total_runtime_ms: u64, target_concurrency: u32, arrival_rate: f64) -> u32 {
    if total_runtime_ms == 0 {
        return 1;
    }
    let per_replica = (1000.0 / total_runtime_ms as f64) * f64::from(target_concurrency.max(1));
    let replicas = (arrival_rate / per_replica.max(1e-6)).ceil();
    if replicas.is_finite() && replicas >= 1.0 {
        replicas.min(f64::from(u32::MAX)) as u32
    } else {
        1
    }
}
