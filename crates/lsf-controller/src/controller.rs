//! Latency controller.
//!
//! ```text
//! tick ──▶ Telemetry ──▶ runtime per app
//!            ├── runtime > limit                    ──▶ upgrade
//!            ├── runtime < limit * downgrade_factor
//!            │     for min_consecutive_downgrade ticks ──▶ downgrade
//!            └── no runtime reported                ──▶ downgrade
//!
//! upgrade   ──▶ ScenarioBuilder::generate_layout_candidates
//!                 └── Composer::apply_layout_with(next key)     ──▶ build → deploy
//! downgrade ──▶ Composer::apply_layout_with(previous key, stored candidates)
//! ```
//!
//! A tick only decides. Layout changes run in their own tasks, so a slow
//! solver or a failing app never delays the next tick or another app. An
//! app with a change in flight is left alone until it lands.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use lsf_composer::{AppliedLayout, Composer, PipelineHandle};
use lsf_core::{
    AppId, CompositionSpec, FunctionApp, FunctionAppSpec, LsfConfig, MetricKind, RateStrategy,
};
use lsf_layout::{LayoutCandidates, ScenarioBuilder};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::{ControllerError, ControllerResult};
use crate::telemetry::Telemetry;

#[derive(Debug, Clone)]
pub struct LatencyControllerConfig {
    pub tick_interval: Duration,
    pub metric: MetricKind,
    /// Minimum time between two layout changes of one app.
    pub cooldown: Duration,
    pub available_node_memory_mb: u64,
    pub downgrade_factor: f64,
    pub min_consecutive_downgrade: u32,
}

impl LatencyControllerConfig {
    pub fn from_config(config: &LsfConfig) -> Self {
        Self {
            tick_interval: Duration::from_secs(config.controller.tick_interval_secs),
            metric: config.controller.metric,
            cooldown: Duration::from_secs(config.controller.cooldown_secs),
            available_node_memory_mb: config.platform.available_node_memory_mb(),
            downgrade_factor: config.controller.downgrade_factor,
            min_consecutive_downgrade: config.controller.min_consecutive_downgrade,
        }
    }
}

/// Direction of a layout change along the strategy path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remediation {
    Upgrade,
    Downgrade,
}

impl fmt::Display for Remediation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Remediation::Upgrade => f.write_str("upgrade"),
            Remediation::Downgrade => f.write_str("downgrade"),
        }
    }
}

/// Per-app controller bookkeeping.
#[derive(Debug, Default)]
struct AppControl {
    last_change: Option<Instant>,
    /// Consecutive ticks below the downgrade threshold.
    low_ticks: u32,
    in_flight: bool,
}

type ControlMap = Arc<Mutex<HashMap<AppId, AppControl>>>;

fn lock(
    control: &Mutex<HashMap<AppId, AppControl>>,
) -> MutexGuard<'_, HashMap<AppId, AppControl>> {
    match control.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub struct LatencyController {
    composer: Arc<Composer>,
    builder: Arc<ScenarioBuilder>,
    telemetry: Arc<dyn Telemetry>,
    config: LatencyControllerConfig,
    control: ControlMap,
    remediations: tokio::sync::Mutex<JoinSet<()>>,
}

impl LatencyController {
    pub fn new(
        composer: Arc<Composer>,
        builder: Arc<ScenarioBuilder>,
        telemetry: Arc<dyn Telemetry>,
        config: LatencyControllerConfig,
    ) -> Self {
        Self {
            composer,
            builder,
            telemetry,
            config,
            control: Arc::new(Mutex::new(HashMap::new())),
            remediations: tokio::sync::Mutex::new(JoinSet::new()),
        }
    }

    pub fn config(&self) -> &LatencyControllerConfig {
        &self.config
    }

    /// Register an app and roll out its first layout.
    ///
    /// Candidates are planned for every strategy; the first strategy's
    /// layout becomes active and is deployed. The groups of the other
    /// candidates are registered too, so their builds are ready before a
    /// remediation needs them.
    pub async fn register_function_app(
        &self,
        spec: FunctionAppSpec,
    ) -> ControllerResult<(FunctionApp, Vec<PipelineHandle>)> {
        let app = self.composer.create_function_app(spec).await?;
        let candidates = self.plan(&app).await?;
        let active_key = next_layout_key(self.builder.strategies(), None);

        let mut pipelines = self
            .composer
            .apply_layout(&app.id, candidates.clone(), &active_key)
            .await?;
        for (key, layout) in candidates.iter().filter(|(key, _)| **key != active_key) {
            for info in layout.values() {
                let spec = CompositionSpec {
                    components: info.component_names(),
                    node: None,
                };
                if let Some(handle) = self.composer.add_function_composition(&app.id, spec).await? {
                    debug!(app_id = %app.id, candidate = %key, "standby composition added");
                    pipelines.push(handle);
                }
            }
        }

        let app = self
            .composer
            .get_function_app(&app.id)
            .await
            .ok_or_else(|| ControllerError::AppNotFound(app.id.clone()))?;
        info!(
            app_id = %app.id,
            active_key = %active_key,
            candidates = candidates.len(),
            pipelines = pipelines.len(),
            "function app registered"
        );
        Ok((app, pipelines))
    }

    /// Tick until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> ControllerResult<()> {
        let period = self.config.tick_interval;
        if period.is_zero() {
            return Err(ControllerError::ZeroInterval);
        }
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval = ?period, metric = ?self.config.metric, "latency controller started");
        let mut stop = shutdown.clone();
        loop {
            tokio::select! {
                biased;
                _ = stopped(&mut shutdown) => break,
                _ = ticker.tick() => {
                    tokio::select! {
                        biased;
                        _ = stopped(&mut stop) => break,
                        _ = self.evaluate_tick() => {}
                    }
                }
            }
        }
        info!("latency controller stopped");
        Ok(())
    }

    /// One control step. Returns the apps a layout change was started for.
    pub async fn evaluate_tick(&self) -> Vec<AppId> {
        self.reap_finished().await;

        let apps: HashMap<AppId, FunctionApp> = self
            .composer
            .list_function_apps()
            .await
            .into_iter()
            .map(|app| (app.id.clone(), app))
            .collect();
        lock(&self.control).retain(|app_id, _| apps.contains_key(app_id));

        let Some(readings) = self.read_runtimes(&apps).await else {
            return Vec::new();
        };
        for app_id in readings.keys().filter(|id| !apps.contains_key(*id)) {
            debug!(%app_id, "runtime reported for unknown app, skipping");
        }

        let mut ordered: Vec<&FunctionApp> = apps.values().collect();
        ordered.sort_by(|a, b| a.id.cmp(&b.id));

        let mut triggered = Vec::new();
        for app in ordered {
            if app.latency_limit_ms == 0 {
                continue;
            }
            let Some(action) = self.decide(app, readings.get(&app.id).copied()) else {
                continue;
            };
            if !self.claim(&app.id, action) {
                continue;
            }
            self.spawn_remediation(app.clone(), action).await;
            triggered.push(app.id.clone());
        }
        triggered
    }

    /// Wait for every in-flight layout change.
    pub async fn wait_remediations(&self) {
        let mut tasks = self.remediations.lock().await;
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "remediation task aborted");
            }
        }
    }

    /// What, if anything, `app` needs given its latest runtime.
    fn decide(&self, app: &FunctionApp, runtime_ms: Option<f64>) -> Option<Remediation> {
        let limit = f64::from(app.latency_limit_ms);
        let mut control = lock(&self.control);
        let entry = control.entry(app.id.clone()).or_default();
        match runtime_ms {
            Some(runtime_ms) if runtime_ms > limit => {
                entry.low_ticks = 0;
                warn!(app_id = %app.id, runtime_ms, limit_ms = app.latency_limit_ms, "latency limit exceeded");
                Some(Remediation::Upgrade)
            }
            Some(runtime_ms) if runtime_ms < limit * self.config.downgrade_factor => {
                entry.low_ticks = entry.low_ticks.saturating_add(1);
                if entry.low_ticks < self.config.min_consecutive_downgrade {
                    return None;
                }
                if !self.can_downgrade(app) {
                    return None;
                }
                debug!(app_id = %app.id, runtime_ms, low_ticks = entry.low_ticks, "runtime well under limit");
                Some(Remediation::Downgrade)
            }
            Some(_) => {
                entry.low_ticks = 0;
                None
            }
            // only a batch query can tell an idle app from a failed query
            None if self.config.metric == MetricKind::P95 => {
                entry.low_ticks = 0;
                if !self.can_downgrade(app) {
                    return None;
                }
                debug!(app_id = %app.id, "no runtime reported");
                Some(Remediation::Downgrade)
            }
            None => None,
        }
    }

    /// True if `app` has a strategy below its active one.
    fn can_downgrade(&self, app: &FunctionApp) -> bool {
        previous_layout_key(self.builder.strategies(), app.active_layout_key.as_deref()).is_some()
    }

    /// Mark a change of `app_id` as started. False while one is in flight
    /// or the app is cooling down.
    fn claim(&self, app_id: &str, action: Remediation) -> bool {
        let now = Instant::now();
        let mut control = lock(&self.control);
        let entry = control.entry(app_id.to_string()).or_default();
        if entry.in_flight {
            debug!(%app_id, %action, "layout change already in flight");
            return false;
        }
        if let Some(at) = entry.last_change
            && now.duration_since(at) < self.config.cooldown
        {
            debug!(%app_id, %action, "layout change during cooldown");
            return false;
        }
        entry.last_change = Some(now);
        entry.in_flight = true;
        true
    }

    async fn read_runtimes(
        &self,
        apps: &HashMap<AppId, FunctionApp>,
    ) -> Option<BTreeMap<AppId, f64>> {
        match self.config.metric {
            MetricKind::P95 => match self.telemetry.query_p95_app_runtimes().await {
                Ok(readings) => Some(readings.into_iter().collect()),
                Err(e) => {
                    let error = format!("{e:#}");
                    warn!(%error, "p95 runtime query failed");
                    None
                }
            },
            MetricKind::Avg => {
                let mut readings = BTreeMap::new();
                for app in apps.values().filter(|app| app.latency_limit_ms > 0) {
                    match self.telemetry.query_average_app_runtime(&app.id).await {
                        Ok(runtime_ms) => {
                            readings.insert(app.id.clone(), runtime_ms);
                        }
                        Err(e) => {
                            let error = format!("{e:#}");
                            warn!(app_id = %app.id, %error, "average runtime query failed");
                        }
                    }
                }
                Some(readings)
            }
        }
    }

    async fn spawn_remediation(&self, app: FunctionApp, action: Remediation) {
        let composer = Arc::clone(&self.composer);
        let builder = Arc::clone(&self.builder);
        let control = Arc::clone(&self.control);
        let memory_mb = self.config.available_node_memory_mb;
        self.remediations.lock().await.spawn(async move {
            let app_id = app.id.clone();
            let result = match action {
                Remediation::Upgrade => upgrade(&composer, builder, app, memory_mb).await,
                Remediation::Downgrade => downgrade(&composer, builder.strategies(), app).await,
            };
            if let Some(entry) = lock(&control).get_mut(&app_id) {
                entry.in_flight = false;
            }
            match result {
                Ok(Some(applied)) => info!(
                    %app_id,
                    %action,
                    active_key = %applied.active_key,
                    previous_key = applied.previous_key.as_deref().unwrap_or("-"),
                    pipelines = applied.pipelines.len(),
                    "layout change applied"
                ),
                Ok(None) => debug!(%app_id, %action, "no layout to move to"),
                Err(e) => error!(%app_id, %action, error = %e, "layout change failed"),
            }
        });
    }

    async fn reap_finished(&self) {
        let mut tasks = self.remediations.lock().await;
        while let Some(joined) = tasks.try_join_next() {
            if let Err(e) = joined {
                error!(error = %e, "remediation task aborted");
            }
        }
    }

    async fn plan(&self, app: &FunctionApp) -> ControllerResult<LayoutCandidates> {
        plan_candidates(
            Arc::clone(&self.builder),
            app.clone(),
            self.config.available_node_memory_mb,
        )
        .await
    }
}

/// Resolves once the flag is set or its sender is gone.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Re-plan and step up from whatever key is active when the plan lands.
async fn upgrade(
    composer: &Composer,
    builder: Arc<ScenarioBuilder>,
    app: FunctionApp,
    memory_mb: u64,
) -> ControllerResult<Option<AppliedLayout>> {
    let app_id = app.id.clone();
    let strategies = builder.strategies().to_vec();
    let candidates = plan_candidates(builder, app, memory_mb).await?;
    let applied = composer
        .apply_layout_with(&app_id, candidates, |current| {
            Some(next_layout_key(&strategies, current))
        })
        .await?;
    Ok(applied)
}

/// Step down using the candidates already on record.
async fn downgrade(
    composer: &Composer,
    strategies: &[RateStrategy],
    app: FunctionApp,
) -> ControllerResult<Option<AppliedLayout>> {
    let applied = composer
        .apply_layout_with(&app.id, app.layout_candidates, |current| {
            previous_layout_key(strategies, current)
        })
        .await?;
    Ok(applied)
}

/// Solver calls block, so planning runs on the blocking pool.
async fn plan_candidates(
    builder: Arc<ScenarioBuilder>,
    app: FunctionApp,
    memory_mb: u64,
) -> ControllerResult<LayoutCandidates> {
    let app_id = app.id.clone();
    let planned = tokio::task::spawn_blocking(move || {
        builder.generate_layout_candidates(
            &app.components,
            &app.links,
            app.latency_limit_ms,
            memory_mb,
        )
    })
    .await
    .map_err(|e| ControllerError::Planner {
        app_id: app_id.clone(),
        reason: e.to_string(),
    })?;
    planned.map_err(|source| ControllerError::Layout { app_id, source })
}

/// The layout key after `current` on the upgrade path. Without a current
/// key this is the first strategy; at the end of the path it stays put.
pub fn next_layout_key(strategies: &[RateStrategy], current: Option<&str>) -> String {
    let position = current.and_then(|key| strategies.iter().position(|s| s.key() == key));
    let next = match position {
        Some(i) => strategies.get(i + 1).or_else(|| strategies.get(i)),
        None => strategies.first(),
    };
    next.copied().unwrap_or(RateStrategy::Min).key().to_string()
}

/// The layout key before `current` on the upgrade path, if there is one.
pub fn previous_layout_key(strategies: &[RateStrategy], current: Option<&str>) -> Option<String> {
    let position = strategies.iter().position(|s| Some(s.key()) == current)?;
    let previous = strategies.get(position.checked_sub(1)?)?;
    Some(previous.key().to_string())
}
