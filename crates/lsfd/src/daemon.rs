//! Daemon wiring.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use lsf_composer::Composer;
use lsf_controller::{LatencyController, LatencyControllerConfig, Telemetry};
use lsf_core::{FunctionAppSpec, LsfConfig};
use lsf_layout::{
    CalculatorConfig, LayoutCalculator, LayoutCandidates, PlacementSolver, ProcessSolver,
    ScenarioBuilder, ScenarioParams,
};
use lsf_scheduler::{PoolConfig, TaskPool};
use lsf_state::StateStore;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::backend::LocalBackend;
use crate::telemetry::FileTelemetry;

/// Everything `lsfd run` needs besides the parsed config.
#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub data_dir: PathBuf,
    /// App specs to register at start-up.
    pub apps: Option<PathBuf>,
    /// Runtime file; defaults to `runtimes.json` in the data directory.
    pub telemetry_file: Option<PathBuf>,
}

/// Layout planner backed by the configured solver process.
pub fn build_planner(config: &LsfConfig) -> ScenarioBuilder {
    let mut solver =
        ProcessSolver::new(config.solver.command.clone(), config.solver.script.clone());
    if config.solver.timeout_secs > 0 {
        solver = solver.with_timeout(Duration::from_secs(config.solver.timeout_secs));
    }
    planner_with_solver(config, Arc::new(solver))
}

pub fn planner_with_solver(
    config: &LsfConfig,
    solver: Arc<dyn PlacementSolver>,
) -> ScenarioBuilder {
    let calculator = LayoutCalculator::new(solver, CalculatorConfig::from_config(config));
    ScenarioBuilder::new(Arc::new(calculator), ScenarioParams::from(&config.layout))
}

/// Read app specs from a JSON file: a single object or an array.
pub fn load_app_specs(path: &Path) -> anyhow::Result<Vec<FunctionAppSpec>> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let value: serde_json::Value =
        serde_json::from_str(&content).with_context(|| format!("parse {}", path.display()))?;
    let specs = if value.is_array() {
        serde_json::from_value::<Vec<FunctionAppSpec>>(value)
    } else {
        serde_json::from_value::<FunctionAppSpec>(value).map(|spec| vec![spec])
    };
    specs.with_context(|| format!("invalid app spec in {}", path.display()))
}

/// Plan the candidates of one app without registering it.
pub fn plan_app(
    planner: &ScenarioBuilder,
    config: &LsfConfig,
    spec: &FunctionAppSpec,
) -> anyhow::Result<LayoutCandidates> {
    let candidates = planner.generate_layout_candidates(
        &spec.components,
        &spec.links,
        spec.latency_limit_ms,
        config.platform.available_node_memory_mb(),
    )?;
    Ok(candidates)
}

/// Run until `shutdown` fires.
///
/// Shutdown stops the controller first, waits for remediations already
/// under way, then closes the task pool.
pub async fn run_daemon(
    config: LsfConfig,
    options: DaemonOptions,
    shutdown: impl std::future::Future<Output = ()>,
) -> anyhow::Result<()> {
    config.validate()?;
    std::fs::create_dir_all(&options.data_dir)
        .with_context(|| format!("create {}", options.data_dir.display()))?;

    let db_path = options.data_dir.join("lsf.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let pool = Arc::new(TaskPool::new(PoolConfig::from(&config.scheduler)));

    let backend = Arc::new(LocalBackend::new(config.deploy.image_registry.clone()));
    let composer = Arc::new(
        Composer::new(backend, Arc::clone(&pool))
            .with_store(store)
            .with_namespace(config.deploy.namespace.clone()),
    );
    composer.restore().await?;

    let telemetry_path = options
        .telemetry_file
        .clone()
        .unwrap_or_else(|| options.data_dir.join("runtimes.json"));
    info!(path = %telemetry_path.display(), "reading runtimes from file");
    let telemetry: Arc<dyn Telemetry> = Arc::new(FileTelemetry::new(telemetry_path));

    let controller = Arc::new(LatencyController::new(
        Arc::clone(&composer),
        Arc::new(build_planner(&config)),
        telemetry,
        LatencyControllerConfig::from_config(&config),
    ));

    if let Some(path) = &options.apps {
        // apps restored from the store were registered by an earlier run
        let mut known: HashSet<String> = composer
            .list_function_apps()
            .await
            .into_iter()
            .map(|app| app.name)
            .collect();
        for spec in load_app_specs(path)? {
            let name = spec.name.clone();
            if !known.insert(name.clone()) {
                info!(%name, "app already registered, skipping");
                continue;
            }
            match controller.register_function_app(spec).await {
                Ok((app, pipelines)) => info!(
                    app_id = %app.id,
                    %name,
                    pipelines = pipelines.len(),
                    "app registered from file"
                ),
                Err(e) => error!(%name, error = %e, "app registration failed"),
            }
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let controller_handle = tokio::spawn({
        let controller = Arc::clone(&controller);
        async move { controller.run(shutdown_rx).await }
    });

    shutdown.await;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    match controller_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "latency controller exited with error"),
        Err(e) => warn!(error = %e, "latency controller task failed"),
    }
    controller.wait_remediations().await;
    pool.close().await;

    info!("lsf daemon stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_file_accepts_object_or_array() {
        let dir = tempfile::tempdir().unwrap();
        let single = dir.path().join("one.json");
        std::fs::write(
            &single,
            r#"{"name": "shop", "components": [{"name": "cart", "memory_mb": 128, "runtime_ms": 20}]}"#,
        )
        .unwrap();
        let specs = load_app_specs(&single).unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].latency_limit_ms, 0);

        let many = dir.path().join("many.json");
        std::fs::write(
            &many,
            r#"[{"name": "a", "components": []}, {"name": "b", "components": [], "latency_limit_ms": 150}]"#,
        )
        .unwrap();
        let specs = load_app_specs(&many).unwrap();
        assert_eq!(specs[1].latency_limit_ms, 150);
    }

    #[test]
    fn bad_app_file_names_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("apps.json");
        std::fs::write(&path, r#"{"components": 3}"#).unwrap();

        let err = load_app_specs(&path).unwrap_err();
        assert!(err.to_string().contains("apps.json"));
    }
}
