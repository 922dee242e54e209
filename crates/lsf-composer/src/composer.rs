//! Composer: function apps, compositions and their pipelines.
//!
//! ```text
//! add_function_composition
//!   └── pipeline (spawned)
//!         ├── build task  ──▶ TaskPool ──▶ FunctionBackend::build
//!         │     └── failed: composition + deployments → error, stop
//!         └── deploy task ──▶ TaskPool ──▶ FunctionBackend::deploy
//!               └── deployments → deployed | error
//!
//! apply_layout
//!   ├── one deployment per group, routed to each other, the rest retired
//!   └── pipeline per composition that needs a build or a redeploy
//! ```
//!
//! Every pipeline outcome is logged. Callers that care about it can also
//! wait on the returned [`PipelineHandle`].

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use lsf_core::{
    AppId, BuildStatus, ComponentLink, CompositionSpec, Deployment, DeploymentStatus,
    FunctionApp, FunctionAppSpec, FunctionComposition, Layout, Route, RoutingTable,
};
use lsf_scheduler::{TaskHandle, TaskPool, promise};
use lsf_state::StateStore;
use tracing::{debug, error, info, warn};

use crate::backend::FunctionBackend;
use crate::error::{ComposerError, ComposerResult};
use crate::registry::AppRegistry;

/// Final state of one composition's pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    Deployed,
    /// Built, with no deployment to roll out.
    Built,
    BuildFailed(String),
    DeployFailed(String),
    /// The task pool shut down before a stage ran.
    Interrupted,
}

pub type PipelineHandle = TaskHandle<PipelineOutcome>;

/// Result of [`Composer::apply_layout_with`].
pub struct AppliedLayout {
    pub previous_key: Option<String>,
    pub active_key: String,
    pub pipelines: Vec<PipelineHandle>,
}

enum Registration {
    Added(FunctionComposition),
    /// A deployment was added to an existing composition.
    Attached(FunctionComposition, Deployment),
    Unchanged,
}

/// Deployment route target for a callee hosted in the same composition.
const LOCAL_ROUTE: &str = "local";

pub struct Composer {
    registry: Arc<AppRegistry>,
    backend: Arc<dyn FunctionBackend>,
    pool: Arc<TaskPool>,
    namespace: String,
}

impl Composer {
    pub fn new(backend: Arc<dyn FunctionBackend>, pool: Arc<TaskPool>) -> Self {
        Self {
            registry: Arc::new(AppRegistry::new(None)),
            backend,
            pool,
            namespace: "application".to_string(),
        }
    }

    /// Persist every app change to `store`.
    pub fn with_store(mut self, store: StateStore) -> Self {
        self.registry = Arc::new(AppRegistry::new(Some(store)));
        self
    }

    /// Namespace recorded on new deployments.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Load persisted apps. Pipelines that were in flight are not resumed.
    pub async fn restore(&self) -> ComposerResult<usize> {
        let count = self.registry.restore().await?;
        info!(count, "function apps restored");
        Ok(count)
    }

    pub async fn create_function_app(&self, spec: FunctionAppSpec) -> ComposerResult<FunctionApp> {
        validate_app_spec(&spec)?;

        let now = epoch_secs();
        let app = FunctionApp {
            id: uuid::Uuid::new_v4().to_string(),
            name: spec.name,
            components: spec.components,
            links: spec.links,
            latency_limit_ms: spec.latency_limit_ms,
            compositions: Vec::new(),
            layout_candidates: BTreeMap::new(),
            active_layout_key: None,
            created_at: now,
            updated_at: now,
        };
        self.registry.insert(app.clone()).await?;

        info!(
            app_id = %app.id,
            name = %app.name,
            components = app.components.len(),
            latency_limit_ms = app.latency_limit_ms,
            "function app created"
        );
        Ok(app)
    }

    pub async fn get_function_app(&self, id: &str) -> Option<FunctionApp> {
        self.registry.get(id).await
    }

    pub async fn list_function_apps(&self) -> Vec<FunctionApp> {
        self.registry.list().await
    }

    /// Delete an app with its compositions and deployments.
    pub async fn delete_function_app(&self, id: &str) -> ComposerResult<bool> {
        let existed = self.registry.remove(id).await?;
        if existed {
            info!(app_id = %id, "function app deleted");
        } else {
            debug!(app_id = %id, "function app not found, nothing to delete");
        }
        Ok(existed)
    }

    /// Register a composition and start its build→deploy pipeline.
    ///
    /// If an equivalent composition already exists and `spec.node` names a
    /// node it is not deployed on, a deployment is attached there instead:
    /// a built composition is only deployed, a failed one is rebuilt, and
    /// one still building picks the deployment up when its build finishes.
    /// Returns `None` when no new pipeline was started.
    pub async fn add_function_composition(
        &self,
        app_id: &str,
        spec: CompositionSpec,
    ) -> ComposerResult<Option<PipelineHandle>> {
        if spec.components.is_empty() {
            return Err(ComposerError::EmptyComposition(app_id.to_string()));
        }
        let id = FunctionComposition::content_id(app_id, &spec.components);
        let namespace = self.namespace.clone();

        let registration = self
            .registry
            .update(app_id, |app| {
                if let Some(missing) = spec.components.iter().find(|c| !app.has_component(c)) {
                    return Err(ComposerError::UnknownComponent {
                        app_id: app_id.to_string(),
                        component: missing.clone(),
                    });
                }

                let routes = routing_table(&app.links, &spec.components, &active_hosts(app));
                let deployment = |node: &String, status| Deployment {
                    id: deployment_id(&id, node),
                    function_composition_id: id.clone(),
                    node: node.clone(),
                    namespace: namespace.clone(),
                    routing_table: routes.clone(),
                    status,
                };

                if let Some(existing) = app.composition_mut(&id) {
                    let Some(node) = &spec.node else {
                        return Ok(Registration::Unchanged);
                    };
                    if existing.deployments.iter().any(|d| &d.node == node) {
                        return Ok(Registration::Unchanged);
                    }
                    let status = match existing.status {
                        BuildStatus::Built => DeploymentStatus::Pending,
                        _ => DeploymentStatus::WaitingForBuild,
                    };
                    let attached = deployment(node, status);
                    existing.deployments.push(attached.clone());
                    return Ok(Registration::Attached(existing.clone(), attached));
                }

                let composition = FunctionComposition {
                    id: id.clone(),
                    function_app_id: app_id.to_string(),
                    components: spec.components.clone(),
                    status: BuildStatus::Pending,
                    build: None,
                    deployments: spec
                        .node
                        .iter()
                        .map(|node| deployment(node, DeploymentStatus::WaitingForBuild))
                        .collect(),
                };
                app.compositions.push(composition.clone());
                Ok(Registration::Added(composition))
            })
            .await??;

        let node = spec.node.as_deref().unwrap_or("-");
        match registration {
            Registration::Unchanged => {
                debug!(%app_id, composition_id = %id, "composition already registered");
                Ok(None)
            }
            Registration::Added(composition) => {
                info!(%app_id, composition_id = %id, node, "composition added");
                Ok(Some(self.spawn_pipeline(app_id.to_string(), composition, true)))
            }
            Registration::Attached(mut composition, attached) => {
                info!(%app_id, composition_id = %id, node, status = ?composition.status, "deployment attached");
                match composition.status {
                    BuildStatus::Built => {
                        composition.deployments = vec![attached];
                        Ok(Some(self.spawn_pipeline(app_id.to_string(), composition, false)))
                    }
                    BuildStatus::Error => {
                        Ok(Some(self.spawn_pipeline(app_id.to_string(), composition, true)))
                    }
                    BuildStatus::Pending => Ok(None),
                }
            }
        }
    }

    /// Store layout candidates, select `active_key` and roll it out.
    pub async fn apply_layout(
        &self,
        app_id: &str,
        candidates: BTreeMap<String, Layout>,
        active_key: &str,
    ) -> ComposerResult<Vec<PipelineHandle>> {
        let applied = self
            .apply_layout_with(app_id, candidates, |_| Some(active_key.to_string()))
            .await?;
        Ok(applied.map(|a| a.pipelines).unwrap_or_default())
    }

    /// Store layout candidates and roll out the key `choose` picks.
    ///
    /// `choose` sees the app's active key under the registry lock, so
    /// concurrent callers always step from the latest key. Returning `None`
    /// leaves the app untouched.
    ///
    /// Every group of the chosen layout gets a deployment on its node.
    /// Routing tables of all active deployments are rebuilt from the
    /// layout, and deployments outside it are retired.
    pub async fn apply_layout_with(
        &self,
        app_id: &str,
        candidates: BTreeMap<String, Layout>,
        choose: impl FnOnce(Option<&str>) -> Option<String>,
    ) -> ComposerResult<Option<AppliedLayout>> {
        let namespace = self.namespace.clone();
        let rollout = self
            .registry
            .update(app_id, |app| {
                let Some(key) = choose(app.active_layout_key.as_deref()) else {
                    return Ok(None);
                };
                let Some(layout) = candidates.get(&key).cloned() else {
                    return Err(ComposerError::UnknownLayout {
                        app_id: app_id.to_string(),
                        key,
                    });
                };
                let missing = layout
                    .values()
                    .flat_map(|info| info.component_profiles.iter())
                    .find(|p| !app.has_component(&p.name));
                if let Some(profile) = missing {
                    return Err(ComposerError::UnknownComponent {
                        app_id: app_id.to_string(),
                        component: profile.name.clone(),
                    });
                }

                let previous = app.active_layout_key.replace(key.clone());
                app.layout_candidates = candidates;
                let rollout = roll_out(app, &layout, &namespace);
                Ok(Some((previous, key, layout.len(), rollout)))
            })
            .await??;

        let Some((previous_key, active_key, groups, rollout)) = rollout else {
            debug!(%app_id, "layout unchanged");
            return Ok(None);
        };
        info!(
            %app_id,
            active_key = %active_key,
            previous_key = previous_key.as_deref().unwrap_or("-"),
            groups,
            retired = rollout.retired.len(),
            "layout applied"
        );
        for deployment_id in &rollout.retired {
            debug!(%app_id, %deployment_id, "deployment retired");
        }

        let pipelines = rollout
            .pipelines
            .into_iter()
            .map(|(composition, build)| self.spawn_pipeline(app_id.to_string(), composition, build))
            .collect();
        Ok(Some(AppliedLayout {
            previous_key,
            active_key,
            pipelines,
        }))
    }

    fn spawn_pipeline(
        &self,
        app_id: AppId,
        composition: FunctionComposition,
        build: bool,
    ) -> PipelineHandle {
        let (completer, handle) = promise();
        let registry = Arc::clone(&self.registry);
        let backend = Arc::clone(&self.backend);
        let pool = Arc::clone(&self.pool);
        tokio::spawn(async move {
            let outcome = if build {
                run_pipeline(&registry, backend, &pool, &app_id, composition).await
            } else {
                run_deploy(&registry, backend, &pool, &app_id, composition).await
            };
            completer.complete(Ok(outcome));
        });
        handle
    }
}

async fn run_pipeline(
    registry: &AppRegistry,
    backend: Arc<dyn FunctionBackend>,
    pool: &TaskPool,
    app_id: &str,
    composition: FunctionComposition,
) -> PipelineOutcome {
    let composition_id = composition.id.clone();

    let build = pool.add_task({
        let backend = Arc::clone(&backend);
        let composition = composition.clone();
        move || {
            let backend = Arc::clone(&backend);
            let composition = composition.clone();
            async move { backend.build(&composition).await }
        }
    });
    let built = match build.wait().await {
        Ok(built) => built,
        Err(e) if e.is_shutdown() => {
            warn!(%app_id, %composition_id, "build not started, task pool shutting down");
            return PipelineOutcome::Interrupted;
        }
        Err(e) => {
            error!(%app_id, %composition_id, error = %e, "composition build failed");
            record(registry, app_id, &composition_id, |c| {
                c.status = BuildStatus::Error;
                for deployment in &mut c.deployments {
                    deployment.status = DeploymentStatus::Error;
                }
            })
            .await;
            return PipelineOutcome::BuildFailed(e.to_string());
        }
    };
    info!(
        %app_id,
        %composition_id,
        image = built.build.as_ref().map(|b| b.image.as_str()).unwrap_or("-"),
        "composition built"
    );

    let build_record = built.build.clone();
    let deployable = record(registry, app_id, &composition_id, |c| {
        c.status = BuildStatus::Built;
        c.build = build_record;
        for deployment in &mut c.deployments {
            deployment.status = DeploymentStatus::Pending;
        }
        c.clone()
    })
    .await
    .unwrap_or(built);

    run_deploy(registry, backend, pool, app_id, deployable).await
}

/// Deploy an already built composition to the deployments it carries.
async fn run_deploy(
    registry: &AppRegistry,
    backend: Arc<dyn FunctionBackend>,
    pool: &TaskPool,
    app_id: &str,
    composition: FunctionComposition,
) -> PipelineOutcome {
    let composition_id = composition.id.clone();
    let targets: Vec<String> = composition.deployments.iter().map(|d| d.id.clone()).collect();
    if targets.is_empty() {
        debug!(%app_id, %composition_id, "no deployments, skipping deploy");
        return PipelineOutcome::Built;
    }

    let deploy = pool.add_task(move || {
        let backend = Arc::clone(&backend);
        let composition = composition.clone();
        async move { backend.deploy(&composition).await }
    });
    match deploy.wait().await {
        Ok(()) => {
            info!(%app_id, %composition_id, deployments = targets.len(), "composition deployed");
            record(registry, app_id, &composition_id, |c| {
                set_deployment_status(c, &targets, DeploymentStatus::Deployed)
            })
            .await;
            PipelineOutcome::Deployed
        }
        Err(e) if e.is_shutdown() => {
            warn!(%app_id, %composition_id, "deploy not started, task pool shutting down");
            PipelineOutcome::Interrupted
        }
        Err(e) => {
            error!(%app_id, %composition_id, error = %e, "composition deploy failed");
            record(registry, app_id, &composition_id, |c| {
                set_deployment_status(c, &targets, DeploymentStatus::Error)
            })
            .await;
            PipelineOutcome::DeployFailed(e.to_string())
        }
    }
}

/// Apply `f` to a stored composition. Returns `None` if the app or the
/// composition is gone (deleted while the pipeline ran).
async fn record<R>(
    registry: &AppRegistry,
    app_id: &str,
    composition_id: &str,
    f: impl FnOnce(&mut FunctionComposition) -> R,
) -> Option<R> {
    let result = registry
        .update(app_id, |app| app.composition_mut(composition_id).map(f))
        .await;
    match result {
        Ok(Some(out)) => Some(out),
        Ok(None) => {
            debug!(%app_id, %composition_id, "composition removed during pipeline");
            None
        }
        Err(ComposerError::AppNotFound(_)) => {
            debug!(%app_id, %composition_id, "app removed during pipeline");
            None
        }
        Err(e) => {
            warn!(%app_id, %composition_id, error = %e, "failed to record pipeline progress");
            None
        }
    }
}

fn set_deployment_status(
    composition: &mut FunctionComposition,
    targets: &[String],
    status: DeploymentStatus,
) {
    for deployment in composition
        .deployments
        .iter_mut()
        .filter(|d| targets.contains(&d.id))
    {
        deployment.status = status;
    }
}

/// Deployment id of the composition `components` on `node`.
fn deployment_id(composition_id: &str, node: &str) -> String {
    format!("{composition_id}-{node}")
}

/// Deployment serving each component in the active layout.
fn active_hosts(app: &FunctionApp) -> HashMap<String, String> {
    let mut hosts = HashMap::new();
    for (node, info) in app.active_layout().into_iter().flatten() {
        let names = info.component_names();
        let id = deployment_id(&FunctionComposition::content_id(&app.id, &names), node);
        for name in names {
            hosts.insert(name, id.clone());
        }
    }
    hosts
}

/// Routes for calls leaving `components`. Callees in the same composition
/// are served locally, others by the deployment in `hosts`. Callees with no
/// host get no route yet.
fn routing_table(
    links: &[ComponentLink],
    components: &[String],
    hosts: &HashMap<String, String>,
) -> RoutingTable {
    let mut table = RoutingTable::new();
    for link in links.iter().filter(|l| components.contains(&l.from)) {
        let function = if components.contains(&link.to) {
            LOCAL_ROUTE.to_string()
        } else if let Some(host) = hosts.get(&link.to) {
            host.clone()
        } else {
            continue;
        };
        table.entry(link.from.clone()).or_default().push(Route {
            to: link.to.clone(),
            function,
        });
    }
    table
}

/// Registry changes of a layout rollout, and the pipelines it needs.
struct Rollout {
    /// Composition to run, and whether it has to be built first.
    pipelines: Vec<(FunctionComposition, bool)>,
    retired: Vec<String>,
}

/// Put `layout` in place on `app`: one deployment per group, routing tables
/// between them, nothing else left deployed.
fn roll_out(app: &mut FunctionApp, layout: &Layout, namespace: &str) -> Rollout {
    let mut hosts = HashMap::new();
    let mut active = HashSet::new();
    let mut added = HashSet::new();

    for (node, info) in layout {
        let names = info.component_names();
        let composition_id = FunctionComposition::content_id(&app.id, &names);
        let id = deployment_id(&composition_id, node);
        for name in &names {
            hosts.insert(name.clone(), id.clone());
        }
        active.insert(id.clone());

        if app.composition(&composition_id).is_none() {
            app.compositions.push(FunctionComposition {
                id: composition_id.clone(),
                function_app_id: app.id.clone(),
                components: names,
                status: BuildStatus::Pending,
                build: None,
                deployments: Vec::new(),
            });
            added.insert(composition_id.clone());
        }
        if let Some(composition) = app.composition_mut(&composition_id)
            && !composition.deployments.iter().any(|d| d.id == id)
        {
            composition.deployments.push(Deployment {
                id,
                function_composition_id: composition_id,
                node: node.clone(),
                namespace: namespace.to_string(),
                routing_table: RoutingTable::new(),
                status: DeploymentStatus::WaitingForBuild,
            });
        }
    }

    let links = app.links.clone();
    let mut retired = Vec::new();
    let mut pipelines = Vec::new();
    for composition in &mut app.compositions {
        composition.deployments.retain(|d| {
            let keep = active.contains(&d.id);
            if !keep {
                retired.push(d.id.clone());
            }
            keep
        });
        if composition.deployments.is_empty() {
            continue;
        }

        let routes = routing_table(&links, &composition.components, &hosts);
        let built = composition.status == BuildStatus::Built;
        let mut stale = Vec::new();
        for deployment in &mut composition.deployments {
            let rerouted = deployment.routing_table != routes;
            deployment.routing_table = routes.clone();
            if !built {
                deployment.status = DeploymentStatus::WaitingForBuild;
                continue;
            }
            if rerouted || deployment.status != DeploymentStatus::Deployed {
                deployment.status = DeploymentStatus::Pending;
                stale.push(deployment.clone());
            }
        }

        match composition.status {
            BuildStatus::Built if !stale.is_empty() => {
                let mut deployable = composition.clone();
                deployable.deployments = stale;
                pipelines.push((deployable, false));
            }
            BuildStatus::Error => pipelines.push((composition.clone(), true)),
            BuildStatus::Pending if added.contains(&composition.id) => {
                pipelines.push((composition.clone(), true))
            }
            // a pipeline is already building it and deploys what it finds
            _ => {}
        }
    }

    Rollout { pipelines, retired }
}

fn validate_app_spec(spec: &FunctionAppSpec) -> ComposerResult<()> {
    if spec.components.is_empty() {
        return Err(ComposerError::InvalidApp(format!(
            "app {} declares no components",
            spec.name
        )));
    }
    let mut names = HashSet::new();
    for component in &spec.components {
        if !names.insert(component.name.as_str()) {
            return Err(ComposerError::InvalidApp(format!(
                "duplicate component {}",
                component.name
            )));
        }
    }
    let unknown: BTreeSet<&str> = spec
        .links
        .iter()
        .flat_map(|l| [l.from.as_str(), l.to.as_str()])
        .filter(|name| !names.contains(name))
        .collect();
    if let Some(name) = unknown.first() {
        return Err(ComposerError::InvalidApp(format!(
            "link references undeclared component {name}"
        )));
    }
    Ok(())
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
