//! Engine: ties the registry, introspection, synthesis, dispatch and lifecycle together.

use crate::dispatch::{DispatchOutput, DispatchParams, Dispatcher};
use crate::error::AppError;
use crate::lifecycle::{
    spawn_monitor, ContainerRuntime, DockerCli, LifecycleManager, LifecycleState, ReadinessProbe, SqlProbe,
};
use crate::registry::{
    AttachConnection, ConnectionInfo, ContainerInstance, DatabaseConnection, DatabaseKind, MemoryProjectStore,
    PgProjectStore, Project, ProjectRegistry, ProjectStore, SecretKey,
};
use crate::schema::{Introspector, SchemaSnapshot, SqlIntrospector};
use crate::service::{QueryExecutor, SqlExecutor};
use crate::settings::{DispatchSettings, Settings};
use crate::synth::{describe_endpoints, synthesize, Endpoint, Operation, RootKind, RoutingTable};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Builds the executor serving a project's data requests.
pub type ExecutorFactory = Arc<dyn Fn(&DatabaseConnection, &DispatchSettings) -> Arc<dyn QueryExecutor> + Send + Sync>;

/// Swappable collaborators. `Engine::connect` wires the real ones.
pub struct EngineParts {
    pub store: Arc<dyn ProjectStore>,
    pub introspector: Arc<dyn Introspector>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub probe: Arc<dyn ReadinessProbe>,
    pub executors: ExecutorFactory,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshOutcome {
    pub project_id: Uuid,
    pub fingerprint: String,
    /// False when the schema was unchanged and the routing table was kept.
    pub changed: bool,
    pub resources: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProvisionOutcome {
    pub project_id: Uuid,
    pub state: LifecycleState,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub connection_url: String,
    pub schema: Option<RefreshOutcome>,
    /// Why the initial schema refresh failed; the instance itself is up.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_error: Option<String>,
}

/// Per-owner project counts.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProjectOverview {
    pub total_projects: usize,
    pub by_kind: BTreeMap<&'static str, usize>,
    pub by_state: BTreeMap<&'static str, usize>,
    pub running_instances: usize,
    pub created_today: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiStatus {
    pub project_id: Uuid,
    pub api_generated: bool,
    /// False while the project's database is stopped or failed.
    pub available: bool,
    pub base_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generated_at: Option<DateTime<Utc>>,
    pub resource_count: usize,
    pub endpoint_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct EndpointListing {
    pub project_id: Uuid,
    pub base_url: String,
    pub endpoint_count: usize,
    pub endpoints: Vec<Endpoint>,
}

pub struct Engine {
    settings: Settings,
    registry: ProjectRegistry,
    introspector: Arc<dyn Introspector>,
    dispatcher: Dispatcher,
    lifecycle: LifecycleManager,
    executors: ExecutorFactory,
    snapshots: RwLock<HashMap<Uuid, Arc<SchemaSnapshot>>>,
    refresh_locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl Engine {
    pub fn new(settings: Settings, parts: EngineParts) -> Self {
        let key = settings.secret_key.clone().unwrap_or_else(|| {
            warn!("SYNTH_SECRET_KEY not set; stored credentials will not survive a restart");
            SecretKey::generate()
        });
        Self {
            registry: ProjectRegistry::new(parts.store.clone(), &key),
            introspector: parts.introspector,
            dispatcher: Dispatcher::new(settings.dispatch.clone()),
            lifecycle: LifecycleManager::new(parts.runtime, parts.probe, parts.store, settings.lifecycle.clone()),
            executors: parts.executors,
            snapshots: RwLock::new(HashMap::new()),
            refresh_locks: Mutex::new(HashMap::new()),
            settings,
        }
    }

    /// Wire the production collaborators: PostgreSQL registry (or in-memory without
    /// `DATABASE_URL`), Docker CLI, SQL probe, introspector and pooled executors.
    pub async fn connect(settings: Settings) -> Result<Self, AppError> {
        let store: Arc<dyn ProjectStore> = match &settings.database_url {
            Some(url) => {
                let pool = sqlx::postgres::PgPoolOptions::new()
                    .max_connections(5)
                    .connect(url)
                    .await
                    .map_err(AppError::registry)?;
                let store = PgProjectStore::new(pool, settings.registry_schema.clone());
                store.ensure_tables().await?;
                Arc::new(store)
            }
            None => {
                warn!("DATABASE_URL not set; registry is kept in memory");
                Arc::new(MemoryProjectStore::new())
            }
        };
        let parts = EngineParts {
            store,
            introspector: Arc::new(SqlIntrospector::new(&settings.introspection)),
            runtime: Arc::new(DockerCli::new(
                settings.lifecycle.docker_bin.clone(),
                settings.lifecycle.docker_timeout,
            )),
            probe: Arc::new(SqlProbe::new(settings.lifecycle.probe_timeout)),
            executors: Arc::new(|conn: &DatabaseConnection, s: &DispatchSettings| -> Arc<dyn QueryExecutor> {
                Arc::new(SqlExecutor::connect_lazy(conn, s))
            }),
        };
        let engine = Self::new(settings, parts);
        engine.restore().await?;
        Ok(engine)
    }

    /// Reload lifecycle state, then rebuild the routing table of every project with stored
    /// credentials whose database should be up. Returns the number of tables rebuilt.
    pub async fn restore(&self) -> Result<usize, AppError> {
        self.lifecycle.restore().await?;
        let mut rebuilt = 0;
        for project_id in self.registry.connected_projects().await? {
            if !self.may_serve(project_id).await? {
                continue;
            }
            match self.refresh_schema(project_id).await {
                Ok(_) => rebuilt += 1,
                Err(e) => warn!(project_id = %project_id, error = %e, "restoring routing table"),
            }
        }
        info!(rebuilt, "routing tables restored");
        Ok(rebuilt)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn registry(&self) -> &ProjectRegistry {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    fn refresh_lock(&self, project_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        self.refresh_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(project_id)
            .or_default()
            .clone()
    }

    pub async fn get_project(&self, project_id: Uuid) -> Result<Project, AppError> {
        self.registry.get_project(project_id).await
    }

    pub async fn get_connection(&self, project_id: Uuid) -> Result<DatabaseConnection, AppError> {
        self.registry.get_connection(project_id).await
    }

    /// Connection details with the password withheld.
    pub async fn connection_info(&self, project_id: Uuid) -> Result<ConnectionInfo, AppError> {
        let conn = self.registry.get_connection(project_id).await?;
        let managed = self.lifecycle.instance(project_id).await?.is_some();
        Ok(conn.info(managed))
    }

    pub async fn overview(&self, owner_id: &str) -> Result<ProjectOverview, AppError> {
        let projects = self.registry.list_projects(owner_id).await?;
        let today = Utc::now().date_naive();
        let mut overview = ProjectOverview {
            total_projects: projects.len(),
            ..Default::default()
        };
        for kind in [DatabaseKind::Postgres, DatabaseKind::MySql] {
            overview.by_kind.insert(kind.as_str(), 0);
        }
        for project in &projects {
            *overview.by_kind.entry(project.database_kind.as_str()).or_default() += 1;
            let state = self.lifecycle.lifecycle_state(project.id).await?;
            *overview.by_state.entry(state.as_str()).or_default() += 1;
            if state == LifecycleState::Running {
                overview.running_instances += 1;
            }
            if project.created_at.date_naive() == today {
                overview.created_today += 1;
            }
        }
        Ok(overview)
    }

    /// Attached databases may always serve; managed ones only while their instance runs.
    async fn may_serve(&self, project_id: Uuid) -> Result<bool, AppError> {
        Ok(match self.lifecycle.instance(project_id).await? {
            Some(instance) => instance.state == LifecycleState::Running,
            None => true,
        })
    }

    /// Introspect the project's database and swap in a new routing table if the schema changed.
    /// Dispatches in flight keep the table they started with.
    pub async fn refresh_schema(&self, project_id: Uuid) -> Result<RefreshOutcome, AppError> {
        let lock = self.refresh_lock(project_id);
        let _guard = lock.lock().await;
        let conn = self.registry.get_connection(project_id).await?;
        let snapshot = self.introspector.introspect(&conn).await?;
        let serving = self.may_serve(project_id).await?;
        let table = synthesize(&snapshot);
        let mut outcome = RefreshOutcome {
            project_id,
            fingerprint: table.fingerprint.clone(),
            changed: true,
            resources: table.resources.len(),
            skipped: snapshot.skipped.len(),
        };

        let current = self.dispatcher.routing_table(project_id);
        if current.as_ref().is_some_and(|t| t.fingerprint == table.fingerprint) {
            outcome.changed = false;
            self.dispatcher.set_available(project_id, serving);
            info!(project_id = %project_id, "schema unchanged");
            return Ok(outcome);
        }

        self.snapshots
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(project_id, Arc::new(snapshot));
        if current.is_some() {
            self.dispatcher.swap_table(table);
            self.dispatcher.set_available(project_id, serving);
        } else {
            let executor = (self.executors)(&conn, &self.settings.dispatch);
            if let Some(old) = self.dispatcher.install(table, executor, serving) {
                old.close().await;
            }
        }
        info!(
            project_id = %project_id,
            resources = outcome.resources,
            skipped = outcome.skipped,
            "schema refreshed"
        );
        Ok(outcome)
    }

    pub fn schema_snapshot(&self, project_id: Uuid) -> Result<Arc<SchemaSnapshot>, AppError> {
        self.snapshots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&project_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("no schema snapshot for project {}", project_id)))
    }

    pub fn api_status(&self, project_id: Uuid, base_url: &str) -> ApiStatus {
        let table = self.dispatcher.routing_table(project_id);
        let generated_at = self.schema_snapshot(project_id).ok().map(|s| s.captured_at);
        ApiStatus {
            project_id,
            api_generated: table.is_some(),
            available: table.is_some() && self.dispatcher.is_available(project_id),
            base_url: base_url.to_string(),
            fingerprint: table.as_ref().map(|t| t.fingerprint.clone()),
            generated_at,
            resource_count: table.as_ref().map_or(0, |t| t.resources.len()),
            endpoint_count: table.as_ref().map_or(0, |t| describe_endpoints(t, base_url).len()),
        }
    }

    pub fn api_endpoints(&self, project_id: Uuid, base_url: &str) -> Result<EndpointListing, AppError> {
        let table = self.routing_table(project_id)?;
        let endpoints = describe_endpoints(&table, base_url);
        Ok(EndpointListing {
            project_id,
            base_url: base_url.to_string(),
            endpoint_count: endpoints.len(),
            endpoints,
        })
    }

    /// Stop serving the synthesized API. The connection is kept; a schema refresh brings it back.
    pub async fn remove_api(&self, project_id: Uuid) -> Result<(), AppError> {
        if !self.dispatcher.unregister(project_id).await {
            return Err(AppError::NotFound(format!("project {} has no synthesized API", project_id)));
        }
        self.snapshots
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&project_id);
        info!(project_id = %project_id, "synthesized API removed");
        Ok(())
    }

    pub fn routing_table(&self, project_id: Uuid) -> Result<Arc<RoutingTable>, AppError> {
        self.dispatcher
            .routing_table(project_id)
            .ok_or_else(|| AppError::NotFound(format!("project {} has no synthesized API", project_id)))
    }

    pub async fn dispatch(
        &self,
        project_id: Uuid,
        resource: &str,
        operation: Operation,
        params: DispatchParams,
    ) -> Result<DispatchOutput, AppError> {
        self.dispatcher.dispatch(project_id, resource, operation, params).await
    }

    pub async fn dispatch_graphql(
        &self,
        project_id: Uuid,
        root: RootKind,
        field: &str,
        args: &Map<String, Value>,
    ) -> Result<Value, AppError> {
        self.dispatcher.dispatch_graphql(project_id, root, field, args).await
    }

    /// Attach an existing database and synthesize its API.
    pub async fn attach_connection(&self, project: &Project, req: AttachConnection) -> Result<RefreshOutcome, AppError> {
        self.registry.attach_connection(project, req).await?;
        if self.dispatcher.unregister(project.id).await {
            info!(project_id = %project.id, "previous connection replaced");
        }
        self.refresh_schema(project.id).await
    }

    /// Provision a managed instance, record its credentials and synthesize its (initially empty) API.
    /// A destroy that lands while the API is being built wins: everything recorded here is dropped.
    pub async fn provision(&self, project_id: Uuid) -> Result<ProvisionOutcome, AppError> {
        let project = self.registry.get_project(project_id).await?;
        let conn = self.lifecycle.provision(&project).await?;
        self.registry.record_connection(conn.clone()).await?;
        self.dispatcher.unregister(project_id).await;
        let (schema, schema_error) = match self.refresh_schema(project_id).await {
            Ok(o) => (Some(o), None),
            Err(e) => {
                warn!(project_id = %project_id, error = %e, "initial schema refresh failed");
                (None, Some(e.to_string()))
            }
        };
        let state = self.lifecycle.lifecycle_state(project_id).await?;
        if state == LifecycleState::Destroyed {
            self.forget(project_id).await;
            return Err(AppError::Provisioning(format!(
                "project {} was destroyed while provisioning",
                project_id
            )));
        }
        Ok(ProvisionOutcome {
            project_id,
            state,
            host: conn.host.clone(),
            port: conn.port,
            database: conn.database.clone(),
            username: conn.username.clone(),
            connection_url: conn.redacted_url(),
            schema,
            schema_error,
        })
    }

    pub async fn start(&self, project_id: Uuid) -> Result<LifecycleState, AppError> {
        let conn = self.registry.get_connection(project_id).await.ok();
        let state = self.lifecycle.start(project_id, conn.as_ref()).await;
        self.sync_availability(project_id, state.as_ref().ok().copied()).await;
        state
    }

    pub async fn stop(&self, project_id: Uuid) -> Result<LifecycleState, AppError> {
        let state = self.lifecycle.stop(project_id).await?;
        self.dispatcher.set_available(project_id, false);
        Ok(state)
    }

    pub async fn restart(&self, project_id: Uuid) -> Result<LifecycleState, AppError> {
        let conn = self.registry.get_connection(project_id).await.ok();
        let state = self.lifecycle.restart(project_id, conn.as_ref()).await;
        self.sync_availability(project_id, state.as_ref().ok().copied()).await;
        state
    }

    /// A project that comes back up without a routing table (stopped across a restart) gets one built.
    async fn sync_availability(&self, project_id: Uuid, state: Option<LifecycleState>) {
        let running = state == Some(LifecycleState::Running);
        if running && self.dispatcher.routing_table(project_id).is_none() {
            if let Err(e) = self.refresh_schema(project_id).await {
                warn!(project_id = %project_id, error = %e, "building routing table after start");
            }
            return;
        }
        self.dispatcher.set_available(project_id, running);
    }

    /// Tear down the managed instance and drop the project's API.
    pub async fn destroy(&self, project_id: Uuid) -> Result<LifecycleState, AppError> {
        let state = self.lifecycle.destroy(project_id).await?;
        self.forget(project_id).await;
        Ok(state)
    }

    pub async fn lifecycle_state(&self, project_id: Uuid) -> Result<LifecycleState, AppError> {
        self.lifecycle.lifecycle_state(project_id).await
    }

    pub async fn instance(&self, project_id: Uuid) -> Result<Option<ContainerInstance>, AppError> {
        self.lifecycle.instance(project_id).await
    }

    async fn forget(&self, project_id: Uuid) {
        self.dispatcher.unregister(project_id).await;
        if let Err(e) = self.registry.remove_connection(project_id).await {
            warn!(project_id = %project_id, error = %e, "removing stored connection");
        }
        self.snapshots
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&project_id);
    }

    /// Registry notification: the project is gone. Destroys its instance if one is live.
    pub async fn on_project_deleted(&self, project_id: Uuid) -> Result<(), AppError> {
        if let Some(instance) = self.lifecycle.instance(project_id).await? {
            if !instance.state.is_terminal() {
                self.lifecycle.destroy(project_id).await?;
            }
        }
        self.forget(project_id).await;
        self.registry.delete_project(project_id).await?;
        Ok(())
    }

    /// One health round over every running instance.
    pub async fn check_health(&self) {
        let projects = match self.lifecycle.running_projects().await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "listing running instances");
                return;
            }
        };
        for project_id in projects {
            let Ok(conn) = self.registry.get_connection(project_id).await else {
                continue;
            };
            match self.lifecycle.health_check(project_id, &conn).await {
                Ok(Some(report)) => {
                    let available = report.state == LifecycleState::Running && report.healthy;
                    if report.state == LifecycleState::Failed || available {
                        self.dispatcher.set_available(project_id, available);
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(project_id = %project_id, error = %e, "health check"),
            }
        }
    }

    pub fn spawn_health_monitor(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        spawn_monitor(self.settings.lifecycle.health_interval, shutdown, move || {
            let engine = engine.clone();
            async move { engine.check_health().await }
        })
    }
}
