//! Per-project routing tables and request dispatch.
//!
//! Each registered project owns a slot holding an `Arc` of its active routes. A refresh
//! replaces that `Arc` under a short write lock; a dispatch clones it once up front and
//! serves the whole request from that copy, so it sees either the old or the new table.

use super::request::{graphql_input, graphql_row, parse_graphql_list, parse_list_query, DispatchParams};
use crate::error::AppError;
use crate::registry::DatabaseKind;
use crate::service::{QueryExecutor, RequestValidator};
use crate::settings::DispatchSettings;
use crate::sql::{self, BindValue, ListQuery};
use crate::synth::{Operation, ResourceDefinition, RootKind, RoutingTable};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Routing table plus the executor serving it.
pub struct ActiveRoutes {
    pub table: Arc<RoutingTable>,
    pub executor: Arc<dyn QueryExecutor>,
}

struct ProjectSlot {
    routes: RwLock<Arc<ActiveRoutes>>,
    available: AtomicBool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum DispatchOutput {
    List {
        rows: Vec<Value>,
        total: u64,
        limit: u32,
        offset: u64,
    },
    One(Value),
}

pub struct Dispatcher {
    slots: RwLock<HashMap<Uuid, Arc<ProjectSlot>>>,
    settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(settings: DispatchSettings) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            settings,
        }
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    fn slot(&self, project_id: Uuid) -> Option<Arc<ProjectSlot>> {
        self.slots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&project_id)
            .cloned()
    }

    /// Install routes for a project, replacing table and executor. Returns the replaced executor.
    pub fn install(
        &self,
        table: RoutingTable,
        executor: Arc<dyn QueryExecutor>,
        available: bool,
    ) -> Option<Arc<dyn QueryExecutor>> {
        let project_id = table.project_id;
        let routes = Arc::new(ActiveRoutes {
            table: Arc::new(table),
            executor,
        });
        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        match slots.get(&project_id) {
            Some(slot) => {
                let mut current = slot.routes.write().unwrap_or_else(|e| e.into_inner());
                let old = std::mem::replace(&mut *current, routes);
                slot.available.store(available, Ordering::SeqCst);
                info!(project_id = %project_id, "routes replaced");
                Some(old.executor.clone())
            }
            None => {
                slots.insert(
                    project_id,
                    Arc::new(ProjectSlot {
                        routes: RwLock::new(routes),
                        available: AtomicBool::new(available),
                    }),
                );
                info!(project_id = %project_id, "routes registered");
                None
            }
        }
    }

    /// Swap in a new table, keeping the executor. Returns false if the project is not registered.
    pub fn swap_table(&self, table: RoutingTable) -> bool {
        let Some(slot) = self.slot(table.project_id) else {
            return false;
        };
        let project_id = table.project_id;
        let mut current = slot.routes.write().unwrap_or_else(|e| e.into_inner());
        let next = Arc::new(ActiveRoutes {
            table: Arc::new(table),
            executor: current.executor.clone(),
        });
        *current = next;
        info!(project_id = %project_id, fingerprint = %current.table.fingerprint, "routing table swapped");
        true
    }

    /// Drop a project's routes and close its pool.
    pub async fn unregister(&self, project_id: Uuid) -> bool {
        let removed = self.slots.write().unwrap_or_else(|e| e.into_inner()).remove(&project_id);
        match removed {
            Some(slot) => {
                let executor = slot.routes.read().unwrap_or_else(|e| e.into_inner()).executor.clone();
                executor.close().await;
                info!(project_id = %project_id, "routes unregistered");
                true
            }
            None => false,
        }
    }

    /// Mark a project's database as reachable or not. Unavailable projects fail fast.
    pub fn set_available(&self, project_id: Uuid, available: bool) {
        if let Some(slot) = self.slot(project_id) {
            slot.available.store(available, Ordering::SeqCst);
        }
    }

    pub fn is_available(&self, project_id: Uuid) -> bool {
        self.slot(project_id)
            .is_some_and(|s| s.available.load(Ordering::SeqCst))
    }

    pub fn routing_table(&self, project_id: Uuid) -> Option<Arc<RoutingTable>> {
        self.slot(project_id)
            .map(|s| s.routes.read().unwrap_or_else(|e| e.into_inner()).table.clone())
    }

    fn active(&self, project_id: Uuid) -> Result<Arc<ActiveRoutes>, AppError> {
        let slot = self
            .slot(project_id)
            .ok_or_else(|| AppError::NotFound(format!("project {} has no synthesized API", project_id)))?;
        if !slot.available.load(Ordering::SeqCst) {
            return Err(AppError::project_unavailable(project_id));
        }
        let routes = slot.routes.read().unwrap_or_else(|e| e.into_inner()).clone();
        Ok(routes)
    }

    pub async fn dispatch(
        &self,
        project_id: Uuid,
        resource: &str,
        operation: Operation,
        params: DispatchParams,
    ) -> Result<DispatchOutput, AppError> {
        let routes = self.active(project_id)?;
        let res = resolve(&routes.table, resource, operation)?;
        let dialect = routes.table.dialect;
        debug!(project_id = %project_id, resource = %resource, operation = %operation, "dispatch");

        match operation {
            Operation::List => {
                let query = parse_list_query(res, dialect, &params.query, &self.settings)?;
                self.run_list(&routes, res, query).await
            }
            Operation::Get => {
                let id = path_id(res, dialect, &params)?;
                self.run_get(&routes, res, id)
                    .await?
                    .map(DispatchOutput::One)
                    .ok_or_else(|| row_not_found(res, &params))
            }
            Operation::Create => {
                let body = params.body.as_ref().ok_or_else(|| AppError::validation("body", "expected a JSON object"))?;
                self.run_create(&routes, res, body).await.map(DispatchOutput::One)
            }
            Operation::Update => {
                let id = path_id(res, dialect, &params)?;
                let body = params.body.as_ref().ok_or_else(|| AppError::validation("body", "expected a JSON object"))?;
                self.run_update(&routes, res, id, body)
                    .await?
                    .map(DispatchOutput::One)
                    .ok_or_else(|| row_not_found(res, &params))
            }
            Operation::Delete => {
                let id = path_id(res, dialect, &params)?;
                self.run_delete(&routes, res, id)
                    .await?
                    .map(DispatchOutput::One)
                    .ok_or_else(|| row_not_found(res, &params))
            }
        }
    }

    /// Resolve a GraphQL root field by name and run the operation it is bound to.
    pub async fn dispatch_graphql(
        &self,
        project_id: Uuid,
        root: RootKind,
        field: &str,
        args: &Map<String, Value>,
    ) -> Result<Value, AppError> {
        let routes = self.active(project_id)?;
        let root_field = routes
            .table
            .graphql
            .root_field(root, field)
            .ok_or_else(|| AppError::NotFound(format!("graphql field {}", field)))?;
        let res = resolve(&routes.table, &root_field.resource, root_field.operation)?;
        let dialect = routes.table.dialect;
        debug!(project_id = %project_id, field = %field, operation = %root_field.operation, "dispatch graphql");

        let row = match root_field.operation {
            Operation::List => {
                let query = parse_graphql_list(res, dialect, args, &self.settings)?;
                return match self.run_list(&routes, res, query).await? {
                    DispatchOutput::List { rows, .. } => {
                        Ok(Value::Array(rows.into_iter().map(|r| graphql_row(res, r)).collect()))
                    }
                    DispatchOutput::One(v) => Ok(graphql_row(res, v)),
                };
            }
            Operation::Get => {
                let id = graphql_id(res, dialect, args)?;
                self.run_get(&routes, res, id).await?
            }
            Operation::Create => {
                let input = graphql_input(res, object_arg(args, "input")?)?;
                Some(self.run_create(&routes, res, &input).await?)
            }
            Operation::Update => {
                let id = graphql_id(res, dialect, args)?;
                let patch = graphql_input(res, object_arg(args, "patch")?)?;
                self.run_update(&routes, res, id, &patch).await?
            }
            Operation::Delete => {
                let id = graphql_id(res, dialect, args)?;
                self.run_delete(&routes, res, id).await?
            }
        };
        Ok(row.map(|r| graphql_row(res, r)).unwrap_or(Value::Null))
    }

    async fn run_list(&self, routes: &ActiveRoutes, res: &ResourceDefinition, query: ListQuery) -> Result<DispatchOutput, AppError> {
        let dialect = routes.table.dialect;
        let select = sql::select_list(dialect, res, &query)?;
        let count = sql::count(dialect, res, &query.filters)?;
        let rows = self
            .read_with_retry(|| routes.executor.fetch_rows(&select, &res.fields))
            .await?;
        let total = self.read_with_retry(|| routes.executor.fetch_count(&count)).await?;
        Ok(DispatchOutput::List {
            rows,
            total,
            limit: query.limit,
            offset: query.offset,
        })
    }

    async fn run_get(&self, routes: &ActiveRoutes, res: &ResourceDefinition, id: BindValue) -> Result<Option<Value>, AppError> {
        let stmt = sql::select_by_id(routes.table.dialect, res, id)?;
        let rows = self
            .read_with_retry(|| routes.executor.fetch_rows(&stmt, &res.fields))
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn run_create(&self, routes: &ActiveRoutes, res: &ResourceDefinition, body: &Map<String, Value>) -> Result<Value, AppError> {
        let dialect = routes.table.dialect;
        let values = RequestValidator::create_values(res, dialect, body)?;
        let steps = sql::insert(dialect, res, &values)?;
        let row = routes.executor.execute_write(&steps, &res.fields).await?;
        // Tables without a key cannot be read back on MySQL; echo what was written.
        Ok(row.unwrap_or_else(|| {
            Value::Object(values.iter().map(|(k, v)| (k.clone(), v.to_json())).collect())
        }))
    }

    async fn run_update(
        &self,
        routes: &ActiveRoutes,
        res: &ResourceDefinition,
        id: BindValue,
        body: &Map<String, Value>,
    ) -> Result<Option<Value>, AppError> {
        let dialect = routes.table.dialect;
        let values = RequestValidator::patch_values(res, dialect, body)?;
        let steps = sql::update(dialect, res, id, &values)?;
        routes.executor.execute_write(&steps, &res.fields).await
    }

    async fn run_delete(&self, routes: &ActiveRoutes, res: &ResourceDefinition, id: BindValue) -> Result<Option<Value>, AppError> {
        let steps = sql::delete(routes.table.dialect, res, id)?;
        routes.executor.execute_write(&steps, &res.fields).await
    }

    /// Reads get one retry after a short backoff on transient failures. Writes never retry.
    async fn read_with_retry<T, F, Fut>(&self, attempt: F) -> Result<T, AppError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        match attempt().await {
            Err(e) if e.upstream_code().is_some_and(|c| c.is_transient()) => {
                warn!(error = %e, "transient read failure; retrying once");
                tokio::time::sleep(self.settings.read_retry_backoff).await;
                attempt().await
            }
            other => other,
        }
    }
}

fn resolve<'a>(table: &'a RoutingTable, resource: &str, operation: Operation) -> Result<&'a ResourceDefinition, AppError> {
    let res = table
        .resource(resource)
        .ok_or_else(|| AppError::NotFound(format!("resource {}", resource)))?;
    if !res.supports(operation) {
        return Err(AppError::NotFound(format!("{} on {}", operation, resource)));
    }
    Ok(res)
}

fn path_id(res: &ResourceDefinition, dialect: DatabaseKind, params: &DispatchParams) -> Result<BindValue, AppError> {
    let pk = res
        .primary_key_field()
        .ok_or_else(|| AppError::NotFound(format!("{} has no primary key", res.name)))?;
    let raw = params.id.as_deref().ok_or_else(|| AppError::validation("id", "missing"))?;
    RequestValidator::coerce_text(pk, dialect, raw)
}

fn graphql_id(res: &ResourceDefinition, dialect: DatabaseKind, args: &Map<String, Value>) -> Result<BindValue, AppError> {
    let pk = res
        .primary_key_field()
        .ok_or_else(|| AppError::NotFound(format!("{} has no primary key", res.name)))?;
    match args.get("id") {
        None | Some(Value::Null) => Err(AppError::validation("id", "missing")),
        Some(v) => RequestValidator::coerce_json(pk, dialect, v),
    }
}

fn object_arg<'a>(args: &'a Map<String, Value>, name: &str) -> Result<&'a Map<String, Value>, AppError> {
    args.get(name)
        .and_then(Value::as_object)
        .ok_or_else(|| AppError::validation(name, "expected an input object"))
}

fn row_not_found(res: &ResourceDefinition, params: &DispatchParams) -> AppError {
    AppError::NotFound(format!("{} {}", res.name, params.id.as_deref().unwrap_or_default()))
}
