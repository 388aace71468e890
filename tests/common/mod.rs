//! In-process fakes for the engine's collaborators.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use schema_synth::engine::{EngineParts, ExecutorFactory};
use schema_synth::error::AppError;
use schema_synth::lifecycle::{ContainerRuntime, ContainerSpec, ReadinessProbe, RuntimeError};
use schema_synth::registry::{DatabaseConnection, DatabaseKind, MemoryProjectStore, NewProject, Project, SecretKey};
use schema_synth::schema::{ColumnDescriptor, SchemaSnapshot, TableDescriptor};
use schema_synth::service::QueryExecutor;
use schema_synth::settings::{DispatchSettings, Settings};
use schema_synth::sql::QueryBuf;
use schema_synth::synth::FieldDef;
use schema_synth::typemap::CanonicalType;
use schema_synth::{Engine, Introspector};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Records every statement; answers reads with canned rows.
#[derive(Default)]
pub struct RecordingExecutor {
    pub statements: Mutex<Vec<QueryBuf>>,
    pub rows: Mutex<Vec<Value>>,
    pub closed: AtomicBool,
}

impl RecordingExecutor {
    pub fn with_rows(rows: Vec<Value>) -> Self {
        Self {
            rows: Mutex::new(rows),
            ..Default::default()
        }
    }

    pub fn sql(&self) -> Vec<String> {
        self.statements.lock().unwrap().iter().map(|s| s.sql.clone()).collect()
    }
}

#[async_trait]
impl QueryExecutor for RecordingExecutor {
    async fn fetch_rows(&self, stmt: &QueryBuf, _fields: &[FieldDef]) -> Result<Vec<Value>, AppError> {
        self.statements.lock().unwrap().push(stmt.clone());
        Ok(self.rows.lock().unwrap().clone())
    }

    async fn fetch_count(&self, stmt: &QueryBuf) -> Result<u64, AppError> {
        self.statements.lock().unwrap().push(stmt.clone());
        Ok(self.rows.lock().unwrap().len() as u64)
    }

    async fn execute_write(&self, steps: &[QueryBuf], _fields: &[FieldDef]) -> Result<Option<Value>, AppError> {
        self.statements.lock().unwrap().extend(steps.iter().cloned());
        Ok(self.rows.lock().unwrap().first().cloned())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Serves whatever snapshot was last set, re-labelled with the caller's project.
pub struct FakeIntrospector {
    pub tables: Mutex<Vec<TableDescriptor>>,
    pub calls: AtomicUsize,
    /// Time each read takes.
    pub delay: Mutex<Duration>,
    pub unreachable: AtomicBool,
}

impl FakeIntrospector {
    pub fn new(tables: Vec<TableDescriptor>) -> Self {
        Self {
            tables: Mutex::new(tables),
            calls: AtomicUsize::new(0),
            delay: Mutex::new(Duration::ZERO),
            unreachable: AtomicBool::new(false),
        }
    }

    pub fn set(&self, tables: Vec<TableDescriptor>) {
        *self.tables.lock().unwrap() = tables;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }
}

#[async_trait]
impl Introspector for FakeIntrospector {
    async fn introspect(&self, conn: &DatabaseConnection) -> Result<SchemaSnapshot, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(AppError::Connection(format!("{}: connection refused", conn.redacted_url())));
        }
        Ok(SchemaSnapshot {
            project_id: conn.project_id,
            dialect: conn.kind,
            database_name: conn.database.clone(),
            tables: self.tables.lock().unwrap().clone(),
            skipped: Vec::new(),
            captured_at: Utc::now(),
        })
    }
}

/// Container runtime that only records what it was asked to do.
#[derive(Default)]
pub struct ScriptedRuntime {
    pub calls: Mutex<Vec<String>>,
    pub specs: Mutex<Vec<ContainerSpec>>,
    pub fail_run: AtomicBool,
    pub container_down: AtomicBool,
}

impl ScriptedRuntime {
    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContainerRuntime for ScriptedRuntime {
    async fn create_network(&self, name: &str) -> Result<(), RuntimeError> {
        self.record(format!("network create {}", name));
        Ok(())
    }

    async fn create_volume(&self, name: &str) -> Result<(), RuntimeError> {
        self.record(format!("volume create {}", name));
        Ok(())
    }

    async fn run(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        self.record(format!("run {}", spec.name));
        if self.fail_run.load(Ordering::SeqCst) {
            return Err(RuntimeError::Command {
                command: "docker run".into(),
                status: "exit status: 125".into(),
                stderr: "image not found".into(),
            });
        }
        self.specs.lock().unwrap().push(spec.clone());
        Ok(format!("cid-{}", spec.name))
    }

    async fn start(&self, name: &str) -> Result<(), RuntimeError> {
        self.record(format!("start {}", name));
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<(), RuntimeError> {
        self.record(format!("stop {}", name));
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<(), RuntimeError> {
        self.record(format!("rm {}", name));
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> Result<(), RuntimeError> {
        self.record(format!("network rm {}", name));
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<(), RuntimeError> {
        self.record(format!("volume rm {}", name));
        Ok(())
    }

    async fn is_running(&self, _name: &str) -> Result<bool, RuntimeError> {
        Ok(!self.container_down.load(Ordering::SeqCst))
    }
}

/// Probe that fails until switched to ready.
#[derive(Default)]
pub struct ScriptedProbe {
    pub ready: AtomicBool,
    pub checks: AtomicUsize,
}

impl ScriptedProbe {
    pub fn ready() -> Self {
        Self {
            ready: AtomicBool::new(true),
            checks: AtomicUsize::new(0),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }
}

#[async_trait]
impl ReadinessProbe for ScriptedProbe {
    async fn check(&self, conn: &DatabaseConnection) -> Result<(), AppError> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        if self.ready.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AppError::Connection(format!("{}: connection refused", conn.redacted_url())))
        }
    }
}

pub fn column(name: &str, ordinal: i32, t: CanonicalType) -> ColumnDescriptor {
    let native = match &t {
        CanonicalType::Int64 => "bigint",
        CanonicalType::Float64 => "numeric",
        CanonicalType::Bool => "boolean",
        CanonicalType::Timestamp => "timestamp with time zone",
        CanonicalType::Json => "jsonb",
        CanonicalType::Binary => "bytea",
        CanonicalType::Text | CanonicalType::Enum(_) => "text",
    };
    ColumnDescriptor {
        name: name.into(),
        ordinal,
        raw_type: native.into(),
        native_type: native.into(),
        mapped_type: t,
        nullable: false,
        default: None,
        auto_generated: false,
        is_primary_key: false,
        is_foreign_key: false,
        references: None,
    }
}

fn table(name: &str, columns: Vec<ColumnDescriptor>) -> TableDescriptor {
    let primary_key = columns.iter().filter(|c| c.is_primary_key).map(|c| c.name.clone()).collect();
    TableDescriptor {
        schema: "public".into(),
        name: name.into(),
        resource_name: name.into(),
        columns,
        primary_key,
        constraints: Vec::new(),
    }
}

/// `users(id bigserial pk, email text, active bool)`
pub fn users_table() -> TableDescriptor {
    let mut id = column("id", 1, CanonicalType::Int64);
    id.is_primary_key = true;
    id.auto_generated = true;
    let mut active = column("active", 3, CanonicalType::Bool);
    active.nullable = true;
    table("users", vec![id, column("email", 2, CanonicalType::Text), active])
}

/// `orders(id int pk, total numeric)`
pub fn orders_table() -> TableDescriptor {
    let mut id = column("id", 1, CanonicalType::Int64);
    id.is_primary_key = true;
    table("orders", vec![id, column("total", 2, CanonicalType::Float64)])
}

pub fn test_settings() -> Settings {
    let mut settings = Settings::default();
    settings.lifecycle.check_host_ports = false;
    settings.lifecycle.port_range_start = 20000;
    settings.lifecycle.port_range_end = 20999;
    settings.lifecycle.readiness_attempts = 5;
    settings.lifecycle.readiness_timeout = Duration::from_secs(2);
    settings.lifecycle.readiness_initial_backoff = Duration::from_millis(5);
    settings.lifecycle.readiness_max_backoff = Duration::from_millis(20);
    settings.lifecycle.probe_timeout = Duration::from_millis(200);
    settings.lifecycle.health_failure_threshold = 2;
    settings.dispatch.read_retry_backoff = Duration::from_millis(1);
    settings.secret_key = Some(SecretKey::from_bytes([7u8; 32]));
    settings
}

pub struct Harness {
    pub engine: Arc<Engine>,
    pub store: Arc<MemoryProjectStore>,
    pub executor: Arc<RecordingExecutor>,
    pub introspector: Arc<FakeIntrospector>,
    pub runtime: Arc<ScriptedRuntime>,
    pub probe: Arc<ScriptedProbe>,
}

pub fn harness_with(settings: Settings, probe: ScriptedProbe, rows: Vec<Value>) -> Harness {
    let executor = Arc::new(RecordingExecutor::with_rows(rows));
    let introspector = Arc::new(FakeIntrospector::new(vec![users_table()]));
    let runtime = Arc::new(ScriptedRuntime::default());
    let probe = Arc::new(probe);
    let store = Arc::new(MemoryProjectStore::new());
    let engine = Engine::new(
        settings,
        EngineParts {
            store: store.clone(),
            introspector: introspector.clone(),
            runtime: runtime.clone(),
            probe: probe.clone(),
            executors: shared_executor(&executor),
        },
    );
    Harness {
        engine: Arc::new(engine),
        store,
        executor,
        introspector,
        runtime,
        probe,
    }
}

fn shared_executor(executor: &Arc<RecordingExecutor>) -> ExecutorFactory {
    let shared = executor.clone();
    Arc::new(move |_conn: &DatabaseConnection, _s: &DispatchSettings| shared.clone() as Arc<dyn QueryExecutor>)
}

/// A second engine over the same registry store and container runtime, as after a process restart.
/// Nothing held in memory by the first engine carries over.
pub fn restarted(h: &Harness, settings: Settings) -> Engine {
    Engine::new(
        settings,
        EngineParts {
            store: h.store.clone(),
            introspector: h.introspector.clone(),
            runtime: h.runtime.clone(),
            probe: h.probe.clone(),
            executors: shared_executor(&h.executor),
        },
    )
}

pub fn harness() -> Harness {
    harness_with(
        test_settings(),
        ScriptedProbe::ready(),
        vec![json!({"id": 1, "email": "ada@example.com", "active": true})],
    )
}

pub async fn new_project(engine: &Engine, owner: &str, name: &str) -> Project {
    engine
        .registry()
        .create_project(
            owner,
            NewProject {
                name: name.into(),
                description: None,
                database_kind: DatabaseKind::Postgres,
            },
        )
        .await
        .unwrap()
}
