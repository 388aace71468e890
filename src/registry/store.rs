//! Persistence for projects, connection records and container instances.
//!
//! `PgProjectStore` keeps its `_sys_*` tables in the registry schema and creates them
//! on startup; `MemoryProjectStore` backs tests and runs without `DATABASE_URL`.

use super::model::{ContainerInstance, Project, StoredConnection};
use crate::error::AppError;
use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

#[async_trait]
pub trait ProjectStore: Send + Sync {
    /// Fails with `Conflict` when the owner already has a project with this name.
    async fn insert_project(&self, project: &Project) -> Result<(), AppError>;
    async fn update_project(&self, project: &Project) -> Result<(), AppError>;
    async fn get_project(&self, id: Uuid) -> Result<Option<Project>, AppError>;
    async fn list_projects(&self, owner_id: &str) -> Result<Vec<Project>, AppError>;
    /// Also drops the project's connection record.
    async fn delete_project(&self, id: Uuid) -> Result<bool, AppError>;

    async fn save_connection(&self, conn: &StoredConnection) -> Result<(), AppError>;
    async fn get_connection(&self, project_id: Uuid) -> Result<Option<StoredConnection>, AppError>;
    async fn list_connected(&self) -> Result<Vec<Uuid>, AppError>;
    async fn delete_connection(&self, project_id: Uuid) -> Result<bool, AppError>;

    async fn save_instance(&self, instance: &ContainerInstance) -> Result<(), AppError>;
    async fn get_instance(&self, project_id: Uuid) -> Result<Option<ContainerInstance>, AppError>;
    async fn list_instances(&self) -> Result<Vec<ContainerInstance>, AppError>;
}

pub struct PgProjectStore {
    pool: PgPool,
    schema: String,
}

impl PgProjectStore {
    /// `schema` must be a plain identifier; settings validation guarantees it.
    pub fn new(pool: PgPool, schema: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
        }
    }

    fn table(&self, name: &str) -> String {
        format!("{}.{}", self.schema, name)
    }

    /// Create the registry schema and `_sys_*` tables if missing.
    pub async fn ensure_tables(&self) -> Result<(), AppError> {
        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", self.schema))
            .execute(&self.pool)
            .await
            .map_err(AppError::registry)?;

        let ddl = [
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {} (
                    id UUID PRIMARY KEY,
                    owner_id TEXT NOT NULL,
                    name TEXT NOT NULL,
                    payload JSONB NOT NULL,
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    UNIQUE (owner_id, name)
                )
                "#,
                self.table("_sys_projects")
            ),
            format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS _sys_projects_owner_lower_name ON {} (owner_id, lower(name))",
                self.table("_sys_projects")
            ),
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {} (
                    project_id UUID PRIMARY KEY REFERENCES {}(id) ON DELETE CASCADE,
                    host TEXT NOT NULL,
                    port INTEGER NOT NULL,
                    database_name TEXT NOT NULL,
                    username TEXT NOT NULL,
                    password_sealed TEXT NOT NULL,
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )
                "#,
                self.table("_sys_connections"),
                self.table("_sys_projects")
            ),
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {} (
                    project_id UUID PRIMARY KEY,
                    state TEXT NOT NULL,
                    payload JSONB NOT NULL,
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )
                "#,
                self.table("_sys_instances")
            ),
        ];
        for stmt in &ddl {
            sqlx::query(stmt).execute(&self.pool).await.map_err(AppError::registry)?;
        }
        tracing::info!(schema = %self.schema, "registry tables ready");
        Ok(())
    }
}

fn conflict_or_registry(err: sqlx::Error, name: &str) -> AppError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            AppError::Conflict(format!("a project named '{}' already exists", name))
        }
        _ => AppError::registry(err),
    }
}

#[async_trait]
impl ProjectStore for PgProjectStore {
    async fn insert_project(&self, project: &Project) -> Result<(), AppError> {
        let sql = format!(
            "INSERT INTO {} (id, owner_id, name, payload, updated_at) VALUES ($1, $2, $3, $4, $5)",
            self.table("_sys_projects")
        );
        sqlx::query(&sql)
            .bind(project.id)
            .bind(&project.owner_id)
            .bind(&project.name)
            .bind(Json(project))
            .bind(project.updated_at)
            .execute(&self.pool)
            .await
            .map_err(|e| conflict_or_registry(e, &project.name))?;
        Ok(())
    }

    async fn update_project(&self, project: &Project) -> Result<(), AppError> {
        let sql = format!(
            "UPDATE {} SET name = $2, payload = $3, updated_at = $4 WHERE id = $1",
            self.table("_sys_projects")
        );
        sqlx::query(&sql)
            .bind(project.id)
            .bind(&project.name)
            .bind(Json(project))
            .bind(project.updated_at)
            .execute(&self.pool)
            .await
            .map_err(|e| conflict_or_registry(e, &project.name))?;
        Ok(())
    }

    async fn get_project(&self, id: Uuid) -> Result<Option<Project>, AppError> {
        let sql = format!("SELECT payload FROM {} WHERE id = $1", self.table("_sys_projects"));
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(AppError::registry)?;
        row.map(|r| r.try_get::<Json<Project>, _>("payload").map(|j| j.0))
            .transpose()
            .map_err(AppError::registry)
    }

    async fn list_projects(&self, owner_id: &str) -> Result<Vec<Project>, AppError> {
        let sql = format!(
            "SELECT payload FROM {} WHERE owner_id = $1 ORDER BY name",
            self.table("_sys_projects")
        );
        let rows = sqlx::query(&sql)
            .bind(owner_id)
            .fetch_all(&self.pool)
            .await
            .map_err(AppError::registry)?;
        rows.iter()
            .map(|r| r.try_get::<Json<Project>, _>("payload").map(|j| j.0))
            .collect::<Result<_, _>>()
            .map_err(AppError::registry)
    }

    async fn delete_project(&self, id: Uuid) -> Result<bool, AppError> {
        let sql = format!("DELETE FROM {} WHERE id = $1", self.table("_sys_projects"));
        let res = sqlx::query(&sql)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(AppError::registry)?;
        Ok(res.rows_affected() > 0)
    }

    async fn save_connection(&self, conn: &StoredConnection) -> Result<(), AppError> {
        let sql = format!(
            r#"
            INSERT INTO {} (project_id, host, port, database_name, username, password_sealed, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, NOW())
            ON CONFLICT (project_id) DO UPDATE SET
                host = EXCLUDED.host, port = EXCLUDED.port, database_name = EXCLUDED.database_name,
                username = EXCLUDED.username, password_sealed = EXCLUDED.password_sealed, updated_at = NOW()
            "#,
            self.table("_sys_connections")
        );
        sqlx::query(&sql)
            .bind(conn.project_id)
            .bind(&conn.host)
            .bind(conn.port as i32)
            .bind(&conn.database)
            .bind(&conn.username)
            .bind(&conn.password_sealed)
            .execute(&self.pool)
            .await
            .map_err(AppError::registry)?;
        Ok(())
    }

    async fn get_connection(&self, project_id: Uuid) -> Result<Option<StoredConnection>, AppError> {
        let sql = format!(
            "SELECT host, port, database_name, username, password_sealed FROM {} WHERE project_id = $1",
            self.table("_sys_connections")
        );
        let row = sqlx::query(&sql)
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(AppError::registry)?;
        let Some(r) = row else { return Ok(None) };
        let port: i32 = r.try_get("port").map_err(AppError::registry)?;
        Ok(Some(StoredConnection {
            project_id,
            host: r.try_get("host").map_err(AppError::registry)?,
            port: u16::try_from(port).map_err(|_| AppError::Registry(format!("stored port {} out of range", port)))?,
            database: r.try_get("database_name").map_err(AppError::registry)?,
            username: r.try_get("username").map_err(AppError::registry)?,
            password_sealed: r.try_get("password_sealed").map_err(AppError::registry)?,
        }))
    }

    async fn list_connected(&self) -> Result<Vec<Uuid>, AppError> {
        let sql = format!("SELECT project_id FROM {} ORDER BY project_id", self.table("_sys_connections"));
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(AppError::registry)?;
        rows.iter()
            .map(|r| r.try_get::<Uuid, _>("project_id"))
            .collect::<Result<_, _>>()
            .map_err(AppError::registry)
    }

    async fn delete_connection(&self, project_id: Uuid) -> Result<bool, AppError> {
        let sql = format!("DELETE FROM {} WHERE project_id = $1", self.table("_sys_connections"));
        let res = sqlx::query(&sql)
            .bind(project_id)
            .execute(&self.pool)
            .await
            .map_err(AppError::registry)?;
        Ok(res.rows_affected() > 0)
    }

    async fn save_instance(&self, instance: &ContainerInstance) -> Result<(), AppError> {
        let sql = format!(
            r#"
            INSERT INTO {} (project_id, state, payload, updated_at) VALUES ($1, $2, $3, $4)
            ON CONFLICT (project_id) DO UPDATE SET
                state = EXCLUDED.state, payload = EXCLUDED.payload, updated_at = EXCLUDED.updated_at
            "#,
            self.table("_sys_instances")
        );
        sqlx::query(&sql)
            .bind(instance.project_id)
            .bind(instance.state.as_str())
            .bind(Json(instance))
            .bind(instance.updated_at)
            .execute(&self.pool)
            .await
            .map_err(AppError::registry)?;
        Ok(())
    }

    async fn get_instance(&self, project_id: Uuid) -> Result<Option<ContainerInstance>, AppError> {
        let sql = format!("SELECT payload FROM {} WHERE project_id = $1", self.table("_sys_instances"));
        let row = sqlx::query(&sql)
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(AppError::registry)?;
        row.map(|r| r.try_get::<Json<ContainerInstance>, _>("payload").map(|j| j.0))
            .transpose()
            .map_err(AppError::registry)
    }

    async fn list_instances(&self) -> Result<Vec<ContainerInstance>, AppError> {
        let sql = format!("SELECT payload FROM {} ORDER BY project_id", self.table("_sys_instances"));
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(AppError::registry)?;
        rows.iter()
            .map(|r| r.try_get::<Json<ContainerInstance>, _>("payload").map(|j| j.0))
            .collect::<Result<_, _>>()
            .map_err(AppError::registry)
    }
}

#[derive(Default)]
struct MemoryTables {
    projects: HashMap<Uuid, Project>,
    connections: HashMap<Uuid, StoredConnection>,
    instances: HashMap<Uuid, ContainerInstance>,
}

/// In-process store. Contents are lost on restart.
#[derive(Default)]
pub struct MemoryProjectStore {
    tables: Mutex<MemoryTables>,
}

impl MemoryProjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryTables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn name_taken(tables: &MemoryTables, project: &Project) -> bool {
    tables
        .projects
        .values()
        .any(|p| p.id != project.id && p.owner_id == project.owner_id && p.name.to_lowercase() == project.name.to_lowercase())
}

#[async_trait]
impl ProjectStore for MemoryProjectStore {
    async fn insert_project(&self, project: &Project) -> Result<(), AppError> {
        let mut t = self.lock();
        if name_taken(&t, project) {
            return Err(AppError::Conflict(format!("a project named '{}' already exists", project.name)));
        }
        t.projects.insert(project.id, project.clone());
        Ok(())
    }

    async fn update_project(&self, project: &Project) -> Result<(), AppError> {
        let mut t = self.lock();
        if name_taken(&t, project) {
            return Err(AppError::Conflict(format!("a project named '{}' already exists", project.name)));
        }
        if let Some(p) = t.projects.get_mut(&project.id) {
            *p = project.clone();
        }
        Ok(())
    }

    async fn get_project(&self, id: Uuid) -> Result<Option<Project>, AppError> {
        Ok(self.lock().projects.get(&id).cloned())
    }

    async fn list_projects(&self, owner_id: &str) -> Result<Vec<Project>, AppError> {
        let mut out: Vec<Project> = self
            .lock()
            .projects
            .values()
            .filter(|p| p.owner_id == owner_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn delete_project(&self, id: Uuid) -> Result<bool, AppError> {
        let mut t = self.lock();
        t.connections.remove(&id);
        Ok(t.projects.remove(&id).is_some())
    }

    async fn save_connection(&self, conn: &StoredConnection) -> Result<(), AppError> {
        self.lock().connections.insert(conn.project_id, conn.clone());
        Ok(())
    }

    async fn get_connection(&self, project_id: Uuid) -> Result<Option<StoredConnection>, AppError> {
        Ok(self.lock().connections.get(&project_id).cloned())
    }

    async fn list_connected(&self) -> Result<Vec<Uuid>, AppError> {
        let mut out: Vec<Uuid> = self.lock().connections.keys().copied().collect();
        out.sort();
        Ok(out)
    }

    async fn delete_connection(&self, project_id: Uuid) -> Result<bool, AppError> {
        Ok(self.lock().connections.remove(&project_id).is_some())
    }

    async fn save_instance(&self, instance: &ContainerInstance) -> Result<(), AppError> {
        self.lock().instances.insert(instance.project_id, instance.clone());
        Ok(())
    }

    async fn get_instance(&self, project_id: Uuid) -> Result<Option<ContainerInstance>, AppError> {
        Ok(self.lock().instances.get(&project_id).cloned())
    }

    async fn list_instances(&self) -> Result<Vec<ContainerInstance>, AppError> {
        let mut out: Vec<ContainerInstance> = self.lock().instances.values().cloned().collect();
        out.sort_by_key(|i| i.project_id);
        Ok(out)
    }
}
