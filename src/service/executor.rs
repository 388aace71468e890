//! Statement execution against a project's database.

use super::rows::{mysql_row_to_json, pg_row_to_json};
use crate::error::AppError;
use crate::registry::{DatabaseConnection, DatabaseKind};
use crate::schema::{mysql_options, pg_options};
use crate::settings::DispatchSettings;
use crate::sql::QueryBuf;
use crate::synth::FieldDef;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::mysql::{MySql, MySqlPool, MySqlPoolOptions};
use sqlx::postgres::{PgPool, PgPoolOptions, Postgres};
use sqlx::Row;

/// Runs built statements. One executor per project; its pool is closed on unregister.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn fetch_rows(&self, stmt: &QueryBuf, fields: &[FieldDef]) -> Result<Vec<Value>, AppError>;

    async fn fetch_count(&self, stmt: &QueryBuf) -> Result<u64, AppError>;

    /// Runs every step in one transaction and returns the row of the step marked `returns_row`.
    async fn execute_write(&self, steps: &[QueryBuf], fields: &[FieldDef]) -> Result<Option<Value>, AppError>;

    async fn close(&self);
}

pub enum DbPool {
    Postgres(PgPool),
    MySql(MySqlPool),
}

pub struct SqlExecutor {
    pool: DbPool,
}

impl SqlExecutor {
    /// Bounded pool; connections are opened on first use.
    pub fn connect_lazy(conn: &DatabaseConnection, settings: &DispatchSettings) -> Self {
        let pool = match conn.kind {
            DatabaseKind::Postgres => DbPool::Postgres(
                PgPoolOptions::new()
                    .max_connections(settings.pool_max_connections)
                    .acquire_timeout(settings.acquire_timeout)
                    .connect_lazy_with(pg_options(conn)),
            ),
            DatabaseKind::MySql => DbPool::MySql(
                MySqlPoolOptions::new()
                    .max_connections(settings.pool_max_connections)
                    .acquire_timeout(settings.acquire_timeout)
                    .connect_lazy_with(mysql_options(conn)),
            ),
        };
        Self { pool }
    }
}

fn pg_query(q: &QueryBuf) -> sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments> {
    let mut query = sqlx::query::<Postgres>(&q.sql);
    for p in &q.params {
        query = query.bind(p.clone());
    }
    query
}

fn mysql_query(q: &QueryBuf) -> sqlx::query::Query<'_, MySql, sqlx::mysql::MySqlArguments> {
    let mut query = sqlx::query::<MySql>(&q.sql);
    for p in &q.params {
        query = query.bind(p.clone());
    }
    query
}

#[async_trait]
impl QueryExecutor for SqlExecutor {
    async fn fetch_rows(&self, stmt: &QueryBuf, fields: &[FieldDef]) -> Result<Vec<Value>, AppError> {
        tracing::debug!(sql = %stmt.sql, params = ?stmt.params, "query");
        match &self.pool {
            DbPool::Postgres(pool) => {
                let rows = pg_query(stmt).fetch_all(pool).await.map_err(AppError::from_query)?;
                rows.iter().map(|r| pg_row_to_json(r, fields)).collect()
            }
            DbPool::MySql(pool) => {
                let rows = mysql_query(stmt).fetch_all(pool).await.map_err(AppError::from_query)?;
                rows.iter().map(|r| mysql_row_to_json(r, fields)).collect()
            }
        }
    }

    async fn fetch_count(&self, stmt: &QueryBuf) -> Result<u64, AppError> {
        tracing::debug!(sql = %stmt.sql, params = ?stmt.params, "count");
        let total: i64 = match &self.pool {
            DbPool::Postgres(pool) => pg_query(stmt)
                .fetch_one(pool)
                .await
                .and_then(|r| r.try_get("total"))
                .map_err(AppError::from_query)?,
            DbPool::MySql(pool) => mysql_query(stmt)
                .fetch_one(pool)
                .await
                .and_then(|r| r.try_get("total"))
                .map_err(AppError::from_query)?,
        };
        Ok(total.max(0) as u64)
    }

    async fn execute_write(&self, steps: &[QueryBuf], fields: &[FieldDef]) -> Result<Option<Value>, AppError> {
        let mut out = None;
        match &self.pool {
            DbPool::Postgres(pool) => {
                let mut tx = pool.begin().await.map_err(AppError::from_query)?;
                for step in steps {
                    tracing::debug!(sql = %step.sql, params = ?step.params, "query (tx)");
                    if step.returns_row {
                        let row = pg_query(step)
                            .fetch_optional(&mut *tx)
                            .await
                            .map_err(AppError::from_query)?;
                        out = row.map(|r| pg_row_to_json(&r, fields)).transpose()?;
                    } else {
                        pg_query(step).execute(&mut *tx).await.map_err(AppError::from_query)?;
                    }
                }
                tx.commit().await.map_err(AppError::from_query)?;
            }
            DbPool::MySql(pool) => {
                let mut tx = pool.begin().await.map_err(AppError::from_query)?;
                for step in steps {
                    tracing::debug!(sql = %step.sql, params = ?step.params, "query (tx)");
                    if step.returns_row {
                        let row = mysql_query(step)
                            .fetch_optional(&mut *tx)
                            .await
                            .map_err(AppError::from_query)?;
                        out = row.map(|r| mysql_row_to_json(&r, fields)).transpose()?;
                    } else {
                        mysql_query(step).execute(&mut *tx).await.map_err(AppError::from_query)?;
                    }
                }
                tx.commit().await.map_err(AppError::from_query)?;
            }
        }
        Ok(out)
    }

    async fn close(&self) {
        match &self.pool {
            DbPool::Postgres(pool) => pool.close().await,
            DbPool::MySql(pool) => pool.close().await,
        }
    }
}
