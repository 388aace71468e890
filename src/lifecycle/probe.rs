//! Readiness and health probing of a project's database.

use crate::error::AppError;
use crate::registry::{DatabaseConnection, DatabaseKind};
use crate::schema::{mysql_options, pg_options};
use async_trait::async_trait;
use sqlx::{ConnectOptions, Connection};
use std::time::Duration;

#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    /// Ok once the database accepts a connection and answers a trivial query.
    async fn check(&self, conn: &DatabaseConnection) -> Result<(), AppError>;
}

/// Opens a fresh connection and runs `SELECT 1`, bounded by a timeout.
pub struct SqlProbe {
    timeout: Duration,
}

impl SqlProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

async fn select_one(conn: &DatabaseConnection) -> Result<(), sqlx::Error> {
    match conn.kind {
        DatabaseKind::Postgres => {
            let mut c = pg_options(conn).connect().await?;
            sqlx::query("SELECT 1").execute(&mut c).await?;
            c.close().await
        }
        DatabaseKind::MySql => {
            let mut c = mysql_options(conn).connect().await?;
            sqlx::query("SELECT 1").execute(&mut c).await?;
            c.close().await
        }
    }
}

#[async_trait]
impl ReadinessProbe for SqlProbe {
    async fn check(&self, conn: &DatabaseConnection) -> Result<(), AppError> {
        match tokio::time::timeout(self.timeout, select_one(conn)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(AppError::Connection(format!("{}: {}", conn.redacted_url(), e))),
            Err(_) => Err(AppError::Connection(format!(
                "{}: probe timed out after {:?}",
                conn.redacted_url(),
                self.timeout
            ))),
        }
    }
}
