//! Live catalog reads for PostgreSQL and MySQL.

use super::normalize::{
    build_snapshot, pg_declared_type, RawCatalog, RawColumn, RawConstraintColumn, RawTable,
};
use super::types::{ConstraintKind, SchemaSnapshot, SkippedItem};
use crate::error::{is_connection_failure, AppError};
use crate::registry::{DatabaseConnection, DatabaseKind};
use crate::settings::IntrospectionSettings;
use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection};
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::{ConnectOptions, Connection, Row};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Reads a database's schema into a snapshot.
#[async_trait]
pub trait Introspector: Send + Sync {
    async fn introspect(&self, conn: &DatabaseConnection) -> Result<SchemaSnapshot, AppError>;
}

/// Introspector that opens a short-lived connection per call.
pub struct SqlIntrospector {
    connect_timeout: Duration,
}

impl SqlIntrospector {
    pub fn new(settings: &IntrospectionSettings) -> Self {
        Self {
            connect_timeout: settings.connect_timeout,
        }
    }
}

#[async_trait]
impl Introspector for SqlIntrospector {
    async fn introspect(&self, conn: &DatabaseConnection) -> Result<SchemaSnapshot, AppError> {
        let catalog = match conn.kind {
            DatabaseKind::Postgres => {
                let mut c = connect_pg(conn, self.connect_timeout).await?;
                let catalog = read_pg_catalog(&mut c).await;
                let _ = c.close().await;
                catalog?
            }
            DatabaseKind::MySql => {
                let mut c = connect_mysql(conn, self.connect_timeout).await?;
                let catalog = read_mysql_catalog(&mut c, &conn.database).await;
                let _ = c.close().await;
                catalog?
            }
        };
        let snapshot = build_snapshot(
            conn.project_id,
            conn.kind,
            &conn.database,
            catalog,
            chrono::Utc::now(),
        );
        info!(
            project_id = %conn.project_id,
            tables = snapshot.tables.len(),
            skipped = snapshot.skipped.len(),
            "introspected schema"
        );
        Ok(snapshot)
    }
}

pub(crate) fn pg_options(conn: &DatabaseConnection) -> PgConnectOptions {
    PgConnectOptions::new()
        .host(&conn.host)
        .port(conn.port)
        .database(&conn.database)
        .username(&conn.username)
        .password(conn.password.expose())
        .disable_statement_logging()
}

pub(crate) fn mysql_options(conn: &DatabaseConnection) -> MySqlConnectOptions {
    MySqlConnectOptions::new()
        .host(&conn.host)
        .port(conn.port)
        .database(&conn.database)
        .username(&conn.username)
        .password(conn.password.expose())
        .disable_statement_logging()
}

async fn connect_pg(conn: &DatabaseConnection, timeout: Duration) -> Result<PgConnection, AppError> {
    match tokio::time::timeout(timeout, pg_options(conn).connect()).await {
        Ok(Ok(c)) => Ok(c),
        Ok(Err(e)) => Err(AppError::Connection(format!("{}: {}", conn.redacted_url(), e))),
        Err(_) => Err(AppError::Connection(format!(
            "{}: connect timed out after {:?}",
            conn.redacted_url(),
            timeout
        ))),
    }
}

async fn connect_mysql(conn: &DatabaseConnection, timeout: Duration) -> Result<MySqlConnection, AppError> {
    match tokio::time::timeout(timeout, mysql_options(conn).connect()).await {
        Ok(Ok(c)) => Ok(c),
        Ok(Err(e)) => Err(AppError::Connection(format!("{}: {}", conn.redacted_url(), e))),
        Err(_) => Err(AppError::Connection(format!(
            "{}: connect timed out after {:?}",
            conn.redacted_url(),
            timeout
        ))),
    }
}

const PG_TABLES: &str = r#"
    SELECT table_schema::text AS table_schema, table_name::text AS table_name
    FROM information_schema.tables
    WHERE table_type = 'BASE TABLE'
      AND table_schema NOT IN ('pg_catalog', 'information_schema')
      AND table_schema NOT LIKE 'pg\_toast%'
      AND table_schema NOT LIKE 'pg\_temp%'
    ORDER BY table_schema, table_name
"#;

const PG_COLUMNS: &str = r#"
    SELECT a.attname::text AS column_name,
           a.attnum::int4 AS ordinal,
           format_type(CASE WHEN t.typtype = 'd' THEN t.typbasetype ELSE a.atttypid END, a.atttypmod) AS declared_type,
           format_type(a.atttypid, NULL) AS native_type,
           bt.typtype::text AS typtype,
           bt.typcategory::text AS typcategory,
           NOT a.attnotnull AS nullable,
           pg_get_expr(d.adbin, d.adrelid) AS column_default,
           (a.attidentity <> '' OR a.attgenerated <> '') AS is_identity,
           COALESCE(
               (SELECT array_agg(e.enumlabel::text ORDER BY e.enumsortorder)
                FROM pg_enum e WHERE e.enumtypid = bt.oid),
               ARRAY[]::text[]
           ) AS enum_labels
    FROM pg_attribute a
    JOIN pg_class c ON c.oid = a.attrelid
    JOIN pg_namespace n ON n.oid = c.relnamespace
    JOIN pg_type t ON t.oid = a.atttypid
    JOIN pg_type bt ON bt.oid = CASE WHEN t.typtype = 'd' THEN t.typbasetype ELSE t.oid END
    LEFT JOIN pg_attrdef d ON d.adrelid = a.attrelid AND d.adnum = a.attnum
    WHERE n.nspname = $1 AND c.relname = $2 AND a.attnum > 0 AND NOT a.attisdropped
    ORDER BY a.attnum
"#;

const PG_CONSTRAINTS: &str = r#"
    SELECT con.conname::text AS constraint_name,
           con.contype::text AS kind,
           a.attname::text AS column_name,
           k.ord::int4 AS position,
           fn.nspname::text AS ref_schema,
           fc.relname::text AS ref_table,
           fa.attname::text AS ref_column
    FROM pg_constraint con
    JOIN pg_class c ON c.oid = con.conrelid
    JOIN pg_namespace n ON n.oid = c.relnamespace
    CROSS JOIN LATERAL unnest(con.conkey) WITH ORDINALITY AS k(attnum, ord)
    JOIN pg_attribute a ON a.attrelid = con.conrelid AND a.attnum = k.attnum
    LEFT JOIN pg_class fc ON fc.oid = con.confrelid
    LEFT JOIN pg_namespace fn ON fn.oid = fc.relnamespace
    LEFT JOIN pg_attribute fa ON fa.attrelid = con.confrelid AND fa.attnum = con.confkey[k.ord]
    WHERE n.nspname = $1 AND c.relname = $2 AND con.contype IN ('p', 'f', 'u')
    ORDER BY con.conname, k.ord
"#;

async fn read_pg_catalog(conn: &mut PgConnection) -> Result<RawCatalog, AppError> {
    let tables = sqlx::query(PG_TABLES)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| catalog_error("information_schema.tables", e))?;

    let mut catalog = RawCatalog::default();
    for row in tables {
        let schema: String = row.try_get("table_schema").map_err(|e| catalog_error("tables", e))?;
        let name: String = row.try_get("table_name").map_err(|e| catalog_error("tables", e))?;
        debug!(schema = %schema, table = %name, "reading table");
        let table = read_pg_table(conn, &schema, &name).await;
        accept_table(&mut catalog, &schema, &name, table)?;
    }
    Ok(catalog)
}

async fn read_pg_table(conn: &mut PgConnection, schema: &str, name: &str) -> Result<RawTable, sqlx::Error> {
    let mut columns = Vec::new();
    for row in sqlx::query(PG_COLUMNS)
        .bind(schema)
        .bind(name)
        .fetch_all(&mut *conn)
        .await?
    {
        let format_type: String = row.try_get("declared_type")?;
        let typtype: String = row.try_get("typtype")?;
        let typcategory: String = row.try_get("typcategory")?;
        let labels: Vec<String> = row.try_get("enum_labels")?;
        columns.push(RawColumn {
            name: row.try_get("column_name")?,
            ordinal: row.try_get("ordinal")?,
            declared_type: pg_declared_type(&format_type, &typtype, &typcategory, &labels),
            native_type: row.try_get("native_type")?,
            nullable: row.try_get("nullable")?,
            default: row.try_get("column_default")?,
            identity: row.try_get::<Option<bool>, _>("is_identity")?.unwrap_or(false),
        });
    }

    let mut constraints = Vec::new();
    for row in sqlx::query(PG_CONSTRAINTS)
        .bind(schema)
        .bind(name)
        .fetch_all(&mut *conn)
        .await?
    {
        let kind: String = row.try_get("kind")?;
        let Some(kind) = constraint_kind(&kind) else { continue };
        constraints.push(RawConstraintColumn {
            name: row.try_get("constraint_name")?,
            kind,
            column: row.try_get("column_name")?,
            position: row.try_get("position")?,
            ref_schema: row.try_get("ref_schema")?,
            ref_table: row.try_get("ref_table")?,
            ref_column: row.try_get("ref_column")?,
        });
    }

    Ok(RawTable {
        schema: schema.to_string(),
        name: name.to_string(),
        columns,
        constraints,
    })
}

// CAST to CHAR: information_schema columns come back as binary strings under some collations
const MYSQL_TABLES: &str = r#"
    SELECT CAST(TABLE_SCHEMA AS CHAR(255)) AS table_schema,
           CAST(TABLE_NAME AS CHAR(255)) AS table_name
    FROM INFORMATION_SCHEMA.TABLES
    WHERE TABLE_SCHEMA = ? AND TABLE_TYPE = 'BASE TABLE'
    ORDER BY TABLE_NAME
"#;

const MYSQL_COLUMNS: &str = r#"
    SELECT CAST(COLUMN_NAME AS CHAR(255)) AS column_name,
           CAST(ORDINAL_POSITION AS SIGNED) AS ordinal,
           CAST(COLUMN_TYPE AS CHAR) AS declared_type,
           CAST(CONCAT(DATA_TYPE, IF(COLUMN_TYPE LIKE '%unsigned%', ' unsigned', '')) AS CHAR(64)) AS native_type,
           CAST(IF(IS_NULLABLE = 'YES', 1, 0) AS SIGNED) AS nullable,
           CAST(COLUMN_DEFAULT AS CHAR) AS column_default,
           CAST(IF(EXTRA LIKE '%auto_increment%' OR EXTRA LIKE '%GENERATED%', 1, 0) AS SIGNED) AS is_identity
    FROM INFORMATION_SCHEMA.COLUMNS
    WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?
    ORDER BY ORDINAL_POSITION
"#;

const MYSQL_CONSTRAINTS: &str = r#"
    SELECT CAST(k.CONSTRAINT_NAME AS CHAR(255)) AS constraint_name,
           CAST(tc.CONSTRAINT_TYPE AS CHAR(32)) AS kind,
           CAST(k.COLUMN_NAME AS CHAR(255)) AS column_name,
           CAST(k.ORDINAL_POSITION AS SIGNED) AS position,
           CAST(k.REFERENCED_TABLE_SCHEMA AS CHAR(255)) AS ref_schema,
           CAST(k.REFERENCED_TABLE_NAME AS CHAR(255)) AS ref_table,
           CAST(k.REFERENCED_COLUMN_NAME AS CHAR(255)) AS ref_column
    FROM INFORMATION_SCHEMA.KEY_COLUMN_USAGE k
    JOIN INFORMATION_SCHEMA.TABLE_CONSTRAINTS tc
      ON tc.CONSTRAINT_SCHEMA = k.CONSTRAINT_SCHEMA
     AND tc.TABLE_NAME = k.TABLE_NAME
     AND tc.CONSTRAINT_NAME = k.CONSTRAINT_NAME
    WHERE k.TABLE_SCHEMA = ? AND k.TABLE_NAME = ?
      AND tc.CONSTRAINT_TYPE IN ('PRIMARY KEY', 'FOREIGN KEY', 'UNIQUE')
    ORDER BY k.CONSTRAINT_NAME, k.ORDINAL_POSITION
"#;

async fn read_mysql_catalog(conn: &mut MySqlConnection, database: &str) -> Result<RawCatalog, AppError> {
    let tables = sqlx::query(MYSQL_TABLES)
        .bind(database)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| catalog_error("INFORMATION_SCHEMA.TABLES", e))?;

    let mut catalog = RawCatalog::default();
    for row in tables {
        let schema: String = row.try_get("table_schema").map_err(|e| catalog_error("tables", e))?;
        let name: String = row.try_get("table_name").map_err(|e| catalog_error("tables", e))?;
        debug!(schema = %schema, table = %name, "reading table");
        let table = read_mysql_table(conn, &schema, &name).await;
        accept_table(&mut catalog, &schema, &name, table)?;
    }
    Ok(catalog)
}

async fn read_mysql_table(conn: &mut MySqlConnection, schema: &str, name: &str) -> Result<RawTable, sqlx::Error> {
    let mut columns = Vec::new();
    for row in sqlx::query(MYSQL_COLUMNS)
        .bind(schema)
        .bind(name)
        .fetch_all(&mut *conn)
        .await?
    {
        let ordinal: i64 = row.try_get("ordinal")?;
        columns.push(RawColumn {
            name: row.try_get("column_name")?,
            ordinal: ordinal as i32,
            declared_type: row.try_get("declared_type")?,
            native_type: row.try_get("native_type")?,
            nullable: row.try_get::<i64, _>("nullable")? == 1,
            default: row.try_get("column_default")?,
            identity: row.try_get::<i64, _>("is_identity")? == 1,
        });
    }

    let mut constraints = Vec::new();
    for row in sqlx::query(MYSQL_CONSTRAINTS)
        .bind(schema)
        .bind(name)
        .fetch_all(&mut *conn)
        .await?
    {
        let kind: String = row.try_get("kind")?;
        let Some(kind) = constraint_kind(&kind) else { continue };
        let position: i64 = row.try_get("position")?;
        constraints.push(RawConstraintColumn {
            name: row.try_get("constraint_name")?,
            kind,
            column: row.try_get("column_name")?,
            position: position as i32,
            ref_schema: row.try_get("ref_schema")?,
            ref_table: row.try_get("ref_table")?,
            ref_column: row.try_get("ref_column")?,
        });
    }

    Ok(RawTable {
        schema: schema.to_string(),
        name: name.to_string(),
        columns,
        constraints,
    })
}

fn constraint_kind(s: &str) -> Option<ConstraintKind> {
    match s {
        "p" | "PRIMARY KEY" => Some(ConstraintKind::PrimaryKey),
        "f" | "FOREIGN KEY" => Some(ConstraintKind::ForeignKey),
        "u" | "UNIQUE" => Some(ConstraintKind::Unique),
        _ => None,
    }
}

fn catalog_error(what: &str, e: sqlx::Error) -> AppError {
    if is_connection_failure(&e) {
        return AppError::Connection(format!("reading {}: {}", what, e));
    }
    AppError::Introspection {
        table: what.to_string(),
        column: None,
        message: e.to_string(),
    }
}

/// A lost connection aborts the whole read; any other error skips just this table.
fn accept_table(
    catalog: &mut RawCatalog,
    schema: &str,
    name: &str,
    table: Result<RawTable, sqlx::Error>,
) -> Result<(), AppError> {
    match table {
        Ok(t) => catalog.tables.push(t),
        Err(e) if is_connection_failure(&e) => {
            return Err(AppError::Connection(format!(
                "connection lost while reading {}.{}: {}",
                schema, name, e
            )))
        }
        Err(e) => skip_table(catalog, schema, name, e),
    }
    Ok(())
}

fn skip_table(catalog: &mut RawCatalog, schema: &str, name: &str, e: sqlx::Error) {
    let err = AppError::Introspection {
        table: format!("{}.{}", schema, name),
        column: None,
        message: e.to_string(),
    };
    warn!(error = %err, "skipping table");
    catalog.failed.push(SkippedItem {
        table: format!("{}.{}", schema, name),
        column: None,
        reason: err.to_string(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constraint_kinds_from_both_catalogs() {
        assert_eq!(constraint_kind("p"), Some(ConstraintKind::PrimaryKey));
        assert_eq!(constraint_kind("FOREIGN KEY"), Some(ConstraintKind::ForeignKey));
        assert_eq!(constraint_kind("c"), None);
    }

    fn raw_table(name: &str) -> RawTable {
        RawTable {
            schema: "public".into(),
            name: name.into(),
            columns: Vec::new(),
            constraints: Vec::new(),
        }
    }

    #[test]
    fn dropped_connection_aborts_the_read() {
        let mut catalog = RawCatalog::default();
        accept_table(&mut catalog, "public", "users", Ok(raw_table("users"))).unwrap();
        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err = accept_table(&mut catalog, "public", "orders", Err(sqlx::Error::Io(reset))).unwrap_err();
        assert_eq!(err.code(), "connection_error");
        assert!(catalog.failed.is_empty());

        let err = accept_table(&mut catalog, "public", "orders", Err(sqlx::Error::PoolClosed)).unwrap_err();
        assert_eq!(err.code(), "connection_error");
    }

    #[test]
    fn decode_error_skips_only_that_table() {
        let mut catalog = RawCatalog::default();
        let err = sqlx::Error::ColumnNotFound("enum_labels".into());
        accept_table(&mut catalog, "public", "odd", Err(err)).unwrap();
        accept_table(&mut catalog, "public", "users", Ok(raw_table("users"))).unwrap();
        assert_eq!(catalog.tables.len(), 1);
        assert_eq!(catalog.failed.len(), 1);
        assert_eq!(catalog.failed[0].table, "public.odd");
    }

    #[test]
    fn catalog_query_transport_failure_is_a_connection_error() {
        assert_eq!(catalog_error("tables", sqlx::Error::PoolTimedOut).code(), "connection_error");
        assert_eq!(
            catalog_error("tables", sqlx::Error::RowNotFound).code(),
            "introspection_error"
        );
    }

    #[tokio::test]
    async fn unreachable_database_is_a_connection_error() {
        let introspector = SqlIntrospector::new(&IntrospectionSettings {
            connect_timeout: Duration::from_millis(500),
        });
        let conn = DatabaseConnection {
            project_id: uuid::Uuid::new_v4(),
            kind: DatabaseKind::Postgres,
            host: "127.0.0.1".into(),
            port: 1,
            database: "nowhere".into(),
            username: "nobody".into(),
            password: crate::registry::Secret::new("secret-value"),
        };
        let err = introspector.introspect(&conn).await.unwrap_err();
        assert_eq!(err.code(), "connection_error");
        assert!(!err.to_string().contains("secret-value"));
    }
}
