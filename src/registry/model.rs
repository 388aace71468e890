//! Project registry records.

use crate::lifecycle::LifecycleState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Relational engine backing a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseKind {
    #[serde(alias = "postgresql")]
    Postgres,
    MySql,
}

impl DatabaseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseKind::Postgres => "postgres",
            DatabaseKind::MySql => "mysql",
        }
    }

    /// Port the engine listens on inside its container.
    pub fn container_port(&self) -> u16 {
        match self {
            DatabaseKind::Postgres => 5432,
            DatabaseKind::MySql => 3306,
        }
    }
}

impl fmt::Display for DatabaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatabaseKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(DatabaseKind::Postgres),
            "mysql" => Ok(DatabaseKind::MySql),
            other => Err(format!("unknown database kind '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Project {
    pub id: Uuid,
    pub owner_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub database_kind: DatabaseKind,
    pub database_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Body of a project creation request.
#[derive(Debug, Clone, Deserialize)]
pub struct NewProject {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub database_kind: DatabaseKind,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProjectPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// String whose contents never reach logs or `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(s: impl Into<String>) -> Self {
        Secret(s.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

/// Credentials for a project's database.
#[derive(Debug, Clone)]
pub struct DatabaseConnection {
    pub project_id: Uuid,
    pub kind: DatabaseKind,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: Secret,
}

impl DatabaseConnection {
    /// Full connection string including the password.
    pub fn connection_string(&self) -> Secret {
        Secret(self.url_with_password(&percent_encode(self.password.expose())))
    }

    /// Connection string safe for logs and API responses.
    pub fn redacted_url(&self) -> String {
        self.url_with_password("***")
    }

    /// View for API responses: everything but the password.
    pub fn info(&self, managed: bool) -> ConnectionInfo {
        ConnectionInfo {
            project_id: self.project_id,
            kind: self.kind,
            host: self.host.clone(),
            port: self.port,
            database: self.database.clone(),
            username: self.username.clone(),
            password: "***",
            connection_url: self.redacted_url(),
            managed,
        }
    }

    fn url_with_password(&self, password: &str) -> String {
        format!(
            "{}://{}:{}@{}:{}/{}",
            self.kind.as_str(),
            percent_encode(&self.username),
            password,
            self.host,
            self.port,
            self.database
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub project_id: Uuid,
    pub kind: DatabaseKind,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: &'static str,
    pub connection_url: String,
    /// True when the database runs in an instance this service provisioned.
    pub managed: bool,
}

/// Persisted form of a connection; the password is sealed with the registry key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredConnection {
    pub project_id: Uuid,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_sealed: String,
}

/// Credentials supplied by a caller for an existing database.
#[derive(Debug, Clone, Deserialize)]
pub struct AttachConnection {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ResourceLimits {
    pub memory_mb: u32,
    pub cpu_share: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContainerInstance {
    pub project_id: Uuid,
    /// Runtime-assigned id; absent until the runtime has created the container.
    pub instance_id: Option<String>,
    pub container_name: String,
    pub network_name: String,
    pub volume_name: String,
    pub host_port: Option<u16>,
    pub state: LifecycleState,
    pub limits: ResourceLimits,
    pub last_health_at: Option<DateTime<Utc>>,
    pub health_failures: u32,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ContainerInstance {
    pub fn new(project_id: Uuid, limits: ResourceLimits) -> Self {
        let short = short_id(project_id);
        Self {
            project_id,
            instance_id: None,
            container_name: format!("synth-db-{}", short),
            network_name: format!("synth-net-{}", short),
            volume_name: format!("synth-vol-{}", short),
            host_port: None,
            state: LifecycleState::Requested,
            limits,
            last_health_at: None,
            health_failures: 0,
            last_error: None,
            updated_at: Utc::now(),
        }
    }
}

/// First 12 hex digits of a project id; used for runtime object names.
pub fn short_id(id: Uuid) -> String {
    id.simple().to_string()[..12].to_string()
}

/// `db_<name>`: lowercase, spaces and hyphens become underscores.
pub fn database_name_for(project_name: &str) -> String {
    let sanitized: String = project_name
        .trim()
        .chars()
        .map(|c| match c {
            ' ' | '-' => '_',
            c => c.to_ascii_lowercase(),
        })
        .collect();
    format!("db_{}", sanitized)
}

fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}
