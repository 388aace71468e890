//! Typed errors and HTTP mapping.

use crate::lifecycle::LifecycleState;
use crate::typemap::UnsupportedTypeError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}'")]
    Invalid { key: &'static str, value: String },
    #[error("invalid port range {start}..={end}")]
    PortRange { start: u16, end: u16 },
}

/// Stable sub-codes for failures reported by a project's own database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamCode {
    ConstraintViolation,
    ConnectionLost,
    PoolTimeout,
    ProjectUnavailable,
    QueryFailed,
}

impl UpstreamCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpstreamCode::ConstraintViolation => "constraint_violation",
            UpstreamCode::ConnectionLost => "connection_lost",
            UpstreamCode::PoolTimeout => "pool_timeout",
            UpstreamCode::ProjectUnavailable => "project_unavailable",
            UpstreamCode::QueryFailed => "query_failed",
        }
    }

    /// Reads may be retried once on these.
    pub fn is_transient(&self) -> bool {
        matches!(self, UpstreamCode::ConnectionLost | UpstreamCode::PoolTimeout)
    }
}

impl std::fmt::Display for UpstreamCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport, protocol and pool failures, as opposed to errors about a statement.
pub(crate) fn is_connection_failure(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolClosed
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::WorkerCrashed
    )
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("connection: {0}")]
    Connection(String),
    #[error("introspection of {table}: {message}")]
    Introspection {
        table: String,
        column: Option<String>,
        message: String,
    },
    #[error(transparent)]
    UnsupportedType(#[from] UnsupportedTypeError),
    #[error("validation: {parameter}: {message}")]
    Validation { parameter: String, message: String },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("upstream ({code}): {message}")]
    Upstream { code: UpstreamCode, message: String },
    #[error("project {project_id} is {state}; cannot {command}")]
    InvalidState {
        project_id: Uuid,
        state: LifecycleState,
        command: &'static str,
    },
    #[error("provisioning: {0}")]
    Provisioning(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("registry: {0}")]
    Registry(String),
}

impl AppError {
    pub fn validation(parameter: impl Into<String>, message: impl Into<String>) -> Self {
        AppError::Validation {
            parameter: parameter.into(),
            message: message.into(),
        }
    }

    pub fn upstream(code: UpstreamCode, message: impl Into<String>) -> Self {
        AppError::Upstream {
            code,
            message: message.into(),
        }
    }

    pub fn project_unavailable(project_id: Uuid) -> Self {
        AppError::upstream(
            UpstreamCode::ProjectUnavailable,
            format!("project {} database is unavailable", project_id),
        )
    }

    /// Classify a driver error raised while serving a data request.
    pub fn from_query(err: sqlx::Error) -> Self {
        let code = match &err {
            sqlx::Error::Database(db) => match db.kind() {
                sqlx::error::ErrorKind::UniqueViolation
                | sqlx::error::ErrorKind::ForeignKeyViolation
                | sqlx::error::ErrorKind::NotNullViolation
                | sqlx::error::ErrorKind::CheckViolation => UpstreamCode::ConstraintViolation,
                _ => UpstreamCode::QueryFailed,
            },
            sqlx::Error::PoolTimedOut => UpstreamCode::PoolTimeout,
            e if is_connection_failure(e) => UpstreamCode::ConnectionLost,
            _ => UpstreamCode::QueryFailed,
        };
        AppError::upstream(code, err.to_string())
    }

    pub fn registry(err: sqlx::Error) -> Self {
        AppError::Registry(err.to_string())
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Connection(_) => "connection_error",
            AppError::Introspection { .. } => "introspection_error",
            AppError::UnsupportedType(_) => "unsupported_type",
            AppError::Validation { .. } => "validation_error",
            AppError::NotFound(_) => "not_found",
            AppError::Upstream { .. } => "upstream_error",
            AppError::InvalidState { .. } => "invalid_state",
            AppError::Provisioning(_) => "provisioning_error",
            AppError::Config(_) => "config_error",
            AppError::Conflict(_) => "conflict",
            AppError::BadRequest(_) => "bad_request",
            AppError::Registry(_) => "registry_error",
        }
    }

    pub fn upstream_code(&self) -> Option<UpstreamCode> {
        match self {
            AppError::Upstream { code, .. } => Some(*code),
            _ => None,
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::Connection(_) => StatusCode::BAD_GATEWAY,
            AppError::Introspection { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::UnsupportedType(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Validation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Upstream { code, .. } => match code {
                UpstreamCode::ConstraintViolation => StatusCode::CONFLICT,
                UpstreamCode::PoolTimeout | UpstreamCode::ProjectUnavailable => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                UpstreamCode::ConnectionLost => StatusCode::BAD_GATEWAY,
                UpstreamCode::QueryFailed => StatusCode::INTERNAL_SERVER_ERROR,
            },
            AppError::InvalidState { .. } => StatusCode::CONFLICT,
            AppError::Provisioning(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Registry(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn details(&self) -> Option<serde_json::Value> {
        match self {
            AppError::Validation { parameter, .. } => {
                Some(serde_json::json!({ "parameter": parameter }))
            }
            AppError::Upstream { code, .. } => Some(serde_json::json!({ "upstream_code": code })),
            AppError::InvalidState { state, command, .. } => {
                Some(serde_json::json!({ "state": state, "command": command }))
            }
            AppError::Introspection { table, column, .. } => {
                Some(serde_json::json!({ "table": table, "column": column }))
            }
            _ => None,
        }
    }
}

#[derive(Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(code = self.code(), error = %self, "request failed");
        }
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code().to_string(),
                message: self.to_string(),
                details: self.details(),
            },
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_timeout_is_transient() {
        let err = AppError::from_query(sqlx::Error::PoolTimedOut);
        assert_eq!(err.upstream_code(), Some(UpstreamCode::PoolTimeout));
        assert!(UpstreamCode::PoolTimeout.is_transient());
        assert!(!UpstreamCode::ConstraintViolation.is_transient());
    }

    #[test]
    fn closed_pool_reads_as_lost_connection() {
        let err = AppError::from_query(sqlx::Error::PoolClosed);
        assert_eq!(err.code(), "upstream_error");
        assert_eq!(err.upstream_code(), Some(UpstreamCode::ConnectionLost));
    }

    #[test]
    fn validation_names_parameter() {
        let err = AppError::validation("customer_name.eq", "unknown field");
        assert_eq!(err.code(), "validation_error");
        assert!(err.to_string().contains("customer_name.eq"));
        assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
