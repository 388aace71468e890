//! Probe routes: liveness, readiness against the registry store, and build version.

use crate::state::AppState;
use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;
use serde_json::json;

#[derive(Serialize)]
struct ReadyBody {
    status: &'static str,
    registry: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    instances: Option<usize>,
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn ready(State(state): State<AppState>) -> (StatusCode, Json<ReadyBody>) {
    let store = state.engine.registry().store();
    match store.list_instances().await {
        Ok(instances) => (
            StatusCode::OK,
            Json(ReadyBody {
                status: "ok",
                registry: "ok",
                instances: Some(instances.len()),
            }),
        ),
        Err(e) => {
            tracing::warn!(error = %e, "registry not ready");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ReadyBody {
                    status: "degraded",
                    registry: "unavailable",
                    instances: None,
                }),
            )
        }
    }
}

async fn version() -> Json<serde_json::Value> {
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// GET /health, GET /ready, GET /version.
pub fn common_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/version", get(version))
        .with_state(state)
}
