//! Router assembly.

pub mod common;
pub mod data;
pub mod projects;

pub use common::common_routes;
pub use data::data_routes;
pub use projects::project_routes;

use crate::state::AppState;
use axum::Router;
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;

/// Upper bound on request bodies.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Full application: probes at the root, projects and data under `/api/v1`.
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(common_routes(state.clone()))
        .nest(
            "/api/v1",
            Router::new()
                .merge(project_routes(state.clone()))
                .merge(data_routes(state)),
        )
        .layer(ServiceBuilder::new().layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES)))
}
