//! Synthesized data routes. Handlers resolve the project and resource from the path,
//! so a schema refresh never requires rebuilding the router.

use crate::handlers::data::{create, delete as delete_handler, graphql, list, read, update};
use crate::state::AppState;
use axum::{
    routing::{get, post},
    Router,
};

pub fn data_routes(state: AppState) -> Router {
    Router::new()
        .route("/data/:project_id/graphql", post(graphql))
        .route("/data/:project_id/:resource", get(list).post(create))
        .route(
            "/data/:project_id/:resource/:id",
            get(read).patch(update).put(update).delete(delete_handler),
        )
        .with_state(state)
}
