//! Project routes: registry CRUD, lifecycle commands, connection, schema and API status.

use crate::handlers::projects::{
    api_endpoints, api_status, attach_connection, connection_info, create, delete as delete_handler, destroy,
    graphql_sdl, lifecycle, list, overview, provision, read, refresh_schema, remove_api, restart, schema, start, stop,
    update,
};
use crate::state::AppState;
use axum::{
    routing::{get, post},
    Router,
};

pub fn project_routes(state: AppState) -> Router {
    Router::new()
        .route("/projects", post(create).get(list))
        .route("/projects/:id", get(read).patch(update).delete(delete_handler))
        .route("/projects/:id/provision", post(provision))
        .route("/projects/:id/start", post(start))
        .route("/projects/:id/stop", post(stop))
        .route("/projects/:id/restart", post(restart))
        .route("/projects/:id/destroy", post(destroy))
        .route("/projects/:id/lifecycle", get(lifecycle))
        .route("/projects/:id/connection", post(attach_connection).get(connection_info))
        .route("/projects/:id/schema/refresh", post(refresh_schema))
        .route("/projects/:id/schema", get(schema))
        .route("/projects/:id/graphql/sdl", get(graphql_sdl))
        .route("/projects/:id/api", get(api_status).delete(remove_api))
        .route("/projects/:id/api/endpoints", get(api_endpoints))
        .route("/stats/overview", get(overview))
        .with_state(state)
}
