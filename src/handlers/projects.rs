//! Project handlers: registry CRUD, lifecycle commands, connection and schema management.

use crate::error::AppError;
use crate::extractors::CallerId;
use crate::lifecycle::LifecycleState;
use crate::registry::{AttachConnection, ContainerInstance, NewProject, ProjectPatch};
use crate::response::{success_created, success_many, success_one};
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    http::header,
    response::IntoResponse,
    Json,
};
use serde::Serialize;
use uuid::Uuid;

/// Where a project's synthesized data routes are mounted.
fn data_base_url(project_id: Uuid) -> String {
    format!("/api/v1/data/{}", project_id)
}

pub(crate) fn parse_project_id(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw).map_err(|_| AppError::BadRequest(format!("invalid project id: {}", raw)))
}

/// Resolve the path id to a project the caller owns.
async fn owned(state: &AppState, caller: &CallerId, raw: &str) -> Result<Uuid, AppError> {
    let id = parse_project_id(raw)?;
    state.engine.registry().get_owned(&caller.0, id).await?;
    Ok(id)
}

#[derive(Serialize)]
struct LifecycleView {
    project_id: Uuid,
    state: LifecycleState,
    #[serde(skip_serializing_if = "Option::is_none")]
    instance: Option<ContainerInstance>,
}

pub async fn create(
    State(state): State<AppState>,
    caller: CallerId,
    Json(body): Json<NewProject>,
) -> Result<impl IntoResponse, AppError> {
    let project = state.engine.registry().create_project(&caller.0, body).await?;
    Ok(success_created(project))
}

pub async fn list(State(state): State<AppState>, caller: CallerId) -> Result<impl IntoResponse, AppError> {
    let projects = state.engine.registry().list_projects(&caller.0).await?;
    Ok(success_many(projects))
}

pub async fn read(
    State(state): State<AppState>,
    caller: CallerId,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let project = state.engine.registry().get_owned(&caller.0, parse_project_id(&id)?).await?;
    Ok(success_one(project))
}

pub async fn update(
    State(state): State<AppState>,
    caller: CallerId,
    Path(id): Path<String>,
    Json(patch): Json<ProjectPatch>,
) -> Result<impl IntoResponse, AppError> {
    let project = state
        .engine
        .registry()
        .update_project(&caller.0, parse_project_id(&id)?, patch)
        .await?;
    Ok(success_one(project))
}

pub async fn delete(
    State(state): State<AppState>,
    caller: CallerId,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let id = owned(&state, &caller, &id).await?;
    state.engine.on_project_deleted(id).await?;
    Ok(success_one(serde_json::json!({ "id": id, "deleted": true })))
}

pub async fn provision(
    State(state): State<AppState>,
    caller: CallerId,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let id = owned(&state, &caller, &id).await?;
    let outcome = state.engine.provision(id).await?;
    Ok(success_created(outcome))
}

async fn lifecycle_view(state: &AppState, project_id: Uuid) -> Result<LifecycleView, AppError> {
    let instance = state.engine.instance(project_id).await?;
    Ok(LifecycleView {
        project_id,
        state: instance.as_ref().map(|i| i.state).unwrap_or(LifecycleState::Requested),
        instance,
    })
}

pub async fn start(
    State(state): State<AppState>,
    caller: CallerId,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let id = owned(&state, &caller, &id).await?;
    state.engine.start(id).await?;
    Ok(success_one(lifecycle_view(&state, id).await?))
}

pub async fn stop(
    State(state): State<AppState>,
    caller: CallerId,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let id = owned(&state, &caller, &id).await?;
    state.engine.stop(id).await?;
    Ok(success_one(lifecycle_view(&state, id).await?))
}

pub async fn restart(
    State(state): State<AppState>,
    caller: CallerId,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let id = owned(&state, &caller, &id).await?;
    state.engine.restart(id).await?;
    Ok(success_one(lifecycle_view(&state, id).await?))
}

pub async fn destroy(
    State(state): State<AppState>,
    caller: CallerId,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let id = owned(&state, &caller, &id).await?;
    state.engine.destroy(id).await?;
    Ok(success_one(lifecycle_view(&state, id).await?))
}

pub async fn lifecycle(
    State(state): State<AppState>,
    caller: CallerId,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let id = owned(&state, &caller, &id).await?;
    Ok(success_one(lifecycle_view(&state, id).await?))
}

pub async fn attach_connection(
    State(state): State<AppState>,
    caller: CallerId,
    Path(id): Path<String>,
    Json(body): Json<AttachConnection>,
) -> Result<impl IntoResponse, AppError> {
    let project = state
        .engine
        .registry()
        .get_owned(&caller.0, parse_project_id(&id)?)
        .await?;
    let outcome = state.engine.attach_connection(&project, body).await?;
    Ok(success_one(outcome))
}

pub async fn connection_info(
    State(state): State<AppState>,
    caller: CallerId,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let id = owned(&state, &caller, &id).await?;
    Ok(success_one(state.engine.connection_info(id).await?))
}

pub async fn overview(State(state): State<AppState>, caller: CallerId) -> Result<impl IntoResponse, AppError> {
    Ok(success_one(state.engine.overview(&caller.0).await?))
}

pub async fn api_status(
    State(state): State<AppState>,
    caller: CallerId,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let id = owned(&state, &caller, &id).await?;
    Ok(success_one(state.engine.api_status(id, &data_base_url(id))))
}

pub async fn api_endpoints(
    State(state): State<AppState>,
    caller: CallerId,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let id = owned(&state, &caller, &id).await?;
    Ok(success_one(state.engine.api_endpoints(id, &data_base_url(id))?))
}

pub async fn remove_api(
    State(state): State<AppState>,
    caller: CallerId,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let id = owned(&state, &caller, &id).await?;
    state.engine.remove_api(id).await?;
    Ok(success_one(serde_json::json!({ "project_id": id, "api_removed": true })))
}

pub async fn refresh_schema(
    State(state): State<AppState>,
    caller: CallerId,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let id = owned(&state, &caller, &id).await?;
    let outcome = state.engine.refresh_schema(id).await?;
    Ok(success_one(outcome))
}

pub async fn schema(
    State(state): State<AppState>,
    caller: CallerId,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let id = owned(&state, &caller, &id).await?;
    let snapshot = state.engine.schema_snapshot(id)?;
    Ok(success_one(snapshot.as_ref().clone()))
}

pub async fn graphql_sdl(
    State(state): State<AppState>,
    caller: CallerId,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let id = owned(&state, &caller, &id).await?;
    let table = state.engine.routing_table(id)?;
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], table.graphql.sdl()))
}
