//! Synthesized data handlers: REST CRUD per resource and the GraphQL endpoint.

use super::projects::parse_project_id;
use crate::dispatch::{DispatchOutput, DispatchParams};
use crate::error::AppError;
use crate::extractors::CallerId;
use crate::response::{success_created, success_one, success_page};
use crate::state::AppState;
use crate::synth::{Operation, RootKind};
use axum::{
    extract::{Path, Query, State},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::{Map, Value};
use uuid::Uuid;

async fn owned(state: &AppState, caller: &CallerId, raw: &str) -> Result<Uuid, AppError> {
    let id = parse_project_id(raw)?;
    state.engine.registry().get_owned(&caller.0, id).await?;
    Ok(id)
}

fn body_to_map(value: Value) -> Result<Map<String, Value>, AppError> {
    match value {
        Value::Object(m) => Ok(m),
        _ => Err(AppError::BadRequest("body must be a JSON object".into())),
    }
}

fn respond(output: DispatchOutput, created: bool) -> Response {
    match output {
        DispatchOutput::List {
            rows,
            total,
            limit,
            offset,
        } => success_page(rows, total, limit, offset).into_response(),
        DispatchOutput::One(row) if created => success_created(row).into_response(),
        DispatchOutput::One(row) => success_one(row).into_response(),
    }
}

pub async fn list(
    State(state): State<AppState>,
    caller: CallerId,
    Path((project_id, resource)): Path<(String, String)>,
    Query(query): Query<Vec<(String, String)>>,
) -> Result<Response, AppError> {
    let project_id = owned(&state, &caller, &project_id).await?;
    let out = state
        .engine
        .dispatch(project_id, &resource, Operation::List, DispatchParams::list(query))
        .await?;
    Ok(respond(out, false))
}

pub async fn create(
    State(state): State<AppState>,
    caller: CallerId,
    Path((project_id, resource)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Result<Response, AppError> {
    let project_id = owned(&state, &caller, &project_id).await?;
    let params = DispatchParams::default().with_body(body_to_map(body)?);
    let out = state.engine.dispatch(project_id, &resource, Operation::Create, params).await?;
    Ok(respond(out, true))
}

pub async fn read(
    State(state): State<AppState>,
    caller: CallerId,
    Path((project_id, resource, id)): Path<(String, String, String)>,
) -> Result<Response, AppError> {
    let project_id = owned(&state, &caller, &project_id).await?;
    let out = state
        .engine
        .dispatch(project_id, &resource, Operation::Get, DispatchParams::by_id(id))
        .await?;
    Ok(respond(out, false))
}

pub async fn update(
    State(state): State<AppState>,
    caller: CallerId,
    Path((project_id, resource, id)): Path<(String, String, String)>,
    Json(body): Json<Value>,
) -> Result<Response, AppError> {
    let project_id = owned(&state, &caller, &project_id).await?;
    let params = DispatchParams::by_id(id).with_body(body_to_map(body)?);
    let out = state.engine.dispatch(project_id, &resource, Operation::Update, params).await?;
    Ok(respond(out, false))
}

pub async fn delete(
    State(state): State<AppState>,
    caller: CallerId,
    Path((project_id, resource, id)): Path<(String, String, String)>,
) -> Result<Response, AppError> {
    let project_id = owned(&state, &caller, &project_id).await?;
    let out = state
        .engine
        .dispatch(project_id, &resource, Operation::Delete, DispatchParams::by_id(id))
        .await?;
    Ok(respond(out, false))
}

/// `{ "operation": "query" | "mutation", "field": "...", "args": { ... } }`
#[derive(Debug, Deserialize)]
pub struct GraphqlRequest {
    #[serde(default)]
    pub operation: Option<String>,
    pub field: String,
    #[serde(default)]
    pub args: Map<String, Value>,
}

pub async fn graphql(
    State(state): State<AppState>,
    caller: CallerId,
    Path(project_id): Path<String>,
    Json(req): Json<GraphqlRequest>,
) -> Result<impl IntoResponse, AppError> {
    let project_id = owned(&state, &caller, &project_id).await?;
    let root = match req.operation.as_deref() {
        None => RootKind::Query,
        Some(op) => RootKind::parse(op)
            .ok_or_else(|| AppError::BadRequest(format!("operation must be query or mutation, got {}", op)))?,
    };
    let value = state
        .engine
        .dispatch_graphql(project_id, root, &req.field, &req.args)
        .await?;
    let mut data = Map::new();
    data.insert(req.field, value);
    Ok(success_one(Value::Object(data)))
}
