mod common;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use schema_synth::{app, AppState};
use serde_json::{json, Value};
use tower::ServiceExt;

fn router(h: &common::Harness) -> Router {
    app(AppState::new(h.engine.clone()))
}

async fn call(app: &Router, method: &str, uri: &str, caller: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
    let mut req = Request::builder().method(method).uri(uri);
    if let Some(c) = caller {
        req = req.header("X-Caller-ID", c);
    }
    let req = match body {
        Some(b) => req
            .header("content-type", "application/json")
            .body(Body::from(b.to_string()))
            .unwrap(),
        None => req.body(Body::empty()).unwrap(),
    };
    let res = app.clone().oneshot(req).await.unwrap();
    let status = res.status();
    let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into()));
    (status, value)
}

#[tokio::test]
async fn health_and_ready() {
    let h = common::harness();
    let app = router(&h);
    let (status, body) = call(&app, "GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    let (status, body) = call(&app, "GET", "/ready", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["registry"], "ok");
}

#[tokio::test]
async fn caller_header_is_required() {
    let h = common::harness();
    let (status, body) = call(&router(&h), "GET", "/api/v1/projects", None, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "bad_request");
}

#[tokio::test]
async fn project_crud_is_scoped_to_the_caller() {
    let h = common::harness();
    let app = router(&h);
    let (status, body) = call(
        &app,
        "POST",
        "/api/v1/projects",
        Some("alice"),
        Some(json!({"name": "Shop", "database_kind": "postgres"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = body["data"]["id"].as_str().unwrap().to_string();

    let (status, body) = call(
        &app,
        "POST",
        "/api/v1/projects",
        Some("alice"),
        Some(json!({"name": "shop", "database_kind": "mysql"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "conflict");

    let (status, body) = call(&app, "GET", "/api/v1/projects", Some("alice"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["meta"]["count"], 1);

    let (status, _) = call(&app, "GET", &format!("/api/v1/projects/{}", id), Some("mallory"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = call(&app, "GET", "/api/v1/projects/not-a-uuid", Some("alice"), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "bad_request");

    let (status, _) = call(&app, "DELETE", &format!("/api/v1/projects/{}", id), Some("alice"), None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = call(&app, "GET", &format!("/api/v1/projects/{}", id), Some("alice"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn provision_then_serve_data() {
    let h = common::harness();
    let app = router(&h);
    let (_, body) = call(
        &app,
        "POST",
        "/api/v1/projects",
        Some("alice"),
        Some(json!({"name": "shop", "database_kind": "postgres"})),
    )
    .await;
    let id = body["data"]["id"].as_str().unwrap().to_string();

    let (status, body) = call(&app, "POST", &format!("/api/v1/projects/{}/provision", id), Some("alice"), None).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["state"], "running");
    assert!(body["data"]["connection_url"].as_str().unwrap().contains("***"));

    let (status, body) = call(&app, "GET", &format!("/api/v1/projects/{}/lifecycle", id), Some("alice"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["state"], "running");

    let (status, body) = call(&app, "GET", &format!("/api/v1/data/{}/users?limit=2", id), Some("alice"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"][0]["email"], "ada@example.com");
    assert_eq!(body["meta"]["limit"], 2);
    assert_eq!(body["meta"]["total"], 1);

    let (status, body) = call(&app, "GET", &format!("/api/v1/data/{}/users?nope.eq=1", id), Some("alice"), None).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["code"], "validation_error");
    assert_eq!(body["error"]["details"]["parameter"], "nope.eq");

    let (status, body) = call(
        &app,
        "POST",
        &format!("/api/v1/data/{}/graphql", id),
        Some("alice"),
        Some(json!({"operation": "query", "field": "usersById", "args": {"id": 1}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["usersById"]["email"], "ada@example.com");

    let (status, body) = call(&app, "GET", &format!("/api/v1/projects/{}/graphql/sdl", id), Some("alice"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.as_str().unwrap().contains("type Users {"));

    let (status, _) = call(&app, "GET", &format!("/api/v1/data/{}/users", id), Some("mallory"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = call(&app, "POST", &format!("/api/v1/projects/{}/start", id), Some("alice"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "invalid_state");
}

async fn create_project(app: &Router, caller: &str, name: &str, kind: &str) -> String {
    let (status, body) = call(
        app,
        "POST",
        "/api/v1/projects",
        Some(caller),
        Some(json!({"name": name, "database_kind": kind})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    body["data"]["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn connection_info_withholds_the_password() {
    let h = common::harness();
    let app = router(&h);
    let id = create_project(&app, "alice", "shop", "postgres").await;
    let (status, _) = call(&app, "GET", &format!("/api/v1/projects/{}/connection", id), Some("alice"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    call(&app, "POST", &format!("/api/v1/projects/{}/provision", id), Some("alice"), None).await;
    let password = h
        .engine
        .get_connection(id.parse().unwrap())
        .await
        .unwrap()
        .password
        .expose()
        .to_string();

    let (status, body) = call(&app, "GET", &format!("/api/v1/projects/{}/connection", id), Some("alice"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["password"], "***");
    assert_eq!(body["data"]["managed"], true);
    assert_eq!(body["data"]["kind"], "postgres");
    assert!(!body.to_string().contains(&password));

    let (status, _) = call(&app, "GET", &format!("/api/v1/projects/{}/connection", id), Some("mallory"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn overview_counts_only_the_callers_projects() {
    let h = common::harness();
    let app = router(&h);
    let shop = create_project(&app, "alice", "shop", "postgres").await;
    create_project(&app, "alice", "blog", "mysql").await;
    create_project(&app, "alice", "wiki", "postgres").await;
    create_project(&app, "bob", "other", "postgres").await;
    call(&app, "POST", &format!("/api/v1/projects/{}/provision", shop), Some("alice"), None).await;

    let (status, body) = call(&app, "GET", "/api/v1/stats/overview", Some("alice"), None).await;
    assert_eq!(status, StatusCode::OK);
    let stats = &body["data"];
    assert_eq!(stats["total_projects"], 3);
    assert_eq!(stats["by_kind"]["postgres"], 2);
    assert_eq!(stats["by_kind"]["mysql"], 1);
    assert_eq!(stats["by_state"]["running"], 1);
    assert_eq!(stats["by_state"]["requested"], 2);
    assert_eq!(stats["running_instances"], 1);
    assert_eq!(stats["created_today"], 3);

    let (_, body) = call(&app, "GET", "/api/v1/stats/overview", Some("carol"), None).await;
    assert_eq!(body["data"]["total_projects"], 0);
    assert_eq!(body["data"]["by_kind"]["mysql"], 0);
}

#[tokio::test]
async fn api_status_and_endpoint_listing() {
    let h = common::harness();
    let app = router(&h);
    let id = create_project(&app, "alice", "shop", "postgres").await;
    let status_uri = format!("/api/v1/projects/{}/api", id);
    let endpoints_uri = format!("/api/v1/projects/{}/api/endpoints", id);

    let (status, body) = call(&app, "GET", &status_uri, Some("alice"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["api_generated"], false);
    assert_eq!(body["data"]["endpoint_count"], 0);
    let (status, _) = call(&app, "GET", &endpoints_uri, Some("alice"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    call(&app, "POST", &format!("/api/v1/projects/{}/provision", id), Some("alice"), None).await;
    let (_, body) = call(&app, "GET", &status_uri, Some("alice"), None).await;
    let api = &body["data"];
    assert_eq!(api["api_generated"], true);
    assert_eq!(api["available"], true);
    assert_eq!(api["resource_count"], 1);
    assert_eq!(api["endpoint_count"], 6);
    assert_eq!(api["base_url"], format!("/api/v1/data/{}", id));
    assert!(api["generated_at"].is_string());

    let (status, body) = call(&app, "GET", &endpoints_uri, Some("alice"), None).await;
    assert_eq!(status, StatusCode::OK);
    let endpoints = body["data"]["endpoints"].as_array().unwrap();
    assert_eq!(endpoints.len(), 6);
    assert!(endpoints
        .iter()
        .any(|e| e["method"] == "PATCH" && e["path"] == format!("/api/v1/data/{}/users/{{id}}", id)));

    call(&app, "POST", &format!("/api/v1/projects/{}/stop", id), Some("alice"), None).await;
    let (_, body) = call(&app, "GET", &status_uri, Some("alice"), None).await;
    assert_eq!(body["data"]["api_generated"], true);
    assert_eq!(body["data"]["available"], false);
}

#[tokio::test]
async fn removed_api_comes_back_on_refresh() {
    let h = common::harness();
    let app = router(&h);
    let id = create_project(&app, "alice", "shop", "postgres").await;
    call(&app, "POST", &format!("/api/v1/projects/{}/provision", id), Some("alice"), None).await;

    let (status, _) = call(&app, "DELETE", &format!("/api/v1/projects/{}/api", id), Some("alice"), None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = call(&app, "GET", &format!("/api/v1/data/{}/users", id), Some("alice"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = call(&app, "DELETE", &format!("/api/v1/projects/{}/api", id), Some("alice"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = call(&app, "POST", &format!("/api/v1/projects/{}/schema/refresh", id), Some("alice"), None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = call(&app, "GET", &format!("/api/v1/data/{}/users", id), Some("alice"), None).await;
    assert_eq!(status, StatusCode::OK);
}
