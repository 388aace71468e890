mod common;

use common::{column, harness, orders_table, users_table};
use schema_synth::registry::AttachConnection;
use schema_synth::typemap::CanonicalType;
use schema_synth::{DispatchOutput, DispatchParams, Operation, RootKind, UpstreamCode};
use serde_json::{json, Map, Value};
use std::sync::Arc;

fn attach_body() -> AttachConnection {
    AttachConnection {
        host: "db.internal".into(),
        port: 5432,
        database: "shop".into(),
        username: "shop_app".into(),
        password: "s3cret-pass".into(),
    }
}

fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
    items.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

#[tokio::test]
async fn attach_synthesizes_and_serves_list() {
    let h = harness();
    let project = common::new_project(&h.engine, "owner-1", "shop").await;
    let outcome = h.engine.attach_connection(&project, attach_body()).await.unwrap();
    assert!(outcome.changed);
    assert_eq!(outcome.resources, 1);

    let out = h
        .engine
        .dispatch(project.id, "users", Operation::List, DispatchParams::list(pairs(&[("email.like", "ada")])))
        .await
        .unwrap();
    match out {
        DispatchOutput::List { rows, total, limit, offset } => {
            assert_eq!(rows.len(), 1);
            assert_eq!(total, 1);
            assert_eq!(limit, 50);
            assert_eq!(offset, 0);
        }
        other => panic!("expected a list, got {:?}", other),
    }
    let sql = h.executor.sql();
    assert!(sql[0].contains("LIMIT 50"), "{}", sql[0]);
    assert!(!sql.iter().any(|s| s.contains("ada")));
    let first = h.executor.statements.lock().unwrap()[0].clone();
    assert!(!first.params.is_empty());
}

#[tokio::test]
async fn unknown_filter_field_is_a_validation_error() {
    let h = harness();
    h.introspector.set(vec![orders_table()]);
    let project = common::new_project(&h.engine, "owner-1", "orders").await;
    h.engine.attach_connection(&project, attach_body()).await.unwrap();

    let err = h
        .engine
        .dispatch(
            project.id,
            "orders",
            Operation::List,
            DispatchParams::list(pairs(&[("customer_name.eq", "Bob")])),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "validation_error");
    assert!(err.to_string().contains("customer_name"));
    assert!(h.executor.sql().is_empty());
}

#[tokio::test]
async fn unknown_resource_and_project_are_not_found() {
    let h = harness();
    let project = common::new_project(&h.engine, "owner-1", "shop").await;
    let err = h
        .engine
        .dispatch(project.id, "users", Operation::List, DispatchParams::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "not_found");

    h.engine.attach_connection(&project, attach_body()).await.unwrap();
    let err = h
        .engine
        .dispatch(project.id, "invoices", Operation::List, DispatchParams::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "not_found");
}

#[tokio::test]
async fn unchanged_schema_keeps_the_table() {
    let h = harness();
    let project = common::new_project(&h.engine, "owner-1", "shop").await;
    h.engine.attach_connection(&project, attach_body()).await.unwrap();
    let before = h.engine.routing_table(project.id).unwrap();

    let again = h.engine.refresh_schema(project.id).await.unwrap();
    assert!(!again.changed);
    let after = h.engine.routing_table(project.id).unwrap();
    assert!(Arc::ptr_eq(&before, &after));

    h.introspector.set(vec![users_table(), orders_table()]);
    let changed = h.engine.refresh_schema(project.id).await.unwrap();
    assert!(changed.changed);
    assert_eq!(changed.resources, 2);
    assert!(h.engine.routing_table(project.id).unwrap().resource("orders").is_some());
    assert_eq!(h.engine.schema_snapshot(project.id).unwrap().tables.len(), 2);
}

#[tokio::test]
async fn create_and_update_go_through_validation() {
    let h = harness();
    let project = common::new_project(&h.engine, "owner-1", "shop").await;
    h.engine.attach_connection(&project, attach_body()).await.unwrap();

    let mut body = Map::new();
    body.insert("email".into(), json!("ada@example.com"));
    let created = h
        .engine
        .dispatch(project.id, "users", Operation::Create, DispatchParams::default().with_body(body))
        .await
        .unwrap();
    assert!(matches!(created, DispatchOutput::One(_)));
    assert!(h.executor.sql().iter().any(|s| s.starts_with("INSERT INTO")));

    let mut missing = Map::new();
    missing.insert("active".into(), json!(true));
    let err = h
        .engine
        .dispatch(project.id, "users", Operation::Create, DispatchParams::default().with_body(missing))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "validation_error");

    let mut pk = Map::new();
    pk.insert("id".into(), json!(9));
    let err = h
        .engine
        .dispatch(project.id, "users", Operation::Update, DispatchParams::by_id("1").with_body(pk))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "validation_error");
}

#[tokio::test]
async fn graphql_list_uses_graphql_names() {
    let h = harness();
    let project = common::new_project(&h.engine, "owner-1", "shop").await;
    h.engine.attach_connection(&project, attach_body()).await.unwrap();
    let table = h.engine.routing_table(project.id).unwrap();
    let field = table
        .graphql
        .queries
        .values()
        .find(|f| f.resource == "users" && f.operation == Operation::List)
        .map(|f| f.name.clone())
        .unwrap();
    assert_eq!(field, "users");

    let mut args = Map::new();
    args.insert("limit".into(), json!(5));
    let value = h
        .engine
        .dispatch_graphql(project.id, RootKind::Query, &field, &args)
        .await
        .unwrap();
    let rows = value.as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["email"], json!("ada@example.com"));
    assert!(h.executor.sql()[0].contains("LIMIT 5"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_dispatch_sees_whole_tables_during_swap() {
    let h = harness();
    let project = common::new_project(&h.engine, "owner-1", "shop").await;
    h.engine.attach_connection(&project, attach_body()).await.unwrap();

    let renamed = {
        let mut t = users_table();
        t.columns[1] = column("mail", 2, CanonicalType::Text);
        t
    };
    let project_id = project.id;
    let mut tasks = Vec::new();
    for _ in 0..32 {
        let engine = h.engine.clone();
        tasks.push(tokio::spawn(async move {
            for _ in 0..10 {
                engine
                    .dispatch(project_id, "users", Operation::List, DispatchParams::default())
                    .await
                    .unwrap();
                tokio::task::yield_now().await;
            }
        }));
    }
    for i in 0..10 {
        h.introspector
            .set(if i % 2 == 0 { vec![renamed.clone()] } else { vec![users_table()] });
        h.engine.refresh_schema(project_id).await.unwrap();
        tokio::task::yield_now().await;
    }
    for t in tasks {
        t.await.unwrap();
    }

    let selects: Vec<String> = h
        .executor
        .sql()
        .into_iter()
        .filter(|s| s.starts_with("SELECT") && !s.contains("COUNT(*)"))
        .collect();
    assert_eq!(selects.len(), 320);
    for s in selects {
        let old = s.contains("\"email\"");
        let new = s.contains("\"mail\"");
        assert!(old ^ new, "mixed table in {}", s);
    }
}

#[tokio::test]
async fn stopped_project_reports_unavailable() {
    let h = harness();
    let project = common::new_project(&h.engine, "owner-1", "shop").await;
    h.engine.provision(project.id).await.unwrap();
    h.engine
        .dispatch(project.id, "users", Operation::List, DispatchParams::default())
        .await
        .unwrap();

    h.engine.stop(project.id).await.unwrap();
    let err = h
        .engine
        .dispatch(project.id, "users", Operation::Get, DispatchParams::by_id("1"))
        .await
        .unwrap_err();
    assert_eq!(err.upstream_code(), Some(UpstreamCode::ProjectUnavailable));

    h.engine.start(project.id).await.unwrap();
    let out = h
        .engine
        .dispatch(project.id, "users", Operation::Get, DispatchParams::by_id("1"))
        .await
        .unwrap();
    assert_eq!(out, DispatchOutput::One(json!({"id": 1, "email": "ada@example.com", "active": true})));
}

#[tokio::test]
async fn project_deletion_tears_everything_down() {
    let h = harness();
    let project = common::new_project(&h.engine, "owner-1", "shop").await;
    h.engine.provision(project.id).await.unwrap();
    assert_eq!(h.engine.lifecycle().allocator().reserved_count(), 1);

    h.engine.on_project_deleted(project.id).await.unwrap();
    assert_eq!(h.engine.lifecycle().allocator().reserved_count(), 0);
    assert!(h.engine.routing_table(project.id).is_err());
    assert_eq!(h.engine.get_project(project.id).await.unwrap_err().code(), "not_found");
    assert!(h.executor.closed.load(std::sync::atomic::Ordering::SeqCst));
    assert!(h.runtime.calls().iter().any(|c| c.starts_with("volume rm")));
}

#[tokio::test]
async fn get_miss_is_not_found() {
    let h = common::harness_with(common::test_settings(), common::ScriptedProbe::ready(), Vec::<Value>::new());
    let project = common::new_project(&h.engine, "owner-1", "shop").await;
    h.engine.attach_connection(&project, attach_body()).await.unwrap();
    let err = h
        .engine
        .dispatch(project.id, "users", Operation::Get, DispatchParams::by_id("42"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "not_found");
}
