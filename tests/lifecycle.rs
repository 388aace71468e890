mod common;

use common::{harness, harness_with, new_project, restarted, test_settings, ScriptedProbe};
use schema_synth::registry::SecretKey;
use schema_synth::{LifecycleState, Operation, ProjectStore, UpstreamCode};
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::time::Duration;

#[tokio::test]
async fn provision_runs_an_isolated_instance() {
    let h = harness();
    let project = new_project(&h.engine, "owner-1", "shop").await;
    let outcome = h.engine.provision(project.id).await.unwrap();

    assert_eq!(outcome.state, LifecycleState::Running);
    assert!((20000..=20999).contains(&outcome.port));
    assert_eq!(h.engine.lifecycle_state(project.id).await.unwrap(), LifecycleState::Running);
    assert_eq!(outcome.schema.map(|s| s.resources), Some(1));

    let specs = h.runtime.specs.lock().unwrap().clone();
    assert_eq!(specs.len(), 1);
    let spec = &specs[0];
    assert_eq!(spec.host_port, outcome.port);
    assert_eq!(spec.limits.memory_mb, 512);
    assert!(spec.network.starts_with("synth-net-"));
    assert!(spec.volume.starts_with("synth-vol-"));
    let password = spec
        .secret_env
        .iter()
        .find(|(k, _)| k == "POSTGRES_PASSWORD")
        .map(|(_, v)| v.expose().to_string())
        .unwrap();
    assert!(password.len() >= 24);
    assert!(!outcome.connection_url.contains(&password));

    let conn = h.engine.get_connection(project.id).await.unwrap();
    assert_eq!(conn.password.expose(), password);
}

#[tokio::test]
async fn readiness_never_passing_marks_failed() {
    let h = harness_with(test_settings(), ScriptedProbe::default(), Vec::new());
    let project = new_project(&h.engine, "owner-1", "shop").await;

    let err = h.engine.provision(project.id).await.unwrap_err();
    assert_eq!(err.code(), "provisioning_error");
    assert_eq!(h.engine.lifecycle_state(project.id).await.unwrap(), LifecycleState::Failed);
    assert_eq!(h.probe.checks.load(Ordering::SeqCst), 5);

    let instance = h.engine.instance(project.id).await.unwrap().unwrap();
    assert_eq!(instance.host_port, None);
    assert!(instance.last_error.is_some());
    assert_eq!(h.engine.lifecycle().allocator().reserved_count(), 0);
    assert!(h.runtime.calls().iter().any(|c| c.starts_with("stop synth-db-")));
    assert!(!h.runtime.calls().iter().any(|c| c.starts_with("rm ")));
}

#[tokio::test]
async fn failed_instance_can_be_provisioned_again() {
    let h = harness_with(test_settings(), ScriptedProbe::default(), Vec::new());
    let project = new_project(&h.engine, "owner-1", "shop").await;
    h.engine.provision(project.id).await.unwrap_err();

    let err = h.engine.start(project.id).await.unwrap_err();
    assert_eq!(err.code(), "invalid_state");

    h.probe.set_ready(true);
    let outcome = h.engine.provision(project.id).await.unwrap();
    assert_eq!(outcome.state, LifecycleState::Running);
    let calls = h.runtime.calls();
    let removed = calls.iter().position(|c| c.starts_with("rm ")).unwrap();
    let second_run = calls.iter().rposition(|c| c.starts_with("run ")).unwrap();
    assert!(removed < second_run);
    assert!(calls.iter().any(|c| c.starts_with("volume rm")));
}

#[tokio::test]
async fn destroy_during_provision_cancels_and_cleans_up() {
    let mut settings = test_settings();
    settings.lifecycle.readiness_attempts = 10_000;
    settings.lifecycle.readiness_timeout = Duration::from_secs(30);
    settings.lifecycle.readiness_initial_backoff = Duration::from_millis(10);
    settings.lifecycle.readiness_max_backoff = Duration::from_millis(10);
    let h = harness_with(settings, ScriptedProbe::default(), Vec::new());
    let project = new_project(&h.engine, "owner-1", "shop").await;

    let engine = h.engine.clone();
    let project_id = project.id;
    let provisioning = tokio::spawn(async move { engine.provision(project_id).await });

    for _ in 0..500 {
        if h.runtime.calls().iter().any(|c| c.starts_with("run ")) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert_eq!(h.engine.lifecycle_state(project.id).await.unwrap(), LifecycleState::Provisioning);

    let state = tokio::time::timeout(Duration::from_secs(5), h.engine.destroy(project.id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state, LifecycleState::Destroyed);

    let provisioned = provisioning.await.unwrap();
    assert_eq!(provisioned.unwrap_err().code(), "provisioning_error");
    assert_eq!(h.engine.lifecycle_state(project.id).await.unwrap(), LifecycleState::Destroyed);
    assert_eq!(h.engine.lifecycle().allocator().reserved_count(), 0);
    let calls = h.runtime.calls();
    for prefix in ["rm synth-db-", "network rm synth-net-", "volume rm synth-vol-"] {
        assert!(calls.iter().any(|c| c.starts_with(prefix)), "missing {}", prefix);
    }

    let err = h.engine.provision(project.id).await.unwrap_err();
    assert_eq!(err.code(), "invalid_state");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_provisions_never_share_a_port() {
    let h = harness();
    let mut ids = Vec::new();
    for i in 0..8 {
        ids.push(new_project(&h.engine, "owner-1", &format!("project-{}", i)).await.id);
    }
    let tasks: Vec<_> = ids
        .into_iter()
        .map(|id| {
            let engine = h.engine.clone();
            tokio::spawn(async move { engine.provision(id).await })
        })
        .collect();
    let mut ports = HashSet::new();
    for t in tasks {
        let outcome = t.await.unwrap().unwrap();
        assert!(ports.insert(outcome.port), "port {} handed out twice", outcome.port);
    }
    assert_eq!(ports.len(), 8);
    assert_eq!(h.engine.lifecycle().allocator().reserved_count(), 8);
}

#[tokio::test]
async fn commands_outside_their_states_are_rejected() {
    let h = harness();
    let project = new_project(&h.engine, "owner-1", "shop").await;

    assert_eq!(h.engine.lifecycle_state(project.id).await.unwrap(), LifecycleState::Requested);
    assert_eq!(h.engine.stop(project.id).await.unwrap_err().code(), "not_found");
    assert_eq!(h.engine.destroy(project.id).await.unwrap_err().code(), "not_found");

    h.engine.provision(project.id).await.unwrap();
    assert_eq!(h.engine.start(project.id).await.unwrap_err().code(), "invalid_state");
    assert_eq!(h.engine.provision(project.id).await.unwrap_err().code(), "invalid_state");
    assert_eq!(h.engine.stop(project.id).await.unwrap(), LifecycleState::Stopped);
    assert_eq!(h.engine.stop(project.id).await.unwrap_err().code(), "invalid_state");
    assert_eq!(h.engine.restart(project.id).await.unwrap(), LifecycleState::Running);
    assert_eq!(h.engine.restart(project.id).await.unwrap(), LifecycleState::Running);
    assert_eq!(h.engine.destroy(project.id).await.unwrap(), LifecycleState::Destroyed);
    assert_eq!(h.engine.start(project.id).await.unwrap_err().code(), "invalid_state");
    assert_eq!(h.engine.destroy(project.id).await.unwrap_err().code(), "invalid_state");
}

#[tokio::test]
async fn repeated_health_failures_fail_the_instance() {
    let h = harness();
    let project = new_project(&h.engine, "owner-1", "shop").await;
    h.engine.provision(project.id).await.unwrap();

    h.probe.set_ready(false);
    h.engine.check_health().await;
    let instance = h.engine.instance(project.id).await.unwrap().unwrap();
    assert_eq!(instance.state, LifecycleState::Running);
    assert_eq!(instance.health_failures, 1);

    h.engine.check_health().await;
    assert_eq!(h.engine.lifecycle_state(project.id).await.unwrap(), LifecycleState::Failed);
    let err = h
        .engine
        .dispatch(project.id, "users", schema_synth::Operation::List, Default::default())
        .await
        .unwrap_err();
    assert_eq!(err.upstream_code(), Some(UpstreamCode::ProjectUnavailable));
    assert_eq!(h.engine.lifecycle().allocator().reserved_count(), 0);
}

#[tokio::test]
async fn exited_container_counts_as_a_health_failure() {
    let h = harness();
    let project = new_project(&h.engine, "owner-1", "shop").await;
    h.engine.provision(project.id).await.unwrap();
    let checks = h.probe.checks.load(Ordering::SeqCst);

    h.runtime.container_down.store(true, Ordering::SeqCst);
    h.engine.check_health().await;
    let instance = h.engine.instance(project.id).await.unwrap().unwrap();
    assert_eq!(instance.health_failures, 1);
    assert!(instance.last_error.unwrap().contains("not running"));
    assert_eq!(h.probe.checks.load(Ordering::SeqCst), checks);
}

#[tokio::test]
async fn restore_reclaims_ports_and_fails_interrupted_provisions() {
    let h = harness();
    let project = new_project(&h.engine, "owner-1", "shop").await;
    let outcome = h.engine.provision(project.id).await.unwrap();

    let store = h.engine.registry().store();
    let mut interrupted = schema_synth::registry::ContainerInstance::new(
        uuid::Uuid::new_v4(),
        schema_synth::registry::ResourceLimits { memory_mb: 256, cpu_share: 0.25 },
    );
    interrupted.state = LifecycleState::Provisioning;
    interrupted.host_port = Some(20500);
    store.save_instance(&interrupted).await.unwrap();

    let restarted = schema_synth::LifecycleManager::new(
        h.runtime.clone(),
        h.probe.clone(),
        store.clone(),
        test_settings().lifecycle,
    );
    assert_eq!(restarted.restore().await.unwrap(), 1);
    assert!(restarted.allocator().is_reserved(outcome.port));
    assert!(!restarted.allocator().is_reserved(20500));
    assert_eq!(
        restarted.lifecycle_state(interrupted.project_id).await.unwrap(),
        LifecycleState::Failed
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn destroy_while_the_api_is_built_rolls_provision_back() {
    let h = harness();
    h.introspector.set_delay(Duration::from_millis(300));
    let project = new_project(&h.engine, "owner-1", "shop").await;

    let engine = h.engine.clone();
    let project_id = project.id;
    let provisioning = tokio::spawn(async move { engine.provision(project_id).await });
    for _ in 0..500 {
        if h.introspector.calls.load(Ordering::SeqCst) > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert_eq!(h.engine.lifecycle_state(project.id).await.unwrap(), LifecycleState::Running);

    assert_eq!(h.engine.destroy(project.id).await.unwrap(), LifecycleState::Destroyed);
    let err = provisioning.await.unwrap().unwrap_err();
    assert_eq!(err.code(), "provisioning_error");
    assert!(h.engine.routing_table(project.id).is_err());
    assert_eq!(h.engine.get_connection(project.id).await.unwrap_err().code(), "not_found");
    assert_eq!(h.engine.lifecycle_state(project.id).await.unwrap(), LifecycleState::Destroyed);
}

#[tokio::test]
async fn failed_initial_refresh_is_reported() {
    let h = harness();
    h.introspector.unreachable.store(true, Ordering::SeqCst);
    let project = new_project(&h.engine, "owner-1", "shop").await;

    let outcome = h.engine.provision(project.id).await.unwrap();
    assert_eq!(outcome.state, LifecycleState::Running);
    assert!(outcome.schema.is_none());
    assert!(outcome.schema_error.unwrap().contains("connection refused"));
}

#[tokio::test]
async fn unchanged_schema_does_not_revive_a_failed_instance() {
    let h = harness();
    let project = new_project(&h.engine, "owner-1", "shop").await;
    h.engine.provision(project.id).await.unwrap();

    h.probe.set_ready(false);
    h.engine.check_health().await;
    h.engine.check_health().await;
    assert_eq!(h.engine.lifecycle_state(project.id).await.unwrap(), LifecycleState::Failed);

    h.probe.set_ready(true);
    let outcome = h.engine.refresh_schema(project.id).await.unwrap();
    assert!(!outcome.changed);
    let err = h
        .engine
        .dispatch(project.id, "users", Operation::List, Default::default())
        .await
        .unwrap_err();
    assert_eq!(err.upstream_code(), Some(UpstreamCode::ProjectUnavailable));
}

#[tokio::test]
async fn managed_project_keeps_serving_after_a_restart() {
    let h = harness();
    let project = new_project(&h.engine, "owner-1", "shop").await;
    let outcome = h.engine.provision(project.id).await.unwrap();
    let before = h.engine.get_connection(project.id).await.unwrap();

    let engine = restarted(&h, test_settings());
    assert_eq!(engine.restore().await.unwrap(), 1);
    assert_eq!(engine.lifecycle_state(project.id).await.unwrap(), LifecycleState::Running);
    assert!(engine.lifecycle().allocator().is_reserved(outcome.port));

    let conn = engine.get_connection(project.id).await.unwrap();
    assert_eq!(conn.password.expose(), before.password.expose());
    assert_eq!(conn.port, outcome.port);
    assert_eq!(conn.username, before.username);

    engine
        .dispatch(project.id, "users", Operation::List, Default::default())
        .await
        .unwrap();
    assert!(!engine.refresh_schema(project.id).await.unwrap().changed);
    engine.check_health().await;
    let instance = engine.instance(project.id).await.unwrap().unwrap();
    assert_eq!(instance.state, LifecycleState::Running);
    assert_eq!(instance.health_failures, 0);
}

#[tokio::test]
async fn project_stopped_across_a_restart_gets_its_api_on_start() {
    let h = harness();
    let project = new_project(&h.engine, "owner-1", "shop").await;
    h.engine.provision(project.id).await.unwrap();
    h.engine.stop(project.id).await.unwrap();

    let engine = restarted(&h, test_settings());
    assert_eq!(engine.restore().await.unwrap(), 0);
    assert!(engine.routing_table(project.id).is_err());

    assert_eq!(engine.start(project.id).await.unwrap(), LifecycleState::Running);
    engine
        .dispatch(project.id, "users", Operation::List, Default::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn credentials_sealed_under_another_key_stay_closed() {
    let h = harness();
    let project = new_project(&h.engine, "owner-1", "shop").await;
    h.engine.provision(project.id).await.unwrap();

    let mut settings = test_settings();
    settings.secret_key = Some(SecretKey::from_bytes([9u8; 32]));
    let engine = restarted(&h, settings);
    assert_eq!(engine.restore().await.unwrap(), 0);
    assert_eq!(engine.get_connection(project.id).await.unwrap_err().code(), "registry_error");
}
