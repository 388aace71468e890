//! Per-project database instance lifecycle.
//!
//! Commands on one project are serialized by that project's async mutex; different
//! projects never wait on each other. A destroy cancels an in-flight readiness wait
//! before taking the mutex, then removes whatever the interrupted provision left behind.

use super::allocator::ResourceAllocator;
use super::probe::ReadinessProbe;
use super::runtime::{ContainerRuntime, ContainerSpec};
use super::state::{LifecycleCommand, LifecycleState};
use crate::error::AppError;
use crate::registry::{ContainerInstance, DatabaseConnection, DatabaseKind, Project, ProjectStore, ResourceLimits, Secret};
use crate::settings::LifecycleSettings;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

struct ProjectUnit {
    op: tokio::sync::Mutex<()>,
    /// Cancelled by destroy. Replaced only when that destroy found nothing to destroy.
    cancel: Mutex<CancellationToken>,
}

impl ProjectUnit {
    fn token(&self) -> CancellationToken {
        self.cancel.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn reset_token(&self) {
        *self.cancel.lock().unwrap_or_else(|e| e.into_inner()) = CancellationToken::new();
    }
}

enum WaitError {
    Cancelled,
    TimedOut { attempts: u32, last: String },
}

/// Result of one health probe.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthReport {
    pub project_id: Uuid,
    pub healthy: bool,
    pub state: LifecycleState,
    pub consecutive_failures: u32,
}

pub struct LifecycleManager {
    runtime: Arc<dyn ContainerRuntime>,
    probe: Arc<dyn ReadinessProbe>,
    store: Arc<dyn ProjectStore>,
    allocator: ResourceAllocator,
    settings: LifecycleSettings,
    units: Mutex<HashMap<Uuid, Arc<ProjectUnit>>>,
}

impl LifecycleManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        probe: Arc<dyn ReadinessProbe>,
        store: Arc<dyn ProjectStore>,
        settings: LifecycleSettings,
    ) -> Self {
        Self {
            runtime,
            probe,
            store,
            allocator: ResourceAllocator::new(&settings),
            settings,
            units: Mutex::new(HashMap::new()),
        }
    }

    pub fn allocator(&self) -> &ResourceAllocator {
        &self.allocator
    }

    fn unit(&self, project_id: Uuid) -> Arc<ProjectUnit> {
        self.units
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(project_id)
            .or_insert_with(|| {
                Arc::new(ProjectUnit {
                    op: tokio::sync::Mutex::new(()),
                    cancel: Mutex::new(CancellationToken::new()),
                })
            })
            .clone()
    }

    fn limits(&self) -> ResourceLimits {
        ResourceLimits {
            memory_mb: self.settings.memory_mb,
            cpu_share: self.settings.cpu_share,
        }
    }

    pub async fn instance(&self, project_id: Uuid) -> Result<Option<ContainerInstance>, AppError> {
        self.store.get_instance(project_id).await
    }

    async fn require_instance(&self, project_id: Uuid) -> Result<ContainerInstance, AppError> {
        self.store
            .get_instance(project_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("no managed instance for project {}", project_id)))
    }

    /// Current state; projects never provisioned report `Requested`.
    pub async fn lifecycle_state(&self, project_id: Uuid) -> Result<LifecycleState, AppError> {
        Ok(self
            .store
            .get_instance(project_id)
            .await?
            .map(|i| i.state)
            .unwrap_or(LifecycleState::Requested))
    }

    fn check_command(instance: &ContainerInstance, command: LifecycleCommand) -> Result<(), AppError> {
        if command.allowed_from(instance.state) {
            Ok(())
        } else {
            Err(AppError::InvalidState {
                project_id: instance.project_id,
                state: instance.state,
                command: command.as_str(),
            })
        }
    }

    async fn transition(&self, instance: &mut ContainerInstance, next: LifecycleState) -> Result<(), AppError> {
        let from = instance.state;
        if !from.can_transition_to(next) {
            return Err(AppError::InvalidState {
                project_id: instance.project_id,
                state: from,
                command: next.as_str(),
            });
        }
        instance.state = next;
        instance.updated_at = Utc::now();
        self.store.save_instance(instance).await?;
        info!(project_id = %instance.project_id, from = %from, to = %next, "lifecycle transition");
        Ok(())
    }

    /// Mark failed, stop the container and free its port. The container itself is kept.
    async fn fail(&self, instance: &mut ContainerInstance, reason: String) -> Result<(), AppError> {
        warn!(project_id = %instance.project_id, reason = %reason, "instance failed");
        if let Err(e) = self.runtime.stop(&instance.container_name).await {
            warn!(project_id = %instance.project_id, error = %e, "stopping failed instance");
        }
        if let Some(port) = instance.host_port.take() {
            self.allocator.release_port(port);
        }
        instance.last_error = Some(reason);
        self.transition(instance, LifecycleState::Failed).await
    }

    fn container_spec(&self, project: &Project, instance: &ContainerInstance, port: u16, username: &str, password: &Secret) -> ContainerSpec {
        let (image, data_dir, secret_env) = match project.database_kind {
            DatabaseKind::Postgres => (
                self.settings.postgres_image.clone(),
                "/var/lib/postgresql/data",
                vec![
                    ("POSTGRES_DB".to_string(), Secret::new(project.database_name.clone())),
                    ("POSTGRES_USER".to_string(), Secret::new(username)),
                    ("POSTGRES_PASSWORD".to_string(), password.clone()),
                ],
            ),
            DatabaseKind::MySql => (
                self.settings.mysql_image.clone(),
                "/var/lib/mysql",
                vec![
                    ("MYSQL_DATABASE".to_string(), Secret::new(project.database_name.clone())),
                    ("MYSQL_USER".to_string(), Secret::new(username)),
                    ("MYSQL_PASSWORD".to_string(), password.clone()),
                    ("MYSQL_ROOT_PASSWORD".to_string(), self.allocator.credentials().1),
                ],
            ),
        };
        ContainerSpec {
            name: instance.container_name.clone(),
            image,
            network: instance.network_name.clone(),
            volume: instance.volume_name.clone(),
            data_dir: data_dir.to_string(),
            host_port: port,
            container_port: project.database_kind.container_port(),
            limits: instance.limits,
            labels: vec![
                ("synth.project".to_string(), project.id.to_string()),
                ("synth.kind".to_string(), project.database_kind.as_str().to_string()),
            ],
            secret_env,
        }
    }

    /// Launch an isolated instance and wait until it answers. Returns its live connection.
    pub async fn provision(&self, project: &Project) -> Result<DatabaseConnection, AppError> {
        let unit = self.unit(project.id);
        let _guard = unit.op.lock().await;
        let mut instance = match self.store.get_instance(project.id).await? {
            Some(i) => i,
            None => ContainerInstance::new(project.id, self.limits()),
        };
        let cancel = unit.token();
        if cancel.is_cancelled() {
            return Err(AppError::InvalidState {
                project_id: project.id,
                state: LifecycleState::Destroyed,
                command: LifecycleCommand::Provision.as_str(),
            });
        }
        Self::check_command(&instance, LifecycleCommand::Provision)?;

        if instance.state == LifecycleState::Failed {
            // Fresh credentials cannot open a data directory initialized with the old ones.
            self.runtime.remove(&instance.container_name).await?;
            self.runtime.remove_volume(&instance.volume_name).await?;
            instance.instance_id = None;
        }

        let port = self.allocator.reserve_port()?;
        let (username, password) = self.allocator.credentials();
        instance.host_port = Some(port);
        instance.limits = self.limits();
        instance.health_failures = 0;
        instance.last_error = None;
        if let Err(e) = self.transition(&mut instance, LifecycleState::Provisioning).await {
            self.allocator.release_port(port);
            return Err(e);
        }

        let spec = self.container_spec(project, &instance, port, &username, &password);
        let launched = async {
            self.runtime.create_network(&instance.network_name).await?;
            self.runtime.create_volume(&instance.volume_name).await?;
            self.runtime.run(&spec).await
        }
        .await;
        match launched {
            Ok(id) => {
                debug!(project_id = %project.id, instance_id = %id, port, "instance launched");
                instance.instance_id = Some(id);
                self.store.save_instance(&instance).await?;
            }
            Err(e) => {
                let msg = e.to_string();
                self.fail(&mut instance, msg.clone()).await?;
                return Err(AppError::Provisioning(msg));
            }
        }

        let conn = DatabaseConnection {
            project_id: project.id,
            kind: project.database_kind,
            host: self.settings.db_host.clone(),
            port,
            database: project.database_name.clone(),
            username,
            password,
        };
        match self.wait_until_ready(&conn, &cancel).await {
            Ok(()) => {
                instance.last_health_at = Some(Utc::now());
                self.transition(&mut instance, LifecycleState::Running).await?;
                Ok(conn)
            }
            Err(WaitError::Cancelled) => {
                info!(project_id = %project.id, "provisioning cancelled");
                Err(AppError::Provisioning(format!("provisioning of {} was cancelled", project.id)))
            }
            Err(WaitError::TimedOut { attempts, last }) => {
                let msg = format!("not ready after {} probes: {}", attempts, last);
                self.fail(&mut instance, msg.clone()).await?;
                Err(AppError::Provisioning(msg))
            }
        }
    }

    /// Probe with bounded attempts and exponential backoff until ready, timed out or cancelled.
    async fn wait_until_ready(&self, conn: &DatabaseConnection, cancel: &CancellationToken) -> Result<(), WaitError> {
        let deadline = Instant::now() + self.settings.readiness_timeout;
        let mut backoff = self.settings.readiness_initial_backoff;
        let mut last = String::from("no probe completed");
        let mut attempts = 0;
        while attempts < self.settings.readiness_attempts {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            attempts += 1;
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(WaitError::Cancelled),
                r = tokio::time::timeout(remaining.min(self.settings.probe_timeout), self.probe.check(conn)) => r,
            };
            match outcome {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => last = e.to_string(),
                Err(_) => last = "probe timed out".to_string(),
            }
            debug!(project_id = %conn.project_id, attempt = attempts, error = %last, "not ready yet");
            let pause = backoff.min(deadline.saturating_duration_since(Instant::now()));
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(WaitError::Cancelled),
                _ = tokio::time::sleep(pause) => {}
            }
            backoff = (backoff * 2).min(self.settings.readiness_max_backoff);
        }
        Err(WaitError::TimedOut { attempts, last })
    }

    /// Stopped -> Running. With a connection, waits for readiness; never ready means Failed.
    pub async fn start(&self, project_id: Uuid, conn: Option<&DatabaseConnection>) -> Result<LifecycleState, AppError> {
        let unit = self.unit(project_id);
        let _guard = unit.op.lock().await;
        let mut instance = self.require_instance(project_id).await?;
        Self::check_command(&instance, LifecycleCommand::Start)?;
        self.runtime.start(&instance.container_name).await?;
        self.transition(&mut instance, LifecycleState::Running).await?;
        self.await_running(&mut instance, conn, &unit.token()).await
    }

    /// Running -> Stopped. The port stays reserved.
    pub async fn stop(&self, project_id: Uuid) -> Result<LifecycleState, AppError> {
        let unit = self.unit(project_id);
        let _guard = unit.op.lock().await;
        let mut instance = self.require_instance(project_id).await?;
        Self::check_command(&instance, LifecycleCommand::Stop)?;
        self.runtime.stop(&instance.container_name).await?;
        self.transition(&mut instance, LifecycleState::Stopped).await?;
        Ok(instance.state)
    }

    /// Running | Stopped -> Running.
    pub async fn restart(&self, project_id: Uuid, conn: Option<&DatabaseConnection>) -> Result<LifecycleState, AppError> {
        let unit = self.unit(project_id);
        let _guard = unit.op.lock().await;
        let mut instance = self.require_instance(project_id).await?;
        Self::check_command(&instance, LifecycleCommand::Restart)?;
        if instance.state == LifecycleState::Running {
            self.runtime.stop(&instance.container_name).await?;
        }
        self.runtime.start(&instance.container_name).await?;
        self.transition(&mut instance, LifecycleState::Running).await?;
        self.await_running(&mut instance, conn, &unit.token()).await
    }

    async fn await_running(
        &self,
        instance: &mut ContainerInstance,
        conn: Option<&DatabaseConnection>,
        cancel: &CancellationToken,
    ) -> Result<LifecycleState, AppError> {
        let Some(conn) = conn else {
            return Ok(instance.state);
        };
        match self.wait_until_ready(conn, cancel).await {
            Ok(()) => {
                instance.health_failures = 0;
                instance.last_health_at = Some(Utc::now());
                self.store.save_instance(instance).await?;
                Ok(instance.state)
            }
            Err(WaitError::Cancelled) => Err(AppError::Provisioning("start was cancelled".into())),
            Err(WaitError::TimedOut { attempts, last }) => {
                let msg = format!("not ready after {} probes: {}", attempts, last);
                self.fail(instance, msg.clone()).await?;
                Err(AppError::Provisioning(msg))
            }
        }
    }

    /// Remove container, network and volume and free the port. Terminal.
    pub async fn destroy(&self, project_id: Uuid) -> Result<LifecycleState, AppError> {
        let unit = self.unit(project_id);
        match self.store.get_instance(project_id).await? {
            Some(before) => Self::check_command(&before, LifecycleCommand::Destroy)?,
            None if unit.op.try_lock().is_ok() => {
                return Err(AppError::NotFound(format!("no managed instance for project {}", project_id)));
            }
            // A provision holds the lock and has not recorded its instance yet.
            None => {}
        }
        unit.token().cancel();
        let _guard = unit.op.lock().await;
        let Some(mut instance) = self.store.get_instance(project_id).await? else {
            // The provision we cancelled gave up before recording an instance.
            unit.reset_token();
            return Err(AppError::NotFound(format!("no managed instance for project {}", project_id)));
        };
        Self::check_command(&instance, LifecycleCommand::Destroy)?;

        self.runtime.remove(&instance.container_name).await?;
        self.runtime.remove_network(&instance.network_name).await?;
        self.runtime.remove_volume(&instance.volume_name).await?;
        if let Some(port) = instance.host_port.take() {
            self.allocator.release_port(port);
        }
        instance.instance_id = None;
        self.transition(&mut instance, LifecycleState::Destroyed).await?;
        Ok(instance.state)
    }

    /// Probe a running instance once. Skips projects with a command in progress.
    /// After the configured number of consecutive failures the instance becomes Failed.
    pub async fn health_check(&self, project_id: Uuid, conn: &DatabaseConnection) -> Result<Option<HealthReport>, AppError> {
        let unit = self.unit(project_id);
        let Ok(_guard) = unit.op.try_lock() else {
            return Ok(None);
        };
        let Some(mut instance) = self.store.get_instance(project_id).await? else {
            return Ok(None);
        };
        if instance.state != LifecycleState::Running {
            return Ok(None);
        }
        let result = match self.runtime.is_running(&instance.container_name).await {
            Ok(true) => self.probe.check(conn).await,
            Ok(false) => Err(AppError::Connection(format!("container {} is not running", instance.container_name))),
            Err(e) => Err(e.into()),
        };
        let healthy = result.is_ok();
        match result {
            Ok(()) => {
                instance.health_failures = 0;
                instance.last_health_at = Some(Utc::now());
                self.store.save_instance(&instance).await?;
            }
            Err(e) => {
                instance.health_failures += 1;
                warn!(
                    project_id = %project_id,
                    failures = instance.health_failures,
                    error = %e,
                    "health check failed"
                );
                if instance.health_failures >= self.settings.health_failure_threshold {
                    let reason = format!("{} consecutive health check failures", instance.health_failures);
                    self.fail(&mut instance, reason).await?;
                } else {
                    instance.last_error = Some(e.to_string());
                    self.store.save_instance(&instance).await?;
                }
            }
        }
        Ok(Some(HealthReport {
            project_id,
            healthy,
            state: instance.state,
            consecutive_failures: instance.health_failures,
        }))
    }

    /// Re-reserve ports of persisted instances after a restart. Provisions interrupted
    /// by the restart are marked Failed. Returns the number of ports restored.
    pub async fn restore(&self) -> Result<usize, AppError> {
        let mut restored = 0;
        for mut instance in self.store.list_instances().await? {
            if instance.state == LifecycleState::Provisioning {
                self.fail(&mut instance, "interrupted by restart".into()).await?;
                continue;
            }
            if !instance.state.holds_port() {
                continue;
            }
            match instance.host_port {
                Some(port) if self.allocator.restore_port(port) => restored += 1,
                Some(port) => warn!(project_id = %instance.project_id, port, "recorded port could not be restored"),
                None => {}
            }
        }
        info!(restored, "lifecycle state restored");
        Ok(restored)
    }

    /// Projects whose instance is currently running.
    pub async fn running_projects(&self) -> Result<Vec<Uuid>, AppError> {
        Ok(self
            .store
            .list_instances()
            .await?
            .into_iter()
            .filter(|i| i.state == LifecycleState::Running)
            .map(|i| i.project_id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::RuntimeError;
    use crate::registry::MemoryProjectStore;
    use async_trait::async_trait;
    use std::time::Duration;

    struct IdleRuntime;

    #[async_trait]
    impl ContainerRuntime for IdleRuntime {
        async fn create_network(&self, _: &str) -> Result<(), RuntimeError> {
            Ok(())
        }
        async fn create_volume(&self, _: &str) -> Result<(), RuntimeError> {
            Ok(())
        }
        async fn run(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
            Ok(format!("cid-{}", spec.name))
        }
        async fn start(&self, _: &str) -> Result<(), RuntimeError> {
            Ok(())
        }
        async fn stop(&self, _: &str) -> Result<(), RuntimeError> {
            Ok(())
        }
        async fn remove(&self, _: &str) -> Result<(), RuntimeError> {
            Ok(())
        }
        async fn remove_network(&self, _: &str) -> Result<(), RuntimeError> {
            Ok(())
        }
        async fn remove_volume(&self, _: &str) -> Result<(), RuntimeError> {
            Ok(())
        }
        async fn is_running(&self, _: &str) -> Result<bool, RuntimeError> {
            Ok(true)
        }
    }

    struct AlwaysReady;

    #[async_trait]
    impl ReadinessProbe for AlwaysReady {
        async fn check(&self, _: &DatabaseConnection) -> Result<(), AppError> {
            Ok(())
        }
    }

    fn manager() -> Arc<LifecycleManager> {
        let settings = LifecycleSettings {
            check_host_ports: false,
            port_range_start: 21000,
            port_range_end: 21010,
            ..LifecycleSettings::default()
        };
        Arc::new(LifecycleManager::new(
            Arc::new(IdleRuntime),
            Arc::new(AlwaysReady),
            Arc::new(MemoryProjectStore::new()),
            settings,
        ))
    }

    fn project() -> Project {
        Project {
            id: Uuid::new_v4(),
            owner_id: "owner-1".into(),
            name: "shop".into(),
            description: None,
            database_kind: DatabaseKind::Postgres,
            database_name: "db_shop".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn destroy_finding_nothing_leaves_provision_possible() {
        let manager = manager();
        let project = project();
        let unit = manager.unit(project.id);

        // a provision holding the lock that gives up before recording an instance
        let held = unit.op.lock().await;
        let destroying = {
            let manager = manager.clone();
            let id = project.id;
            tokio::spawn(async move { manager.destroy(id).await })
        };
        for _ in 0..500 {
            if unit.token().is_cancelled() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert!(unit.token().is_cancelled());
        drop(held);

        let err = destroying.await.unwrap().unwrap_err();
        assert_eq!(err.code(), "not_found");
        assert!(!unit.token().is_cancelled());
        manager.provision(&project).await.unwrap();
        assert_eq!(manager.lifecycle_state(project.id).await.unwrap(), LifecycleState::Running);
    }

    #[tokio::test]
    async fn destroyed_project_stays_destroyed() {
        let manager = manager();
        let project = project();
        manager.provision(&project).await.unwrap();
        manager.destroy(project.id).await.unwrap();
        let err = manager.provision(&project).await.unwrap_err();
        assert_eq!(err.code(), "invalid_state");
    }
}
