//! Container runtime seam and the Docker CLI implementation.

use crate::error::AppError;
use crate::registry::{ResourceLimits, Secret};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("failed to launch {bin}: {source}")]
    Spawn {
        bin: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` did not finish within {after:?}")]
    Timeout { command: String, after: Duration },
    #[error("`{command}` failed ({status}): {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },
}

impl From<RuntimeError> for AppError {
    fn from(e: RuntimeError) -> Self {
        AppError::Provisioning(e.to_string())
    }
}

/// Everything needed to launch one database instance.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub network: String,
    pub volume: String,
    /// Mount point of the volume inside the container.
    pub data_dir: String,
    pub host_port: u16,
    pub container_port: u16,
    pub limits: ResourceLimits,
    pub labels: Vec<(String, String)>,
    /// Passed through the child environment, never on the command line.
    pub secret_env: Vec<(String, Secret)>,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn create_network(&self, name: &str) -> Result<(), RuntimeError>;
    async fn create_volume(&self, name: &str) -> Result<(), RuntimeError>;
    /// Create and start a container; returns the runtime's id for it.
    async fn run(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;
    async fn start(&self, name: &str) -> Result<(), RuntimeError>;
    async fn stop(&self, name: &str) -> Result<(), RuntimeError>;
    /// Force-remove; a missing container is not an error.
    async fn remove(&self, name: &str) -> Result<(), RuntimeError>;
    async fn remove_network(&self, name: &str) -> Result<(), RuntimeError>;
    async fn remove_volume(&self, name: &str) -> Result<(), RuntimeError>;
    async fn is_running(&self, name: &str) -> Result<bool, RuntimeError>;
}

/// Drives the `docker` binary.
pub struct DockerCli {
    bin: String,
    timeout: Duration,
}

impl DockerCli {
    pub fn new(bin: impl Into<String>, timeout: Duration) -> Self {
        Self {
            bin: bin.into(),
            timeout,
        }
    }

    fn describe(&self, args: &[String]) -> String {
        format!("{} {}", self.bin, args.first().map(String::as_str).unwrap_or_default())
    }

    async fn exec(&self, args: &[String], env: &[(String, Secret)]) -> Result<String, RuntimeError> {
        let mut cmd = Command::new(&self.bin);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (k, v) in env {
            cmd.env(k, v.expose());
        }
        debug!(bin = %self.bin, args = ?args, "runtime command");
        // kill_on_drop reaps the child when the timeout drops the future
        let out = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(out) => out.map_err(|source| RuntimeError::Spawn {
                bin: self.bin.clone(),
                source,
            })?,
            Err(_) => {
                return Err(RuntimeError::Timeout {
                    command: self.describe(args),
                    after: self.timeout,
                })
            }
        };
        if out.status.success() {
            Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
        } else {
            Err(RuntimeError::Command {
                command: self.describe(args),
                status: out.status.to_string(),
                stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            })
        }
    }

    /// Run, treating "no such object" or "already exists" style failures as success.
    async fn exec_tolerant(&self, args: &[String], tolerated: &[&str]) -> Result<(), RuntimeError> {
        match self.exec(args, &[]).await {
            Ok(_) => Ok(()),
            Err(RuntimeError::Command { stderr, .. })
                if tolerated.iter().any(|t| stderr.to_ascii_lowercase().contains(t)) =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

fn args(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// `docker run` arguments. Secret values are referenced by name only.
pub fn run_args(spec: &ContainerSpec) -> Vec<String> {
    let mut a = args(&["run", "-d", "--name", &spec.name, "--network", &spec.network]);
    a.push("--memory".into());
    a.push(format!("{}m", spec.limits.memory_mb));
    a.push("--cpus".into());
    a.push(format!("{}", spec.limits.cpu_share));
    a.push("-v".into());
    a.push(format!("{}:{}", spec.volume, spec.data_dir));
    a.push("-p".into());
    a.push(format!("{}:{}", spec.host_port, spec.container_port));
    for (k, v) in &spec.labels {
        a.push("--label".into());
        a.push(format!("{}={}", k, v));
    }
    for (k, _) in &spec.secret_env {
        a.push("-e".into());
        a.push(k.clone());
    }
    a.push(spec.image.clone());
    a
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn create_network(&self, name: &str) -> Result<(), RuntimeError> {
        self.exec_tolerant(&args(&["network", "create", "--driver", "bridge", name]), &["already exists"])
            .await
    }

    async fn create_volume(&self, name: &str) -> Result<(), RuntimeError> {
        self.exec(&args(&["volume", "create", name]), &[]).await.map(|_| ())
    }

    async fn run(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        self.exec(&run_args(spec), &spec.secret_env).await
    }

    async fn start(&self, name: &str) -> Result<(), RuntimeError> {
        self.exec(&args(&["start", name]), &[]).await.map(|_| ())
    }

    async fn stop(&self, name: &str) -> Result<(), RuntimeError> {
        self.exec_tolerant(&args(&["stop", name]), &["no such container"]).await
    }

    async fn remove(&self, name: &str) -> Result<(), RuntimeError> {
        self.exec_tolerant(&args(&["rm", "-f", name]), &["no such container"]).await
    }

    async fn remove_network(&self, name: &str) -> Result<(), RuntimeError> {
        self.exec_tolerant(&args(&["network", "rm", name]), &["not found", "no such network"])
            .await
    }

    async fn remove_volume(&self, name: &str) -> Result<(), RuntimeError> {
        self.exec_tolerant(&args(&["volume", "rm", "-f", name]), &["no such volume"]).await
    }

    async fn is_running(&self, name: &str) -> Result<bool, RuntimeError> {
        match self
            .exec(&args(&["inspect", "-f", "{{.State.Running}}", name]), &[])
            .await
        {
            Ok(out) => Ok(out == "true"),
            Err(RuntimeError::Command { stderr, .. }) if stderr.to_ascii_lowercase().contains("no such") => Ok(false),
            Err(e) => Err(e),
        }
    }
}
