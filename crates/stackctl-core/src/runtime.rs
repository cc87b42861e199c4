//! Container runtime seam
//!
//! The orchestrator never manages containers itself; it asks a
//! [`ContainerRuntime`] to start services, report their status, hand back
//! recent logs, and prepare networks and volumes. [`ComposeRuntime`] drives
//! `docker compose` through subprocesses.

use crate::error::RuntimeError;
use crate::exec::{self, CommandOutput};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Observed state of one service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    /// Running, no health check defined
    Running,
    /// Running and its container health check passes
    Healthy,
    /// Health check still in its start period
    Starting,
    /// Health check failing
    Unhealthy,
    /// Exited or stopped
    Stopped,
    /// No container exists
    Missing,
    /// Anything the runtime reports that is not listed above
    Other(String),
}

impl ServiceStatus {
    /// Parse the runtime's state/health strings.
    ///
    /// A non-empty health value wins over the plain state.
    #[must_use]
    pub fn from_state(state: &str, health: &str) -> Self {
        match health.trim().to_ascii_lowercase().as_str() {
            "healthy" => return Self::Healthy,
            "unhealthy" => return Self::Unhealthy,
            "starting" => return Self::Starting,
            _ => {}
        }
        match state.trim().to_ascii_lowercase().as_str() {
            "" => Self::Missing,
            "running" => Self::Running,
            "restarting" | "created" => Self::Starting,
            "exited" | "dead" | "paused" | "removing" | "stopped" => Self::Stopped,
            other => Self::Other(other.to_string()),
        }
    }

    /// True if the service can be depended upon
    #[inline]
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Running | Self::Healthy)
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => f.write_str("running"),
            Self::Healthy => f.write_str("healthy"),
            Self::Starting => f.write_str("starting"),
            Self::Unhealthy => f.write_str("unhealthy"),
            Self::Stopped => f.write_str("stopped"),
            Self::Missing => f.write_str("missing"),
            Self::Other(s) => f.write_str(s),
        }
    }
}

/// An existing container network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInfo {
    /// Network name
    pub name: String,
    /// Configured subnets (CIDR)
    pub subnets: Vec<String>,
}

/// Operations the orchestrator needs from the container runtime
#[async_trait::async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Start a service; an error means the start command failed
    async fn start(&self, service: &str) -> Result<(), RuntimeError>;

    /// Current status of a service
    async fn status(&self, service: &str) -> Result<ServiceStatus, RuntimeError>;

    /// Last `tail` lines of the service's logs
    async fn logs(&self, service: &str, tail: usize) -> Result<String, RuntimeError>;

    /// Look up a network by name
    async fn inspect_network(&self, name: &str) -> Result<Option<NetworkInfo>, RuntimeError>;

    /// Create an isolated bridge network
    async fn create_network(&self, name: &str, subnet: Option<&str>) -> Result<(), RuntimeError>;

    /// True if the named volume exists
    async fn volume_exists(&self, name: &str) -> Result<bool, RuntimeError>;

    /// Create a named volume
    async fn create_volume(&self, name: &str) -> Result<(), RuntimeError>;
}

/// `docker compose` backed runtime
#[derive(Debug, Clone)]
pub struct ComposeRuntime {
    docker: String,
    compose_file: PathBuf,
    project: String,
    command_timeout: Duration,
}

impl ComposeRuntime {
    /// Runtime for one compose project
    #[must_use]
    pub fn new(compose_file: impl Into<PathBuf>, project: impl Into<String>, command_timeout: Duration) -> Self {
        Self {
            docker: "docker".to_string(),
            compose_file: compose_file.into(),
            project: project.into(),
            command_timeout,
        }
    }

    /// Use a different docker-compatible binary (e.g. `podman`)
    #[must_use]
    pub fn with_binary(mut self, docker: impl Into<String>) -> Self {
        self.docker = docker.into();
        self
    }

    fn compose_args(&self, rest: &[&str]) -> Vec<String> {
        let mut args = vec![
            "compose".to_string(),
            "-f".to_string(),
            self.compose_file.display().to_string(),
            "-p".to_string(),
            self.project.clone(),
        ];
        args.extend(rest.iter().map(|s| (*s).to_string()));
        args
    }

    async fn docker(&self, args: Vec<String>) -> Result<CommandOutput, RuntimeError> {
        tracing::trace!(program = %self.docker, ?args, "runtime command");
        Ok(exec::run(&self.docker, &args, self.command_timeout).await?)
    }

    fn check(operation: &'static str, target: &str, out: CommandOutput) -> Result<CommandOutput, RuntimeError> {
        if out.success() {
            Ok(out)
        } else {
            Err(RuntimeError::CommandFailed {
                operation,
                target: target.to_string(),
                code: out.code,
                stderr: out.error_tail(10),
            })
        }
    }
}

fn is_not_found(out: &CommandOutput) -> bool {
    let stderr = out.stderr.to_ascii_lowercase();
    stderr.contains("no such") || stderr.contains("not found")
}

#[async_trait::async_trait]
impl ContainerRuntime for ComposeRuntime {
    async fn start(&self, service: &str) -> Result<(), RuntimeError> {
        let out = self.docker(self.compose_args(&["up", "-d", "--no-deps", service])).await?;
        Self::check("start", service, out).map(|_| ())
    }

    async fn status(&self, service: &str) -> Result<ServiceStatus, RuntimeError> {
        let out = self
            .docker(self.compose_args(&["ps", "-a", "--format", "{{.State}}|{{.Health}}", service]))
            .await?;
        let out = Self::check("status", service, out)?;
        let line = out.stdout.lines().find(|l| !l.trim().is_empty()).unwrap_or_default();
        let (state, health) = line.split_once('|').unwrap_or((line, ""));
        Ok(ServiceStatus::from_state(state, health))
    }

    async fn logs(&self, service: &str, tail: usize) -> Result<String, RuntimeError> {
        let tail = tail.to_string();
        let out = self
            .docker(self.compose_args(&["logs", "--no-color", "--tail", &tail, service]))
            .await?;
        let out = Self::check("logs", service, out)?;
        Ok(out.stdout)
    }

    async fn inspect_network(&self, name: &str) -> Result<Option<NetworkInfo>, RuntimeError> {
        let args = vec![
            "network".to_string(),
            "inspect".to_string(),
            name.to_string(),
            "--format".to_string(),
            "{{range .IPAM.Config}}{{.Subnet}} {{end}}".to_string(),
        ];
        let out = self.docker(args).await?;
        if !out.success() && is_not_found(&out) {
            return Ok(None);
        }
        let out = Self::check("inspect network", name, out)?;
        Ok(Some(NetworkInfo {
            name: name.to_string(),
            subnets: out.stdout.split_whitespace().map(str::to_string).collect(),
        }))
    }

    async fn create_network(&self, name: &str, subnet: Option<&str>) -> Result<(), RuntimeError> {
        let mut args = vec!["network".to_string(), "create".to_string(), "--driver".to_string(), "bridge".to_string()];
        if let Some(subnet) = subnet {
            args.push("--subnet".to_string());
            args.push(subnet.to_string());
        }
        args.push(name.to_string());
        let out = self.docker(args).await?;
        Self::check("create network", name, out).map(|_| ())
    }

    async fn volume_exists(&self, name: &str) -> Result<bool, RuntimeError> {
        let args = vec!["volume".to_string(), "inspect".to_string(), name.to_string()];
        let out = self.docker(args).await?;
        if out.success() {
            Ok(true)
        } else if is_not_found(&out) {
            Ok(false)
        } else {
            Self::check("inspect volume", name, out).map(|_| true)
        }
    }

    async fn create_volume(&self, name: &str) -> Result<(), RuntimeError> {
        let args = vec!["volume".to_string(), "create".to_string(), name.to_string()];
        let out = self.docker(args).await?;
        Self::check("create volume", name, out).map(|_| ())
    }
}
