//! Readiness probes

use crate::error::ProbeError;
use crate::exec;
use crate::rollout::ServiceSpec;
use crate::runtime::ContainerRuntime;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// How a service proves it is ready
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReadinessProbe {
    /// GET the URL; any 2xx passes unless `expected_status` is set
    Http {
        /// Target URL
        url: String,
        /// Exact status to require
        #[serde(default)]
        expected_status: Option<u16>,
    },
    /// Run a command; exit 0 passes
    Command {
        /// Program to run
        program: String,
        /// Arguments
        #[serde(default)]
        args: Vec<String>,
    },
    /// Ask the container runtime; `running` or `healthy` passes
    #[default]
    Status,
}

impl ReadinessProbe {
    /// Short label for plans and logs
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Http { .. } => "http",
            Self::Command { .. } => "command",
            Self::Status => "status",
        }
    }
}

/// Runs one readiness check for a service
///
/// A single call is one attempt; retrying and timeouts are the caller's job.
#[async_trait::async_trait]
pub trait Prober: Send + Sync {
    /// Check the service once
    async fn probe(&self, service: &ServiceSpec) -> Result<(), ProbeError>;
}

/// Prober backed by an HTTP client, subprocesses and the container runtime
pub struct StandardProber {
    http: reqwest::Client,
    runtime: Arc<dyn ContainerRuntime>,
    command_timeout: Duration,
}

impl StandardProber {
    /// Create a prober; `command_timeout` bounds HTTP requests and probe commands
    #[must_use]
    pub fn new(runtime: Arc<dyn ContainerRuntime>, command_timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(command_timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            runtime,
            command_timeout,
        }
    }

    async fn http(&self, url: &str, expected: Option<u16>) -> Result<(), ProbeError> {
        let response = self.http.get(url).send().await.map_err(|source| ProbeError::Http {
            url: url.to_string(),
            source,
        })?;
        let status = response.status();
        let ok = match expected {
            Some(code) => status.as_u16() == code,
            None => status.is_success(),
        };
        if ok {
            Ok(())
        } else {
            Err(ProbeError::UnexpectedStatus {
                url: url.to_string(),
                status: status.as_u16(),
            })
        }
    }

    async fn command(&self, program: &str, args: &[String]) -> Result<(), ProbeError> {
        let out = exec::run(program, args, self.command_timeout).await?;
        if out.success() {
            Ok(())
        } else {
            Err(ProbeError::CommandFailed {
                program: program.to_string(),
                code: out.code,
            })
        }
    }

    async fn status(&self, service: &str) -> Result<(), ProbeError> {
        let status = self.runtime.status(service).await?;
        if status.is_ready() {
            Ok(())
        } else {
            Err(ProbeError::NotReady {
                service: service.to_string(),
                status: status.to_string(),
            })
        }
    }
}

#[async_trait::async_trait]
impl Prober for StandardProber {
    async fn probe(&self, service: &ServiceSpec) -> Result<(), ProbeError> {
        match &service.probe {
            ReadinessProbe::Http { url, expected_status } => self.http(url, *expected_status).await,
            ReadinessProbe::Command { program, args } => self.command(program, args).await,
            ReadinessProbe::Status => self.status(&service.name).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RuntimeError;
    use crate::runtime::{NetworkInfo, ServiceStatus};

    struct FixedStatus(ServiceStatus);

    #[async_trait::async_trait]
    impl ContainerRuntime for FixedStatus {
        async fn start(&self, _: &str) -> Result<(), RuntimeError> {
            Ok(())
        }
        async fn status(&self, _: &str) -> Result<ServiceStatus, RuntimeError> {
            Ok(self.0.clone())
        }
        async fn logs(&self, _: &str, _: usize) -> Result<String, RuntimeError> {
            Ok(String::new())
        }
        async fn inspect_network(&self, _: &str) -> Result<Option<NetworkInfo>, RuntimeError> {
            Ok(None)
        }
        async fn create_network(&self, _: &str, _: Option<&str>) -> Result<(), RuntimeError> {
            Ok(())
        }
        async fn volume_exists(&self, _: &str) -> Result<bool, RuntimeError> {
            Ok(false)
        }
        async fn create_volume(&self, _: &str) -> Result<(), RuntimeError> {
            Ok(())
        }
    }

    fn prober(status: ServiceStatus) -> StandardProber {
        StandardProber::new(Arc::new(FixedStatus(status)), Duration::from_secs(5))
    }

    #[test]
    fn probe_kind_parses_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            probe: ReadinessProbe,
        }
        let w: Wrapper = toml::from_str(r#"probe = { kind = "http", url = "http://api:8080/health" }"#).unwrap();
        assert_eq!(
            w.probe,
            ReadinessProbe::Http {
                url: "http://api:8080/health".into(),
                expected_status: None
            }
        );
        let w: Wrapper = toml::from_str(r#"probe = { kind = "status" }"#).unwrap();
        assert_eq!(w.probe.kind(), "status");
    }

    #[tokio::test]
    async fn status_probe_follows_runtime() {
        let spec = ServiceSpec::new("api", 1);
        assert!(prober(ServiceStatus::Healthy).probe(&spec).await.is_ok());

        let err = prober(ServiceStatus::Starting).probe(&spec).await.unwrap_err();
        assert!(matches!(err, ProbeError::NotReady { ref status, .. } if status == "starting"));
    }

    #[tokio::test]
    async fn command_probe_uses_exit_code() {
        let ok = ServiceSpec::new("db", 0).with_probe(ReadinessProbe::Command {
            program: "true".into(),
            args: vec![],
        });
        assert!(prober(ServiceStatus::Missing).probe(&ok).await.is_ok());

        let failing = ServiceSpec::new("db", 0).with_probe(ReadinessProbe::Command {
            program: "sh".into(),
            args: vec!["-c".into(), "exit 2".into()],
        });
        let err = prober(ServiceStatus::Missing).probe(&failing).await.unwrap_err();
        assert!(matches!(err, ProbeError::CommandFailed { code: Some(2), .. }));
    }

    #[tokio::test]
    async fn http_probe_connection_refused_is_an_error() {
        // port 9 (discard) is closed on test hosts
        let spec = ServiceSpec::new("api", 1).with_probe(ReadinessProbe::Http {
            url: "http://127.0.0.1:9/health".into(),
            expected_status: None,
        });
        let err = prober(ServiceStatus::Running).probe(&spec).await.unwrap_err();
        assert!(matches!(err, ProbeError::Http { .. }));
    }
}
