//! Error types for stackctl
//!
//! One enum per component, aggregated into [`StackError`] at the process
//! boundary:
//! - Configuration and manifest problems (fatal, before anything starts)
//! - Provisioning failures (fatal, before any service starts)
//! - Collaborator failures (runtime, probes, proxy, certificate client)
//! - Certificate cutover failures (always resolved to a safe proxy state)
//!
//! Unhealthy services are not errors: they are recorded in the
//! [`RolloutResult`](crate::rollout::RolloutResult).

use crate::cutover::CutoverState;
use crate::report::ExitCode;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level error for a stackctl run
#[derive(Debug, thiserror::Error)]
pub enum StackError {
    /// Environment bundle failed validation
    #[error("configuration invalid: {0}")]
    Config(#[from] ConfigError),

    /// Manifest could not be read or parsed
    #[error("manifest invalid: {0}")]
    Manifest(#[from] ManifestError),

    /// Service tiers are inconsistent
    #[error("rollout plan invalid: {0}")]
    Plan(#[from] PlanError),

    /// Directories, network or volumes could not be prepared
    #[error("provisioning failed: {0}")]
    Provision(#[from] ProvisionError),

    /// Certificate cutover failed (proxy left in a known-good state)
    #[error("certificate cutover failed: {0}")]
    Cutover(#[from] CutoverError),

    /// Anything else
    #[error("internal error: {0}")]
    Internal(String),
}

impl StackError {
    /// Process exit code for this error
    #[must_use]
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Self::Config(_) | Self::Manifest(_) | Self::Plan(_) => ExitCode::ConfigInvalid,
            Self::Provision(_) => ExitCode::ProvisionFailed,
            Self::Cutover(_) => ExitCode::CutoverFailed,
            Self::Internal(_) => ExitCode::Internal,
        }
    }
}

/// Environment bundle validation errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required key absent or empty
    #[error("missing required key {0}")]
    MissingKey(String),

    /// Placeholder value or below minimum length
    #[error("weak value for {key}: {reason}")]
    WeakValue { key: String, reason: String },

    /// Failed a pattern or range validator
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    /// Env file line is not `KEY=value`
    #[error("{source_name}:{line}: {reason}")]
    Malformed {
        source_name: String,
        line: usize,
        reason: String,
    },

    /// Env file unreadable
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ConfigError {
    /// Key the error refers to, if any
    #[must_use]
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::MissingKey(key) => Some(key),
            Self::WeakValue { key, .. } | Self::InvalidValue { key, .. } => Some(key),
            Self::Malformed { .. } | Self::Io { .. } => None,
        }
    }
}

/// Manifest loading errors
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    /// Manifest unreadable
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// TOML syntax or schema error
    #[error("failed to parse manifest: {0}")]
    Parse(#[from] toml::de::Error),

    /// Semantically invalid value
    #[error("invalid manifest value for {field}: {reason}")]
    Invalid { field: String, reason: String },

    /// A command is needed but the manifest has no section for it
    #[error("manifest has no [{0}] section")]
    MissingSection(&'static str),
}

/// Rollout plan construction errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    /// Two services share a name
    #[error("service {0} is declared more than once")]
    DuplicateService(String),

    /// Dependency names no declared service
    #[error("service {service} depends on unknown service {dependency}")]
    UnknownDependency { service: String, dependency: String },

    /// Dependency would start after its dependent
    #[error("service {service} (tier {tier}) depends on {dependency} in later tier {dependency_tier}")]
    DependencyOnLaterTier {
        service: String,
        tier: u32,
        dependency: String,
        dependency_tier: u32,
    },

    /// Dependencies form a cycle
    #[error("dependency cycle between {}", .0.join(", "))]
    DependencyCycle(Vec<String>),

    /// Tier list not strictly ascending or a service filed under the wrong tier
    #[error("tier {0} is out of order or contains services from another tier")]
    TierOutOfOrder(u32),
}

/// Provisioning errors (all fatal)
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    /// Operator lacks rights on a path
    #[error("permission denied on {path}: {source}")]
    PermissionDenied {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Path exists but is not a directory
    #[error("{0} exists and is not a directory")]
    NotADirectory(PathBuf),

    /// Other filesystem failure
    #[error("filesystem error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Network or volume setup failed
    #[error("container runtime: {0}")]
    Runtime(#[from] RuntimeError),
}

/// Subprocess execution errors
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// Empty command line
    #[error("empty command")]
    EmptyCommand,

    /// Program could not be spawned
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Program ran past its timeout and was killed
    #[error("{program} timed out after {after:?}")]
    TimedOut { program: String, after: Duration },
}

/// Container runtime errors
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Runtime command could not run
    #[error(transparent)]
    Exec(#[from] ExecError),

    /// Runtime command exited nonzero
    #[error("{operation} failed for {target} (exit {code:?}): {stderr}")]
    CommandFailed {
        operation: &'static str,
        target: String,
        code: Option<i32>,
        stderr: String,
    },
}

/// Readiness probe failures; every variant counts against the retry budget
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    /// HTTP request failed (connection refused, DNS, TLS)
    #[error("GET {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// HTTP status was not the expected one
    #[error("GET {url} returned {status}")]
    UnexpectedStatus { url: String, status: u16 },

    /// Probe command exited nonzero
    #[error("{program} exited with {code:?}")]
    CommandFailed { program: String, code: Option<i32> },

    /// Probe command could not run
    #[error(transparent)]
    Exec(#[from] ExecError),

    /// Runtime reports the service as not ready
    #[error("service {service} is {status}")]
    NotReady { service: String, status: String },

    /// Runtime status query failed
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// Reverse proxy errors
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// No live configuration file exists
    #[error("no live proxy configuration at {0}")]
    NoLiveConfig(PathBuf),

    /// Candidate failed the proxy's syntax/config check
    #[error("candidate {mode} configuration rejected: {reason}")]
    ValidationFailed { mode: String, reason: String },

    /// Reload failed; the previous configuration was put back
    #[error("proxy reload failed: {0}")]
    ReloadFailed(String),

    /// Configuration file could not be read or written
    #[error("proxy configuration I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Validate or reload command could not run
    #[error(transparent)]
    Exec(#[from] ExecError),
}

/// Typed failures of the external certificate client
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CertClientError {
    /// CA rate limit hit
    #[error("rate limited by certificate authority: {0}")]
    RateLimited(String),

    /// Challenge validation failed
    #[error("domain validation failed: {0}")]
    ValidationFailed(String),

    /// CA unreachable
    #[error("network error talking to certificate authority: {0}")]
    Network(String),

    /// Client ran past its timeout
    #[error("certificate client timed out after {0:?}")]
    Timeout(Duration),

    /// Client produced no readable certificate
    #[error("issued certificate unreadable: {0}")]
    Unreadable(String),

    /// Client program could not be run at all
    #[error("certificate client unavailable: {0}")]
    Unavailable(String),
}

/// Issued certificate did not pass verification
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CertificateError {
    /// PEM could not be parsed
    #[error("certificate could not be parsed: {0}")]
    Parse(String),

    /// `not_before` is in the future
    #[error("certificate is not valid until {0}")]
    NotYetValid(String),

    /// `not_after` has passed
    #[error("certificate expired at {0}")]
    Expired(String),

    /// Remaining validity under the threshold
    #[error("certificate expires in {remaining_days} days, minimum is {minimum_days}")]
    ExpiresTooSoon {
        remaining_days: i64,
        minimum_days: i64,
    },

    /// Requested domains not covered by the subject names
    #[error("certificate does not cover {}", .0.join(", "))]
    MissingNames(Vec<String>),
}

/// Cutover lock errors
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// Another cutover holds the lock
    #[error("cutover lock {path} is held ({holder})")]
    Held { path: PathBuf, holder: String },

    /// Lock file could not be created or inspected
    #[error("cutover lock {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Certificate cutover state machine errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateMachineError {
    /// Transition not in the table
    #[error("illegal cutover transition {from:?} -> {to:?}")]
    IllegalTransition {
        from: Option<CutoverState>,
        to: CutoverState,
    },
}

/// The step of a cutover that failed
#[derive(Debug, thiserror::Error)]
pub enum CutoverFailure {
    /// Certificate client failed
    #[error(transparent)]
    Client(#[from] CertClientError),

    /// Issued certificate failed verification
    #[error(transparent)]
    Certificate(#[from] CertificateError),

    /// Production candidate rejected or could not be applied
    #[error(transparent)]
    Proxy(#[from] ProxyError),
}

/// Certificate cutover errors
///
/// Every variant leaves the proxy in a previously valid configuration
/// except [`CutoverError::RestoreFailed`], which is reported loudly.
#[derive(Debug, thiserror::Error)]
pub enum CutoverError {
    /// Lock unavailable; nothing was touched
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Live configuration unreadable; nothing was touched
    #[error("cannot read live proxy configuration: {0}")]
    LiveConfig(#[source] ProxyError),

    /// Challenge candidate rejected; live configuration unchanged
    #[error("challenge configuration rejected, live configuration unchanged: {0}")]
    ChallengeRejected(#[source] ProxyError),

    /// Failure after entering challenge mode; previous configuration restored
    #[error("failed in {stage} state, rolled back to {restored} configuration: {cause}")]
    RolledBack {
        stage: CutoverState,
        restored: String,
        cause: CutoverFailure,
    },

    /// Failure and the restore also failed
    #[error("failed in {stage} state ({cause}) and restoring the previous configuration failed: {restore}")]
    RestoreFailed {
        stage: CutoverState,
        cause: CutoverFailure,
        restore: ProxyError,
    },

    /// Internal transition bug
    #[error(transparent)]
    StateMachine(#[from] StateMachineError),
}

impl CutoverError {
    /// True if the proxy is known to be serving a validated configuration
    #[inline]
    #[must_use]
    pub fn proxy_is_safe(&self) -> bool {
        !matches!(self, Self::RestoreFailed { .. } | Self::StateMachine(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_error_exit_codes_are_distinct() {
        let config = StackError::Config(ConfigError::MissingKey("DB_PASSWORD".into()));
        let provision = StackError::Provision(ProvisionError::NotADirectory("/srv".into()));
        let cutover = StackError::Cutover(CutoverError::LiveConfig(ProxyError::NoLiveConfig(
            "/etc/nginx/site.conf".into(),
        )));

        assert_eq!(config.exit_code(), ExitCode::ConfigInvalid);
        assert_eq!(provision.exit_code(), ExitCode::ProvisionFailed);
        assert_eq!(cutover.exit_code(), ExitCode::CutoverFailed);
        assert_ne!(config.exit_code().code(), provision.exit_code().code());
        assert_ne!(provision.exit_code().code(), cutover.exit_code().code());
    }

    #[test]
    fn plan_errors_are_config_errors() {
        let err = StackError::Plan(PlanError::DuplicateService("db".into()));
        assert_eq!(err.exit_code(), ExitCode::ConfigInvalid);
    }

    #[test]
    fn config_error_key() {
        let err = ConfigError::WeakValue {
            key: "JWT_SECRET".into(),
            reason: "too short".into(),
        };
        assert_eq!(err.key(), Some("JWT_SECRET"));
        assert!(err.to_string().contains("weak value"));
    }

    #[test]
    fn restore_failure_is_unsafe() {
        let err = CutoverError::RestoreFailed {
            stage: CutoverState::Issuing,
            cause: CutoverFailure::Client(CertClientError::Network("dns".into())),
            restore: ProxyError::ReloadFailed("nginx down".into()),
        };
        assert!(!err.proxy_is_safe());

        let err = CutoverError::RolledBack {
            stage: CutoverState::Issuing,
            restored: "production".into(),
            cause: CutoverFailure::Client(CertClientError::RateLimited("429".into())),
        };
        assert!(err.proxy_is_safe());
    }
}
