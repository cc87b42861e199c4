//! Stack manifest (TOML)
//!
//! Describes the container runtime, what to provision, probe defaults, the
//! services and their tiers, and the certificate cutover. Unknown fields
//! are rejected. Relative paths are resolved against the manifest's
//! directory.

use crate::certificate::CertbotClient;
use crate::config::ConfigBundle;
use crate::cutover::CutoverSettings;
use crate::error::{ManifestError, ProxyError};
use crate::probe::ReadinessProbe;
use crate::provision::{NetworkSpec, ProvisionSpec};
use crate::proxy::{FileProxy, ProxyTemplates, CONFIG_PLACEHOLDER};
use crate::retry::RetryPolicy;
use crate::rollout::{Criticality, ServiceRole, ServiceSpec};
use crate::runtime::ComposeRuntime;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_compose_file() -> PathBuf {
    PathBuf::from("docker-compose.yml")
}
fn default_project() -> String {
    "stack".to_string()
}
fn default_docker() -> String {
    "docker".to_string()
}
const fn default_command_timeout() -> u64 {
    60
}
const fn default_log_tail() -> usize {
    50
}
const fn default_interval() -> u64 {
    5
}
const fn default_max_attempts() -> u32 {
    10
}
const fn default_attempt_timeout() -> u64 {
    5
}
const fn default_multiplier() -> f64 {
    1.0
}
const fn default_max_interval() -> u64 {
    30
}
fn default_lock_path() -> PathBuf {
    PathBuf::from("/var/lock/stackctl-cutover.lock")
}
const fn default_lock_stale() -> u64 {
    3600
}
const fn default_min_validity() -> i64 {
    30
}
const fn default_client_timeout() -> u64 {
    300
}
fn default_certbot() -> String {
    "certbot".to_string()
}

/// `[runtime]`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeSection {
    /// Compose file
    #[serde(default = "default_compose_file")]
    pub compose_file: PathBuf,
    /// Compose project name
    #[serde(default = "default_project")]
    pub project: String,
    /// docker-compatible CLI
    #[serde(default = "default_docker")]
    pub docker: String,
    /// Timeout for every runtime, probe and proxy command
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    /// Log lines kept in diagnostic snapshots
    #[serde(default = "default_log_tail")]
    pub log_tail_lines: usize,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            compose_file: default_compose_file(),
            project: default_project(),
            docker: default_docker(),
            command_timeout_secs: default_command_timeout(),
            log_tail_lines: default_log_tail(),
        }
    }
}

/// `[provision.network]`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkSection {
    /// Network name
    pub name: String,
    /// Subnet (CIDR)
    pub subnet: Option<String>,
}

/// `[provision]`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProvisionSection {
    /// Directories to create
    #[serde(default)]
    pub directories: Vec<PathBuf>,
    /// Permission bits
    pub mode: Option<u32>,
    /// Owner uid
    pub owner_uid: Option<u32>,
    /// Owner gid
    pub owner_gid: Option<u32>,
    /// Shared network
    pub network: Option<NetworkSection>,
    /// Named volumes
    #[serde(default)]
    pub volumes: Vec<String>,
}

/// `[probe]` defaults
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProbeDefaults {
    /// Seconds between attempts
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    /// Attempts per service
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Timeout of one attempt
    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout_secs: u64,
    /// Delay growth per attempt
    #[serde(default = "default_multiplier")]
    pub backoff_multiplier: f64,
    /// Cap on the grown delay
    #[serde(default = "default_max_interval")]
    pub max_interval_secs: u64,
}

impl Default for ProbeDefaults {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
            max_attempts: default_max_attempts(),
            attempt_timeout_secs: default_attempt_timeout(),
            backoff_multiplier: default_multiplier(),
            max_interval_secs: default_max_interval(),
        }
    }
}

/// `[rollout]`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RolloutSection {
    /// Run-level deadline
    pub run_timeout_secs: Option<u64>,
}

/// `[[service]]`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceEntry {
    /// Service name in the compose file
    pub name: String,
    /// Tier index
    pub tier: u32,
    /// Role
    #[serde(default)]
    pub role: ServiceRole,
    /// Explicit criticality; defaults from the role
    pub criticality: Option<Criticality>,
    /// Dependencies
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Total readiness budget; defaults to interval × attempts
    pub startup_timeout_secs: Option<u64>,
    /// Per-service interval override
    pub interval_secs: Option<u64>,
    /// Per-service attempts override
    pub max_attempts: Option<u32>,
    /// Readiness probe
    #[serde(default)]
    pub probe: ReadinessProbe,
}

/// `[cutover.proxy]`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxySection {
    /// Live configuration file the proxy reads
    pub live_config: PathBuf,
    /// Challenge-mode template
    pub challenge_config: PathBuf,
    /// Production template
    pub production_config: PathBuf,
    /// Checker; `{config}` is replaced by the candidate path and must appear
    #[serde(default)]
    pub validate_command: Vec<String>,
    /// Reload command
    #[serde(default)]
    pub reload_command: Vec<String>,
}

/// `[cutover.client]`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientSection {
    /// Client program
    #[serde(default = "default_certbot")]
    pub program: String,
    /// Directory served under the challenge path
    pub webroot: PathBuf,
    /// Chain the client installs
    pub cert_path: PathBuf,
    /// Use the CA's staging environment
    #[serde(default)]
    pub staging: bool,
}

/// `[cutover]`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CutoverSection {
    /// Names to cover; defaults to `DOMAIN` from the bundle
    #[serde(default)]
    pub domains: Vec<String>,
    /// Contact; defaults to `ACME_EMAIL` from the bundle
    pub contact_email: Option<String>,
    /// Lock file
    #[serde(default = "default_lock_path")]
    pub lock_path: PathBuf,
    /// Age after which a lock is stale
    #[serde(default = "default_lock_stale")]
    pub lock_stale_after_secs: u64,
    /// Minimum remaining certificate validity
    #[serde(default = "default_min_validity")]
    pub min_validity_days: i64,
    /// Certificate client timeout
    #[serde(default = "default_client_timeout")]
    pub client_timeout_secs: u64,
    /// Reverse proxy
    pub proxy: ProxySection,
    /// Certificate client
    pub client: ClientSection,
}

/// Parsed manifest
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    /// `[runtime]`
    #[serde(default)]
    pub runtime: RuntimeSection,
    /// `[provision]`
    #[serde(default)]
    pub provision: ProvisionSection,
    /// `[probe]`
    #[serde(default)]
    pub probe: ProbeDefaults,
    /// `[rollout]`
    #[serde(default)]
    pub rollout: RolloutSection,
    /// `[[service]]`
    #[serde(default, rename = "service")]
    pub services: Vec<ServiceEntry>,
    /// `[cutover]`
    pub cutover: Option<CutoverSection>,
    #[serde(skip)]
    base_dir: PathBuf,
}

/// Upper bound for every `*_secs` field (30 days)
pub const MAX_DURATION_SECS: u64 = 30 * 24 * 60 * 60;

fn check_secs(field: impl Into<String>, secs: Option<u64>) -> Result<(), ManifestError> {
    match secs {
        Some(secs) if secs > MAX_DURATION_SECS => Err(invalid(
            field,
            format!("{secs} exceeds the maximum of {MAX_DURATION_SECS} seconds"),
        )),
        _ => Ok(()),
    }
}

fn invalid(field: impl Into<String>, reason: impl Into<String>) -> ManifestError {
    ManifestError::Invalid {
        field: field.into(),
        reason: reason.into(),
    }
}

impl Manifest {
    /// Read and validate a manifest file
    ///
    /// # Errors
    /// I/O, TOML or validation errors
    pub fn from_file(path: &Path) -> Result<Self, ManifestError> {
        let text = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut manifest = Self::from_toml(&text)?;
        manifest.base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        tracing::debug!(path = %path.display(), services = manifest.services.len(), "manifest loaded");
        Ok(manifest)
    }

    /// Parse and validate manifest text; relative paths stay relative
    ///
    /// # Errors
    /// TOML or validation errors
    pub fn from_toml(text: &str) -> Result<Self, ManifestError> {
        let manifest: Self = toml::from_str(text)?;
        manifest.validate()?;
        Ok(manifest)
    }

    fn validate(&self) -> Result<(), ManifestError> {
        let p = &self.probe;
        if p.max_attempts == 0 {
            return Err(invalid("probe.max_attempts", "must be at least 1"));
        }
        if p.interval_secs == 0 {
            return Err(invalid("probe.interval_secs", "must be positive"));
        }
        if !(p.backoff_multiplier.is_finite() && p.backoff_multiplier >= 1.0) {
            return Err(invalid("probe.backoff_multiplier", "must be a finite number >= 1.0"));
        }
        if self.runtime.command_timeout_secs == 0 {
            return Err(invalid("runtime.command_timeout_secs", "must be positive"));
        }
        check_secs("runtime.command_timeout_secs", Some(self.runtime.command_timeout_secs))?;
        check_secs("probe.interval_secs", Some(p.interval_secs))?;
        check_secs("probe.attempt_timeout_secs", Some(p.attempt_timeout_secs))?;
        check_secs("probe.max_interval_secs", Some(p.max_interval_secs))?;
        check_secs("rollout.run_timeout_secs", self.rollout.run_timeout_secs)?;
        if let Some(mode) = self.provision.mode {
            if mode > 0o7777 {
                return Err(invalid("provision.mode", format!("{mode:o} is not a permission mode")));
            }
        }
        if self.provision.owner_uid.is_some() != self.provision.owner_gid.is_some() {
            return Err(invalid("provision.owner_uid", "owner_uid and owner_gid must be set together"));
        }
        for service in &self.services {
            if service.name.trim().is_empty() {
                return Err(invalid("service.name", "must not be empty"));
            }
            if service.max_attempts == Some(0) {
                return Err(invalid(format!("service.{}.max_attempts", service.name), "must be at least 1"));
            }
            if service.interval_secs == Some(0) {
                return Err(invalid(format!("service.{}.interval_secs", service.name), "must be positive"));
            }
            check_secs(format!("service.{}.interval_secs", service.name), service.interval_secs)?;
            check_secs(
                format!("service.{}.startup_timeout_secs", service.name),
                service.startup_timeout_secs,
            )?;
        }
        if let Some(cutover) = &self.cutover {
            if cutover.min_validity_days < 0 {
                return Err(invalid("cutover.min_validity_days", "must not be negative"));
            }
            if cutover.proxy.reload_command.is_empty() {
                return Err(invalid("cutover.proxy.reload_command", "must not be empty"));
            }
            if cutover.proxy.validate_command.is_empty() {
                return Err(invalid("cutover.proxy.validate_command", "must not be empty"));
            }
            if !cutover.proxy.validate_command.iter().any(|arg| arg.contains(CONFIG_PLACEHOLDER)) {
                return Err(invalid(
                    "cutover.proxy.validate_command",
                    format!("must pass the candidate to the checker through {CONFIG_PLACEHOLDER}"),
                ));
            }
            check_secs("cutover.lock_stale_after_secs", Some(cutover.lock_stale_after_secs))?;
            check_secs("cutover.client_timeout_secs", Some(cutover.client_timeout_secs))?;
        }
        Ok(())
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    /// Timeout applied to runtime, probe and proxy commands
    #[must_use]
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.runtime.command_timeout_secs)
    }

    /// Run-level deadline, if any
    #[must_use]
    pub fn run_timeout(&self) -> Option<Duration> {
        self.rollout.run_timeout_secs.map(Duration::from_secs)
    }

    /// Retry policy from `[probe]`
    #[must_use]
    pub fn default_retry(&self) -> RetryPolicy {
        let p = &self.probe;
        let interval = Duration::from_secs(p.interval_secs);
        RetryPolicy::fixed(interval, p.max_attempts, interval.saturating_mul(p.max_attempts))
            .with_attempt_timeout(Duration::from_secs(p.attempt_timeout_secs))
            .with_backoff(p.backoff_multiplier, Duration::from_secs(p.max_interval_secs))
    }

    /// Services with effective criticality and retry budget
    #[must_use]
    pub fn service_specs(&self) -> Vec<ServiceSpec> {
        let defaults = self.default_retry();
        self.services
            .iter()
            .map(|entry| {
                let mut retry = defaults;
                if let Some(secs) = entry.interval_secs {
                    retry.interval = Duration::from_secs(secs);
                    retry.max_interval = retry.max_interval.max(retry.interval);
                }
                if let Some(attempts) = entry.max_attempts {
                    retry.max_attempts = attempts;
                }
                retry.total_timeout = entry
                    .startup_timeout_secs
                    .map_or(retry.interval.saturating_mul(retry.max_attempts), Duration::from_secs);

                let mut spec = ServiceSpec::new(entry.name.clone(), entry.tier)
                    .with_role(entry.role)
                    .with_probe(entry.probe.clone())
                    .with_retry(retry);
                if let Some(criticality) = entry.criticality {
                    spec = spec.with_criticality(criticality);
                }
                spec.depends_on.clone_from(&entry.depends_on);
                spec
            })
            .collect()
    }

    /// What to provision
    #[must_use]
    pub fn provision_spec(&self) -> ProvisionSpec {
        let p = &self.provision;
        ProvisionSpec {
            directories: p.directories.iter().map(|d| self.resolve(d)).collect(),
            mode: p.mode,
            owner: p.owner_uid.zip(p.owner_gid),
            network: p.network.as_ref().map(|n| NetworkSpec {
                name: n.name.clone(),
                subnet: n.subnet.clone(),
            }),
            volumes: p.volumes.clone(),
        }
    }

    /// Container runtime for this stack
    #[must_use]
    pub fn compose_runtime(&self) -> ComposeRuntime {
        ComposeRuntime::new(
            self.resolve(&self.runtime.compose_file),
            self.runtime.project.clone(),
            self.command_timeout(),
        )
        .with_binary(self.runtime.docker.clone())
    }

    fn cutover_section(&self) -> Result<&CutoverSection, ManifestError> {
        self.cutover.as_ref().ok_or(ManifestError::MissingSection("cutover"))
    }

    /// Cutover parameters, falling back to `DOMAIN` and `ACME_EMAIL`
    ///
    /// # Errors
    /// Missing `[cutover]`, or no domain or contact available
    pub fn cutover_settings(&self, bundle: &ConfigBundle) -> Result<CutoverSettings, ManifestError> {
        let c = self.cutover_section()?;
        let domains = if c.domains.is_empty() {
            bundle.get("DOMAIN").map(|d| vec![d.to_string()]).unwrap_or_default()
        } else {
            c.domains.clone()
        };
        if domains.is_empty() {
            return Err(invalid("cutover.domains", "no domains and no DOMAIN in the environment"));
        }
        let contact_email = c
            .contact_email
            .clone()
            .or_else(|| bundle.get("ACME_EMAIL").map(str::to_string))
            .ok_or_else(|| invalid("cutover.contact_email", "no contact and no ACME_EMAIL in the environment"))?;

        Ok(CutoverSettings {
            domains,
            contact_email,
            lock_path: self.resolve(&c.lock_path),
            lock_stale_after: Duration::from_secs(c.lock_stale_after_secs),
            min_validity_days: c.min_validity_days,
            client_timeout: Duration::from_secs(c.client_timeout_secs),
        })
    }

    /// Challenge and production templates
    ///
    /// # Errors
    /// Missing `[cutover]` or unreadable template
    pub fn proxy_templates(&self) -> Result<ProxyTemplates, ManifestError> {
        let c = self.cutover_section()?;
        ProxyTemplates::load(&self.resolve(&c.proxy.challenge_config), &self.resolve(&c.proxy.production_config))
            .map_err(|e| match e {
                ProxyError::Io { path, source } => ManifestError::Io { path, source },
                other => invalid("cutover.proxy", other.to_string()),
            })
    }

    /// File-backed proxy
    ///
    /// # Errors
    /// Missing `[cutover]`
    pub fn file_proxy(&self) -> Result<FileProxy, ManifestError> {
        let c = self.cutover_section()?;
        Ok(FileProxy::new(
            self.resolve(&c.proxy.live_config),
            c.proxy.validate_command.clone(),
            c.proxy.reload_command.clone(),
            self.command_timeout(),
        ))
    }

    /// certbot client
    ///
    /// # Errors
    /// Missing `[cutover]`
    pub fn certbot_client(&self) -> Result<CertbotClient, ManifestError> {
        let c = self.cutover_section()?;
        Ok(CertbotClient::new(
            c.client.program.clone(),
            self.resolve(&c.client.webroot),
            self.resolve(&c.client.cert_path),
            Duration::from_secs(c.client_timeout_secs),
        )
        .staging(c.client.staging))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigLoader, KeySpec};
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    const SAMPLE: &str = r#"
[runtime]
compose_file = "docker-compose.yml"
project = "web"
command_timeout_secs = 60
log_tail_lines = 20

[provision]
directories = ["data/postgres", "/srv/web/logs"]
mode = 0o750
volumes = ["pgdata"]

[provision.network]
name = "web_net"
subnet = "172.28.0.0/16"

[probe]
interval_secs = 5
max_attempts = 10

[rollout]
run_timeout_secs = 900

[[service]]
name = "postgres"
tier = 0
role = "data"
probe = { kind = "command", program = "pg_isready", args = ["-h", "localhost"] }

[[service]]
name = "api"
tier = 1
role = "auxiliary"
criticality = "blocking"
depends_on = ["postgres"]
startup_timeout_secs = 120
probe = { kind = "http", url = "http://localhost:8080/health" }

[[service]]
name = "prometheus"
tier = 2
role = "observability"
max_attempts = 3

[cutover]
lock_path = "/tmp/stackctl.lock"
[cutover.proxy]
live_config = "nginx/site.conf"
challenge_config = "nginx/challenge.conf"
production_config = "nginx/production.conf"
validate_command = ["nginx", "-t", "-c", "{config}"]
reload_command = ["nginx", "-s", "reload"]
[cutover.client]
webroot = "/var/www/certbot"
cert_path = "/etc/letsencrypt/live/example.com/fullchain.pem"
"#;

    fn bundle(pairs: &[(&str, &str)]) -> ConfigBundle {
        let map: BTreeMap<String, String> = pairs.iter().map(|(k, v)| ((*k).into(), (*v).into())).collect();
        ConfigLoader::new(vec![KeySpec::present("DOMAIN").optional()])
            .validate_map(map)
            .unwrap()
    }

    #[test]
    fn parses_sample() {
        let m = Manifest::from_toml(SAMPLE).unwrap();
        assert_eq!(m.runtime.project, "web");
        assert_eq!(m.services.len(), 3);
        assert_eq!(m.provision.mode, Some(0o750));
        assert_eq!(m.run_timeout(), Some(Duration::from_secs(900)));
    }

    #[test]
    fn criticality_defaults_from_role_unless_explicit() {
        let specs = Manifest::from_toml(SAMPLE).unwrap().service_specs();
        let by_name = |n: &str| specs.iter().find(|s| s.name == n).unwrap().criticality;
        assert_eq!(by_name("postgres"), Criticality::Blocking);
        assert_eq!(by_name("api"), Criticality::Blocking);
        assert_eq!(by_name("prometheus"), Criticality::BestEffort);
    }

    #[test]
    fn retry_budget_overrides() {
        let specs = Manifest::from_toml(SAMPLE).unwrap().service_specs();
        let api = specs.iter().find(|s| s.name == "api").unwrap();
        assert_eq!(api.retry.total_timeout, Duration::from_secs(120));
        assert_eq!(api.retry.max_attempts, 10);
        let prom = specs.iter().find(|s| s.name == "prometheus").unwrap();
        assert_eq!(prom.retry.max_attempts, 3);
        assert_eq!(prom.retry.total_timeout, Duration::from_secs(15));
        assert_eq!(prom.probe, ReadinessProbe::Status);
    }

    #[test]
    fn unknown_fields_rejected() {
        let err = Manifest::from_toml("[runtime]\nprojekt = \"web\"\n").unwrap_err();
        assert!(matches!(err, ManifestError::Parse(_)));

        let err = Manifest::from_toml("[[service]]\nname = \"a\"\ntier = 0\nblocking = true\n").unwrap_err();
        assert!(matches!(err, ManifestError::Parse(_)));
    }

    #[test]
    fn invalid_values_rejected() {
        let err = Manifest::from_toml("[probe]\nmax_attempts = 0\n").unwrap_err();
        assert!(matches!(err, ManifestError::Invalid { ref field, .. } if field == "probe.max_attempts"));

        let err = Manifest::from_toml("[provision]\nowner_uid = 1000\n").unwrap_err();
        assert!(matches!(err, ManifestError::Invalid { .. }));
    }

    fn invalid_field(text: &str) -> String {
        match Manifest::from_toml(text) {
            Err(ManifestError::Invalid { field, .. }) => field,
            other => panic!("expected an invalid field, got {other:?}"),
        }
    }

    #[test]
    fn validate_command_must_check_the_candidate() {
        let without = SAMPLE.replace("validate_command = [\"nginx\", \"-t\", \"-c\", \"{config}\"]\n", "");
        assert_eq!(invalid_field(&without), "cutover.proxy.validate_command");

        let live_only = SAMPLE.replace(
            "[\"nginx\", \"-t\", \"-c\", \"{config}\"]",
            "[\"sh\", \"-c\", \"grep -q server site.conf\"]",
        );
        assert_eq!(invalid_field(&live_only), "cutover.proxy.validate_command");
    }

    #[test]
    fn oversized_durations_rejected() {
        let huge = "9223372036854775807";
        assert_eq!(
            invalid_field(&format!("[[service]]\nname = \"api\"\ntier = 0\nstartup_timeout_secs = {huge}\n")),
            "service.api.startup_timeout_secs"
        );
        assert_eq!(invalid_field(&format!("[probe]\ninterval_secs = {huge}\n")), "probe.interval_secs");
        assert_eq!(
            invalid_field(&format!("[rollout]\nrun_timeout_secs = {huge}\n")),
            "rollout.run_timeout_secs"
        );

        let at_limit = format!("[probe]\ninterval_secs = {MAX_DURATION_SECS}\nmax_attempts = {}\n", u32::MAX);
        let m = Manifest::from_toml(&at_limit).unwrap();
        assert_eq!(m.default_retry().interval, Duration::from_secs(MAX_DURATION_SECS));
    }

    #[test]
    fn empty_manifest_is_valid() {
        let m = Manifest::from_toml("").unwrap();
        assert!(m.service_specs().is_empty());
        assert_eq!(m.provision_spec(), ProvisionSpec::default());
        assert!(matches!(
            m.cutover_settings(&bundle(&[])),
            Err(ManifestError::MissingSection("cutover"))
        ));
    }

    #[test]
    fn relative_paths_resolve_against_manifest_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("stack.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let m = Manifest::from_file(&path).unwrap();

        let spec = m.provision_spec();
        assert_eq!(spec.directories[0], tmp.path().join("data/postgres"));
        assert_eq!(spec.directories[1], PathBuf::from("/srv/web/logs"));
        assert_eq!(m.file_proxy().unwrap().live_path(), tmp.path().join("nginx/site.conf"));
    }

    #[test]
    fn cutover_falls_back_to_bundle() {
        let m = Manifest::from_toml(SAMPLE).unwrap();
        let settings = m
            .cutover_settings(&bundle(&[("DOMAIN", "example.com"), ("ACME_EMAIL", "ops@example.com")]))
            .unwrap();
        assert_eq!(settings.domains, vec!["example.com".to_string()]);
        assert_eq!(settings.contact_email, "ops@example.com");
        assert_eq!(settings.min_validity_days, 30);

        let err = m.cutover_settings(&bundle(&[])).unwrap_err();
        assert!(matches!(err, ManifestError::Invalid { ref field, .. } if field == "cutover.domains"));
    }

    #[test]
    fn bundled_sample_is_valid() {
        let m = Manifest::from_toml(include_str!("../../../deploy/stack.toml")).unwrap();
        let plan = crate::rollout::RolloutPlan::build(m.service_specs()).unwrap();
        assert_eq!(plan.tiers().len(), 4);
        assert!(plan.service("nginx").unwrap().is_blocking());
        assert!(!plan.service("grafana").unwrap().is_blocking());
        let proxy = &m.cutover.as_ref().unwrap().proxy;
        // server-block templates are only valid inside http {}
        assert!(proxy.validate_command.iter().any(|a| a.contains("http { include %s; }")));
        assert_eq!(proxy.validate_command.last().map(String::as_str), Some(CONFIG_PLACEHOLDER));
    }
}
