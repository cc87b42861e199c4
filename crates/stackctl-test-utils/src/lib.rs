//! Testing utilities for the stackctl workspace
//!
//! In-memory fakes for the runtime, prober, reverse proxy and certificate
//! client, plus fixtures (environment maps, self-signed certificates).

#![allow(missing_docs)]
#![allow(clippy::missing_panics_doc, clippy::must_use_candidate)]

use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::PKey;
use openssl::x509::extension::SubjectAlternativeName;
use openssl::x509::{X509Builder, X509NameBuilder};
use parking_lot::Mutex;
use stackctl_core::certificate::{CertificateClient, IssueRequest, IssuedCertificate};
use stackctl_core::probe::Prober;
use stackctl_core::proxy::{ProxyConfig, ReverseProxy};
use stackctl_core::retry::RetryPolicy;
use stackctl_core::rollout::ServiceSpec;
use stackctl_core::runtime::{ContainerRuntime, NetworkInfo, ServiceStatus};
use stackctl_core::{CertClientError, ProbeError, ProxyError, RuntimeError};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Self-signed certificate valid from now for `days`, covering `names`
/// (SAN entries; the first name is also the CN).
pub fn self_signed_pem(names: &[&str], days: u32) -> String {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
    let key = PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap();

    let mut subject = X509NameBuilder::new().unwrap();
    subject
        .append_entry_by_nid(Nid::COMMONNAME, names.first().copied().unwrap_or("localhost"))
        .unwrap();
    let subject = subject.build();

    let mut builder = X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    let serial = BigNum::from_u32(1).unwrap().to_asn1_integer().unwrap();
    builder.set_serial_number(&serial).unwrap();
    builder.set_subject_name(&subject).unwrap();
    builder.set_issuer_name(&subject).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
    builder.set_not_after(&Asn1Time::days_from_now(days).unwrap()).unwrap();

    if !names.is_empty() {
        let mut san = SubjectAlternativeName::new();
        for name in names {
            san.dns(name);
        }
        let ext = san.build(&builder.x509v3_context(None, None)).unwrap();
        builder.append_extension(ext).unwrap();
    }

    builder.sign(&key, MessageDigest::sha256()).unwrap();
    String::from_utf8(builder.build().to_pem().unwrap()).unwrap()
}

/// Environment that passes the standard schema
pub fn valid_env() -> BTreeMap<String, String> {
    [
        ("DB_USER", "app"),
        ("DB_PASSWORD", "k3Jd9sLq2mXv7pWz"),
        ("DB_NAME", "app"),
        ("REDIS_PASSWORD", "r8Tn4bQx1cVy6hEu"),
        ("JWT_SECRET", "Zp2Lm9Qw4Xc7Vb1Nk8Hj3Gf6Ds5Ar0Ty"),
        ("DOMAIN", "example.com"),
        ("ACME_EMAIL", "ops@example.com"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// Render a map as an env file
pub fn env_file(values: &BTreeMap<String, String>) -> String {
    values.iter().map(|(k, v)| format!("{k}={v}\n")).collect()
}

/// Short retry budget: 1s interval, `attempts` attempts
pub fn fast_retry(attempts: u32) -> RetryPolicy {
    let interval = Duration::from_secs(1);
    RetryPolicy::fixed(interval, attempts, interval * attempts).with_attempt_timeout(interval)
}

/// Blocking service with a fast retry budget
pub fn blocking(name: &str, tier: u32) -> ServiceSpec {
    ServiceSpec::new(name, tier).blocking().with_retry(fast_retry(3))
}

/// Best-effort service with a fast retry budget
pub fn best_effort(name: &str, tier: u32) -> ServiceSpec {
    ServiceSpec::new(name, tier).best_effort().with_retry(fast_retry(3))
}

// ---------------------------------------------------------------------------
// Container runtime
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RuntimeState {
    statuses: HashMap<String, ServiceStatus>,
    start_failures: HashSet<String>,
    logs: HashMap<String, String>,
    started: Vec<String>,
    networks: HashMap<String, NetworkInfo>,
    volumes: BTreeSet<String>,
    created_networks: Vec<String>,
    created_volumes: Vec<String>,
}

/// Runtime where every started service reports healthy unless told otherwise
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<RuntimeState>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(self, service: &str, status: ServiceStatus) -> Self {
        self.state.lock().statuses.insert(service.to_string(), status);
        self
    }

    pub fn fail_start(self, service: &str) -> Self {
        self.state.lock().start_failures.insert(service.to_string());
        self
    }

    pub fn with_logs(self, service: &str, logs: &str) -> Self {
        self.state.lock().logs.insert(service.to_string(), logs.to_string());
        self
    }

    pub fn with_network(self, name: &str, subnets: &[&str]) -> Self {
        self.state.lock().networks.insert(
            name.to_string(),
            NetworkInfo {
                name: name.to_string(),
                subnets: subnets.iter().map(|s| (*s).to_string()).collect(),
            },
        );
        self
    }

    pub fn with_volume(self, name: &str) -> Self {
        self.state.lock().volumes.insert(name.to_string());
        self
    }

    /// Services in the order they were started
    pub fn started(&self) -> Vec<String> {
        self.state.lock().started.clone()
    }

    pub fn was_started(&self, service: &str) -> bool {
        self.state.lock().started.iter().any(|s| s == service)
    }

    pub fn created_networks(&self) -> Vec<String> {
        self.state.lock().created_networks.clone()
    }

    pub fn created_volumes(&self) -> Vec<String> {
        self.state.lock().created_volumes.clone()
    }
}

#[async_trait::async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn start(&self, service: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock();
        state.started.push(service.to_string());
        if state.start_failures.contains(service) {
            return Err(RuntimeError::CommandFailed {
                operation: "start",
                target: service.to_string(),
                code: Some(1),
                stderr: format!("no such service: {service}"),
            });
        }
        Ok(())
    }

    async fn status(&self, service: &str) -> Result<ServiceStatus, RuntimeError> {
        let state = self.state.lock();
        if let Some(status) = state.statuses.get(service) {
            return Ok(status.clone());
        }
        let started = state.started.iter().any(|s| s == service) && !state.start_failures.contains(service);
        Ok(if started { ServiceStatus::Healthy } else { ServiceStatus::Missing })
    }

    async fn logs(&self, service: &str, tail: usize) -> Result<String, RuntimeError> {
        let state = self.state.lock();
        let logs = state.logs.get(service).map(String::as_str).unwrap_or_default();
        let lines: Vec<&str> = logs.lines().collect();
        Ok(lines[lines.len().saturating_sub(tail)..].join("\n"))
    }

    async fn inspect_network(&self, name: &str) -> Result<Option<NetworkInfo>, RuntimeError> {
        Ok(self.state.lock().networks.get(name).cloned())
    }

    async fn create_network(&self, name: &str, subnet: Option<&str>) -> Result<(), RuntimeError> {
        let mut state = self.state.lock();
        state.networks.insert(
            name.to_string(),
            NetworkInfo {
                name: name.to_string(),
                subnets: subnet.map(str::to_string).into_iter().collect(),
            },
        );
        state.created_networks.push(name.to_string());
        Ok(())
    }

    async fn volume_exists(&self, name: &str) -> Result<bool, RuntimeError> {
        Ok(self.state.lock().volumes.contains(name))
    }

    async fn create_volume(&self, name: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock();
        state.volumes.insert(name.to_string());
        state.created_volumes.push(name.to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Prober
// ---------------------------------------------------------------------------

/// How a service answers probes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    AlwaysHealthy,
    NeverHealthy,
    /// Fails until the n-th attempt
    HealthyAfter(u32),
    /// Each probe takes this long, then succeeds
    Slow(Duration),
    /// Probe never returns
    Hang,
}

#[derive(Default)]
struct ProbeLog {
    attempts: HashMap<String, u32>,
    first_probe: HashMap<String, Instant>,
    ready_at: HashMap<String, Instant>,
}

/// Prober answering from a per-service script; unscripted services are healthy
pub struct ScriptedProber {
    scripts: HashMap<String, Script>,
    log: Mutex<ProbeLog>,
}

impl Default for ScriptedProber {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedProber {
    pub fn new() -> Self {
        Self {
            scripts: HashMap::new(),
            log: Mutex::new(ProbeLog::default()),
        }
    }

    pub fn script(mut self, service: &str, script: Script) -> Self {
        self.scripts.insert(service.to_string(), script);
        self
    }

    pub fn attempts(&self, service: &str) -> u32 {
        self.log.lock().attempts.get(service).copied().unwrap_or(0)
    }

    /// When the first probe of `service` began
    pub fn first_probe(&self, service: &str) -> Option<Instant> {
        self.log.lock().first_probe.get(service).copied()
    }

    /// When `service` first answered healthy
    pub fn ready_at(&self, service: &str) -> Option<Instant> {
        self.log.lock().ready_at.get(service).copied()
    }
}

#[async_trait::async_trait]
impl Prober for ScriptedProber {
    async fn probe(&self, service: &ServiceSpec) -> Result<(), ProbeError> {
        let attempt = {
            let mut log = self.log.lock();
            log.first_probe.entry(service.name.clone()).or_insert_with(Instant::now);
            let n = log.attempts.entry(service.name.clone()).or_insert(0);
            *n += 1;
            *n
        };
        let not_ready = || ProbeError::NotReady {
            service: service.name.clone(),
            status: ServiceStatus::Unhealthy.to_string(),
        };

        let script = self.scripts.get(&service.name).copied().unwrap_or(Script::AlwaysHealthy);
        match script {
            Script::NeverHealthy => return Err(not_ready()),
            Script::HealthyAfter(n) if attempt < n => return Err(not_ready()),
            Script::AlwaysHealthy | Script::HealthyAfter(_) => {}
            Script::Slow(delay) => tokio::time::sleep(delay).await,
            Script::Hang => std::future::pending::<()>().await,
        }
        self.log.lock().ready_at.entry(service.name.clone()).or_insert_with(Instant::now);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Reverse proxy
// ---------------------------------------------------------------------------

struct ProxyState {
    live: String,
    rejected: HashSet<String>,
    failing_reload: HashSet<String>,
    applied: Vec<String>,
    reloads: u32,
}

/// In-memory reverse proxy
pub struct FakeProxy {
    state: Mutex<ProxyState>,
}

impl FakeProxy {
    pub fn new(live: &str) -> Self {
        Self {
            state: Mutex::new(ProxyState {
                live: live.to_string(),
                rejected: HashSet::new(),
                failing_reload: HashSet::new(),
                applied: Vec::new(),
                reloads: 0,
            }),
        }
    }

    /// Validation fails for this exact configuration
    pub fn reject(self, contents: &str) -> Self {
        self.state.lock().rejected.insert(contents.to_string());
        self
    }

    /// Reloading into this configuration fails
    pub fn fail_reload_of(self, contents: &str) -> Self {
        self.state.lock().failing_reload.insert(contents.to_string());
        self
    }

    pub fn live_config(&self) -> String {
        self.state.lock().live.clone()
    }

    pub fn reloads(&self) -> u32 {
        self.state.lock().reloads
    }

    /// Configurations applied, in order
    pub fn applied(&self) -> Vec<String> {
        self.state.lock().applied.clone()
    }
}

#[async_trait::async_trait]
impl ReverseProxy for FakeProxy {
    async fn live(&self) -> Result<String, ProxyError> {
        Ok(self.state.lock().live.clone())
    }

    async fn validate(&self, candidate: &ProxyConfig) -> Result<(), ProxyError> {
        if self.state.lock().rejected.contains(&candidate.contents) {
            return Err(ProxyError::ValidationFailed {
                mode: candidate.mode.to_string(),
                reason: "syntax error".to_string(),
            });
        }
        Ok(())
    }

    async fn apply(&self, candidate: &ProxyConfig) -> Result<(), ProxyError> {
        let mut state = self.state.lock();
        if state.failing_reload.contains(&candidate.contents) {
            return Err(ProxyError::ReloadFailed("reload signal failed".to_string()));
        }
        state.live.clone_from(&candidate.contents);
        state.applied.push(candidate.contents.clone());
        state.reloads += 1;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Certificate client
// ---------------------------------------------------------------------------

/// What the next `issue` call does
#[derive(Debug, Clone)]
pub enum IssueBehavior {
    /// Succeed with this PEM and install it
    Issue(String),
    Fail(CertClientError),
    Hang,
}

/// Scripted certificate client
pub struct FakeCertClient {
    behavior: IssueBehavior,
    installed: Mutex<Option<String>>,
    requests: Mutex<Vec<IssueRequest>>,
}

impl FakeCertClient {
    pub fn new(behavior: IssueBehavior) -> Self {
        Self {
            behavior,
            installed: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn issuing(pem: String) -> Self {
        Self::new(IssueBehavior::Issue(pem))
    }

    pub fn failing(error: CertClientError) -> Self {
        Self::new(IssueBehavior::Fail(error))
    }

    pub fn with_installed(self, pem: String) -> Self {
        *self.installed.lock() = Some(pem);
        self
    }

    pub fn requests(&self) -> Vec<IssueRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait::async_trait]
impl CertificateClient for FakeCertClient {
    async fn issue(&self, request: &IssueRequest) -> Result<IssuedCertificate, CertClientError> {
        self.requests.lock().push(request.clone());
        match &self.behavior {
            IssueBehavior::Issue(pem) => {
                *self.installed.lock() = Some(pem.clone());
                Ok(IssuedCertificate { pem: pem.clone() })
            }
            IssueBehavior::Fail(e) => Err(e.clone()),
            IssueBehavior::Hang => std::future::pending().await,
        }
    }

    async fn current(&self) -> Result<Option<IssuedCertificate>, CertClientError> {
        Ok(self.installed.lock().clone().map(|pem| IssuedCertificate { pem }))
    }
}
