//! Tiered rollout
//!
//! Tiers run strictly in ascending order. Inside a tier every service gets
//! its own task: start, then poll its readiness probe under its own retry
//! budget, so a slow service never delays the resolution of a fast one.
//! The controller moves to the next tier only when every blocking service
//! in the current tier is healthy.
//!
//! ```text
//! tier 0: [postgres] [redis]          start + poll concurrently
//!            │          │
//!            └── gate ──┘             all blocking healthy?
//!                 │ yes                      │ no
//! tier 1: [api] [metrics]              halt: fatal, rest not_attempted
//! ```

mod plan;
mod result;

pub use plan::{Criticality, RolloutPlan, ServiceRole, ServiceSpec, Tier};
pub use result::{DiagnosticSnapshot, ExitStatus, RolloutResult, ServiceHealth, ServiceOutcome};

use crate::config::ConfigBundle;
use crate::exec::tail_lines;
use crate::probe::Prober;
use crate::redact::redact_text;
use crate::retry::retry;
use crate::runtime::ContainerRuntime;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::Instrument;

/// Default number of log lines kept in a diagnostic snapshot
pub const DEFAULT_LOG_TAIL_LINES: usize = 50;

/// Collaborators shared by every service task
struct ServiceContext {
    runtime: Arc<dyn ContainerRuntime>,
    prober: Arc<dyn Prober>,
    log_tail_lines: usize,
    secrets: Option<Arc<ConfigBundle>>,
}

impl ServiceContext {
    /// Start the service and poll it until healthy or out of budget
    async fn resolve(&self, spec: ServiceSpec, deadline: Option<Instant>) -> ServiceOutcome {
        let started = Instant::now();

        if let Err(e) = self.runtime.start(&spec.name).await {
            tracing::warn!(error = %e, "start failed");
            let diagnostic = self.snapshot(&spec.name).await;
            return unhealthy(&spec, 0, started, format!("start failed: {e}"), diagnostic);
        }
        tracing::debug!("started");

        let policy = spec.retry.capped_at(deadline);
        let prober = &self.prober;
        let target = &spec;
        let polled = retry(&policy, move |attempt| async move {
            let outcome = prober.probe(target).await;
            if let Err(e) = &outcome {
                tracing::debug!(attempt, error = %e, "probe failed");
            }
            outcome
        })
        .await;

        match polled {
            Ok(done) => {
                tracing::info!(attempts = done.attempts, elapsed_ms = millis(done.elapsed), "healthy");
                ServiceOutcome {
                    name: spec.name.clone(),
                    tier: spec.tier,
                    criticality: spec.criticality,
                    health: ServiceHealth::Healthy,
                    attempts: done.attempts,
                    elapsed_ms: millis(started.elapsed()),
                    failure: None,
                    diagnostic: None,
                }
            }
            Err(exhausted) => {
                let failure = exhausted.last_error.map_or_else(
                    || "run deadline reached before the first probe".to_string(),
                    |e| self.scrub(&e.to_string()),
                );
                tracing::warn!(
                    attempts = exhausted.attempts,
                    reason = ?exhausted.reason,
                    error = %failure,
                    "unhealthy"
                );
                let diagnostic = self.snapshot(&spec.name).await;
                unhealthy(&spec, exhausted.attempts, started, failure, diagnostic)
            }
        }
    }

    /// Runtime status plus the last log lines, with secrets scrubbed
    async fn snapshot(&self, service: &str) -> DiagnosticSnapshot {
        let status = match self.runtime.status(service).await {
            Ok(status) => status.to_string(),
            Err(e) => format!("status unavailable: {e}"),
        };
        let log_tail = match self.runtime.logs(service, self.log_tail_lines).await {
            Ok(logs) => self.scrub(&tail_lines(&logs, self.log_tail_lines)),
            Err(e) => format!("logs unavailable: {e}"),
        };
        DiagnosticSnapshot { status, log_tail }
    }

    fn scrub(&self, text: &str) -> String {
        let text = redact_text(text);
        match &self.secrets {
            Some(bundle) => bundle.redact(&text),
            None => text.into_owned(),
        }
    }
}

fn unhealthy(
    spec: &ServiceSpec,
    attempts: u32,
    started: Instant,
    failure: String,
    diagnostic: DiagnosticSnapshot,
) -> ServiceOutcome {
    ServiceOutcome {
        name: spec.name.clone(),
        tier: spec.tier,
        criticality: spec.criticality,
        health: ServiceHealth::Unhealthy,
        attempts,
        elapsed_ms: millis(started.elapsed()),
        failure: Some(failure),
        diagnostic: Some(diagnostic),
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Drives a [`RolloutPlan`] against a container runtime
pub struct RolloutController {
    runtime: Arc<dyn ContainerRuntime>,
    prober: Arc<dyn Prober>,
    log_tail_lines: usize,
    secrets: Option<Arc<ConfigBundle>>,
    run_timeout: Option<Duration>,
}

impl RolloutController {
    /// Controller with default settings and no run deadline
    #[must_use]
    pub fn new(runtime: Arc<dyn ContainerRuntime>, prober: Arc<dyn Prober>) -> Self {
        Self {
            runtime,
            prober,
            log_tail_lines: DEFAULT_LOG_TAIL_LINES,
            secrets: None,
            run_timeout: None,
        }
    }

    /// Keep `lines` log lines in diagnostic snapshots
    #[must_use]
    pub fn with_log_tail_lines(mut self, lines: usize) -> Self {
        self.log_tail_lines = lines;
        self
    }

    /// Stop starting tiers once `timeout` has passed since the rollout began
    #[must_use]
    pub fn with_run_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.run_timeout = timeout;
        self
    }

    /// Scrub this bundle's secret values from captured logs
    #[must_use]
    pub fn with_secrets(mut self, bundle: Arc<ConfigBundle>) -> Self {
        self.secrets = Some(bundle);
        self
    }

    /// Roll out every tier of `plan`.
    ///
    /// Never fails: unhealthy services are recorded in the result. Services
    /// in tiers that were started are left running whatever the outcome.
    pub async fn rollout(&self, plan: &RolloutPlan) -> RolloutResult {
        let deadline = self.run_timeout.and_then(|t| Instant::now().checked_add(t));
        let ctx = Arc::new(ServiceContext {
            runtime: Arc::clone(&self.runtime),
            prober: Arc::clone(&self.prober),
            log_tail_lines: self.log_tail_lines,
            secrets: self.secrets.clone(),
        });
        let mut outcomes = Vec::with_capacity(plan.service_count());
        let mut status = ExitStatus::Success;
        let mut halted_at_tier = None;
        let mut deadline_exceeded = false;

        tracing::info!(tiers = plan.tiers().len(), services = plan.service_count(), "rollout starting");

        for tier in plan.tiers() {
            if halted_at_tier.is_some() || deadline_exceeded {
                outcomes.extend(skip(tier));
                continue;
            }
            if tier.services.is_empty() {
                tracing::debug!(tier = tier.index, "empty tier");
                continue;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                tracing::error!(tier = tier.index, "run deadline passed; remaining tiers not attempted");
                deadline_exceeded = true;
                outcomes.extend(skip(tier));
                continue;
            }

            let tier_outcomes = run_tier(&ctx, tier, deadline).await;

            let blocking_failed: Vec<&str> = tier_outcomes
                .iter()
                .filter(|o| o.health == ServiceHealth::Unhealthy && o.criticality == Criticality::Blocking)
                .map(|o| o.name.as_str())
                .collect();
            let best_effort_failed: Vec<&str> = tier_outcomes
                .iter()
                .filter(|o| o.health == ServiceHealth::Unhealthy && o.criticality == Criticality::BestEffort)
                .map(|o| o.name.as_str())
                .collect();

            if !best_effort_failed.is_empty() {
                tracing::warn!(tier = tier.index, services = ?best_effort_failed, "best-effort services unhealthy; continuing");
                status = status.max(ExitStatus::Partial);
            }
            if blocking_failed.is_empty() {
                tracing::info!(tier = tier.index, "tier ready");
            } else {
                tracing::error!(tier = tier.index, services = ?blocking_failed, "blocking services unhealthy; halting");
                status = ExitStatus::Fatal;
                halted_at_tier = Some(tier.index);
            }
            outcomes.extend(tier_outcomes);
        }

        if deadline_exceeded {
            let blocking_skipped = outcomes
                .iter()
                .any(|o| o.health == ServiceHealth::NotAttempted && o.criticality == Criticality::Blocking);
            if blocking_skipped {
                status = ExitStatus::Fatal;
                halted_at_tier = halted_at_tier.or_else(|| {
                    outcomes
                        .iter()
                        .find(|o| o.health == ServiceHealth::NotAttempted)
                        .map(|o| o.tier)
                });
            } else {
                status = status.max(ExitStatus::Partial);
            }
        }

        let failed = outcomes
            .iter()
            .filter(|o| o.health == ServiceHealth::Unhealthy)
            .map(|o| o.name.clone())
            .collect();

        tracing::info!(%status, "rollout finished");
        RolloutResult {
            outcomes,
            failed,
            status,
            halted_at_tier,
            deadline_exceeded,
        }
    }
}

async fn run_tier(ctx: &Arc<ServiceContext>, tier: &Tier, deadline: Option<Instant>) -> Vec<ServiceOutcome> {
    tracing::info!(tier = tier.index, services = tier.services.len(), "starting tier");

    let mut tasks = JoinSet::new();
    for spec in &tier.services {
        let ctx = Arc::clone(ctx);
        let span = tracing::info_span!("service", service = %spec.name, tier = tier.index);
        let spec = spec.clone();
        tasks.spawn(async move { ctx.resolve(spec, deadline).await }.instrument(span));
    }

    let mut resolved: HashMap<String, ServiceOutcome> = HashMap::with_capacity(tier.services.len());
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(outcome) => {
                resolved.insert(outcome.name.clone(), outcome);
            }
            Err(e) => tracing::error!(tier = tier.index, error = %e, "service task aborted"),
        }
    }

    tier.services
        .iter()
        .map(|spec| {
            resolved.remove(&spec.name).unwrap_or_else(|| ServiceOutcome {
                health: ServiceHealth::Unhealthy,
                failure: Some("service task aborted".to_string()),
                ..ServiceOutcome::not_attempted(&spec.name, spec.tier, spec.criticality)
            })
        })
        .collect()
}

fn skip(tier: &Tier) -> impl Iterator<Item = ServiceOutcome> + '_ {
    tier.services
        .iter()
        .map(|s| ServiceOutcome::not_attempted(&s.name, s.tier, s.criticality))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ProbeError, RuntimeError};
    use crate::retry::RetryPolicy;
    use crate::runtime::{NetworkInfo, ServiceStatus};
    use parking_lot::Mutex;
    use std::collections::HashSet;

    #[derive(Default)]
    struct Runtime {
        started: Mutex<Vec<String>>,
        refuse: HashSet<String>,
    }

    #[async_trait::async_trait]
    impl ContainerRuntime for Runtime {
        async fn start(&self, service: &str) -> Result<(), RuntimeError> {
            if self.refuse.contains(service) {
                return Err(RuntimeError::CommandFailed {
                    operation: "start",
                    target: service.to_string(),
                    code: Some(1),
                    stderr: "no such image".into(),
                });
            }
            self.started.lock().push(service.to_string());
            Ok(())
        }
        async fn status(&self, _: &str) -> Result<ServiceStatus, RuntimeError> {
            Ok(ServiceStatus::Unhealthy)
        }
        async fn logs(&self, _: &str, _: usize) -> Result<String, RuntimeError> {
            Ok("connecting to postgres://app:hunter22@db/app\nrefused".into())
        }
        async fn inspect_network(&self, _: &str) -> Result<Option<NetworkInfo>, RuntimeError> {
            Ok(None)
        }
        async fn create_network(&self, _: &str, _: Option<&str>) -> Result<(), RuntimeError> {
            Ok(())
        }
        async fn volume_exists(&self, _: &str) -> Result<bool, RuntimeError> {
            Ok(true)
        }
        async fn create_volume(&self, _: &str) -> Result<(), RuntimeError> {
            Ok(())
        }
    }

    /// Healthy unless named in `down`; services in `hang` never answer
    #[derive(Default)]
    struct Probe {
        down: HashSet<String>,
        hang: HashSet<String>,
    }

    #[async_trait::async_trait]
    impl Prober for Probe {
        async fn probe(&self, service: &ServiceSpec) -> Result<(), ProbeError> {
            if self.hang.contains(&service.name) {
                std::future::pending::<()>().await;
            }
            if self.down.contains(&service.name) {
                Err(ProbeError::NotReady {
                    service: service.name.clone(),
                    status: "unhealthy".into(),
                })
            } else {
                Ok(())
            }
        }
    }

    fn quick() -> RetryPolicy {
        RetryPolicy::fixed(Duration::from_secs(1), 3, Duration::from_secs(10))
    }

    fn controller(runtime: Runtime, probe: Probe) -> (RolloutController, Arc<Runtime>) {
        let runtime = Arc::new(runtime);
        (RolloutController::new(runtime.clone(), Arc::new(probe)), runtime)
    }

    fn names(list: &[&str]) -> HashSet<String> {
        list.iter().map(|s| (*s).to_string()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn start_failure_resolves_unhealthy_without_probing() {
        let runtime = Runtime {
            refuse: ["api".to_string()].into(),
            ..Runtime::default()
        };
        let (ctl, _) = controller(runtime, Probe::default());
        let plan = RolloutPlan::build(vec![ServiceSpec::new("api", 0).blocking().with_retry(quick())]).unwrap();

        let result = ctl.rollout(&plan).await;
        let api = result.outcome("api").unwrap();
        assert_eq!(api.health, ServiceHealth::Unhealthy);
        assert_eq!(api.attempts, 0);
        assert!(api.failure.as_deref().unwrap().starts_with("start failed"));
        assert_eq!(result.status, ExitStatus::Fatal);
    }

    #[tokio::test(start_paused = true)]
    async fn diagnostic_log_tail_is_redacted() {
        let (ctl, _) = controller(
            Runtime::default(),
            Probe {
                down: names(&["db"]),
                ..Probe::default()
            },
        );
        let plan = RolloutPlan::build(vec![ServiceSpec::new("db", 0).with_retry(quick())]).unwrap();

        let result = ctl.rollout(&plan).await;
        let snapshot = result.outcome("db").unwrap().diagnostic.clone().unwrap();
        assert_eq!(snapshot.status, "unhealthy");
        assert!(!snapshot.log_tail.contains("hunter22"));
        assert!(snapshot.log_tail.ends_with("refused"));
    }

    #[tokio::test(start_paused = true)]
    async fn run_deadline_stops_later_tiers() {
        let (ctl, runtime) = controller(
            Runtime::default(),
            Probe {
                hang: names(&["slow"]),
                ..Probe::default()
            },
        );
        let ctl = ctl.with_run_timeout(Some(Duration::from_secs(5)));
        // attempts time out at t=2 and t=5; the cap ends the budget exactly at the deadline
        let plan = RolloutPlan::build(vec![
            ServiceSpec::new("slow", 0)
                .best_effort()
                .with_retry(RetryPolicy::fixed(Duration::from_secs(2), 100, Duration::from_secs(60))),
            ServiceSpec::new("api", 1).blocking(),
        ])
        .unwrap();

        let result = ctl.rollout(&plan).await;
        assert!(result.deadline_exceeded);
        assert_eq!(result.health("api"), Some(ServiceHealth::NotAttempted));
        assert_eq!(result.status, ExitStatus::Fatal);
        assert_eq!(result.halted_at_tier, Some(1));
        assert_eq!(*runtime.started.lock(), vec!["slow"]);
    }

    #[tokio::test]
    async fn empty_plan_is_success() {
        let (ctl, _) = controller(Runtime::default(), Probe::default());
        let result = ctl.rollout(&RolloutPlan::default()).await;
        assert_eq!(result.status, ExitStatus::Success);
        assert!(result.outcomes.is_empty());
    }
}
