//! Rollout outcomes

use super::plan::Criticality;
use serde::Serialize;
use std::fmt;

/// Resolution of one service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceHealth {
    /// A probe passed
    Healthy,
    /// Start failed or the probe budget ran out
    Unhealthy,
    /// Its tier was never reached
    NotAttempted,
}

/// Overall rollout status, ordered from best to worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    /// Every service healthy
    Success,
    /// Only best-effort services failed
    Partial,
    /// A blocking service failed; later tiers not attempted
    Fatal,
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => f.write_str("success"),
            Self::Partial => f.write_str("partial"),
            Self::Fatal => f.write_str("fatal"),
        }
    }
}

/// Runtime state captured when a service resolves unhealthy
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiagnosticSnapshot {
    /// Runtime status at capture time, or the status query error
    pub status: String,
    /// Last log lines, redacted
    pub log_tail: String,
}

/// Per-service record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceOutcome {
    /// Service name
    pub name: String,
    /// Tier index
    pub tier: u32,
    /// Criticality in effect
    pub criticality: Criticality,
    /// Resolution
    pub health: ServiceHealth,
    /// Probe attempts made
    pub attempts: u32,
    /// Milliseconds from start to resolution
    pub elapsed_ms: u64,
    /// Last failure, if unhealthy
    pub failure: Option<String>,
    /// Captured state, if unhealthy
    pub diagnostic: Option<DiagnosticSnapshot>,
}

impl ServiceOutcome {
    /// Outcome for a service whose tier was never reached
    #[must_use]
    pub fn not_attempted(name: impl Into<String>, tier: u32, criticality: Criticality) -> Self {
        Self {
            name: name.into(),
            tier,
            criticality,
            health: ServiceHealth::NotAttempted,
            attempts: 0,
            elapsed_ms: 0,
            failure: None,
            diagnostic: None,
        }
    }
}

/// Final result of a rollout
///
/// Unhealthy services are data here, never errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RolloutResult {
    /// One entry per planned service, in plan order
    pub outcomes: Vec<ServiceOutcome>,
    /// Names of unhealthy services, in plan order
    pub failed: Vec<String>,
    /// Overall status
    pub status: ExitStatus,
    /// Tier at which a blocking failure stopped the rollout
    pub halted_at_tier: Option<u32>,
    /// True if the run deadline stopped later tiers from starting
    pub deadline_exceeded: bool,
}

impl RolloutResult {
    /// Outcome for a service
    #[must_use]
    pub fn outcome(&self, name: &str) -> Option<&ServiceOutcome> {
        self.outcomes.iter().find(|o| o.name == name)
    }

    /// Health of a service
    #[must_use]
    pub fn health(&self, name: &str) -> Option<ServiceHealth> {
        self.outcome(name).map(|o| o.health)
    }

    /// Number of services with the given health
    #[must_use]
    pub fn count(&self, health: ServiceHealth) -> usize {
        self.outcomes.iter().filter(|o| o.health == health).count()
    }

    /// Services whose tier was reached
    #[must_use]
    pub fn attempted(&self) -> usize {
        self.outcomes.len() - self.count(ServiceHealth::NotAttempted)
    }
}
