//! Rollout summaries and exit codes
//!
//! A [`Summary`] is a pure function of the [`RolloutResult`]: the same
//! result always renders the same text and the same JSON. Healthy services
//! are never torn down, whatever the status.

use crate::rollout::{ExitStatus, RolloutResult, ServiceHealth};
use serde::Serialize;
use std::fmt::Write as _;

/// Process exit codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitCode {
    /// Success or partial rollout
    Success,
    /// Usage or internal error
    Internal,
    /// Environment bundle, manifest or plan invalid
    ConfigInvalid,
    /// Provisioning failed
    ProvisionFailed,
    /// A blocking service failed
    RolloutFatal,
    /// Certificate cutover failed
    CutoverFailed,
}

impl ExitCode {
    /// Numeric code for `std::process::exit`
    #[must_use]
    pub fn code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Internal => 1,
            Self::ConfigInvalid => 2,
            Self::ProvisionFailed => 3,
            Self::RolloutFatal => 4,
            Self::CutoverFailed => 5,
        }
    }

    /// Exit code for a rollout status; partial rollouts exit 0
    #[must_use]
    pub fn from_status(status: ExitStatus) -> Self {
        match status {
            ExitStatus::Success | ExitStatus::Partial => Self::Success,
            ExitStatus::Fatal => Self::RolloutFatal,
        }
    }
}

/// One line of the summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceLine {
    /// Service name
    pub name: String,
    /// Tier index
    pub tier: u32,
    /// `blocking` or `best-effort`
    pub criticality: String,
    /// Resolution
    pub health: ServiceHealth,
    /// Probe attempts
    pub attempts: u32,
    /// Failure reason, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

/// Deterministic rollout summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Summary {
    /// Overall status
    pub status: ExitStatus,
    /// Process exit code
    pub exit_code: i32,
    /// Services whose tier was reached
    pub attempted: usize,
    /// Healthy services
    pub healthy: usize,
    /// Names of unhealthy services
    pub unhealthy: Vec<String>,
    /// Names of services never started
    pub not_attempted: Vec<String>,
    /// Tier at which a blocking failure halted the rollout
    pub halted_at_tier: Option<u32>,
    /// True if the run deadline stopped later tiers
    pub deadline_exceeded: bool,
    /// Per-service lines in plan order
    pub services: Vec<ServiceLine>,
}

/// Summarize a rollout and log the diagnostics of every failed service
#[must_use]
pub fn report(result: &RolloutResult) -> Summary {
    for outcome in &result.outcomes {
        if let Some(snapshot) = &outcome.diagnostic {
            tracing::warn!(
                service = %outcome.name,
                tier = outcome.tier,
                status = %snapshot.status,
                failure = outcome.failure.as_deref().unwrap_or_default(),
                "diagnostics:\n{}",
                snapshot.log_tail
            );
        }
    }

    let names_with = |health: ServiceHealth| -> Vec<String> {
        result
            .outcomes
            .iter()
            .filter(|o| o.health == health)
            .map(|o| o.name.clone())
            .collect()
    };

    Summary {
        status: result.status,
        exit_code: ExitCode::from_status(result.status).code(),
        attempted: result.attempted(),
        healthy: result.count(ServiceHealth::Healthy),
        unhealthy: names_with(ServiceHealth::Unhealthy),
        not_attempted: names_with(ServiceHealth::NotAttempted),
        halted_at_tier: result.halted_at_tier,
        deadline_exceeded: result.deadline_exceeded,
        services: result
            .outcomes
            .iter()
            .map(|o| ServiceLine {
                name: o.name.clone(),
                tier: o.tier,
                criticality: o.criticality.to_string(),
                health: o.health,
                attempts: o.attempts,
                failure: o.failure.clone(),
            })
            .collect(),
    }
}

impl Summary {
    /// Human-readable rendering
    #[must_use]
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "rollout {} (exit {})", self.status, self.exit_code);
        let _ = writeln!(
            out,
            "  attempted {}, healthy {}, unhealthy {}, not attempted {}",
            self.attempted,
            self.healthy,
            self.unhealthy.len(),
            self.not_attempted.len()
        );
        if let Some(tier) = self.halted_at_tier {
            let _ = writeln!(out, "  halted at tier {tier}");
        }
        if self.deadline_exceeded {
            let _ = writeln!(out, "  run deadline exceeded");
        }
        for line in &self.services {
            let health = match line.health {
                ServiceHealth::Healthy => "healthy",
                ServiceHealth::Unhealthy => "UNHEALTHY",
                ServiceHealth::NotAttempted => "not attempted",
            };
            let _ = write!(
                out,
                "  [tier {}] {:<20} {:<12} {:<14}",
                line.tier, line.name, line.criticality, health
            );
            if line.attempts > 0 {
                let _ = write!(out, " attempts={}", line.attempts);
            }
            if let Some(failure) = &line.failure {
                let _ = write!(out, " ({failure})");
            }
            out.push('\n');
        }
        out
    }

    /// Pretty-printed JSON rendering
    ///
    /// # Errors
    /// Only if serialization fails, which the types here do not do.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
