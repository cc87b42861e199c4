//! Service specifications and tier plans

use crate::error::PlanError;
use crate::probe::ReadinessProbe;
use crate::retry::RetryPolicy;
use petgraph::algo::{is_cyclic_directed, tarjan_scc};
use petgraph::graphmap::DiGraphMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// What a service is for; decides its default criticality
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceRole {
    /// Databases, caches, queues
    Data,
    /// Reverse proxy / ingress
    Proxy,
    /// Metrics, dashboards, log shipping
    Observability,
    /// Everything else
    #[default]
    Auxiliary,
}

impl ServiceRole {
    /// Criticality used when the manifest does not set one
    #[must_use]
    pub fn default_criticality(self) -> Criticality {
        match self {
            Self::Data | Self::Proxy => Criticality::Blocking,
            Self::Observability | Self::Auxiliary => Criticality::BestEffort,
        }
    }
}

/// Whether a service's failure halts the rollout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Criticality {
    /// Failure halts the rollout
    Blocking,
    /// Failure is recorded and the rollout continues
    BestEffort,
}

impl fmt::Display for Criticality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blocking => f.write_str("blocking"),
            Self::BestEffort => f.write_str("best-effort"),
        }
    }
}

/// One managed service
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceSpec {
    /// Unique name, as known to the container runtime
    pub name: String,
    /// Tier index; lower tiers start first
    pub tier: u32,
    /// Role
    pub role: ServiceRole,
    /// Effective criticality
    pub criticality: Criticality,
    /// Services that must be in the same or an earlier tier
    pub depends_on: Vec<String>,
    /// Readiness check
    pub probe: ReadinessProbe,
    /// Polling budget
    pub retry: RetryPolicy,
}

impl ServiceSpec {
    /// Auxiliary, best-effort service probed through the runtime status
    #[must_use]
    pub fn new(name: impl Into<String>, tier: u32) -> Self {
        let role = ServiceRole::default();
        Self {
            name: name.into(),
            tier,
            role,
            criticality: role.default_criticality(),
            depends_on: Vec::new(),
            probe: ReadinessProbe::default(),
            retry: RetryPolicy::default(),
        }
    }

    /// Set the role and take its default criticality
    #[must_use]
    pub fn with_role(mut self, role: ServiceRole) -> Self {
        self.role = role;
        self.criticality = role.default_criticality();
        self
    }

    /// Override criticality
    #[must_use]
    pub fn with_criticality(mut self, criticality: Criticality) -> Self {
        self.criticality = criticality;
        self
    }

    /// Shorthand for `with_criticality(Criticality::Blocking)`
    #[must_use]
    pub fn blocking(self) -> Self {
        self.with_criticality(Criticality::Blocking)
    }

    /// Shorthand for `with_criticality(Criticality::BestEffort)`
    #[must_use]
    pub fn best_effort(self) -> Self {
        self.with_criticality(Criticality::BestEffort)
    }

    /// Add a dependency
    #[must_use]
    pub fn depends_on(mut self, service: impl Into<String>) -> Self {
        self.depends_on.push(service.into());
        self
    }

    /// Set the readiness probe
    #[must_use]
    pub fn with_probe(mut self, probe: ReadinessProbe) -> Self {
        self.probe = probe;
        self
    }

    /// Set the polling budget
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// True if the service's failure halts the rollout
    #[inline]
    #[must_use]
    pub fn is_blocking(&self) -> bool {
        self.criticality == Criticality::Blocking
    }
}

/// Services sharing a tier index
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Tier {
    /// Tier index
    pub index: u32,
    /// Services started together
    pub services: Vec<ServiceSpec>,
}

/// Validated, ordered list of tiers
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RolloutPlan {
    tiers: Vec<Tier>,
}

impl RolloutPlan {
    /// Group services into ascending tiers and validate the dependency graph.
    ///
    /// Declaration order is kept within a tier.
    ///
    /// # Errors
    ///
    /// Duplicate names, unknown dependencies, dependencies on a later tier
    /// and dependency cycles are rejected.
    pub fn build(specs: Vec<ServiceSpec>) -> Result<Self, PlanError> {
        let mut grouped: BTreeMap<u32, Vec<ServiceSpec>> = BTreeMap::new();
        for spec in specs {
            grouped.entry(spec.tier).or_default().push(spec);
        }
        let tiers = grouped
            .into_iter()
            .map(|(index, services)| Tier { index, services })
            .collect();
        Self::from_tiers(tiers)
    }

    /// Use explicit tiers, which may be empty.
    ///
    /// # Errors
    ///
    /// As [`RolloutPlan::build`], plus [`PlanError::TierOutOfOrder`] when
    /// indices are not strictly ascending or a service's own tier differs
    /// from the tier it is filed under.
    pub fn from_tiers(tiers: Vec<Tier>) -> Result<Self, PlanError> {
        let mut previous: Option<u32> = None;
        for tier in &tiers {
            if previous.is_some_and(|p| tier.index <= p) || tier.services.iter().any(|s| s.tier != tier.index) {
                return Err(PlanError::TierOutOfOrder(tier.index));
            }
            previous = Some(tier.index);
        }

        let plan = Self { tiers };
        plan.validate()?;
        Ok(plan)
    }

    fn validate(&self) -> Result<(), PlanError> {
        let mut tier_of: HashMap<&str, u32> = HashMap::new();
        for spec in self.services() {
            if tier_of.insert(spec.name.as_str(), spec.tier).is_some() {
                return Err(PlanError::DuplicateService(spec.name.clone()));
            }
        }

        let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
        for spec in self.services() {
            graph.add_node(spec.name.as_str());
            for dep in &spec.depends_on {
                let Some(&dep_tier) = tier_of.get(dep.as_str()) else {
                    return Err(PlanError::UnknownDependency {
                        service: spec.name.clone(),
                        dependency: dep.clone(),
                    });
                };
                if dep_tier > spec.tier {
                    return Err(PlanError::DependencyOnLaterTier {
                        service: spec.name.clone(),
                        tier: spec.tier,
                        dependency: dep.clone(),
                        dependency_tier: dep_tier,
                    });
                }
                graph.add_edge(dep.as_str(), spec.name.as_str(), ());
            }
        }

        if is_cyclic_directed(&graph) {
            let mut cycle: Vec<String> = tarjan_scc(&graph)
                .into_iter()
                .find(|scc| scc.len() > 1 || scc.iter().any(|n| graph.contains_edge(*n, *n)))
                .unwrap_or_default()
                .into_iter()
                .map(str::to_string)
                .collect();
            cycle.sort();
            return Err(PlanError::DependencyCycle(cycle));
        }
        Ok(())
    }

    /// Tiers in rollout order
    #[must_use]
    pub fn tiers(&self) -> &[Tier] {
        &self.tiers
    }

    /// All services in rollout order
    pub fn services(&self) -> impl Iterator<Item = &ServiceSpec> {
        self.tiers.iter().flat_map(|t| t.services.iter())
    }

    /// Look up a service by name
    #[must_use]
    pub fn service(&self, name: &str) -> Option<&ServiceSpec> {
        self.services().find(|s| s.name == name)
    }

    /// Total number of services
    #[must_use]
    pub fn service_count(&self) -> usize {
        self.tiers.iter().map(|t| t.services.len()).sum()
    }

    /// True if there is nothing to roll out
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.service_count() == 0
    }
}
