//! stackctl core
//!
//! Deployment orchestration for a multi-service stack, in three phases:
//! 1. **Validation**: load the environment bundle and the manifest, reject
//!    missing or placeholder secrets before anything is touched
//! 2. **Rollout**: provision directories, network and volumes, then start
//!    services tier by tier, gating each tier on readiness probes
//! 3. **Cutover**: optionally swap the reverse proxy into challenge mode,
//!    issue a certificate and swap back, never leaving the proxy unconfigured
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use stackctl_core::prelude::*;
//!
//! let bundle = ConfigLoader::standard().load(&EnvSource::File(".env".into()))?;
//! let manifest = Manifest::from_file("stack.toml".as_ref())?;
//! let plan = RolloutPlan::build(manifest.service_specs())?;
//!
//! let controller = RolloutController::new(runtime, prober);
//! let result = controller.rollout(&plan).await;
//! let summary = report(&result);
//! std::process::exit(summary.exit_code);
//! ```

pub mod certificate;
pub mod config;
pub mod cutover;
pub mod error;
pub mod exec;
pub mod lock;
pub mod manifest;
pub mod probe;
pub mod provision;
pub mod proxy;
pub mod redact;
pub mod report;
pub mod retry;
pub mod rollout;
pub mod runtime;

pub use error::*;

/// Commonly used types
pub mod prelude {
    pub use crate::certificate::{
        CertbotClient, CertificateClient, CertificateInfo, IssueRequest, IssuedCertificate,
    };
    pub use crate::config::{ConfigBundle, ConfigLoader, EnvSource, KeyRule, KeySpec};
    pub use crate::cutover::{
        CertificateCutover, CutoverOutcome, CutoverSettings, CutoverState,
    };
    pub use crate::error::{
        ConfigError, CutoverError, PlanError, ProvisionError, StackError,
    };
    pub use crate::manifest::Manifest;
    pub use crate::probe::{Prober, ReadinessProbe, StandardProber};
    pub use crate::provision::{ProvisionResult, ProvisionSpec, Provisioner};
    pub use crate::proxy::{FileProxy, ProxyConfig, ProxyMode, ProxyTemplates, ReverseProxy};
    pub use crate::report::{report, ExitCode, Summary};
    pub use crate::retry::RetryPolicy;
    pub use crate::rollout::{
        Criticality, ExitStatus, RolloutController, RolloutPlan, RolloutResult, ServiceHealth,
        ServiceRole, ServiceSpec, Tier,
    };
    pub use crate::runtime::{ComposeRuntime, ContainerRuntime, ServiceStatus};
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
