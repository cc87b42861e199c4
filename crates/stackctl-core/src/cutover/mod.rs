//! Certificate cutover
//!
//! Swaps the reverse proxy into challenge mode, has the certificate client
//! issue a certificate, verifies it and swaps production back in:
//!
//! ```text
//! ChallengeMode ──► Issuing ──► Verifying ──► ProductionMode
//!       │              │            │
//!       └──────────────┴────────────┴──────► RolledBack
//! ```
//!
//! Every swap is preceded by validating the candidate. Any failure after
//! challenge mode was entered restores the configuration that was live
//! before the run, so the proxy always serves a configuration it accepted.

mod state;

pub use state::{allowed_transitions, validate_transition, CutoverMachine, CutoverState, Transition};

use crate::certificate::{CertificateClient, CertificateInfo, IssueRequest};
use crate::error::{CertClientError, CutoverError, CutoverFailure, ProxyError};
use crate::lock::CutoverLock;
use crate::proxy::{ProxyConfig, ProxyTemplates, ReverseProxy};
use chrono::Utc;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

/// Cutover parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CutoverSettings {
    /// Names the certificate must cover
    pub domains: Vec<String>,
    /// Registration contact
    pub contact_email: String,
    /// Lock file serializing cutovers
    pub lock_path: PathBuf,
    /// Age after which a lock is considered abandoned
    pub lock_stale_after: Duration,
    /// Minimum remaining validity for a certificate to be accepted
    pub min_validity_days: i64,
    /// Upper bound on one certificate client run
    pub client_timeout: Duration,
}

/// Result of a successful cutover
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CutoverOutcome {
    /// Always `ProductionMode` on success
    pub final_state: CutoverState,
    /// True if the proxy was reloaded at least once
    pub reloaded: bool,
    /// True if nothing had to be done
    pub skipped: bool,
    /// Certificate now in use
    pub certificate: Option<CertificateInfo>,
    /// Transitions taken
    pub history: Vec<Transition>,
}

/// Single-writer owner of the proxy configuration during a cutover
pub struct CertificateCutover {
    proxy: Arc<dyn ReverseProxy>,
    client: Arc<dyn CertificateClient>,
    templates: ProxyTemplates,
    settings: CutoverSettings,
}

impl CertificateCutover {
    /// Create a cutover
    #[must_use]
    pub fn new(
        proxy: Arc<dyn ReverseProxy>,
        client: Arc<dyn CertificateClient>,
        templates: ProxyTemplates,
        settings: CutoverSettings,
    ) -> Self {
        Self {
            proxy,
            client,
            templates,
            settings,
        }
    }

    /// Run the cutover.
    ///
    /// Without `force`, a run where production is already live and the
    /// installed certificate passes verification does nothing.
    ///
    /// # Errors
    ///
    /// See [`CutoverError`]; every variant except `RestoreFailed` and
    /// `StateMachine` leaves a previously valid configuration live.
    pub async fn run(&self, force: bool) -> Result<CutoverOutcome, CutoverError> {
        let span = tracing::info_span!("cutover", domains = ?self.settings.domains);
        self.run_locked(force).instrument(span).await
    }

    async fn run_locked(&self, force: bool) -> Result<CutoverOutcome, CutoverError> {
        let _lock = CutoverLock::acquire(&self.settings.lock_path, self.settings.lock_stale_after)?;

        let live = self.proxy.live().await.map_err(CutoverError::LiveConfig)?;
        let previous = self.templates.classify(&live);
        tracing::info!(mode = %previous.mode, digest = %previous.digest(), "live proxy configuration");

        let mut machine = CutoverMachine::new();

        if !force && live == self.templates.production().contents {
            if let Some(info) = self.installed_certificate().await {
                machine.advance(CutoverState::ProductionMode)?;
                tracing::info!("production live with a valid certificate; nothing to do");
                return Ok(CutoverOutcome {
                    final_state: CutoverState::ProductionMode,
                    reloaded: false,
                    skipped: true,
                    certificate: Some(info),
                    history: machine.into_history(),
                });
            }
        }

        let challenge = self.templates.challenge();
        self.proxy
            .validate(challenge)
            .await
            .map_err(CutoverError::ChallengeRejected)?;
        if live != challenge.contents {
            self.proxy
                .apply(challenge)
                .await
                .map_err(CutoverError::ChallengeRejected)?;
        }
        machine.advance(CutoverState::ChallengeMode)?;

        machine.advance(CutoverState::Issuing)?;
        let request = IssueRequest {
            domains: self.settings.domains.clone(),
            contact_email: self.settings.contact_email.clone(),
            force_renewal: force,
        };
        let issued = match tokio::time::timeout(self.settings.client_timeout, self.client.issue(&request)).await {
            Ok(Ok(issued)) => issued,
            Ok(Err(e)) => return Err(self.roll_back(&mut machine, &previous, e.into()).await),
            Err(_) => {
                let e = CertClientError::Timeout(self.settings.client_timeout);
                return Err(self.roll_back(&mut machine, &previous, e.into()).await);
            }
        };

        machine.advance(CutoverState::Verifying)?;
        let verified = issued.info().and_then(|info| {
            info.verify(&self.settings.domains, Utc::now(), self.settings.min_validity_days)
                .map(|()| info)
        });
        let info = match verified {
            Ok(info) => info,
            Err(e) => return Err(self.roll_back(&mut machine, &previous, e.into()).await),
        };
        tracing::info!(not_after = %info.not_after, names = ?info.subject_names, "certificate verified");

        let production = self.templates.production();
        if let Err(e) = self.proxy.validate(production).await {
            return Err(self.roll_back(&mut machine, &previous, e.into()).await);
        }
        if let Err(e) = self.proxy.apply(production).await {
            return Err(self.roll_back(&mut machine, &previous, e.into()).await);
        }
        machine.advance(CutoverState::ProductionMode)?;
        tracing::info!("production configuration live");

        Ok(CutoverOutcome {
            final_state: CutoverState::ProductionMode,
            reloaded: true,
            skipped: false,
            certificate: Some(info),
            history: machine.into_history(),
        })
    }

    /// Installed certificate, if it passes verification
    async fn installed_certificate(&self) -> Option<CertificateInfo> {
        let cert = match self.client.current().await {
            Ok(Some(cert)) => cert,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(error = %e, "cannot read installed certificate");
                return None;
            }
        };
        let info = cert.info().ok()?;
        match info.verify(&self.settings.domains, Utc::now(), self.settings.min_validity_days) {
            Ok(()) => Some(info),
            Err(e) => {
                tracing::info!(reason = %e, "installed certificate needs replacing");
                None
            }
        }
    }

    /// Restore `previous` and record the rollback
    async fn roll_back(&self, machine: &mut CutoverMachine, previous: &ProxyConfig, cause: CutoverFailure) -> CutoverError {
        let stage = machine.state().unwrap_or(CutoverState::ChallengeMode);
        tracing::warn!(stage = %stage, error = %cause, "cutover failed; restoring previous configuration");

        let restored = match self.restore(previous).await {
            Ok(restored) => restored,
            Err(restore) => {
                tracing::error!(error = %restore, "restoring previous proxy configuration failed");
                return CutoverError::RestoreFailed { stage, cause, restore };
            }
        };
        if let Err(e) = machine.advance(CutoverState::RolledBack) {
            return e.into();
        }
        tracing::info!(restored = %restored, "rolled back");
        CutoverError::RolledBack { stage, restored, cause }
    }

    /// Put `previous` back; if it no longer validates, stay in challenge mode.
    /// Returns the mode now live.
    async fn restore(&self, previous: &ProxyConfig) -> Result<String, ProxyError> {
        let live = self.proxy.live().await?;
        if live == previous.contents {
            return Ok(previous.mode.to_string());
        }
        match self.proxy.validate(previous).await {
            Ok(()) => {
                self.proxy.apply(previous).await?;
                Ok(previous.mode.to_string())
            }
            Err(e) => {
                tracing::warn!(error = %e, "previous configuration no longer validates; keeping challenge mode");
                let challenge = self.templates.challenge();
                if live != challenge.contents {
                    self.proxy.validate(challenge).await?;
                    self.proxy.apply(challenge).await?;
                }
                Ok(challenge.mode.to_string())
            }
        }
    }
}
