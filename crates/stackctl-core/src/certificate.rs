//! Certificates and the certificate client

use crate::error::{CertClientError, CertificateError, ExecError};
use crate::exec;
use chrono::{DateTime, Utc};
use openssl::asn1::{Asn1Time, Asn1TimeRef};
use openssl::nid::Nid;
use openssl::x509::X509;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

/// What to ask the certificate authority for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueRequest {
    /// Names the certificate must cover
    pub domains: Vec<String>,
    /// Registration contact
    pub contact_email: String,
    /// Replace a still-valid certificate
    pub force_renewal: bool,
}

/// PEM returned by the client (leaf first)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCertificate {
    /// PEM text
    pub pem: String,
}

impl IssuedCertificate {
    /// Parse the leaf certificate
    ///
    /// # Errors
    /// `CertificateError::Parse` if the PEM holds no readable certificate.
    pub fn info(&self) -> Result<CertificateInfo, CertificateError> {
        CertificateInfo::from_pem(&self.pem)
    }
}

/// The parts of a certificate the cutover checks
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CertificateInfo {
    /// DNS subject alternative names plus the common name
    pub subject_names: Vec<String>,
    /// Start of validity
    pub not_before: DateTime<Utc>,
    /// End of validity
    pub not_after: DateTime<Utc>,
}

fn parse_err(e: impl std::fmt::Display) -> CertificateError {
    CertificateError::Parse(e.to_string())
}

fn to_utc(time: &Asn1TimeRef) -> Result<DateTime<Utc>, CertificateError> {
    let epoch = Asn1Time::from_unix(0).map_err(parse_err)?;
    let diff = epoch.diff(time).map_err(parse_err)?;
    let secs = i64::from(diff.days) * 86_400 + i64::from(diff.secs);
    DateTime::from_timestamp(secs, 0).ok_or_else(|| CertificateError::Parse(format!("timestamp {secs} out of range")))
}

/// True if `pattern` (possibly `*.` wildcard) covers `name`
fn covers(pattern: &str, name: &str) -> bool {
    let pattern = pattern.to_ascii_lowercase();
    let name = name.to_ascii_lowercase();
    match pattern.strip_prefix("*.") {
        Some(suffix) => name
            .split_once('.')
            .is_some_and(|(label, rest)| !label.is_empty() && rest == suffix),
        None => pattern == name,
    }
}

impl CertificateInfo {
    /// Parse the first certificate in `pem`
    ///
    /// # Errors
    /// `CertificateError::Parse` on malformed input.
    pub fn from_pem(pem: &str) -> Result<Self, CertificateError> {
        let chain = X509::stack_from_pem(pem.as_bytes()).map_err(parse_err)?;
        let leaf = chain
            .first()
            .ok_or_else(|| CertificateError::Parse("no certificate in PEM".to_string()))?;

        let mut subject_names: Vec<String> = leaf
            .subject_alt_names()
            .map(|names| names.iter().filter_map(|n| n.dnsname().map(str::to_string)).collect())
            .unwrap_or_default();
        for entry in leaf.subject_name().entries_by_nid(Nid::COMMONNAME) {
            if let Ok(cn) = entry.data().as_utf8() {
                let cn = cn.to_string();
                if !subject_names.contains(&cn) {
                    subject_names.push(cn);
                }
            }
        }

        Ok(Self {
            subject_names,
            not_before: to_utc(leaf.not_before())?,
            not_after: to_utc(leaf.not_after())?,
        })
    }

    /// Whole days of validity left at `now`
    #[must_use]
    pub fn remaining_days(&self, now: DateTime<Utc>) -> i64 {
        (self.not_after - now).num_days()
    }

    /// Requested domains not covered by the subject names
    #[must_use]
    pub fn uncovered<'a>(&self, domains: &'a [String]) -> Vec<&'a str> {
        domains
            .iter()
            .filter(|d| !self.subject_names.iter().any(|p| covers(p, d)))
            .map(String::as_str)
            .collect()
    }

    /// Check the validity window and subject names.
    ///
    /// # Errors
    ///
    /// The first failed check: not yet valid, expired, expiring within
    /// `min_validity_days`, or a requested domain not covered.
    pub fn verify(&self, domains: &[String], now: DateTime<Utc>, min_validity_days: i64) -> Result<(), CertificateError> {
        if now < self.not_before {
            return Err(CertificateError::NotYetValid(self.not_before.to_rfc3339()));
        }
        if now >= self.not_after {
            return Err(CertificateError::Expired(self.not_after.to_rfc3339()));
        }
        let remaining_days = self.remaining_days(now);
        if remaining_days < min_validity_days {
            return Err(CertificateError::ExpiresTooSoon {
                remaining_days,
                minimum_days: min_validity_days,
            });
        }
        let missing = self.uncovered(domains);
        if !missing.is_empty() {
            return Err(CertificateError::MissingNames(missing.into_iter().map(str::to_string).collect()));
        }
        Ok(())
    }
}

/// External certificate issuance
#[async_trait::async_trait]
pub trait CertificateClient: Send + Sync {
    /// Obtain a certificate for the request's domains
    async fn issue(&self, request: &IssueRequest) -> Result<IssuedCertificate, CertClientError>;

    /// Certificate currently installed, if any
    async fn current(&self) -> Result<Option<IssuedCertificate>, CertClientError>;
}

/// Classify client output into a typed failure
#[must_use]
pub fn classify_failure(output: &str) -> CertClientError {
    let lower = output.to_ascii_lowercase();
    let detail = exec::tail_lines(output, 3);
    if lower.contains("too many") || lower.contains("rate limit") || lower.contains("ratelimited") {
        CertClientError::RateLimited(detail)
    } else if ["connection", "network", "could not resolve", "name resolution", "unreachable", "timed out"]
        .iter()
        .any(|needle| lower.contains(needle))
    {
        CertClientError::Network(detail)
    } else {
        CertClientError::ValidationFailed(detail)
    }
}

/// certbot in webroot mode
#[derive(Debug, Clone)]
pub struct CertbotClient {
    program: String,
    webroot: PathBuf,
    cert_path: PathBuf,
    staging: bool,
    timeout: Duration,
}

impl CertbotClient {
    /// Client writing challenges under `webroot` and reading the chain from `cert_path`
    #[must_use]
    pub fn new(program: impl Into<String>, webroot: impl Into<PathBuf>, cert_path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            webroot: webroot.into(),
            cert_path: cert_path.into(),
            staging: false,
            timeout,
        }
    }

    /// Use the CA's staging environment
    #[must_use]
    pub fn staging(mut self, staging: bool) -> Self {
        self.staging = staging;
        self
    }

    fn args(&self, request: &IssueRequest) -> Vec<String> {
        let mut args: Vec<String> = [
            "certonly",
            "--webroot",
            "--non-interactive",
            "--agree-tos",
            "--expand",
        ]
        .iter()
        .map(|s| (*s).to_string())
        .collect();
        args.push("-w".into());
        args.push(self.webroot.display().to_string());
        args.push("--email".into());
        args.push(request.contact_email.clone());
        for domain in &request.domains {
            args.push("-d".into());
            args.push(domain.clone());
        }
        if request.force_renewal {
            args.push("--force-renewal".into());
        }
        if self.staging {
            args.push("--staging".into());
        }
        args
    }

    async fn read_cert(&self) -> Result<Option<IssuedCertificate>, CertClientError> {
        match tokio::fs::read_to_string(&self.cert_path).await {
            Ok(pem) => Ok(Some(IssuedCertificate { pem })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CertClientError::Unreadable(format!("{}: {e}", self.cert_path.display()))),
        }
    }
}

#[async_trait::async_trait]
impl CertificateClient for CertbotClient {
    async fn issue(&self, request: &IssueRequest) -> Result<IssuedCertificate, CertClientError> {
        tracing::info!(domains = ?request.domains, staging = self.staging, "requesting certificate");
        let out = match exec::run(&self.program, &self.args(request), self.timeout).await {
            Ok(out) => out,
            Err(ExecError::TimedOut { after, .. }) => return Err(CertClientError::Timeout(after)),
            Err(e) => return Err(CertClientError::Unavailable(e.to_string())),
        };
        if !out.success() {
            return Err(classify_failure(&format!("{}\n{}", out.stdout, out.stderr)));
        }
        self.read_cert()
            .await?
            .ok_or_else(|| CertClientError::Unreadable(format!("{} missing after issuance", self.cert_path.display())))
    }

    async fn current(&self) -> Result<Option<IssuedCertificate>, CertClientError> {
        self.read_cert().await
    }
}
