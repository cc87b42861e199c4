//! Reverse proxy configuration
//!
//! The proxy is only ever in one of two modes: challenge (serves the ACME
//! challenge path, nothing else) or production. A configuration is swapped
//! in only after the proxy's own checker accepted it, and the swap itself
//! is a rename so the live file is never half-written.

use crate::error::ProxyError;
use crate::exec::{self, CommandOutput};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Placeholder in validate/reload arguments replaced by the candidate's path
pub const CONFIG_PLACEHOLDER: &str = "{config}";

/// Proxy mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyMode {
    /// Serves only `/.well-known/acme-challenge/`
    Challenge,
    /// Serves the application over TLS
    Production,
}

impl fmt::Display for ProxyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Challenge => f.write_str("challenge"),
            Self::Production => f.write_str("production"),
        }
    }
}

/// A complete proxy configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Mode this configuration puts the proxy in
    pub mode: ProxyMode,
    /// File contents
    pub contents: String,
}

impl ProxyConfig {
    /// Create a configuration
    #[must_use]
    pub fn new(mode: ProxyMode, contents: impl Into<String>) -> Self {
        Self {
            mode,
            contents: contents.into(),
        }
    }

    /// SHA-256 of the contents, hex encoded
    #[must_use]
    pub fn digest(&self) -> String {
        digest(&self.contents)
    }
}

/// SHA-256 of `contents`, hex encoded
#[must_use]
pub fn digest(contents: &str) -> String {
    hex::encode(Sha256::digest(contents.as_bytes()))
}

/// The two configurations a cutover switches between
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTemplates {
    challenge: ProxyConfig,
    production: ProxyConfig,
}

impl ProxyTemplates {
    /// Templates from in-memory contents
    #[must_use]
    pub fn new(challenge: impl Into<String>, production: impl Into<String>) -> Self {
        Self {
            challenge: ProxyConfig::new(ProxyMode::Challenge, challenge),
            production: ProxyConfig::new(ProxyMode::Production, production),
        }
    }

    /// Read both templates from disk
    ///
    /// # Errors
    /// `ProxyError::Io` if either file is unreadable.
    pub fn load(challenge: &Path, production: &Path) -> Result<Self, ProxyError> {
        let read = |path: &Path| {
            std::fs::read_to_string(path).map_err(|source| ProxyError::Io {
                path: path.to_path_buf(),
                source,
            })
        };
        Ok(Self::new(read(challenge)?, read(production)?))
    }

    /// Challenge-mode configuration
    #[must_use]
    pub fn challenge(&self) -> &ProxyConfig {
        &self.challenge
    }

    /// Production configuration
    #[must_use]
    pub fn production(&self) -> &ProxyConfig {
        &self.production
    }

    /// Mode of a live configuration: challenge if it is the challenge
    /// template, production otherwise
    #[must_use]
    pub fn classify(&self, contents: &str) -> ProxyConfig {
        let mode = if contents == self.challenge.contents {
            ProxyMode::Challenge
        } else {
            ProxyMode::Production
        };
        ProxyConfig::new(mode, contents)
    }
}

/// Operations the cutover needs from the reverse proxy
#[async_trait::async_trait]
pub trait ReverseProxy: Send + Sync {
    /// Current live configuration
    async fn live(&self) -> Result<String, ProxyError>;

    /// Check a candidate without touching the live configuration
    async fn validate(&self, candidate: &ProxyConfig) -> Result<(), ProxyError>;

    /// Replace the live configuration and reload.
    ///
    /// On reload failure the previous configuration is put back and
    /// [`ProxyError::ReloadFailed`] returned.
    async fn apply(&self, candidate: &ProxyConfig) -> Result<(), ProxyError>;
}

/// Proxy whose live configuration is a file, checked and reloaded by commands
#[derive(Debug, Clone)]
pub struct FileProxy {
    live_path: PathBuf,
    validate_command: Vec<String>,
    reload_command: Vec<String>,
    command_timeout: Duration,
}

impl FileProxy {
    /// Create a file-backed proxy
    #[must_use]
    pub fn new(
        live_path: impl Into<PathBuf>,
        validate_command: Vec<String>,
        reload_command: Vec<String>,
        command_timeout: Duration,
    ) -> Self {
        Self {
            live_path: live_path.into(),
            validate_command,
            reload_command,
            command_timeout,
        }
    }

    /// Path of the live configuration file
    #[must_use]
    pub fn live_path(&self) -> &Path {
        &self.live_path
    }

    fn dir(&self) -> &Path {
        match self.live_path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        }
    }

    fn io(&self, source: std::io::Error) -> ProxyError {
        ProxyError::Io {
            path: self.live_path.clone(),
            source,
        }
    }

    /// Write `contents` next to the live file and rename it into place
    fn write_atomic(&self, contents: &str) -> Result<(), ProxyError> {
        let mut tmp = tempfile::Builder::new()
            .prefix(".stackctl-")
            .tempfile_in(self.dir())
            .map_err(|e| self.io(e))?;
        tmp.write_all(contents.as_bytes()).map_err(|e| self.io(e))?;
        // keep the live file's mode; temp files are created 0600
        let mode = std::fs::metadata(&self.live_path).map_or(0o644, |m| m.permissions().mode());
        tmp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(mode))
            .map_err(|e| self.io(e))?;
        tmp.as_file().sync_all().map_err(|e| self.io(e))?;
        tmp.persist(&self.live_path).map_err(|e| self.io(e.error))?;
        Ok(())
    }

    async fn run(&self, command: &[String], config: &Path) -> Result<CommandOutput, ProxyError> {
        let config = config.display().to_string();
        let argv: Vec<String> = command
            .iter()
            .map(|arg| arg.replace(CONFIG_PLACEHOLDER, &config))
            .collect();
        Ok(exec::run_argv(&argv, self.command_timeout).await?)
    }

    async fn reload(&self) -> Result<(), ProxyError> {
        if self.reload_command.is_empty() {
            return Ok(());
        }
        let out = self.run(&self.reload_command, &self.live_path).await?;
        if out.success() {
            Ok(())
        } else {
            Err(ProxyError::ReloadFailed(out.error_tail(5)))
        }
    }
}

#[async_trait::async_trait]
impl ReverseProxy for FileProxy {
    async fn live(&self) -> Result<String, ProxyError> {
        match tokio::fs::read_to_string(&self.live_path).await {
            Ok(contents) => Ok(contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ProxyError::NoLiveConfig(self.live_path.clone())),
            Err(e) => Err(self.io(e)),
        }
    }

    async fn validate(&self, candidate: &ProxyConfig) -> Result<(), ProxyError> {
        if !self.validate_command.iter().any(|arg| arg.contains(CONFIG_PLACEHOLDER)) {
            return Err(ProxyError::ValidationFailed {
                mode: candidate.mode.to_string(),
                reason: format!("validate command does not check the candidate (no {CONFIG_PLACEHOLDER} argument)"),
            });
        }
        let mut tmp = tempfile::Builder::new()
            .prefix(".stackctl-candidate-")
            .suffix(".conf")
            .tempfile_in(self.dir())
            .map_err(|e| self.io(e))?;
        tmp.write_all(candidate.contents.as_bytes()).map_err(|e| self.io(e))?;
        tmp.flush().map_err(|e| self.io(e))?;

        let out = self.run(&self.validate_command, tmp.path()).await?;
        if out.success() {
            tracing::debug!(mode = %candidate.mode, digest = %candidate.digest(), "candidate accepted");
            Ok(())
        } else {
            Err(ProxyError::ValidationFailed {
                mode: candidate.mode.to_string(),
                reason: out.error_tail(5),
            })
        }
    }

    async fn apply(&self, candidate: &ProxyConfig) -> Result<(), ProxyError> {
        let previous = match tokio::fs::read_to_string(&self.live_path).await {
            Ok(contents) => Some(contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(self.io(e)),
        };

        self.write_atomic(&candidate.contents)?;
        match self.reload().await {
            Ok(()) => {
                tracing::info!(mode = %candidate.mode, path = %self.live_path.display(), "proxy reloaded");
                Ok(())
            }
            Err(e) => {
                let reason = match e {
                    ProxyError::ReloadFailed(reason) => reason,
                    other => other.to_string(),
                };
                match &previous {
                    Some(prev) => self.write_atomic(prev)?,
                    None => std::fs::remove_file(&self.live_path).map_err(|e| self.io(e))?,
                }
                if let Err(again) = self.reload().await {
                    tracing::error!(error = %again, "reload after restoring previous configuration failed");
                }
                Err(ProxyError::ReloadFailed(reason))
            }
        }
    }
}
