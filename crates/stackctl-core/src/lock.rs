//! Cutover lock file
//!
//! Only one cutover may touch the proxy at a time. The lock is a file
//! created with `O_EXCL` holding the owner's pid and start time; a lock
//! older than the configured age is assumed abandoned and taken over.

use crate::error::LockError;
use chrono::Utc;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Held lock; the file is removed on drop
#[derive(Debug)]
pub struct CutoverLock {
    path: PathBuf,
}

impl CutoverLock {
    /// Take the lock at `path`, replacing it if it is older than `stale_after`.
    ///
    /// # Errors
    ///
    /// - `LockError::Held` if a fresh lock exists
    /// - `LockError::Io` if the file cannot be created or inspected
    pub fn acquire(path: &Path, stale_after: Duration) -> Result<Self, LockError> {
        match Self::create(path) {
            Ok(lock) => Ok(lock),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let holder = std::fs::read_to_string(path).unwrap_or_default().trim().to_string();
                let age = std::fs::metadata(path)
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|modified| SystemTime::now().duration_since(modified).ok())
                    .unwrap_or_default();

                if age < stale_after {
                    return Err(LockError::Held {
                        path: path.to_path_buf(),
                        holder,
                    });
                }

                tracing::warn!(
                    path = %path.display(),
                    holder = %holder,
                    age_secs = age.as_secs(),
                    "removing stale cutover lock"
                );
                match std::fs::remove_file(path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(source) => {
                        return Err(LockError::Io {
                            path: path.to_path_buf(),
                            source,
                        })
                    }
                }
                // another process may win the race here; that is a plain Held
                Self::create(path).map_err(|source| Self::error(path, source))
            }
            Err(source) => Err(Self::error(path, source)),
        }
    }

    fn create(path: &Path) -> std::io::Result<Self> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        writeln!(file, "pid={} since={}", std::process::id(), Utc::now().to_rfc3339())?;
        file.sync_all()?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    fn error(path: &Path, source: std::io::Error) -> LockError {
        if source.kind() == ErrorKind::AlreadyExists {
            LockError::Held {
                path: path.to_path_buf(),
                holder: "unknown".to_string(),
            }
        } else {
            LockError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }

    /// Path of the lock file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for CutoverLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to remove cutover lock");
        }
    }
}
