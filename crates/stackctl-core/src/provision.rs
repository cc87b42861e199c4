//! Resource provisioning
//!
//! Runs once before the first tier starts. Directories, the shared network
//! and named volumes are brought to the declared state; anything already
//! correct is reported as unchanged, so re-running is a no-op.

use crate::error::ProvisionError;
use crate::runtime::ContainerRuntime;
use serde::Serialize;
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Shared container network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSpec {
    /// Network name
    pub name: String,
    /// Subnet in CIDR notation
    pub subnet: Option<String>,
}

/// Everything the provisioner prepares
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionSpec {
    /// Host directories to create
    pub directories: Vec<PathBuf>,
    /// Permission bits applied to every directory
    pub mode: Option<u32>,
    /// `(uid, gid)` applied to every directory
    pub owner: Option<(u32, u32)>,
    /// Network to ensure
    pub network: Option<NetworkSpec>,
    /// Named volumes to ensure
    pub volumes: Vec<String>,
}

/// One thing the provisioner did (or found already done)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ProvisionAction {
    /// Directory created
    Created { path: PathBuf },
    /// Existing directory's mode or owner corrected
    Adjusted { path: PathBuf, changes: Vec<String> },
    /// Directory already correct
    Unchanged { path: PathBuf },
    /// Network created
    NetworkCreated { name: String },
    /// Existing network reused
    NetworkReused { name: String },
    /// Volume created
    VolumeCreated { name: String },
    /// Existing volume reused
    VolumeReused { name: String },
}

impl ProvisionAction {
    /// True if the action changed the host
    #[must_use]
    pub fn is_change(&self) -> bool {
        matches!(
            self,
            Self::Created { .. } | Self::Adjusted { .. } | Self::NetworkCreated { .. } | Self::VolumeCreated { .. }
        )
    }
}

/// What provisioning did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProvisionResult {
    /// Actions in execution order
    pub actions: Vec<ProvisionAction>,
    /// Non-fatal findings
    pub warnings: Vec<String>,
}

impl ProvisionResult {
    /// Number of actions that changed the host
    #[must_use]
    pub fn changes(&self) -> usize {
        self.actions.iter().filter(|a| a.is_change()).count()
    }
}

fn fs_error(path: &Path, source: io::Error) -> ProvisionError {
    if source.kind() == io::ErrorKind::PermissionDenied {
        ProvisionError::PermissionDenied {
            path: path.to_path_buf(),
            source,
        }
    } else {
        ProvisionError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Prepares host resources through the container runtime
pub struct Provisioner {
    runtime: Arc<dyn ContainerRuntime>,
}

impl Provisioner {
    /// Create a provisioner
    #[must_use]
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { runtime }
    }

    /// Bring directories, network and volumes to the declared state.
    ///
    /// # Errors
    ///
    /// Any filesystem or runtime failure aborts provisioning; a permission
    /// problem surfaces as [`ProvisionError::PermissionDenied`].
    pub async fn provision(&self, spec: &ProvisionSpec) -> Result<ProvisionResult, ProvisionError> {
        let mut result = ProvisionResult::default();

        for dir in &spec.directories {
            let action = ensure_directory(dir, spec.mode, spec.owner).await?;
            tracing::debug!(path = %dir.display(), ?action, "directory");
            result.actions.push(action);
        }

        if let Some(network) = &spec.network {
            self.ensure_network(network, &mut result).await?;
        }

        for volume in &spec.volumes {
            let action = if self.runtime.volume_exists(volume).await? {
                ProvisionAction::VolumeReused { name: volume.clone() }
            } else {
                self.runtime.create_volume(volume).await?;
                tracing::info!(volume = %volume, "created volume");
                ProvisionAction::VolumeCreated { name: volume.clone() }
            };
            result.actions.push(action);
        }

        for warning in &result.warnings {
            tracing::warn!("{warning}");
        }
        tracing::info!(
            changes = result.changes(),
            actions = result.actions.len(),
            warnings = result.warnings.len(),
            "provisioning complete"
        );
        Ok(result)
    }

    async fn ensure_network(&self, network: &NetworkSpec, result: &mut ProvisionResult) -> Result<(), ProvisionError> {
        match self.runtime.inspect_network(&network.name).await? {
            Some(info) => {
                if let Some(subnet) = &network.subnet {
                    if !info.subnets.iter().any(|s| s == subnet) {
                        result.warnings.push(format!(
                            "network {} exists with subnet [{}], expected {subnet}; reusing it",
                            network.name,
                            info.subnets.join(", ")
                        ));
                    }
                }
                result.actions.push(ProvisionAction::NetworkReused {
                    name: network.name.clone(),
                });
            }
            None => {
                self.runtime
                    .create_network(&network.name, network.subnet.as_deref())
                    .await?;
                tracing::info!(network = %network.name, "created network");
                result.actions.push(ProvisionAction::NetworkCreated {
                    name: network.name.clone(),
                });
            }
        }
        Ok(())
    }
}

async fn ensure_directory(
    path: &Path,
    mode: Option<u32>,
    owner: Option<(u32, u32)>,
) -> Result<ProvisionAction, ProvisionError> {
    let created = match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => false,
        Ok(_) => return Err(ProvisionError::NotADirectory(path.to_path_buf())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tokio::fs::create_dir_all(path).await.map_err(|e| fs_error(path, e))?;
            true
        }
        Err(e) => return Err(fs_error(path, e)),
    };

    let meta = tokio::fs::metadata(path).await.map_err(|e| fs_error(path, e))?;
    let mut changes = Vec::new();

    if let Some(mode) = mode {
        let current = meta.permissions().mode() & 0o7777;
        if current != mode & 0o7777 {
            tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
                .await
                .map_err(|e| fs_error(path, e))?;
            changes.push(format!("mode {current:o} -> {mode:o}"));
        }
    }

    if let Some((uid, gid)) = owner {
        if meta.uid() != uid || meta.gid() != gid {
            std::os::unix::fs::chown(path, Some(uid), Some(gid)).map_err(|e| fs_error(path, e))?;
            changes.push(format!("owner {}:{} -> {uid}:{gid}", meta.uid(), meta.gid()));
        }
    }

    let path = path.to_path_buf();
    Ok(if created {
        ProvisionAction::Created { path }
    } else if changes.is_empty() {
        ProvisionAction::Unchanged { path }
    } else {
        ProvisionAction::Adjusted { path, changes }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RuntimeError;
    use crate::runtime::{NetworkInfo, ServiceStatus};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        network: Option<NetworkInfo>,
        volumes: Vec<String>,
        created: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl ContainerRuntime for Recorder {
        async fn start(&self, _: &str) -> Result<(), RuntimeError> {
            Ok(())
        }
        async fn status(&self, _: &str) -> Result<ServiceStatus, RuntimeError> {
            Ok(ServiceStatus::Running)
        }
        async fn logs(&self, _: &str, _: usize) -> Result<String, RuntimeError> {
            Ok(String::new())
        }
        async fn inspect_network(&self, _: &str) -> Result<Option<NetworkInfo>, RuntimeError> {
            Ok(self.network.clone())
        }
        async fn create_network(&self, name: &str, _: Option<&str>) -> Result<(), RuntimeError> {
            self.created.lock().push(format!("network:{name}"));
            Ok(())
        }
        async fn volume_exists(&self, name: &str) -> Result<bool, RuntimeError> {
            Ok(self.volumes.iter().any(|v| v == name))
        }
        async fn create_volume(&self, name: &str) -> Result<(), RuntimeError> {
            self.created.lock().push(format!("volume:{name}"));
            Ok(())
        }
    }

    fn provisioner(rt: Recorder) -> (Provisioner, Arc<Recorder>) {
        let rt = Arc::new(rt);
        (Provisioner::new(rt.clone()), rt)
    }

    #[tokio::test]
    async fn second_run_is_unchanged() {
        let tmp = tempfile::tempdir().unwrap();
        let spec = ProvisionSpec {
            directories: vec![tmp.path().join("data"), tmp.path().join("logs/nginx")],
            mode: Some(0o750),
            ..ProvisionSpec::default()
        };
        let (p, _) = provisioner(Recorder::default());

        let first = p.provision(&spec).await.unwrap();
        assert_eq!(first.changes(), 2);
        assert!(matches!(first.actions[0], ProvisionAction::Created { .. }));

        let second = p.provision(&spec).await.unwrap();
        assert_eq!(second.changes(), 0);
        assert!(second
            .actions
            .iter()
            .all(|a| matches!(a, ProvisionAction::Unchanged { .. })));
    }

    #[tokio::test]
    async fn wrong_mode_is_adjusted() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("data");
        std::fs::create_dir(&dir).unwrap();
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o777)).unwrap();

        let spec = ProvisionSpec {
            directories: vec![dir.clone()],
            mode: Some(0o700),
            ..ProvisionSpec::default()
        };
        let (p, _) = provisioner(Recorder::default());
        let result = p.provision(&spec).await.unwrap();

        assert!(matches!(&result.actions[0], ProvisionAction::Adjusted { changes, .. } if changes.len() == 1));
        let mode = std::fs::metadata(&dir).unwrap().permissions().mode() & 0o7777;
        assert_eq!(mode, 0o700);
    }

    #[tokio::test]
    async fn file_in_place_of_directory_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("data");
        std::fs::write(&path, b"not a dir").unwrap();

        let spec = ProvisionSpec {
            directories: vec![path],
            ..ProvisionSpec::default()
        };
        let (p, _) = provisioner(Recorder::default());
        let err = p.provision(&spec).await.unwrap_err();
        assert!(matches!(err, ProvisionError::NotADirectory(_)));
    }

    #[tokio::test]
    async fn conflicting_subnet_warns_and_reuses() {
        let (p, rt) = provisioner(Recorder {
            network: Some(NetworkInfo {
                name: "web_net".into(),
                subnets: vec!["10.0.0.0/24".into()],
            }),
            ..Recorder::default()
        });
        let spec = ProvisionSpec {
            network: Some(NetworkSpec {
                name: "web_net".into(),
                subnet: Some("172.28.0.0/16".into()),
            }),
            ..ProvisionSpec::default()
        };

        let result = p.provision(&spec).await.unwrap();
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("172.28.0.0/16"));
        assert_eq!(
            result.actions,
            vec![ProvisionAction::NetworkReused { name: "web_net".into() }]
        );
        assert!(rt.created.lock().is_empty());
    }

    #[tokio::test]
    async fn missing_network_and_volume_are_created() {
        let (p, rt) = provisioner(Recorder {
            volumes: vec!["pgdata".into()],
            ..Recorder::default()
        });
        let spec = ProvisionSpec {
            network: Some(NetworkSpec {
                name: "web_net".into(),
                subnet: None,
            }),
            volumes: vec!["pgdata".into(), "redisdata".into()],
            ..ProvisionSpec::default()
        };

        let result = p.provision(&spec).await.unwrap();
        assert_eq!(result.changes(), 2);
        assert_eq!(*rt.created.lock(), vec!["network:web_net", "volume:redisdata"]);
        assert!(result.warnings.is_empty());
    }
}
