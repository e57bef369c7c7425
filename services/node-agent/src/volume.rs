//! Volume reconciliation.
//!
//! Volumes come in four flavours, decided by the declared fields:
//! - Container-bound (`deviceNumber == 0`): lives and dies with the instance container
//! - Managed (driver and name set): a named engine volume
//! - Host path: a directory on the host the agent never deletes
//! - Unmanaged: a directory under the engine root, addressed by `file://` URI

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use corral_events::Volume;
use corral_reconcile::LockManager;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::AgentError;
use crate::runtime::{self, ContainerFilter, RuntimeClient, RuntimeError};
use crate::state::ContainerStateStore;

/// Engine root as seen from the host.
const DOCKER_ROOT: &str = "/var/lib/docker";
const FILE_SCHEME: &str = "file://";

/// How a declared volume is backed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeClass {
    ContainerBound,
    Managed,
    HostPath,
    Unmanaged,
}

impl VolumeClass {
    pub fn of(volume: &Volume) -> Self {
        if volume.is_container_bound() {
            Self::ContainerBound
        } else if volume.is_managed() {
            Self::Managed
        } else if volume.is_host_path() {
            Self::HostPath
        } else {
            Self::Unmanaged
        }
    }
}

pub struct VolumeReconciler {
    runtime: Arc<dyn RuntimeClient>,
    config: Arc<Config>,
    locks: Arc<LockManager>,
    store: ContainerStateStore,
}

impl VolumeReconciler {
    pub fn new(runtime: Arc<dyn RuntimeClient>, config: Arc<Config>, locks: Arc<LockManager>) -> Self {
        let store = ContainerStateStore::new(config.container_state_dir.clone());
        Self {
            runtime,
            config,
            locks,
            store,
        }
    }

    /// Unmanaged volumes are always active. A managed volume is active when
    /// the engine knows it and it has not been moved.
    pub async fn is_active(&self, volume: &Volume) -> Result<bool, AgentError> {
        if VolumeClass::of(volume) != VolumeClass::Managed {
            return Ok(true);
        }
        match self.runtime.inspect_volume(managed_name(volume)).await {
            Ok(inspect) => Ok(!inspect.is_moved()),
            Err(RuntimeError::NotFound(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn activate(&self, volume: &Volume) -> Result<Value, AgentError> {
        if self.is_active(volume).await? {
            return Ok(payload());
        }

        let _guard = self.locks.acquire(&lock_key(volume)).await?;
        if self.is_active(volume).await? {
            return Ok(payload());
        }

        let name = managed_name(volume);
        let driver = volume.driver.as_deref().unwrap_or_default();

        match self.runtime.inspect_volume(name).await {
            Ok(inspect) if inspect.is_moved() => {
                info!(volume = %name, "Volume was moved, removing stale reference");
                match self.runtime.remove_volume(name).await {
                    Ok(()) | Err(RuntimeError::NotFound(_)) => {}
                    Err(e) => return Err(e.into()),
                }
            }
            Ok(_) | Err(RuntimeError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let opts = unwrap_driver_opts(volume.driver_opts.as_ref());
        info!(volume = %name, driver = %driver, "Creating volume");
        self.runtime.create_volume(name, driver, &opts).await?;

        Ok(payload())
    }

    /// Volumes hold no running state; deactivation only acknowledges.
    pub async fn deactivate(&self, volume: &Volume) -> Result<Value, AgentError> {
        debug!(volume_uuid = %volume.uuid, "Volume deactivate is a no-op");
        Ok(payload())
    }

    /// Whether nothing backing the volume remains.
    pub async fn is_removed(&self, volume: &Volume) -> Result<bool, AgentError> {
        match VolumeClass::of(volume) {
            VolumeClass::ContainerBound => {
                let Some(instance) = volume.instance.as_ref() else {
                    return Ok(true);
                };
                let container = runtime::find_container(
                    self.runtime.as_ref(),
                    ContainerFilter::Name(format!("/{}", instance.uuid)),
                )
                .await?;
                Ok(container.is_none())
            }
            VolumeClass::Managed => match self.runtime.inspect_volume(managed_name(volume)).await {
                Ok(_) => Ok(false),
                Err(RuntimeError::NotFound(_)) => Ok(true),
                Err(e) => Err(e.into()),
            },
            VolumeClass::HostPath => Ok(true),
            VolumeClass::Unmanaged => Ok(match self.local_path(volume) {
                Some(path) => !tokio::fs::try_exists(&path).await?,
                None => true,
            }),
        }
    }

    pub async fn remove(&self, volume: &Volume) -> Result<Value, AgentError> {
        if self.is_removed(volume).await? {
            debug!(volume_uuid = %volume.uuid, "Volume already removed");
            return Ok(payload());
        }

        let _guard = self.locks.acquire(&lock_key(volume)).await?;

        match VolumeClass::of(volume) {
            VolumeClass::ContainerBound => self.remove_bound_container(volume).await?,
            VolumeClass::Managed => {
                let name = managed_name(volume);
                info!(volume = %name, "Removing volume");
                match self.runtime.remove_volume(name).await {
                    Ok(()) | Err(RuntimeError::NotFound(_)) => {}
                    Err(RuntimeError::Conflict(message)) => {
                        warn!(volume = %name, reason = %message, "Volume in use, leaving it orphaned");
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            VolumeClass::HostPath => {}
            VolumeClass::Unmanaged => {
                if let Some(path) = self.local_path(volume) {
                    info!(volume_uuid = %volume.uuid, path = %path.display(), "Deleting volume directory");
                    match tokio::fs::remove_dir_all(&path).await {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }

        Ok(payload())
    }

    async fn remove_bound_container(&self, volume: &Volume) -> Result<(), AgentError> {
        let Some(instance) = volume.instance.as_ref() else {
            return Ok(());
        };
        let Some(container) = runtime::find_container(
            self.runtime.as_ref(),
            ContainerFilter::Name(format!("/{}", instance.uuid)),
        )
        .await?
        else {
            return Ok(());
        };

        self.store.purge(&container.id).await?;

        info!(instance_uuid = %instance.uuid, container_id = %container.id, "Removing container of bound volume");
        match self.runtime.remove_container(&container.id).await {
            Ok(()) | Err(RuntimeError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Where an unmanaged volume lives, as seen by the agent.
    pub fn local_path(&self, volume: &Volume) -> Option<PathBuf> {
        let uri = volume.uri.as_deref().filter(|u| !u.is_empty())?;
        Some(map_to_root_mount(uri, &self.config.docker_root_mount))
    }
}

/// Strip the file scheme and rebase anything under the engine root onto `root_mount`.
pub fn map_to_root_mount(uri: &str, root_mount: &Path) -> PathBuf {
    let path = uri.strip_prefix(FILE_SCHEME).unwrap_or(uri);
    match path.find(DOCKER_ROOT) {
        Some(index) => {
            let rest = path[index + DOCKER_ROOT.len()..].trim_start_matches('/');
            if rest.is_empty() {
                root_mount.to_path_buf()
            } else {
                root_mount.join(rest)
            }
        }
        None => PathBuf::from(path),
    }
}

/// Flatten declared driver options into the string map the engine accepts.
///
/// Strings pass through, null entries are dropped and anything else is
/// JSON-encoded.
pub fn unwrap_driver_opts(opts: Option<&Value>) -> BTreeMap<String, String> {
    let Some(Value::Object(map)) = opts else {
        return BTreeMap::new();
    };

    map.iter()
        .filter_map(|(key, value)| {
            let value = match value {
                Value::Null => return None,
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            Some((key.clone(), value))
        })
        .collect()
}

fn managed_name(volume: &Volume) -> &str {
    volume.name.as_deref().unwrap_or_default()
}

fn lock_key(volume: &Volume) -> String {
    match volume.name.as_deref().filter(|n| !n.is_empty()) {
        Some(name) => format!("volume:{}", name),
        None => format!("volume:{}", volume.uuid),
    }
}

fn payload() -> Value {
    json!({
        "volumeStoragePoolMap": {
            "volume": {
                "format": "docker",
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use corral_events::{InstanceRef, VolumeData, VolumeFields};
    use rstest::rstest;
    use tempfile::TempDir;

    use super::*;
    use crate::runtime::MockRuntime;

    fn setup() -> (TempDir, Arc<MockRuntime>, VolumeReconciler) {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(Config::for_state_dir(dir.path()));
        let runtime = Arc::new(MockRuntime::new());
        let volumes = VolumeReconciler::new(runtime.clone(), config, Arc::new(LockManager::new()));
        (dir, runtime, volumes)
    }

    fn managed(name: &str) -> Volume {
        Volume {
            uuid: format!("{}-uuid", name),
            name: Some(name.to_string()),
            device_number: 1,
            driver: Some("local".to_string()),
            ..Default::default()
        }
    }

    #[rstest]
    #[case("file:///var/lib/docker/vfs/dir/abc", "/host/var/lib/docker/vfs/dir/abc")]
    #[case("/var/lib/docker/volumes/x", "/host/var/lib/docker/volumes/x")]
    #[case("file:///opt/data", "/opt/data")]
    fn test_map_to_root_mount(#[case] uri: &str, #[case] expected: &str) {
        assert_eq!(
            map_to_root_mount(uri, Path::new("/host/var/lib/docker")),
            PathBuf::from(expected)
        );
    }

    #[test]
    fn test_unwrap_driver_opts() {
        let opts = json!({"size": "10G", "replicas": 3, "encrypted": true, "skip": null, "tags": {"a": 1}});
        let unwrapped = unwrap_driver_opts(Some(&opts));
        assert_eq!(unwrapped["size"], "10G");
        assert_eq!(unwrapped["replicas"], "3");
        assert_eq!(unwrapped["encrypted"], "true");
        assert_eq!(unwrapped["tags"], r#"{"a":1}"#);
        assert!(!unwrapped.contains_key("skip"));
        assert!(unwrap_driver_opts(None).is_empty());
    }

    #[tokio::test]
    async fn test_activate_creates_managed_volume() {
        let (_dir, runtime, volumes) = setup();
        let mut volume = managed("data");
        volume.driver_opts = Some(json!({"size": "1G"}));

        assert!(!volumes.is_active(&volume).await.unwrap());
        let payload = volumes.activate(&volume).await.unwrap();

        assert_eq!(payload["volumeStoragePoolMap"]["volume"]["format"], "docker");
        let created = runtime.volume("data").unwrap();
        assert_eq!(created.driver, "local");
        assert_eq!(created.opts["size"], "1G");
        assert!(volumes.is_active(&volume).await.unwrap());
    }

    #[tokio::test]
    async fn test_unmanaged_volume_always_active() {
        let (_dir, runtime, volumes) = setup();
        let volume = Volume {
            uuid: "v1".to_string(),
            device_number: 1,
            uri: Some("file:///var/lib/docker/vfs/dir/v1".to_string()),
            ..Default::default()
        };

        assert!(volumes.is_active(&volume).await.unwrap());
        volumes.activate(&volume).await.unwrap();
        assert_eq!(runtime.calls().create_volume, 0);
    }

    #[tokio::test]
    async fn test_host_path_never_deleted() {
        let (dir, _runtime, volumes) = setup();
        let host_dir = dir.path().join("docker").join("host-data");
        std::fs::create_dir_all(&host_dir).unwrap();

        let volume = Volume {
            uuid: "v2".to_string(),
            device_number: 1,
            uri: Some("file:///var/lib/docker/host-data".to_string()),
            data: VolumeData {
                fields: VolumeFields { is_host_path: true },
            },
            ..Default::default()
        };

        assert!(volumes.is_removed(&volume).await.unwrap());
        volumes.remove(&volume).await.unwrap();
        assert!(host_dir.exists());
    }

    #[tokio::test]
    async fn test_unmanaged_directory_deleted() {
        let (dir, _runtime, volumes) = setup();
        let volume_dir = dir.path().join("docker").join("vfs").join("dir").join("v3");
        std::fs::create_dir_all(&volume_dir).unwrap();
        std::fs::write(volume_dir.join("file"), b"x").unwrap();

        let volume = Volume {
            uuid: "v3".to_string(),
            device_number: 1,
            uri: Some("file:///var/lib/docker/vfs/dir/v3".to_string()),
            ..Default::default()
        };

        assert!(!volumes.is_removed(&volume).await.unwrap());
        volumes.remove(&volume).await.unwrap();
        assert!(!volume_dir.exists());
        assert!(volumes.is_removed(&volume).await.unwrap());
    }

    #[tokio::test]
    async fn test_container_bound_removes_container_and_record() {
        let (_dir, runtime, volumes) = setup();
        let id = runtime.add_container("inst-1", "busybox", false);
        volumes
            .store
            .record(&id, &corral_events::Instance::default())
            .await
            .unwrap();

        let volume = Volume {
            uuid: "root".to_string(),
            device_number: 0,
            instance: Some(InstanceRef {
                uuid: "inst-1".to_string(),
            }),
            ..Default::default()
        };

        volumes.remove(&volume).await.unwrap();
        assert!(runtime.container(&id).is_none());
        assert!(volumes.store.load(&id).await.unwrap().is_none());
        assert!(volumes.is_removed(&volume).await.unwrap());
    }
}
