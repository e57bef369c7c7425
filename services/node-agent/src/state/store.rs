//! File-based container state store.
//!
//! One record per runtime container, named by container id, holding the
//! instance snapshot at the moment the container was first bound. Records are
//! written once and never overwritten.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use corral_events::Instance;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Errors from state store operations.
#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("state store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid state record {path}: {source}")]
    Serialization {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid container id: {0:?}")]
    InvalidId(String),
}

/// Container state records under one directory.
#[derive(Debug, Clone)]
pub struct ContainerStateStore {
    dir: PathBuf,
}

impl ContainerStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the record for `container_id`.
    pub fn path_for(&self, container_id: &str) -> Result<PathBuf, StateStoreError> {
        let valid = !container_id.is_empty()
            && container_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StateStoreError::InvalidId(container_id.to_string()));
        }
        Ok(self.dir.join(container_id))
    }

    /// Record the instance snapshot for a container.
    ///
    /// Returns `false` when a record already existed; it is left untouched.
    pub async fn record(
        &self,
        container_id: &str,
        instance: &Instance,
    ) -> Result<bool, StateStoreError> {
        let path = self.path_for(container_id)?;

        if fs::try_exists(&path).await.map_err(|e| io_error(&path, e))? {
            return Ok(false);
        }

        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| io_error(&self.dir, e))?;

        let data = serde_json::to_vec(instance).map_err(|source| StateStoreError::Serialization {
            path: path.clone(),
            source,
        })?;

        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(io_error(&path, e)),
        };

        file.write_all(&data).await.map_err(|e| io_error(&path, e))?;
        file.flush().await.map_err(|e| io_error(&path, e))?;

        debug!(container_id = %container_id, instance_uuid = %instance.uuid, "Recorded container state");
        Ok(true)
    }

    /// Load the snapshot recorded for a container.
    pub async fn load(&self, container_id: &str) -> Result<Option<Instance>, StateStoreError> {
        let path = self.path_for(container_id)?;

        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(&path, e)),
        };

        serde_json::from_slice(&data)
            .map(Some)
            .map_err(|source| StateStoreError::Serialization { path, source })
    }

    /// Remove the record for a container. Returns whether one existed.
    pub async fn purge(&self, container_id: &str) -> Result<bool, StateStoreError> {
        let path = self.path_for(container_id)?;

        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(container_id = %container_id, "Purged container state");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_error(&path, e)),
        }
    }
}

fn io_error(path: &Path, source: std::io::Error) -> StateStoreError {
    StateStoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}
