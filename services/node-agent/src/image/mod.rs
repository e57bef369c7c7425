//! Image reconciliation.
//!
//! This module handles:
//! - Deciding whether a declared image is present on the engine
//! - Pulling images, with registry credentials when attached
//! - Building images from a context archive or a VCS remote
//! - Turning engine pull/build output into progress updates
//!
//! Activation is serialized per image reference by the shared lock manager.

mod auth;
mod build;
mod reference;

pub use auth::{normalize_server, registry_auth, DOCKER_HUB_INDEX};
pub use build::{build_options, download_context, rewrite_remote};
pub use reference::{ImageReference, DEFAULT_TAG, DOCKER_SCHEME};

use std::sync::Arc;
use std::time::Instant;

use corral_events::Image;
use corral_reconcile::LockManager;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::error::AgentError;
use crate::progress::Progress;
use crate::runtime::{ProgressEvent, ProgressStream, RuntimeClient, RuntimeError};

/// Placeholder image that is always considered present.
pub const NOOP_IMAGE: &str = "docker:none";

/// Which engine operation a progress stream belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamKind {
    Pull,
    Build,
}

/// Brings declared images onto the local engine.
pub struct ImageReconciler {
    runtime: Arc<dyn RuntimeClient>,
    locks: Arc<LockManager>,
    http: reqwest::Client,
}

impl ImageReconciler {
    pub fn new(runtime: Arc<dyn RuntimeClient>, locks: Arc<LockManager>) -> Self {
        Self {
            runtime,
            locks,
            http: reqwest::Client::new(),
        }
    }

    /// Whether the image is the no-op placeholder.
    pub fn is_noop(image: &Image) -> bool {
        image.full_name() == Some(NOOP_IMAGE)
    }

    /// Whether the image needs no activation.
    ///
    /// Images with a build spec are never active; they are rebuilt on every
    /// activation.
    pub async fn is_active(&self, image: &Image) -> Result<bool, AgentError> {
        if image.build_spec().is_some() {
            return Ok(false);
        }
        if Self::is_noop(image) {
            return Ok(true);
        }

        let reference = Self::reference(image)?;
        match self.runtime.inspect_image(&reference.to_string()).await {
            Ok(_) => Ok(true),
            Err(RuntimeError::NotFound(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Activate the image and return the image payload.
    pub async fn activate(&self, image: &Image, progress: &dyn Progress) -> Result<Value, AgentError> {
        self.ensure_present(image, progress).await?;
        self.payload(image).await
    }

    /// Pull or build the image unless it is already present.
    pub async fn ensure_present(&self, image: &Image, progress: &dyn Progress) -> Result<(), AgentError> {
        if self.is_active(image).await? {
            debug!(image = ?image.full_name(), "Image already present");
            return Ok(());
        }

        let reference = Self::reference(image)?;
        let key = format!("image:{}", reference);
        let _guard = self.locks.acquire(&key).await?;

        // A concurrent activation may have pulled it while we waited.
        if self.is_active(image).await? {
            debug!(image = %reference, "Image became present while waiting for lock");
            return Ok(());
        }

        let start = Instant::now();
        match image.build_spec() {
            Some(spec) => {
                let options = build_options(&self.http, spec, &reference.to_string()).await?;
                let stream = self.runtime.build_image(&options).await.map_err(|e| {
                    AgentError::ImageBuild {
                        image: reference.to_string(),
                        message: e.to_string(),
                    }
                })?;
                consume(stream, StreamKind::Build, &reference, progress).await?;
            }
            None => {
                let auth = registry_auth(image, &reference.to_string())?;
                info!(
                    image = %reference,
                    authenticated = auth.is_some(),
                    "Pulling image"
                );
                let stream = self
                    .runtime
                    .pull_image(&reference.repo, &reference.tag, auth.as_ref())
                    .await
                    .map_err(|e| AgentError::ImagePull {
                        image: reference.to_string(),
                        message: e.to_string(),
                    })?;
                consume(stream, StreamKind::Pull, &reference, progress).await?;
            }
        }

        info!(
            image = %reference,
            duration_ms = start.elapsed().as_millis() as u64,
            "Image ready"
        );
        Ok(())
    }

    /// Image payload: `{"imageStoragePoolMap": {"+data": {"dockerImage": ...}}}`.
    pub async fn payload(&self, image: &Image) -> Result<Value, AgentError> {
        let docker_image = if Self::is_noop(image) {
            Value::Null
        } else {
            let reference = Self::reference(image)?;
            match self.runtime.inspect_image(&reference.to_string()).await {
                Ok(inspect) => inspect.raw,
                Err(RuntimeError::NotFound(_)) => Value::Null,
                Err(e) => return Err(e.into()),
            }
        };

        Ok(json!({
            "imageStoragePoolMap": {
                "+data": {
                    "dockerImage": docker_image,
                }
            }
        }))
    }

    fn reference(image: &Image) -> Result<ImageReference, AgentError> {
        let name = image.full_name().unwrap_or_default();
        ImageReference::parse(name).ok_or_else(|| {
            AgentError::configuration(
                format!("image {}", image.uuid.as_deref().unwrap_or("<unnamed>")),
                "no image reference",
            )
        })
    }
}

/// Drain a pull or build stream into progress updates.
///
/// Pull status lines are deduplicated against the previous line. An error
/// line fails the operation; undecodable lines are skipped.
async fn consume(
    mut stream: ProgressStream,
    kind: StreamKind,
    reference: &ImageReference,
    progress: &dyn Progress,
) -> Result<(), AgentError> {
    let failure = |message: String| match kind {
        StreamKind::Pull => AgentError::ImagePull {
            image: reference.to_string(),
            message,
        },
        StreamKind::Build => AgentError::ImageBuild {
            image: reference.to_string(),
            message,
        },
    };

    let mut last_status: Option<String> = None;
    while let Some(item) = stream.next().await {
        match item.map_err(|e| failure(e.to_string()))? {
            ProgressEvent::Status {
                error: Some(error), ..
            } => {
                warn!(image = %reference, error = %error, "Engine reported image failure");
                return Err(failure(error));
            }
            ProgressEvent::Status {
                status: Some(status),
                ..
            } => {
                let status = status.trim();
                if status.is_empty() {
                    continue;
                }
                if kind == StreamKind::Pull && last_status.as_deref() == Some(status) {
                    continue;
                }
                progress.update(status, None);
                last_status = Some(status.to_string());
            }
            ProgressEvent::Status { .. } => {}
            ProgressEvent::Malformed(line) => {
                debug!(image = %reference, line = %line, "Ignoring undecodable progress line");
            }
        }
    }

    Ok(())
}
