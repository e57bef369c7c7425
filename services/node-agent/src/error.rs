//! Errors surfaced by reconcilers and handlers.

use corral_events::EventError;
use corral_reconcile::LockError;
use thiserror::Error;

use crate::runtime::RuntimeError;
use crate::state::StateStoreError;

/// Node agent errors. Each one becomes an error reply.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    StateStore(#[from] StateStoreError),

    #[error(transparent)]
    Event(#[from] EventError),

    /// The declared resource cannot be acted on as given.
    #[error("invalid {resource}: {message}")]
    Configuration { resource: String, message: String },

    /// Neither stop nor kill brought the container down.
    #[error("Failed to stop container {instance}")]
    StopFailed { instance: String },

    #[error("Failed to pull image {image}: {message}")]
    ImagePull { image: String, message: String },

    #[error("Failed to build image {image}: {message}")]
    ImageBuild { image: String, message: String },

    #[error("Failed to download {url}: {message}")]
    Download { url: String, message: String },

    #[error("delegated request to {target} failed: {message}")]
    Delegate { target: String, message: String },

    /// Host statistics could not be collected.
    #[error("host stats unavailable: {0}")]
    Stats(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    pub fn configuration(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Configuration {
            resource: resource.into(),
            message: message.into(),
        }
    }
}
