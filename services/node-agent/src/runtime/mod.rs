//! Container runtime interface.
//!
//! The runtime interface abstracts the local container engine:
//! - Container lookup, creation and lifecycle
//! - Image pulls, builds and inspection
//! - Named volumes
//!
//! [`DockerRuntime`] talks to a Docker engine. [`MockRuntime`] keeps everything
//! in memory for tests and dry runs.

mod docker;
mod mock;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde_json::Value;
use thiserror::Error;

pub use docker::DockerRuntime;
pub use mock::{MockCalls, MockContainer, MockRuntime, MockVolume};

/// Mount point the engine reports for a volume whose backing store was moved.
pub const MOVED_MOUNTPOINT: &str = "moved";

/// Errors reported by the container engine.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The container, image or volume does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Name collision on create, or resource in use on removal.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Any other engine-side failure.
    #[error("engine error ({status}): {message}")]
    Engine { status: u16, message: String },

    /// The engine could not be reached or answered garbage.
    #[error("runtime transport error: {0}")]
    Transport(String),
}

impl RuntimeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

// =============================================================================
// Containers
// =============================================================================

/// Server-side container filter for listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerFilter {
    /// Exact container name, including the leading `/`.
    Name(String),
    /// Full container id.
    Id(String),
}

impl ContainerFilter {
    pub fn matches(&self, container: &ContainerSummary) -> bool {
        match self {
            Self::Name(name) => container.names.iter().any(|n| n == name),
            Self::Id(id) => &container.id == id,
        }
    }
}

/// A published or exposed port as seen in a container listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryPort {
    pub private_port: Option<u16>,
    pub public_port: Option<u16>,
    pub protocol: String,
}

/// One entry of a container listing.
#[derive(Debug, Clone)]
pub struct ContainerSummary {
    pub id: String,
    pub names: Vec<String>,
    pub ports: Vec<SummaryPort>,
    /// Listing entry as reported by the engine.
    pub raw: Value,
}

/// Result of a container inspection.
#[derive(Debug, Clone)]
pub struct ContainerInspect {
    pub id: String,
    /// `None` when the engine did not report a state.
    pub running: Option<bool>,
    pub ip_address: Option<String>,
    /// Inspection document as reported by the engine.
    pub raw: Value,
}

impl ContainerInspect {
    pub fn is_running(&self) -> bool {
        self.running.unwrap_or(false)
    }
}

/// A port exposed by the container, `<port>/<protocol>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ExposedPort {
    pub port: u16,
    pub protocol: String,
}

impl ExposedPort {
    pub fn new(port: u16, protocol: impl Into<String>) -> Self {
        Self {
            port,
            protocol: protocol.into(),
        }
    }

    /// Engine key, e.g. `80/tcp`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.port, self.protocol)
    }
}

/// Host side of a port binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortBinding {
    pub host_ip: Option<String>,
    pub host_port: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartPolicy {
    pub name: String,
    pub maximum_retry_count: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMapping {
    pub path_on_host: String,
    pub path_in_container: String,
    pub cgroup_permissions: String,
}

/// Container-level settings fixed at creation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreateConfig {
    pub name: String,
    pub hostname: Option<String>,
    pub domainname: Option<String>,
    pub user: Option<String>,
    pub working_dir: Option<String>,
    pub environment: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub memory: Option<i64>,
    pub memory_swap: Option<i64>,
    pub cpu_shares: Option<i64>,
    pub cpuset: Option<String>,
    pub tty: bool,
    pub stdin_open: bool,
    pub detach: bool,
    pub entrypoint: Option<Vec<String>>,
    pub command: Option<Vec<String>>,
    pub ports: Vec<ExposedPort>,
    /// Anonymous volumes by container path.
    pub volumes: Vec<String>,
    pub mac_address: Option<String>,
}

/// Host-level settings for starting the container.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StartConfig {
    /// `host:container:mode` bind mounts.
    pub binds: Vec<String>,
    pub volumes_from: Vec<String>,
    pub port_bindings: BTreeMap<String, Vec<PortBinding>>,
    /// Target container name to alias. `None` means no links at all.
    pub links: Option<BTreeMap<String, String>>,
    pub restart_policy: Option<RestartPolicy>,
    pub cap_add: Vec<String>,
    pub cap_drop: Vec<String>,
    pub dns: Vec<String>,
    pub dns_search: Vec<String>,
    pub publish_all_ports: bool,
    pub devices: Vec<DeviceMapping>,
    pub privileged: bool,
}

// =============================================================================
// Images and volumes
// =============================================================================

/// One line of a pull or build stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Status {
        id: Option<String>,
        status: Option<String>,
        error: Option<String>,
    },
    /// A line the engine sent that could not be decoded.
    Malformed(String),
}

impl ProgressEvent {
    pub fn status(message: impl Into<String>) -> Self {
        Self::Status {
            id: None,
            status: Some(message.into()),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Status {
            id: None,
            status: None,
            error: Some(message.into()),
        }
    }
}

pub type ProgressStream = BoxStream<'static, Result<ProgressEvent, RuntimeError>>;

/// Registry credentials for a pull.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryAuth {
    pub username: String,
    pub password: String,
    pub email: Option<String>,
    pub server_address: Option<String>,
}

/// Parameters of an image build.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Tag given to the built image.
    pub tag: String,
    pub remote: Option<String>,
    pub dockerfile: Option<String>,
    pub nocache: bool,
    pub rm: bool,
    pub forcerm: bool,
    /// Build context as a tar archive.
    pub context: Option<bytes::Bytes>,
}

#[derive(Debug, Clone)]
pub struct ImageInspect {
    pub id: String,
    pub repo_tags: Vec<String>,
    pub raw: Value,
}

#[derive(Debug, Clone)]
pub struct VolumeInspect {
    pub name: String,
    pub driver: String,
    pub mountpoint: String,
}

impl VolumeInspect {
    pub fn is_moved(&self) -> bool {
        self.mountpoint == MOVED_MOUNTPOINT
    }
}

// =============================================================================
// Interface
// =============================================================================

/// Container engine interface.
#[async_trait]
pub trait RuntimeClient: Send + Sync {
    async fn list_containers(
        &self,
        all: bool,
        filter: Option<&ContainerFilter>,
    ) -> Result<Vec<ContainerSummary>, RuntimeError>;

    async fn inspect_container(&self, id: &str) -> Result<ContainerInspect, RuntimeError>;

    /// Create a container and return its id. Host-level settings in `start`
    /// are applied here.
    async fn create_container(
        &self,
        image: &str,
        create: &CreateConfig,
        start: &StartConfig,
    ) -> Result<String, RuntimeError>;

    async fn start_container(&self, id: &str, start: &StartConfig) -> Result<(), RuntimeError>;

    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<(), RuntimeError>;

    async fn kill_container(&self, id: &str) -> Result<(), RuntimeError>;

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError>;

    async fn pull_image(
        &self,
        repo: &str,
        tag: &str,
        auth: Option<&RegistryAuth>,
    ) -> Result<ProgressStream, RuntimeError>;

    async fn build_image(&self, options: &BuildOptions) -> Result<ProgressStream, RuntimeError>;

    async fn inspect_image(&self, reference: &str) -> Result<ImageInspect, RuntimeError>;

    async fn create_volume(
        &self,
        name: &str,
        driver: &str,
        opts: &BTreeMap<String, String>,
    ) -> Result<(), RuntimeError>;

    async fn remove_volume(&self, name: &str) -> Result<(), RuntimeError>;

    async fn inspect_volume(&self, name: &str) -> Result<VolumeInspect, RuntimeError>;
}

/// First container matching `filter`, listing stopped containers too.
pub async fn find_container(
    runtime: &dyn RuntimeClient,
    filter: ContainerFilter,
) -> Result<Option<ContainerSummary>, RuntimeError> {
    let containers = runtime.list_containers(true, Some(&filter)).await?;
    Ok(containers.into_iter().find(|c| filter.matches(c)))
}

/// Whether the container exists and reports itself running.
pub async fn is_running(runtime: &dyn RuntimeClient, id: &str) -> Result<bool, RuntimeError> {
    match runtime.inspect_container(id).await {
        Ok(inspect) => Ok(inspect.is_running()),
        Err(RuntimeError::NotFound(_)) => Ok(false),
        Err(e) => Err(e),
    }
}
