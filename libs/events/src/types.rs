//! Declared resource types.
//!
//! These mirror the control plane's resource schema. Every member the control
//! plane may omit is an `Option` or defaults to empty; the agent never fails to
//! decode a resource because an optional member is missing.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// =============================================================================
// Constants
// =============================================================================

/// Network service kinds the network resolver reacts to.
pub mod service_kinds {
    pub const PORT_SERVICE: &str = "portService";
    pub const LINK_SERVICE: &str = "linkService";
    pub const IPSEC_TUNNEL_SERVICE: &str = "ipsecTunnelService";
}

/// System container flavour that runs the host network agent.
pub const NETWORK_AGENT_SYSTEM_CONTAINER: &str = "NetworkAgent";

/// IP address role marking the primary address of a NIC.
pub const PRIMARY_IP_ROLE: &str = "primary";

// =============================================================================
// Identifiers
// =============================================================================

/// Control-plane identifier, sent either as a number or a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResourceId {
    Int(i64),
    Str(String),
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceId::Int(id) => write!(f, "{}", id),
            ResourceId::Str(id) => write!(f, "{}", id),
        }
    }
}

/// Reference to another instance by uuid.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRef {
    pub uuid: String,
}

// =============================================================================
// Instance
// =============================================================================

/// A declared compute unit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub uuid: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ResourceId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    /// Runtime container id, recorded once the instance is bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<ResourceId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_container: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<Image>,

    #[serde(default)]
    pub nics: Vec<Nic>,

    #[serde(default)]
    pub instance_links: Vec<InstanceLink>,

    #[serde(default)]
    pub ports: Vec<Port>,

    #[serde(default)]
    pub data_volumes_from_containers: Vec<InstanceRef>,

    #[serde(default)]
    pub data: InstanceData,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Instance {
    /// Runtime container name bound to this instance before `externalId` is known.
    pub fn container_name(&self) -> String {
        format!("/{}", self.uuid)
    }

    /// Whether this instance is the host's network agent.
    ///
    /// Requires an agent id, and either no system container flavour or the
    /// network agent flavour specifically.
    pub fn is_network_agent(&self) -> bool {
        if self.agent_id.is_none() {
            return false;
        }
        match self.system_container.as_deref() {
            None => true,
            Some(flavour) => flavour == NETWORK_AGENT_SYSTEM_CONTAINER,
        }
    }

    /// Full image reference to create the container from.
    pub fn image_full_name(&self) -> Option<&str> {
        self.image.as_ref().and_then(Image::full_name)
    }

    pub fn fields(&self) -> &InstanceFields {
        &self.data.fields
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceData {
    #[serde(default)]
    pub fields: InstanceFields,

    /// Host-specific IPsec port assignments keyed by host id.
    #[serde(default)]
    pub ipsec: BTreeMap<String, IpsecPorts>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Container settings declared on an instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<BTreeMap<String, String>>,

    /// Working directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_swap: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_set: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_shares: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tty: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin_open: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detach: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_point: Option<CommandLine>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    #[serde(default)]
    pub command_args: Vec<String>,

    #[serde(default)]
    pub cap_add: Vec<String>,

    #[serde(default)]
    pub cap_drop: Vec<String>,

    #[serde(default)]
    pub dns: Vec<String>,

    #[serde(default)]
    pub dns_search: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish_all_ports: Option<bool>,

    /// Device mappings, `host[:container[:permissions]]`.
    #[serde(default)]
    pub devices: Vec<String>,

    #[serde(default)]
    pub privileged: bool,

    /// Volume specs, `container-path` or `host-path:container-path[:ro]`.
    #[serde(default)]
    pub data_volumes: Vec<String>,

    /// Restart policy as declared; key casing is normalised for the runtime.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<Map<String, Value>>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A command line given either as one string or as a list of arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandLine {
    Single(String),
    Multiple(Vec<String>),
}

impl CommandLine {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            CommandLine::Single(s) => vec![s.clone()],
            CommandLine::Multiple(v) => v.clone(),
        }
    }
}

/// An explicitly published port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Port {
    pub private_port: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_port: Option<u16>,

    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    "tcp".to_string()
}

/// NAT traversal and key exchange ports assigned to one host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpsecPorts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nat: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isakmp: Option<u16>,
}

// =============================================================================
// Networking
// =============================================================================

/// A declared network interface.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Nic {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ResourceId>,

    /// Ordering key; unique per instance.
    #[serde(default)]
    pub device_number: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,

    #[serde(default)]
    pub ip_addresses: Vec<IpAddress>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<Network>,
}

impl Nic {
    /// Whether this NIC's network declares a service of the given kind.
    pub fn has_service(&self, kind: &str) -> bool {
        self.network
            .as_ref()
            .is_some_and(|network| network.network_services.iter().any(|s| s.kind == kind))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpAddress {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet: Option<Subnet>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subnet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cidr_size: Option<u8>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Network {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    #[serde(default)]
    pub network_services: Vec<NetworkService>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkService {
    pub kind: String,
}

/// Directed link from an instance to a named target instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceLink {
    pub link_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_instance_id: Option<ResourceId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_instance: Option<InstanceRef>,

    #[serde(default)]
    pub data: LinkData,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkData {
    #[serde(default)]
    pub fields: LinkFields,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<Vec<LinkPort>>,
}

/// A port exposed through an instance link.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkPort {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_port: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_port: Option<u16>,
}

/// The compute host an instance is scheduled on.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Host {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ResourceId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoragePool {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

// =============================================================================
// Image
// =============================================================================

/// A declared container image.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ResourceId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,

    /// Reference such as `docker:nginx:1.18`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default)]
    pub data: ImageData,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_credential: Option<RegistryCredential>,
}

impl Image {
    /// The image reference, preferring the resolved docker image name.
    pub fn full_name(&self) -> Option<&str> {
        self.data
            .docker_image
            .as_ref()
            .and_then(|d| d.full_name.as_deref())
            .or(self.name.as_deref())
            .filter(|name| !name.is_empty())
    }

    /// Build specification, if the image is built rather than pulled.
    pub fn build_spec(&self) -> Option<&BuildSpec> {
        self.data
            .fields
            .build
            .as_ref()
            .filter(|build| build.context.is_some() || build.remote.is_some())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_image: Option<DockerImage>,

    #[serde(default)]
    pub fields: ImageFields,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerImage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildSpec>,
}

/// How to build an image instead of pulling it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildSpec {
    /// URL of a tar archive holding the build context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,

    /// VCS URL the engine clones the build context from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dockerfile: Option<String>,

    #[serde(default)]
    pub nocache: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rm: Option<bool>,

    #[serde(default)]
    pub forcerm: bool,
}

/// Pull credentials attached to an image.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryCredential {
    /// Username.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_value: Option<String>,

    /// Password or token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_value: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<Registry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_address: Option<String>,
}

// =============================================================================
// Volume
// =============================================================================

/// A declared volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    #[serde(default)]
    pub uuid: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// `0` marks the container-bound root volume of an instance.
    #[serde(default)]
    pub device_number: i64,

    /// Backing location, `file://...` for unmanaged volumes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_opts: Option<Value>,

    /// Owning instance of a container-bound volume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<InstanceRef>,

    #[serde(default)]
    pub data: VolumeData,
}

impl Volume {
    /// Lifecycle tied 1:1 to an instance's container.
    pub fn is_container_bound(&self) -> bool {
        self.device_number == 0
    }

    /// Backed by a named runtime volume driver.
    pub fn is_managed(&self) -> bool {
        let has_driver = self.driver.as_deref().is_some_and(|d| !d.is_empty());
        let has_name = self.name.as_deref().is_some_and(|n| !n.is_empty());
        has_driver && has_name
    }

    pub fn is_host_path(&self) -> bool {
        self.data.fields.is_host_path
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeData {
    #[serde(default)]
    pub fields: VolumeFields,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeFields {
    #[serde(default)]
    pub is_host_path: bool,
}

// =============================================================================
// Delegation
// =============================================================================

/// Container a delegated request is forwarded to.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegateTarget {
    pub uuid: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}
