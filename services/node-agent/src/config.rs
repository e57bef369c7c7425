//! Configuration for the node agent.
//!
//! Built once at startup and shared as `Arc<Config>`. Every key is read from
//! `CORRAL_<KEY>`; [`ConfigOverrides`] take precedence over the environment.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};

/// Prefix of every configuration variable.
pub const ENV_PREFIX: &str = "CORRAL_";

/// Values consulted before the environment.
pub type ConfigOverrides = BTreeMap<String, String>;

/// Which container engine the agent drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeBackend {
    Docker,
    /// In-memory engine; nothing on the host is touched.
    Mock,
}

/// Node agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root of the agent's local state.
    pub state_dir: PathBuf,

    /// Directory of per-container state records.
    pub container_state_dir: PathBuf,

    /// Maximum events processed concurrently.
    pub workers: usize,

    pub hostname: String,
    pub physical_host_uuid: String,

    /// Identity of this host's container engine.
    pub docker_uuid: String,

    /// Address containers on this host are reachable at.
    pub docker_host_ip: String,

    pub docker_enabled: bool,

    /// Engine endpoint; local defaults when unset.
    pub docker_host: Option<String>,

    pub runtime: RuntimeBackend,

    /// Reverse proxy URL reported with the host record.
    pub host_api_proxy: Option<String>,

    /// Configuration URL handed to agent instances.
    pub config_url: Option<String>,

    pub api_proxy_listen_port: u16,

    /// Stop timeout when an event does not carry one.
    pub stop_timeout: Duration,

    /// Lock wait limit; `None` waits forever.
    pub lock_timeout: Option<Duration>,

    /// Where the host's docker root is mounted inside the agent.
    pub docker_root_mount: PathBuf,

    pub delegate_timeout: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from overrides, falling back to the environment.
    pub fn from_overrides(overrides: &ConfigOverrides) -> Result<Self> {
        Self::from_lookup(|key| {
            let short = key.strip_prefix(ENV_PREFIX).unwrap_or(key);
            overrides
                .get(short)
                .cloned()
                .or_else(|| std::env::var(key).ok())
        })
    }

    /// Load configuration through an arbitrary key lookup.
    ///
    /// `lookup` receives full variable names (`CORRAL_STATE_DIR`).
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(&format!("{}{}", ENV_PREFIX, key)).filter(|v| !v.trim().is_empty())
        };

        let state_dir = PathBuf::from(get("STATE_DIR").unwrap_or_else(|| "/var/lib/corral".to_string()));
        let container_state_dir = get("CONTAINER_STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| state_dir.join("containers"));

        let workers = parse(get("WORKERS"), "WORKERS", 50usize)?.max(1);

        let hostname = match get("HOSTNAME") {
            Some(hostname) => hostname,
            None => hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "localhost".to_string()),
        };

        let physical_host_uuid = match get("PHYSICAL_HOST_UUID") {
            Some(uuid) => uuid,
            None => memoised_uuid(&state_dir.join(".physical_host_uuid"))?,
        };
        let docker_uuid = match get("DOCKER_UUID") {
            Some(uuid) => uuid,
            None => memoised_uuid(&state_dir.join(".docker_uuid"))?,
        };

        let docker_host_ip = get("DOCKER_HOST_IP")
            .or_else(|| get("AGENT_IP"))
            .unwrap_or_else(|| "127.0.0.1".to_string());

        let runtime = match get("RUNTIME").as_deref() {
            None | Some("docker") => RuntimeBackend::Docker,
            Some("mock") => RuntimeBackend::Mock,
            Some(other) => anyhow::bail!("unknown runtime {:?}, expected docker or mock", other),
        };

        let lock_timeout = get("LOCK_TIMEOUT")
            .map(|v| {
                v.parse::<u64>()
                    .with_context(|| format!("invalid {}LOCK_TIMEOUT: {:?}", ENV_PREFIX, v))
            })
            .transpose()?
            .map(Duration::from_secs);

        Ok(Self {
            container_state_dir,
            workers,
            hostname,
            physical_host_uuid,
            docker_uuid,
            docker_host_ip,
            docker_enabled: parse(get("DOCKER_ENABLED"), "DOCKER_ENABLED", true)?,
            docker_host: get("DOCKER_HOST"),
            runtime,
            host_api_proxy: get("HOST_API_PROXY"),
            config_url: get("CONFIG_URL"),
            api_proxy_listen_port: parse(get("API_PROXY_LISTEN_PORT"), "API_PROXY_LISTEN_PORT", 9342u16)?,
            stop_timeout: Duration::from_secs(parse(get("STOP_TIMEOUT"), "STOP_TIMEOUT", 10u64)?),
            lock_timeout,
            docker_root_mount: PathBuf::from(
                get("DOCKER_ROOT_MOUNT").unwrap_or_else(|| "/host/var/lib/docker".to_string()),
            ),
            delegate_timeout: Duration::from_secs(parse(get("DELEGATE_TIMEOUT"), "DELEGATE_TIMEOUT", 30u64)?),
            log_level: get("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            state_dir,
        })
    }

    /// Configuration for tests: every path under `state_dir`, fixed identities.
    pub fn for_state_dir(state_dir: impl AsRef<Path>) -> Self {
        let state_dir = state_dir.as_ref().to_path_buf();
        Self {
            container_state_dir: state_dir.join("containers"),
            workers: 4,
            hostname: "node-1".to_string(),
            physical_host_uuid: "physical-host-uuid".to_string(),
            docker_uuid: "docker-uuid".to_string(),
            docker_host_ip: "10.0.0.5".to_string(),
            docker_enabled: true,
            docker_host: None,
            runtime: RuntimeBackend::Mock,
            host_api_proxy: None,
            config_url: None,
            api_proxy_listen_port: 9342,
            stop_timeout: Duration::from_secs(10),
            lock_timeout: None,
            docker_root_mount: state_dir.join("docker"),
            delegate_timeout: Duration::from_secs(30),
            log_level: "info".to_string(),
            state_dir,
        }
    }
}

fn parse<T>(value: Option<String>, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match value {
        Some(v) => v
            .trim()
            .parse()
            .with_context(|| format!("invalid {}{}: {:?}", ENV_PREFIX, key, v)),
        None => Ok(default),
    }
}

/// Read a uuid from `path`, generating and writing one when missing.
fn memoised_uuid(path: &Path) -> Result<String> {
    match std::fs::read_to_string(path) {
        Ok(contents) if !contents.trim().is_empty() => return Ok(contents.trim().to_string()),
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    }

    let uuid = uuid::Uuid::new_v4().to_string();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    std::fs::write(path, &uuid).with_context(|| format!("writing {}", path.display()))?;
    Ok(uuid)
}
