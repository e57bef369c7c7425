//! Instance reconciliation.
//!
//! An instance is observed in one of three states, never stored:
//! - Unbound: no container matches
//! - Stopped: the container exists and is not running
//! - Running: the container exists and is running
//!
//! `activate` drives an instance to Running, `deactivate` to Stopped. Both
//! take the per-instance lock and re-check state once they hold it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use corral_events::{CommandLine, Event, Host, Instance, ProcessData};
use corral_reconcile::LockManager;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::Config;
use crate::error::AgentError;
use crate::image::{ImageReconciler, ImageReference};
use crate::network::apply_network_config;
use crate::progress::Progress;
use crate::runtime::{
    self, ContainerFilter, ContainerSummary, CreateConfig, DeviceMapping, ExposedPort,
    PortBinding, RestartPolicy, RuntimeClient, RuntimeError, StartConfig,
};
use crate::state::ContainerStateStore;

/// Label carrying the instance uuid on every created container.
pub const LABEL_CONTAINER_UUID: &str = "io.corral.container.uuid";

const DEFAULT_DEVICE_PERMISSIONS: &str = "rwm";

/// How `activate` treats the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationMode {
    /// Create and start the container as needed.
    Apply,
    /// Replay of a creation that already happened: record state only.
    RecordOnly,
}

impl ActivationMode {
    pub fn for_event(event: &Event) -> Self {
        if event.is_container_event_replay() {
            Self::RecordOnly
        } else {
            Self::Apply
        }
    }
}

/// Outcome of one locked activation pass.
enum Attempt {
    Done(Value),
    /// Creation failed because the engine lacks the image.
    ImageMissing(String),
}

/// Brings declared instances to the requested container state.
pub struct InstanceReconciler {
    runtime: Arc<dyn RuntimeClient>,
    config: Arc<Config>,
    locks: Arc<LockManager>,
    store: ContainerStateStore,
    images: Arc<ImageReconciler>,
}

impl InstanceReconciler {
    pub fn new(
        runtime: Arc<dyn RuntimeClient>,
        config: Arc<Config>,
        locks: Arc<LockManager>,
        images: Arc<ImageReconciler>,
    ) -> Self {
        let store = ContainerStateStore::new(config.container_state_dir.clone());
        Self {
            runtime,
            config,
            locks,
            store,
            images,
        }
    }

    pub fn store(&self) -> &ContainerStateStore {
        &self.store
    }

    /// The container bound to `instance`, in any state.
    ///
    /// A recorded container id is authoritative; the uuid-derived name is
    /// only consulted while no id is recorded.
    pub async fn find_container(
        &self,
        instance: &Instance,
    ) -> Result<Option<ContainerSummary>, RuntimeError> {
        let filter = match instance.external_id.as_deref().filter(|id| !id.is_empty()) {
            Some(id) => ContainerFilter::Id(id.to_string()),
            None => ContainerFilter::Name(instance.container_name()),
        };
        runtime::find_container(self.runtime.as_ref(), filter).await
    }

    /// Running iff a container is bound and inspection reports it running.
    pub async fn is_active(&self, instance: &Instance) -> Result<bool, AgentError> {
        Ok(self.running_container(instance).await?.is_some())
    }

    pub async fn is_inactive(&self, instance: &Instance) -> Result<bool, AgentError> {
        Ok(!self.is_active(instance).await?)
    }

    async fn running_container(
        &self,
        instance: &Instance,
    ) -> Result<Option<ContainerSummary>, AgentError> {
        let Some(container) = self.find_container(instance).await? else {
            return Ok(None);
        };
        if runtime::is_running(self.runtime.as_ref(), &container.id).await? {
            Ok(Some(container))
        } else {
            Ok(None)
        }
    }

    /// Drive the instance to Running and return the instance payload.
    ///
    /// When the engine lacks the image, the instance lock is released, the
    /// image is pulled and creation is attempted once more.
    pub async fn activate(
        &self,
        instance: &Instance,
        host: Option<&Host>,
        mode: ActivationMode,
        progress: &dyn Progress,
    ) -> Result<Value, AgentError> {
        if let Some(container) = self.running_container(instance).await? {
            debug!(instance_uuid = %instance.uuid, container_id = %container.id, "Instance already running");
            self.record_state(&container.id, instance).await?;
            return self.payload(instance).await;
        }

        let reason = match self.activate_locked(instance, host, mode).await? {
            Attempt::Done(payload) => return Ok(payload),
            Attempt::ImageMissing(reason) => reason,
        };

        let image = instance.image.as_ref().ok_or_else(|| {
            AgentError::configuration(format!("instance {}", instance.uuid), "no image")
        })?;
        info!(
            instance_uuid = %instance.uuid,
            reason = %reason,
            "Image missing on create, pulling and retrying"
        );
        self.images.ensure_present(image, progress).await?;

        match self.activate_locked(instance, host, mode).await? {
            Attempt::Done(payload) => Ok(payload),
            Attempt::ImageMissing(reason) => Err(RuntimeError::NotFound(reason).into()),
        }
    }

    /// One activation pass under the instance lock.
    async fn activate_locked(
        &self,
        instance: &Instance,
        host: Option<&Host>,
        mode: ActivationMode,
    ) -> Result<Attempt, AgentError> {
        let _guard = self.locks.acquire(&lock_key(instance)).await?;

        // A duplicate delivery may have finished while we waited.
        if let Some(container) = self.running_container(instance).await? {
            debug!(instance_uuid = %instance.uuid, container_id = %container.id, "Instance started while waiting for lock");
            self.record_state(&container.id, instance).await?;
            return Ok(Attempt::Done(self.payload(instance).await?));
        }

        if mode == ActivationMode::RecordOnly {
            info!(instance_uuid = %instance.uuid, "Replayed creation, recording state only");
            if let Some(container) = self.find_container(instance).await? {
                self.record_state(&container.id, instance).await?;
            }
            return Ok(Attempt::Done(self.payload(instance).await?));
        }

        let (create, start) = self.build_config(instance, host);

        let container_id = match self.find_container(instance).await? {
            Some(container) => container.id,
            None => match self.create_container(instance, &create, &start).await {
                Err(AgentError::Runtime(RuntimeError::NotFound(reason))) => {
                    return Ok(Attempt::ImageMissing(reason));
                }
                other => other?,
            },
        };

        info!(instance_uuid = %instance.uuid, container_id = %container_id, "Starting container");
        self.runtime.start_container(&container_id, &start).await?;

        self.record_state(&container_id, instance).await?;

        let container =
            runtime::find_container(self.runtime.as_ref(), ContainerFilter::Id(container_id)).await?;
        Ok(Attempt::Done(self.payload_for(container).await?))
    }

    /// Drive the instance to Stopped and return the instance payload.
    ///
    /// Stops with the timeout from `process_data` (else the configured
    /// default), then kills; each step is followed by a fresh inspection.
    pub async fn deactivate(
        &self,
        instance: &Instance,
        process_data: Option<&ProcessData>,
    ) -> Result<Value, AgentError> {
        if self.running_container(instance).await?.is_none() {
            debug!(instance_uuid = %instance.uuid, "Instance already stopped");
            return self.payload(instance).await;
        }

        let _guard = self.locks.acquire(&lock_key(instance)).await?;

        let Some(container) = self.running_container(instance).await? else {
            return self.payload(instance).await;
        };

        let timeout = process_data
            .and_then(ProcessData::timeout_secs)
            .map(Duration::from_secs)
            .unwrap_or(self.config.stop_timeout);

        info!(
            instance_uuid = %instance.uuid,
            container_id = %container.id,
            timeout_secs = timeout.as_secs(),
            "Stopping container"
        );
        ignore_not_found(self.runtime.stop_container(&container.id, timeout).await)?;
        if !runtime::is_running(self.runtime.as_ref(), &container.id).await? {
            return self.payload(instance).await;
        }

        warn!(instance_uuid = %instance.uuid, container_id = %container.id, "Container ignored stop, killing");
        ignore_not_found(self.runtime.kill_container(&container.id).await)?;
        if !runtime::is_running(self.runtime.as_ref(), &container.id).await? {
            return self.payload(instance).await;
        }

        Err(AgentError::StopFailed {
            instance: instance.uuid.clone(),
        })
    }

    /// Create the container. A name collision resolves to the existing container.
    async fn create_container(
        &self,
        instance: &Instance,
        create: &CreateConfig,
        start: &StartConfig,
    ) -> Result<String, AgentError> {
        let reference = instance
            .image_full_name()
            .and_then(ImageReference::parse)
            .ok_or_else(|| {
                AgentError::configuration(format!("instance {}", instance.uuid), "no image reference")
            })?
            .to_string();

        info!(instance_uuid = %instance.uuid, image = %reference, "Creating container");
        match self.runtime.create_container(&reference, create, start).await {
            Ok(id) => Ok(id),
            Err(RuntimeError::Conflict(message)) => {
                debug!(instance_uuid = %instance.uuid, reason = %message, "Container name taken, using existing container");
                let existing = runtime::find_container(
                    self.runtime.as_ref(),
                    ContainerFilter::Name(instance.container_name()),
                )
                .await?;
                existing
                    .map(|c| c.id)
                    .ok_or(AgentError::Runtime(RuntimeError::Conflict(message)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn record_state(&self, container_id: &str, instance: &Instance) -> Result<(), AgentError> {
        let mut snapshot = instance.clone();
        snapshot.external_id = Some(container_id.to_string());
        if !self.store.record(container_id, &snapshot).await? {
            debug!(container_id = %container_id, "Container state already recorded");
        }
        Ok(())
    }

    /// Assemble create and start settings from the declared instance.
    pub fn build_config(&self, instance: &Instance, host: Option<&Host>) -> (CreateConfig, StartConfig) {
        let fields = instance.fields();

        let mut create = CreateConfig {
            name: instance.uuid.clone(),
            hostname: instance.hostname.clone(),
            domainname: fields.domain_name.clone(),
            user: fields.user.clone(),
            working_dir: fields.directory.clone(),
            environment: fields.environment.clone().unwrap_or_default(),
            memory: fields.memory,
            memory_swap: fields.memory_swap,
            cpu_shares: fields.cpu_shares,
            cpuset: fields.cpu_set.clone(),
            tty: fields.tty.unwrap_or(false),
            stdin_open: fields.stdin_open.unwrap_or(false),
            detach: fields.detach.unwrap_or(true),
            entrypoint: fields.entry_point.as_ref().map(entrypoint),
            command: command(fields.command.as_deref(), &fields.command_args),
            ..Default::default()
        };
        create
            .labels
            .insert(LABEL_CONTAINER_UUID.to_string(), instance.uuid.clone());

        let mut start = StartConfig {
            volumes_from: instance
                .data_volumes_from_containers
                .iter()
                .map(|c| c.uuid.clone())
                .collect(),
            restart_policy: fields.restart_policy.as_ref().and_then(restart_policy),
            cap_add: fields.cap_add.clone(),
            cap_drop: fields.cap_drop.clone(),
            dns: fields.dns.clone(),
            dns_search: fields.dns_search.clone(),
            publish_all_ports: fields.publish_all_ports.unwrap_or(false),
            devices: fields.devices.iter().filter_map(|d| device(d)).collect(),
            privileged: fields.privileged,
            ..Default::default()
        };

        for port in &instance.ports {
            let exposed = ExposedPort::new(port.private_port, port.protocol.clone());
            if let Some(public) = port.public_port {
                start
                    .port_bindings
                    .entry(exposed.key())
                    .or_default()
                    .push(PortBinding {
                        host_ip: None,
                        host_port: Some(public.to_string()),
                    });
            }
            if !create.ports.contains(&exposed) {
                create.ports.push(exposed);
            }
        }

        for spec in &fields.data_volumes {
            let parts: Vec<&str> = spec.splitn(3, ':').collect();
            match parts.as_slice() {
                [path] => create.volumes.push(path.to_string()),
                [host_path, container_path, rest @ ..] => {
                    let mode = if rest.first() == Some(&"ro") { "ro" } else { "rw" };
                    start
                        .binds
                        .push(format!("{}:{}:{}", host_path, container_path, mode));
                }
                [] => {}
            }
        }

        let links: BTreeMap<String, String> = instance
            .instance_links
            .iter()
            .filter(|link| link.target_instance_id.is_some())
            .filter_map(|link| {
                let target = link.target_instance.as_ref()?;
                Some((target.uuid.clone(), link.link_name.clone()))
            })
            .collect();
        if !links.is_empty() {
            start.links = Some(links);
        }

        apply_network_config(instance, host, &mut create, &mut start);
        self.inject_config_url(instance, &mut create);

        (create, start)
    }

    /// Point agent instances at the configuration service.
    fn inject_config_url(&self, instance: &Instance, create: &mut CreateConfig) {
        if instance.agent_id.is_none() {
            return;
        }
        let Some(config_url) = self.config.config_url.as_deref() else {
            return;
        };

        let url = match Url::parse(config_url) {
            Ok(url) => url,
            Err(e) => {
                warn!(config_url = %config_url, error = %e, "Ignoring unparsable config URL");
                return;
            }
        };

        let env = &mut create.environment;
        if url.host_str() == Some("localhost") {
            env.insert("CORRAL_AGENT_INSTANCE".to_string(), "true".to_string());
            env.insert("CORRAL_CONFIG_URL_SCHEME".to_string(), url.scheme().to_string());
            env.insert("CORRAL_CONFIG_URL_PATH".to_string(), url.path().to_string());
            env.insert(
                "CORRAL_CONFIG_URL_PORT".to_string(),
                self.config.api_proxy_listen_port.to_string(),
            );
        } else {
            env.insert("CORRAL_CONFIG_URL".to_string(), config_url.to_string());
        }
    }

    /// Instance payload reflecting the container as it is now.
    pub async fn payload(&self, instance: &Instance) -> Result<Value, AgentError> {
        let container = self.find_container(instance).await?;
        self.payload_for(container).await
    }

    async fn payload_for(&self, container: Option<ContainerSummary>) -> Result<Value, AgentError> {
        let mut fields = Map::new();
        fields.insert("dockerHostIp".to_string(), json!(self.config.docker_host_ip));

        let mut data = Map::new();
        let mut payload = Map::new();

        match container {
            Some(container) => {
                let inspect = match self.runtime.inspect_container(&container.id).await {
                    Ok(inspect) => Some(inspect),
                    Err(RuntimeError::NotFound(_)) => None,
                    Err(e) => return Err(e.into()),
                };

                let ports: Map<String, Value> = container
                    .ports
                    .iter()
                    .filter_map(|port| {
                        let private = port.private_port?;
                        let public = port.public_port.map(|p| Value::String(p.to_string()));
                        Some((
                            format!("{}/{}", private, port.protocol),
                            public.unwrap_or(Value::Null),
                        ))
                    })
                    .collect();

                fields.insert("dockerPorts".to_string(), Value::Object(ports));
                fields.insert(
                    "dockerIp".to_string(),
                    json!(inspect.as_ref().and_then(|i| i.ip_address.clone())),
                );
                data.insert("dockerContainer".to_string(), container.raw.clone());
                data.insert(
                    "dockerInspect".to_string(),
                    inspect.map(|i| i.raw).unwrap_or(Value::Null),
                );
                payload.insert("externalId".to_string(), Value::String(container.id));
            }
            None => {
                fields.insert("dockerPorts".to_string(), json!({}));
                fields.insert("dockerIp".to_string(), Value::Null);
                data.insert("dockerContainer".to_string(), Value::Null);
                data.insert("dockerInspect".to_string(), Value::Null);
            }
        }

        data.insert("+fields".to_string(), Value::Object(fields));
        payload.insert("+data".to_string(), Value::Object(data));

        Ok(json!({ "instanceHostMap": { "instance": payload } }))
    }
}

fn lock_key(instance: &Instance) -> String {
    format!("instance:{}", instance.uuid)
}

fn ignore_not_found(result: Result<(), RuntimeError>) -> Result<(), RuntimeError> {
    match result {
        Err(RuntimeError::NotFound(_)) => Ok(()),
        other => other,
    }
}

fn entrypoint(entry_point: &CommandLine) -> Vec<String> {
    match entry_point {
        CommandLine::Single(line) => line.split_whitespace().map(str::to_string).collect(),
        CommandLine::Multiple(args) => args.clone(),
    }
}

fn command(command: Option<&str>, args: &[String]) -> Option<Vec<String>> {
    let command = command.filter(|c| !c.trim().is_empty());
    match (command, args.is_empty()) {
        (Some(command), false) => {
            let mut line = vec![command.to_string()];
            line.extend(args.iter().cloned());
            Some(line)
        }
        (Some(command), true) => Some(command.split_whitespace().map(str::to_string).collect()),
        (None, false) => Some(args.to_vec()),
        (None, true) => None,
    }
}

/// Restart policy with keys in the engine's casing (`Name`, `MaximumRetryCount`).
fn restart_policy(declared: &Map<String, Value>) -> Option<RestartPolicy> {
    let mut name = None;
    let mut maximum_retry_count = None;

    for (key, value) in declared {
        match upper_first(key).as_str() {
            "Name" => name = value.as_str().map(str::to_string),
            "MaximumRetryCount" => {
                maximum_retry_count = value
                    .as_i64()
                    .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
            }
            _ => {}
        }
    }

    name.filter(|n| !n.is_empty()).map(|name| RestartPolicy {
        name,
        maximum_retry_count,
    })
}

fn upper_first(key: &str) -> String {
    let mut chars = key.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Parse `host[:container[:permissions]]`.
fn device(spec: &str) -> Option<DeviceMapping> {
    let mut parts = spec.splitn(3, ':');
    let host = parts.next().filter(|p| !p.is_empty())?;
    let container = parts.next().filter(|p| !p.is_empty()).unwrap_or(host);
    let permissions = parts
        .next()
        .filter(|p| !p.is_empty())
        .unwrap_or(DEFAULT_DEVICE_PERMISSIONS);

    Some(DeviceMapping {
        path_on_host: host.to_string(),
        path_in_container: container.to_string(),
        cgroup_permissions: permissions.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use corral_events::{
        Image, InstanceFields, InstanceLink, InstanceRef, Network, NetworkService, Nic, Port,
        ResourceId,
    };
    use rstest::rstest;
    use tempfile::TempDir;

    use super::*;
    use crate::progress::RecordingProgress;
    use crate::runtime::MockRuntime;

    struct Fixture {
        _dir: TempDir,
        runtime: Arc<MockRuntime>,
        locks: Arc<LockManager>,
        reconciler: InstanceReconciler,
    }

    fn fixture_with(runtime: MockRuntime, configure: impl FnOnce(&mut Config)) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::for_state_dir(dir.path());
        configure(&mut config);

        let runtime = Arc::new(runtime);
        let locks = Arc::new(LockManager::new());
        let images = Arc::new(ImageReconciler::new(runtime.clone(), locks.clone()));
        let reconciler =
            InstanceReconciler::new(runtime.clone(), Arc::new(config), locks.clone(), images);

        Fixture {
            _dir: dir,
            runtime,
            locks,
            reconciler,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(MockRuntime::new().with_image("nginx:1.18"), |_| {})
    }

    fn instance(uuid: &str) -> Instance {
        Instance {
            uuid: uuid.to_string(),
            image: Some(Image {
                name: Some("docker:nginx:1.18".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_activate_creates_and_starts() {
        let f = fixture();
        let inst = instance("c0ffee");

        let payload = f
            .reconciler
            .activate(&inst, None, ActivationMode::Apply, &RecordingProgress::new())
            .await
            .unwrap();

        let container = f.runtime.container("/c0ffee").unwrap();
        assert!(container.running);
        assert_eq!(container.image, "nginx:1.18");
        assert_eq!(
            container.create.labels.get(LABEL_CONTAINER_UUID).map(String::as_str),
            Some("c0ffee")
        );

        let out = &payload["instanceHostMap"]["instance"];
        assert_eq!(out["externalId"], json!(container.id));
        assert_eq!(out["+data"]["+fields"]["dockerHostIp"], json!("10.0.0.5"));
        assert_eq!(out["+data"]["+fields"]["dockerIp"], json!(container.ip_address));
        assert!(f.reconciler.store().load(&container.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_activate_starts_stopped_container() {
        let f = fixture();
        let id = f.runtime.add_container("c0ffee", "nginx:1.18", false);

        f.reconciler
            .activate(&instance("c0ffee"), None, ActivationMode::Apply, &RecordingProgress::new())
            .await
            .unwrap();

        assert_eq!(f.runtime.calls().create_container, 0);
        assert!(f.runtime.container(&id).unwrap().running);
    }

    #[tokio::test]
    async fn test_record_only_mode_skips_runtime() {
        let f = fixture();
        let id = f.runtime.add_container("c0ffee", "nginx:1.18", false);

        f.reconciler
            .activate(
                &instance("c0ffee"),
                None,
                ActivationMode::RecordOnly,
                &RecordingProgress::new(),
            )
            .await
            .unwrap();

        let calls = f.runtime.calls();
        assert_eq!(calls.create_container, 0);
        assert_eq!(calls.start_container, 0);
        assert!(f.reconciler.store().load(&id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_missing_image_pulled_once_then_created() {
        let f = fixture_with(MockRuntime::new(), |_| {});

        f.reconciler
            .activate(&instance("c0ffee"), None, ActivationMode::Apply, &RecordingProgress::new())
            .await
            .unwrap();

        let calls = f.runtime.calls();
        assert_eq!(calls.pull_image, 1);
        assert_eq!(calls.create_container, 2);
        assert!(f.runtime.container("/c0ffee").unwrap().running);
    }

    /// Records which locks are held whenever the pull reports progress.
    struct LockWatch {
        locks: Arc<LockManager>,
        seen: std::sync::Mutex<Vec<(bool, bool)>>,
    }

    impl Progress for LockWatch {
        fn update(&self, _message: &str, _data: Option<Value>) {
            let held = (
                self.locks.is_held("instance:c0ffee"),
                self.locks.is_held("image:nginx:1.18"),
            );
            self.seen.lock().unwrap().push(held);
        }
    }

    #[tokio::test]
    async fn test_pull_runs_outside_instance_lock() {
        let f = fixture_with(MockRuntime::new(), |_| {});
        let watch = LockWatch {
            locks: f.locks.clone(),
            seen: Default::default(),
        };

        let payload = f
            .reconciler
            .activate(&instance("c0ffee"), None, ActivationMode::Apply, &watch)
            .await
            .unwrap();

        let seen = watch.seen.lock().unwrap().clone();
        assert!(!seen.is_empty());
        assert!(seen.iter().all(|&(instance_held, image_held)| !instance_held && image_held));
        assert_eq!(f.runtime.calls().create_container, 2);
        assert!(payload["instanceHostMap"]["instance"]["externalId"].is_string());
        assert_eq!(f.locks.active_keys(), 0);
    }

    #[tokio::test]
    async fn test_recorded_id_is_authoritative() {
        let f = fixture();
        let id = f.runtime.add_container("c0ffee", "nginx:1.18", true);
        let mut stale = instance("c0ffee");
        stale.external_id = Some("feedface0000".to_string());

        assert!(f.reconciler.find_container(&stale).await.unwrap().is_none());
        assert!(!f.reconciler.is_active(&stale).await.unwrap());

        let payload = f.reconciler.deactivate(&stale, None).await.unwrap();
        assert_eq!(f.runtime.calls().stop_container, 0);
        assert!(f.runtime.container(&id).unwrap().running);
        assert!(payload["instanceHostMap"]["instance"]["externalId"].is_null());

        let mut bound = instance("c0ffee");
        bound.external_id = Some(id.clone());
        assert_eq!(
            f.reconciler.find_container(&bound).await.unwrap().map(|c| c.id),
            Some(id)
        );
    }

    #[tokio::test]
    async fn test_pull_failure_propagates() {
        let f = fixture_with(MockRuntime::new(), |_| {});
        f.runtime
            .script_pull(vec![crate::runtime::ProgressEvent::error("manifest unknown")]);

        let err = f
            .reconciler
            .activate(&instance("c0ffee"), None, ActivationMode::Apply, &RecordingProgress::new())
            .await
            .unwrap_err();

        assert!(matches!(err, AgentError::ImagePull { .. }));
        assert_eq!(f.runtime.calls().create_container, 1);
        assert!(f.runtime.containers().is_empty());
    }

    #[tokio::test]
    async fn test_deactivate_escalates_to_kill() {
        let f = fixture();
        let id = f.runtime.add_container("c0ffee", "nginx:1.18", true);
        f.runtime.set_ignore_stop(true);

        assert!(f.reconciler.is_active(&instance("c0ffee")).await.unwrap());
        f.reconciler.deactivate(&instance("c0ffee"), None).await.unwrap();

        assert!(!f.runtime.container(&id).unwrap().running);
        assert_eq!(f.runtime.calls().kill_container, 1);
        assert!(f.reconciler.is_inactive(&instance("c0ffee")).await.unwrap());
    }

    #[tokio::test]
    async fn test_deactivate_fails_when_container_survives() {
        let f = fixture();
        f.runtime.add_container("c0ffee", "nginx:1.18", true);
        f.runtime.set_ignore_stop(true);
        f.runtime.set_ignore_kill(true);

        let err = f
            .reconciler
            .deactivate(&instance("c0ffee"), None)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Failed to stop container c0ffee");
    }

    #[tokio::test]
    async fn test_deactivate_missing_container_is_noop() {
        let f = fixture();
        let payload = f.reconciler.deactivate(&instance("c0ffee"), None).await.unwrap();

        assert_eq!(f.runtime.calls().stop_container, 0);
        assert!(payload["instanceHostMap"]["instance"]["+data"]["dockerContainer"].is_null());
    }

    #[test]
    fn test_build_config_fields() {
        let f = fixture();
        let mut inst = instance("c0ffee");
        inst.hostname = Some("web".to_string());
        inst.ports = vec![
            Port {
                private_port: 80,
                public_port: Some(8080),
                protocol: "tcp".to_string(),
            },
            Port {
                private_port: 53,
                public_port: None,
                protocol: "udp".to_string(),
            },
        ];
        inst.data.fields = InstanceFields {
            command: Some("nginx".to_string()),
            command_args: vec!["-g".to_string(), "daemon off;".to_string()],
            data_volumes: vec![
                "/data".to_string(),
                "/host/logs:/var/log:ro".to_string(),
                "/host/cache:/cache".to_string(),
            ],
            devices: vec!["/dev/fuse".to_string(), "/dev/sda:/dev/xvda:r".to_string()],
            ..Default::default()
        };

        let (create, start) = f.reconciler.build_config(&inst, None);

        assert_eq!(create.name, "c0ffee");
        assert_eq!(create.hostname.as_deref(), Some("web"));
        assert!(create.detach);
        assert_eq!(
            create.command,
            Some(vec!["nginx".to_string(), "-g".to_string(), "daemon off;".to_string()])
        );
        assert_eq!(create.volumes, vec!["/data".to_string()]);
        assert_eq!(
            start.binds,
            vec![
                "/host/logs:/var/log:ro".to_string(),
                "/host/cache:/cache:rw".to_string()
            ]
        );
        assert_eq!(create.ports.len(), 2);
        assert_eq!(
            start.port_bindings["80/tcp"][0].host_port.as_deref(),
            Some("8080")
        );
        assert!(!start.port_bindings.contains_key("53/udp"));
        assert_eq!(start.devices[0].path_in_container, "/dev/fuse");
        assert_eq!(start.devices[0].cgroup_permissions, "rwm");
        assert_eq!(start.devices[1].path_in_container, "/dev/xvda");
        assert_eq!(start.devices[1].cgroup_permissions, "r");
    }

    #[rstest]
    #[case(Some("sleep 30"), vec![], Some(vec!["sleep", "30"]))]
    #[case(Some("sh"), vec!["-c", "echo hi"], Some(vec!["sh", "-c", "echo hi"]))]
    #[case(None, vec![], None)]
    fn test_command_line(
        #[case] cmd: Option<&str>,
        #[case] args: Vec<&str>,
        #[case] expected: Option<Vec<&str>>,
    ) {
        let args: Vec<String> = args.into_iter().map(String::from).collect();
        let expected = expected.map(|v| v.into_iter().map(String::from).collect::<Vec<_>>());
        assert_eq!(command(cmd, &args), expected);
    }

    #[test]
    fn test_restart_policy_casing() {
        let declared = serde_json::from_value::<Map<String, Value>>(json!({
            "name": "on-failure",
            "maximumRetryCount": 3
        }))
        .unwrap();

        let policy = restart_policy(&declared).unwrap();
        assert_eq!(policy.name, "on-failure");
        assert_eq!(policy.maximum_retry_count, Some(3));
    }

    #[test]
    fn test_links_by_target_uuid() {
        let f = fixture();
        let mut inst = instance("c0ffee");
        inst.instance_links = vec![
            InstanceLink {
                link_name: "db".to_string(),
                target_instance_id: Some(ResourceId::Int(7)),
                target_instance: Some(InstanceRef {
                    uuid: "db-uuid".to_string(),
                }),
                ..Default::default()
            },
            InstanceLink {
                link_name: "dangling".to_string(),
                ..Default::default()
            },
        ];

        let (_, start) = f.reconciler.build_config(&inst, None);
        let links = start.links.unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links["db-uuid"], "db");
    }

    #[test]
    fn test_link_service_removes_links() {
        let f = fixture();
        let mut inst = instance("c0ffee");
        inst.instance_links = vec![InstanceLink {
            link_name: "db".to_string(),
            target_instance_id: Some(ResourceId::Int(7)),
            target_instance: Some(InstanceRef {
                uuid: "db-uuid".to_string(),
            }),
            ..Default::default()
        }];
        inst.nics = vec![Nic {
            network: Some(Network {
                kind: None,
                network_services: vec![NetworkService {
                    kind: "linkService".to_string(),
                }],
            }),
            ..Default::default()
        }];

        let (_, start) = f.reconciler.build_config(&inst, None);
        assert!(start.links.is_none());
    }

    #[test]
    fn test_localhost_config_url() {
        let f = fixture_with(MockRuntime::new(), |config| {
            config.config_url = Some("http://localhost:8081/v1".to_string());
        });
        let mut inst = instance("agent");
        inst.agent_id = Some(ResourceId::Int(1));

        let (create, _) = f.reconciler.build_config(&inst, None);
        let env = &create.environment;
        assert_eq!(env["CORRAL_AGENT_INSTANCE"], "true");
        assert_eq!(env["CORRAL_CONFIG_URL_SCHEME"], "http");
        assert_eq!(env["CORRAL_CONFIG_URL_PATH"], "/v1");
        assert_eq!(env["CORRAL_CONFIG_URL_PORT"], "9342");
        assert!(!env.contains_key("CORRAL_CONFIG_URL"));
    }

    #[test]
    fn test_remote_config_url() {
        let f = fixture_with(MockRuntime::new(), |config| {
            config.config_url = Some("https://config.example.com/v1".to_string());
        });
        let mut inst = instance("agent");
        inst.agent_id = Some(ResourceId::Int(1));

        let (create, _) = f.reconciler.build_config(&inst, None);
        assert_eq!(
            create.environment["CORRAL_CONFIG_URL"],
            "https://config.example.com/v1"
        );

        let (plain, _) = f.reconciler.build_config(&instance("app"), None);
        assert!(!plain.environment.contains_key("CORRAL_CONFIG_URL"));
    }
}
