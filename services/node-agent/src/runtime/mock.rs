//! In-memory container engine for testing and dry runs.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::json;
use tracing::{debug, info};

use super::{
    BuildOptions, ContainerFilter, ContainerInspect, ContainerSummary, CreateConfig,
    ImageInspect, ProgressEvent, ProgressStream, RegistryAuth, RuntimeClient, RuntimeError,
    StartConfig, SummaryPort, VolumeInspect, MOVED_MOUNTPOINT,
};

/// A container held by the mock engine.
#[derive(Debug, Clone)]
pub struct MockContainer {
    pub id: String,
    /// Engine name, with leading `/`.
    pub name: String,
    pub image: String,
    pub running: bool,
    pub create: CreateConfig,
    pub start: StartConfig,
    pub ip_address: String,
}

#[derive(Debug, Clone)]
pub struct MockVolume {
    pub name: String,
    pub driver: String,
    pub opts: BTreeMap<String, String>,
    pub mountpoint: String,
}

/// Number of mutating calls received, per operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MockCalls {
    pub create_container: usize,
    pub start_container: usize,
    pub stop_container: usize,
    pub kill_container: usize,
    pub remove_container: usize,
    pub pull_image: usize,
    pub build_image: usize,
    pub create_volume: usize,
    pub remove_volume: usize,
}

#[derive(Default)]
struct MockState {
    containers: Vec<MockContainer>,
    /// Image reference to image id.
    images: BTreeMap<String, String>,
    volumes: BTreeMap<String, MockVolume>,
    volumes_in_use: BTreeSet<String>,
    pull_script: Option<Vec<ProgressEvent>>,
    build_script: Option<Vec<ProgressEvent>>,
    pulls: Vec<(String, String, Option<RegistryAuth>)>,
    builds: Vec<BuildOptions>,
    ignore_stop: bool,
    ignore_kill: bool,
    calls: MockCalls,
    next_id: u64,
}

impl MockState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}{:060x}", prefix, self.next_id)
    }

    fn container(&self, id_or_name: &str) -> Option<&MockContainer> {
        self.containers.iter().find(|c| is_same_container(c, id_or_name))
    }

    fn container_mut(&mut self, id_or_name: &str) -> Option<&mut MockContainer> {
        self.containers
            .iter_mut()
            .find(|c| is_same_container(c, id_or_name))
    }
}

fn is_same_container(container: &MockContainer, id_or_name: &str) -> bool {
    container.id == id_or_name
        || container.name == id_or_name
        || container.name.trim_start_matches('/') == id_or_name
}

/// Mock container engine.
///
/// Everything happens in memory. Knobs make the engine misbehave the ways a
/// real engine can: ignoring stop or kill, missing images, moved or busy
/// volumes, scripted pull and build output.
#[derive(Default)]
pub struct MockRuntime {
    state: Mutex<MockState>,
    create_delay: Duration,
}

impl MockRuntime {
    /// Create an empty mock engine.
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every container creation, to widen race windows in tests.
    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = delay;
        self
    }

    /// Make `reference` available locally.
    pub fn with_image(self, reference: &str) -> Self {
        self.add_image(reference);
        self
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_image(&self, reference: &str) {
        let mut state = self.state();
        let id = state.next_id("sha256:");
        state.images.insert(normalize_reference(reference), id);
    }

    pub fn has_image(&self, reference: &str) -> bool {
        self.state()
            .images
            .contains_key(&normalize_reference(reference))
    }

    /// Add an existing container named `/<name>` and return its id.
    pub fn add_container(&self, name: &str, image: &str, running: bool) -> String {
        let mut state = self.state();
        let id = state.next_id("");
        let ip_address = format!("172.17.0.{}", state.containers.len() + 2);
        state.containers.push(MockContainer {
            id: id.clone(),
            name: format!("/{}", name.trim_start_matches('/')),
            image: image.to_string(),
            running,
            create: CreateConfig::default(),
            start: StartConfig::default(),
            ip_address,
        });
        id
    }

    pub fn containers(&self) -> Vec<MockContainer> {
        self.state().containers.clone()
    }

    pub fn container(&self, id_or_name: &str) -> Option<MockContainer> {
        self.state().container(id_or_name).cloned()
    }

    /// Override the address a container reports on inspection.
    pub fn set_ip_address(&self, id_or_name: &str, ip_address: &str) {
        if let Some(container) = self.state().container_mut(id_or_name) {
            container.ip_address = ip_address.to_string();
        }
    }

    /// Add a named volume with a regular mount point.
    pub fn add_volume(&self, name: &str, driver: &str) {
        self.state().volumes.insert(
            name.to_string(),
            MockVolume {
                name: name.to_string(),
                driver: driver.to_string(),
                opts: BTreeMap::new(),
                mountpoint: format!("/var/lib/docker/volumes/{}/_data", name),
            },
        );
    }

    pub fn volume(&self, name: &str) -> Option<MockVolume> {
        self.state().volumes.get(name).cloned()
    }

    /// Report the volume's mount point as moved.
    pub fn mark_volume_moved(&self, name: &str) {
        if let Some(volume) = self.state().volumes.get_mut(name) {
            volume.mountpoint = MOVED_MOUNTPOINT.to_string();
        }
    }

    /// Make removal of the volume fail with a conflict.
    pub fn mark_volume_in_use(&self, name: &str) {
        self.state().volumes_in_use.insert(name.to_string());
    }

    /// Containers ignore stop requests.
    pub fn set_ignore_stop(&self, ignore: bool) {
        self.state().ignore_stop = ignore;
    }

    /// Containers ignore kill requests.
    pub fn set_ignore_kill(&self, ignore: bool) {
        self.state().ignore_kill = ignore;
    }

    /// Replace the pull output. A script containing an error leaves the image absent.
    pub fn script_pull(&self, events: Vec<ProgressEvent>) {
        self.state().pull_script = Some(events);
    }

    /// Replace the build output. A script containing an error leaves the image absent.
    pub fn script_build(&self, events: Vec<ProgressEvent>) {
        self.state().build_script = Some(events);
    }

    pub fn calls(&self) -> MockCalls {
        self.state().calls
    }

    /// Pulls received, as `(repo, tag, auth)`.
    pub fn pulls(&self) -> Vec<(String, String, Option<RegistryAuth>)> {
        self.state().pulls.clone()
    }

    pub fn builds(&self) -> Vec<BuildOptions> {
        self.state().builds.clone()
    }
}

fn normalize_reference(reference: &str) -> String {
    let last_segment = reference.rsplit('/').next().unwrap_or(reference);
    if last_segment.contains(':') {
        reference.to_string()
    } else {
        format!("{}:latest", reference)
    }
}

fn has_error(events: &[ProgressEvent]) -> bool {
    events
        .iter()
        .any(|e| matches!(e, ProgressEvent::Status { error: Some(_), .. }))
}

fn summary_of(container: &MockContainer) -> ContainerSummary {
    let mut ports: Vec<SummaryPort> = Vec::new();
    for (key, bindings) in &container.start.port_bindings {
        let (port, protocol) = key.split_once('/').unwrap_or((key.as_str(), "tcp"));
        ports.push(SummaryPort {
            private_port: port.parse().ok(),
            public_port: bindings
                .first()
                .and_then(|b| b.host_port.as_deref())
                .and_then(|p| p.parse().ok()),
            protocol: protocol.to_string(),
        });
    }
    for exposed in &container.create.ports {
        if !container.start.port_bindings.contains_key(&exposed.key()) {
            ports.push(SummaryPort {
                private_port: Some(exposed.port),
                public_port: None,
                protocol: exposed.protocol.clone(),
            });
        }
    }

    let raw = json!({
        "Id": container.id,
        "Names": [container.name],
        "Image": container.image,
        "State": if container.running { "running" } else { "exited" },
    });

    ContainerSummary {
        id: container.id.clone(),
        names: vec![container.name.clone()],
        ports,
        raw,
    }
}

#[async_trait]
impl RuntimeClient for MockRuntime {
    async fn list_containers(
        &self,
        all: bool,
        filter: Option<&ContainerFilter>,
    ) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let state = self.state();
        Ok(state
            .containers
            .iter()
            .filter(|c| all || c.running)
            .map(summary_of)
            .filter(|c| filter.is_none_or(|f| f.matches(c)))
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInspect, RuntimeError> {
        let state = self.state();
        let container = state
            .container(id)
            .ok_or_else(|| RuntimeError::NotFound(format!("No such container: {}", id)))?;

        let raw = json!({
            "Id": container.id,
            "Name": container.name,
            "Image": container.image,
            "State": {"Running": container.running},
            "NetworkSettings": {"IPAddress": container.ip_address},
        });

        Ok(ContainerInspect {
            id: container.id.clone(),
            running: Some(container.running),
            ip_address: Some(container.ip_address.clone()),
            raw,
        })
    }

    async fn create_container(
        &self,
        image: &str,
        create: &CreateConfig,
        start: &StartConfig,
    ) -> Result<String, RuntimeError> {
        if !self.create_delay.is_zero() {
            tokio::time::sleep(self.create_delay).await;
        }

        let mut state = self.state();
        state.calls.create_container += 1;

        if !state.images.contains_key(&normalize_reference(image)) {
            return Err(RuntimeError::NotFound(format!("No such image: {}", image)));
        }

        let name = format!("/{}", create.name.trim_start_matches('/'));
        if state.container(&name).is_some() {
            return Err(RuntimeError::Conflict(format!(
                "The container name \"{}\" is already in use",
                name
            )));
        }

        let id = state.next_id("");
        let ip_address = format!("172.17.0.{}", state.containers.len() + 2);
        info!(name = %name, container_id = %id, "[MOCK] Created container");

        state.containers.push(MockContainer {
            id: id.clone(),
            name,
            image: image.to_string(),
            running: false,
            create: create.clone(),
            start: start.clone(),
            ip_address,
        });

        Ok(id)
    }

    async fn start_container(&self, id: &str, _start: &StartConfig) -> Result<(), RuntimeError> {
        let mut state = self.state();
        state.calls.start_container += 1;
        let container = state
            .container_mut(id)
            .ok_or_else(|| RuntimeError::NotFound(format!("No such container: {}", id)))?;
        container.running = true;
        debug!(container_id = %id, "[MOCK] Started container");
        Ok(())
    }

    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<(), RuntimeError> {
        let mut state = self.state();
        state.calls.stop_container += 1;
        let ignore = state.ignore_stop;
        let container = state
            .container_mut(id)
            .ok_or_else(|| RuntimeError::NotFound(format!("No such container: {}", id)))?;
        if !ignore {
            container.running = false;
        }
        debug!(container_id = %id, timeout_secs = timeout.as_secs(), ignored = ignore, "[MOCK] Stop");
        Ok(())
    }

    async fn kill_container(&self, id: &str) -> Result<(), RuntimeError> {
        let mut state = self.state();
        state.calls.kill_container += 1;
        let ignore = state.ignore_kill;
        let container = state
            .container_mut(id)
            .ok_or_else(|| RuntimeError::NotFound(format!("No such container: {}", id)))?;
        if !ignore {
            container.running = false;
        }
        debug!(container_id = %id, ignored = ignore, "[MOCK] Kill");
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        let mut state = self.state();
        state.calls.remove_container += 1;
        let before = state.containers.len();
        state.containers.retain(|c| !is_same_container(c, id));
        if state.containers.len() == before {
            return Err(RuntimeError::NotFound(format!("No such container: {}", id)));
        }
        Ok(())
    }

    async fn pull_image(
        &self,
        repo: &str,
        tag: &str,
        auth: Option<&RegistryAuth>,
    ) -> Result<ProgressStream, RuntimeError> {
        let mut state = self.state();
        state.calls.pull_image += 1;
        state
            .pulls
            .push((repo.to_string(), tag.to_string(), auth.cloned()));

        let events = state.pull_script.clone().unwrap_or_else(|| {
            vec![
                ProgressEvent::status(format!("Pulling from {}", repo)),
                ProgressEvent::status("Pull complete"),
                ProgressEvent::status("Pull complete"),
                ProgressEvent::status(format!(
                    "Status: Downloaded newer image for {}:{}",
                    repo, tag
                )),
            ]
        });

        if !has_error(&events) {
            let id = state.next_id("sha256:");
            state.images.insert(format!("{}:{}", repo, tag), id);
        }

        Ok(futures_util::stream::iter(events.into_iter().map(Ok)).boxed())
    }

    async fn build_image(&self, options: &BuildOptions) -> Result<ProgressStream, RuntimeError> {
        let mut state = self.state();
        state.calls.build_image += 1;
        state.builds.push(options.clone());

        let events = state.build_script.clone().unwrap_or_else(|| {
            vec![
                ProgressEvent::status("Step 1/1 : FROM scratch\n"),
                ProgressEvent::status(format!("Successfully tagged {}\n", options.tag)),
            ]
        });

        if !has_error(&events) {
            let id = state.next_id("sha256:");
            state.images.insert(normalize_reference(&options.tag), id);
        }

        Ok(futures_util::stream::iter(events.into_iter().map(Ok)).boxed())
    }

    async fn inspect_image(&self, reference: &str) -> Result<ImageInspect, RuntimeError> {
        let state = self.state();
        let reference = normalize_reference(reference);
        let id = state
            .images
            .get(&reference)
            .ok_or_else(|| RuntimeError::NotFound(format!("No such image: {}", reference)))?;

        Ok(ImageInspect {
            id: id.clone(),
            repo_tags: vec![reference.clone()],
            raw: json!({"Id": id, "RepoTags": [reference]}),
        })
    }

    async fn create_volume(
        &self,
        name: &str,
        driver: &str,
        opts: &BTreeMap<String, String>,
    ) -> Result<(), RuntimeError> {
        let mut state = self.state();
        state.calls.create_volume += 1;
        state.volumes.insert(
            name.to_string(),
            MockVolume {
                name: name.to_string(),
                driver: driver.to_string(),
                opts: opts.clone(),
                mountpoint: format!("/var/lib/docker/volumes/{}/_data", name),
            },
        );
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<(), RuntimeError> {
        let mut state = self.state();
        state.calls.remove_volume += 1;
        if state.volumes_in_use.contains(name) {
            return Err(RuntimeError::Conflict(format!("volume is in use - [{}]", name)));
        }
        state
            .volumes
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| RuntimeError::NotFound(format!("no such volume: {}", name)))
    }

    async fn inspect_volume(&self, name: &str) -> Result<VolumeInspect, RuntimeError> {
        let state = self.state();
        let volume = state
            .volumes
            .get(name)
            .ok_or_else(|| RuntimeError::NotFound(format!("no such volume: {}", name)))?;
        Ok(VolumeInspect {
            name: volume.name.clone(),
            driver: volume.driver.clone(),
            mountpoint: volume.mountpoint.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn test_create_requires_image() {
        let runtime = MockRuntime::new();
        let create = CreateConfig {
            name: "c1".to_string(),
            ..Default::default()
        };

        let err = runtime
            .create_container("nginx", &create, &StartConfig::default())
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        runtime.add_image("nginx");
        let id = runtime
            .create_container("nginx", &create, &StartConfig::default())
            .await
            .unwrap();
        assert!(!runtime.container(&id).unwrap().running);
    }

    #[tokio::test]
    async fn test_name_collision_is_conflict() {
        let runtime = MockRuntime::new().with_image("busybox:latest");
        runtime.add_container("c1", "busybox", false);

        let create = CreateConfig {
            name: "c1".to_string(),
            ..Default::default()
        };
        let err = runtime
            .create_container("busybox", &create, &StartConfig::default())
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_stubborn_container() {
        let runtime = MockRuntime::new();
        let id = runtime.add_container("c1", "busybox", true);
        runtime.set_ignore_stop(true);

        runtime.stop_container(&id, Duration::from_secs(1)).await.unwrap();
        assert!(runtime.container(&id).unwrap().running);

        runtime.kill_container(&id).await.unwrap();
        assert!(!runtime.container(&id).unwrap().running);
        assert_eq!(runtime.calls().stop_container, 1);
        assert_eq!(runtime.calls().kill_container, 1);
    }

    #[tokio::test]
    async fn test_scripted_pull_error_leaves_image_absent() {
        let runtime = MockRuntime::new();
        runtime.script_pull(vec![ProgressEvent::error("manifest unknown")]);

        let events: Vec<_> = runtime
            .pull_image("nginx", "1.18", None)
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(events.len(), 1);
        assert!(!runtime.has_image("nginx:1.18"));
    }

    #[tokio::test]
    async fn test_volume_in_use() {
        let runtime = MockRuntime::new();
        runtime.add_volume("data", "local");
        runtime.mark_volume_in_use("data");

        let err = runtime.remove_volume("data").await.unwrap_err();
        assert!(err.is_conflict());
        assert!(runtime.volume("data").is_some());
    }

    #[test]
    fn test_reference_normalization() {
        assert_eq!(normalize_reference("busybox"), "busybox:latest");
        assert_eq!(normalize_reference("nginx:1.18"), "nginx:1.18");
        assert_eq!(
            normalize_reference("registry:5000/app"),
            "registry:5000/app:latest"
        );
    }
}
