//! Docker engine implementation of [`RuntimeClient`].

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use bollard::auth::DockerCredentials;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, InspectContainerOptions,
    KillContainerOptions, ListContainersOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::{BuildImageOptions, CreateImageOptions};
use bollard::models::{
    DeviceMapping as EngineDeviceMapping, HostConfig, PortBinding as EnginePortBinding,
    RestartPolicy as EngineRestartPolicy, RestartPolicyNameEnum,
};
use bollard::volume::{CreateVolumeOptions, RemoveVolumeOptions};
use bollard::{Docker, API_DEFAULT_VERSION};
use futures_util::{stream, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{
    BuildOptions, ContainerFilter, ContainerInspect, ContainerSummary, CreateConfig,
    ImageInspect, ProgressEvent, ProgressStream, RegistryAuth, RestartPolicy, RuntimeClient,
    RuntimeError, StartConfig, SummaryPort, VolumeInspect,
};

/// Seconds to wait for the engine to answer a request.
const ENGINE_TIMEOUT_SECS: u64 = 120;

/// Progress events buffered between an engine stream and its consumer.
const PROGRESS_BUFFER: usize = 64;

/// Docker engine runtime.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to the engine at `docker_host`, or the local default socket.
    pub fn connect(docker_host: Option<&str>) -> Result<Self, RuntimeError> {
        let docker = match docker_host {
            Some(host) if host.starts_with("unix://") => {
                Docker::connect_with_unix(host, ENGINE_TIMEOUT_SECS, API_DEFAULT_VERSION)
            }
            Some(host) => Docker::connect_with_http(host, ENGINE_TIMEOUT_SECS, API_DEFAULT_VERSION),
            None => Docker::connect_with_local_defaults(),
        }
        .map_err(map_error)?;

        info!(docker_host = ?docker_host, "Connected to Docker engine");
        Ok(Self { docker })
    }
}

#[async_trait]
impl RuntimeClient for DockerRuntime {
    async fn list_containers(
        &self,
        all: bool,
        filter: Option<&ContainerFilter>,
    ) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let mut filters = HashMap::new();
        match filter {
            Some(ContainerFilter::Name(name)) => {
                filters.insert(
                    "name".to_string(),
                    vec![name.trim_start_matches('/').to_string()],
                );
            }
            Some(ContainerFilter::Id(id)) => {
                filters.insert("id".to_string(), vec![id.clone()]);
            }
            None => {}
        }

        let options = ListContainersOptions {
            all,
            filters,
            ..Default::default()
        };

        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(map_error)?;

        Ok(containers.into_iter().map(summary_from_engine).collect())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInspect, RuntimeError> {
        let response = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(map_error)?;

        let raw = serde_json::to_value(&response).unwrap_or(Value::Null);
        let running = response.state.as_ref().and_then(|s| s.running);
        let ip_address = response
            .network_settings
            .as_ref()
            .and_then(|n| n.ip_address.clone())
            .filter(|ip| !ip.is_empty());

        Ok(ContainerInspect {
            id: response.id.unwrap_or_else(|| id.to_string()),
            running,
            ip_address,
            raw,
        })
    }

    async fn create_container(
        &self,
        image: &str,
        create: &CreateConfig,
        start: &StartConfig,
    ) -> Result<String, RuntimeError> {
        let options = CreateContainerOptions {
            name: create.name.clone(),
            ..Default::default()
        };

        debug!(name = %create.name, image = %image, "Creating container");

        let response = self
            .docker
            .create_container(Some(options), container_config(image, create, start))
            .await
            .map_err(map_error)?;

        Ok(response.id)
    }

    async fn start_container(&self, id: &str, _start: &StartConfig) -> Result<(), RuntimeError> {
        // Host settings were applied at create; the engine rejects them here.
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(map_error)
    }

    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<(), RuntimeError> {
        let options = StopContainerOptions {
            t: timeout.as_secs() as i64,
        };
        self.docker
            .stop_container(id, Some(options))
            .await
            .map_err(map_error)
    }

    async fn kill_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .kill_container(id, None::<KillContainerOptions<String>>)
            .await
            .map_err(map_error)
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(map_error)
    }

    async fn pull_image(
        &self,
        repo: &str,
        tag: &str,
        auth: Option<&RegistryAuth>,
    ) -> Result<ProgressStream, RuntimeError> {
        let options = CreateImageOptions {
            from_image: repo.to_string(),
            tag: tag.to_string(),
            ..Default::default()
        };

        let credentials = auth.map(|auth| DockerCredentials {
            username: Some(auth.username.clone()),
            password: Some(auth.password.clone()),
            email: auth.email.clone(),
            serveraddress: auth.server_address.clone(),
            ..Default::default()
        });

        let stream = self
            .docker
            .create_image(Some(options), None, credentials)
            .map(|item| match item {
                Ok(info) => Ok(ProgressEvent::Status {
                    id: info.id,
                    status: info.status,
                    error: info.error,
                }),
                Err(e) => stream_error(e),
            })
            .boxed();

        Ok(stream)
    }

    async fn build_image(&self, options: &BuildOptions) -> Result<ProgressStream, RuntimeError> {
        let build = BuildImageOptions {
            t: options.tag.clone(),
            remote: options.remote.clone().unwrap_or_default(),
            dockerfile: options
                .dockerfile
                .clone()
                .unwrap_or_else(|| "Dockerfile".to_string()),
            nocache: options.nocache,
            rm: options.rm,
            forcerm: options.forcerm,
            ..Default::default()
        };

        let context = options.context.clone();
        let docker = self.docker.clone();

        // The engine's build stream borrows its client, so a task owning a
        // client clone drives it.
        let stream = spawn_progress(move |progress| async move {
            let mut stream = docker.build_image(build, None, context).boxed();
            while let Some(item) = stream.next().await {
                let event = match item {
                    Ok(info) => Ok(ProgressEvent::Status {
                        id: info.id,
                        status: info.stream.or(info.status),
                        error: info.error,
                    }),
                    Err(e) => stream_error(e),
                };
                if progress.send(event).await.is_err() {
                    debug!("Build progress consumer went away, abandoning stream");
                    break;
                }
            }
        });

        Ok(stream)
    }

    async fn inspect_image(&self, reference: &str) -> Result<ImageInspect, RuntimeError> {
        let response = self
            .docker
            .inspect_image(reference)
            .await
            .map_err(map_error)?;

        let raw = serde_json::to_value(&response).unwrap_or(Value::Null);
        Ok(ImageInspect {
            id: response.id.unwrap_or_default(),
            repo_tags: response.repo_tags.unwrap_or_default(),
            raw,
        })
    }

    async fn create_volume(
        &self,
        name: &str,
        driver: &str,
        opts: &BTreeMap<String, String>,
    ) -> Result<(), RuntimeError> {
        let options = CreateVolumeOptions {
            name: name.to_string(),
            driver: driver.to_string(),
            driver_opts: opts.clone().into_iter().collect(),
            ..Default::default()
        };

        self.docker
            .create_volume(options)
            .await
            .map(|_| ())
            .map_err(map_error)
    }

    async fn remove_volume(&self, name: &str) -> Result<(), RuntimeError> {
        self.docker
            .remove_volume(name, None::<RemoveVolumeOptions>)
            .await
            .map_err(map_error)
    }

    async fn inspect_volume(&self, name: &str) -> Result<VolumeInspect, RuntimeError> {
        let volume = self.docker.inspect_volume(name).await.map_err(map_error)?;
        Ok(VolumeInspect {
            name: volume.name,
            driver: volume.driver,
            mountpoint: volume.mountpoint,
        })
    }
}

fn map_error(err: BollardError) -> RuntimeError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404,
            message,
        } => RuntimeError::NotFound(message),
        BollardError::DockerResponseServerError {
            status_code: 409,
            message,
        } => RuntimeError::Conflict(message),
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => RuntimeError::Engine {
            status: status_code,
            message,
        },
        other => RuntimeError::Transport(other.to_string()),
    }
}

/// Stream items the engine could not encode become progress, not failures.
fn stream_error(err: BollardError) -> Result<ProgressEvent, RuntimeError> {
    match err {
        BollardError::JsonDataError { message, .. } => Ok(ProgressEvent::Malformed(message)),
        BollardError::DockerStreamError { error } => Ok(ProgressEvent::error(error)),
        other => Err(map_error(other)),
    }
}

/// Run `drive` on its own task and expose what it sends as a progress stream.
///
/// Events are handed over one at a time through a bounded channel; the
/// stream ends when `drive` returns.
fn spawn_progress<F, Fut>(drive: F) -> ProgressStream
where
    F: FnOnce(mpsc::Sender<Result<ProgressEvent, RuntimeError>>) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(PROGRESS_BUFFER);
    tokio::spawn(drive(tx));

    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
}

fn summary_from_engine(container: bollard::models::ContainerSummary) -> ContainerSummary {
    let raw = serde_json::to_value(&container).unwrap_or(Value::Null);

    let ports = container
        .ports
        .unwrap_or_default()
        .into_iter()
        .map(|port| SummaryPort {
            private_port: Some(port.private_port),
            public_port: port.public_port,
            protocol: port
                .typ
                .map(|t| t.to_string())
                .unwrap_or_else(|| "tcp".to_string()),
        })
        .collect();

    ContainerSummary {
        id: container.id.unwrap_or_default(),
        names: container.names.unwrap_or_default(),
        ports,
        raw,
    }
}

fn non_empty<T: Clone>(items: &[T]) -> Option<Vec<T>> {
    if items.is_empty() {
        None
    } else {
        Some(items.to_vec())
    }
}

fn path_set(paths: impl Iterator<Item = String>) -> Option<HashMap<String, HashMap<(), ()>>> {
    let set: HashMap<_, _> = paths.map(|p| (p, HashMap::new())).collect();
    if set.is_empty() {
        None
    } else {
        Some(set)
    }
}

fn container_config(image: &str, create: &CreateConfig, start: &StartConfig) -> ContainerConfig<String> {
    let env: Vec<String> = create
        .environment
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();

    ContainerConfig {
        image: Some(image.to_string()),
        hostname: create.hostname.clone(),
        domainname: create.domainname.clone(),
        user: create.user.clone(),
        working_dir: create.working_dir.clone(),
        env: non_empty(&env),
        labels: Some(create.labels.clone().into_iter().collect()),
        tty: Some(create.tty),
        open_stdin: Some(create.stdin_open),
        attach_stdout: Some(!create.detach),
        attach_stderr: Some(!create.detach),
        entrypoint: create.entrypoint.clone(),
        cmd: create.command.clone(),
        exposed_ports: path_set(create.ports.iter().map(|p| p.key())),
        volumes: path_set(create.volumes.iter().cloned()),
        mac_address: create.mac_address.clone(),
        host_config: Some(host_config(create, start)),
        ..Default::default()
    }
}

fn host_config(create: &CreateConfig, start: &StartConfig) -> HostConfig {
    let port_bindings = if start.port_bindings.is_empty() {
        None
    } else {
        Some(
            start
                .port_bindings
                .iter()
                .map(|(key, bindings)| {
                    let bindings = bindings
                        .iter()
                        .map(|b| EnginePortBinding {
                            host_ip: b.host_ip.clone(),
                            host_port: b.host_port.clone(),
                        })
                        .collect();
                    (key.clone(), Some(bindings))
                })
                .collect(),
        )
    };

    let devices: Vec<EngineDeviceMapping> = start
        .devices
        .iter()
        .map(|d| EngineDeviceMapping {
            path_on_host: Some(d.path_on_host.clone()),
            path_in_container: Some(d.path_in_container.clone()),
            cgroup_permissions: Some(d.cgroup_permissions.clone()),
        })
        .collect();

    HostConfig {
        memory: create.memory,
        memory_swap: create.memory_swap,
        cpu_shares: create.cpu_shares,
        cpuset_cpus: create.cpuset.clone(),
        binds: non_empty(&start.binds),
        volumes_from: non_empty(&start.volumes_from),
        port_bindings,
        links: start.links.as_ref().map(|links| {
            links
                .iter()
                .map(|(target, alias)| format!("{}:{}", target, alias))
                .collect()
        }),
        restart_policy: start.restart_policy.as_ref().map(engine_restart_policy),
        cap_add: non_empty(&start.cap_add),
        cap_drop: non_empty(&start.cap_drop),
        dns: non_empty(&start.dns),
        dns_search: non_empty(&start.dns_search),
        publish_all_ports: Some(start.publish_all_ports),
        devices: non_empty(&devices),
        privileged: Some(start.privileged),
        ..Default::default()
    }
}

fn engine_restart_policy(policy: &RestartPolicy) -> EngineRestartPolicy {
    let name = match policy.name.as_str() {
        "always" => RestartPolicyNameEnum::ALWAYS,
        "unless-stopped" => RestartPolicyNameEnum::UNLESS_STOPPED,
        "on-failure" => RestartPolicyNameEnum::ON_FAILURE,
        "no" => RestartPolicyNameEnum::NO,
        _ => RestartPolicyNameEnum::EMPTY,
    };

    EngineRestartPolicy {
        name: Some(name),
        maximum_retry_count: policy.maximum_retry_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{DeviceMapping, ExposedPort, PortBinding};

    #[test]
    fn test_error_mapping() {
        let not_found = map_error(BollardError::DockerResponseServerError {
            status_code: 404,
            message: "No such image".to_string(),
        });
        assert!(not_found.is_not_found());

        let conflict = map_error(BollardError::DockerResponseServerError {
            status_code: 409,
            message: "volume is in use".to_string(),
        });
        assert!(conflict.is_conflict());

        let engine = map_error(BollardError::DockerResponseServerError {
            status_code: 500,
            message: "boom".to_string(),
        });
        assert!(matches!(engine, RuntimeError::Engine { status: 500, .. }));
    }

    #[test]
    fn test_host_settings_applied_at_create() {
        let create = CreateConfig {
            name: "c0ffee".to_string(),
            memory: Some(64 * 1024 * 1024),
            ports: vec![ExposedPort::new(80, "tcp")],
            volumes: vec!["/data".to_string()],
            ..Default::default()
        };

        let mut start = StartConfig {
            binds: vec!["/host:/ctr:ro".to_string()],
            privileged: true,
            restart_policy: Some(RestartPolicy {
                name: "on-failure".to_string(),
                maximum_retry_count: Some(3),
            }),
            devices: vec![DeviceMapping {
                path_on_host: "/dev/sda".to_string(),
                path_in_container: "/dev/xvda".to_string(),
                cgroup_permissions: "rwm".to_string(),
            }],
            ..Default::default()
        };
        start.port_bindings.insert(
            "80/tcp".to_string(),
            vec![PortBinding {
                host_ip: None,
                host_port: Some("8080".to_string()),
            }],
        );

        let config = container_config("nginx:latest", &create, &start);
        let host = config.host_config.unwrap();

        assert_eq!(config.image.as_deref(), Some("nginx:latest"));
        assert!(config.exposed_ports.unwrap().contains_key("80/tcp"));
        assert!(config.volumes.unwrap().contains_key("/data"));
        assert_eq!(host.memory, Some(64 * 1024 * 1024));
        assert_eq!(host.privileged, Some(true));
        assert_eq!(host.binds.unwrap(), vec!["/host:/ctr:ro".to_string()]);
        assert!(host.links.is_none());
        assert_eq!(
            host.restart_policy.unwrap().name,
            Some(RestartPolicyNameEnum::ON_FAILURE)
        );
        let bindings = host.port_bindings.unwrap();
        assert_eq!(
            bindings["80/tcp"].as_ref().unwrap()[0].host_port.as_deref(),
            Some("8080")
        );
    }

    #[tokio::test]
    async fn test_spawned_progress_yields_in_order() {
        let mut stream = spawn_progress(|progress| async move {
            for line in ["Step 1/2 : FROM alpine", "Step 2/2 : RUN true"] {
                progress.send(Ok(ProgressEvent::status(line))).await.unwrap();
            }
            progress
                .send(Ok(ProgressEvent::error("returned a non-zero code")))
                .await
                .unwrap();
        });

        assert_eq!(
            stream.next().await.unwrap().unwrap(),
            ProgressEvent::status("Step 1/2 : FROM alpine")
        );
        assert_eq!(
            stream.next().await.unwrap().unwrap(),
            ProgressEvent::status("Step 2/2 : RUN true")
        );
        assert_eq!(
            stream.next().await.unwrap().unwrap(),
            ProgressEvent::error("returned a non-zero code")
        );
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_spawned_progress_stops_when_consumer_drops() {
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();

        let mut stream = spawn_progress(|progress| async move {
            let mut sent = 0usize;
            while progress.send(Ok(ProgressEvent::status("line"))).await.is_ok() {
                sent += 1;
            }
            let _ = done_tx.send(sent);
        });

        assert!(stream.next().await.is_some());
        drop(stream);

        let sent = tokio::time::timeout(Duration::from_secs(5), done_rx)
            .await
            .unwrap()
            .unwrap();
        assert!(sent <= PROGRESS_BUFFER + 1);
    }

    #[test]
    fn test_links_rendered_as_target_alias() {
        let mut links = BTreeMap::new();
        links.insert("target-uuid".to_string(), "db".to_string());
        let start = StartConfig {
            links: Some(links),
            ..Default::default()
        };

        let host = host_config(&CreateConfig::default(), &start);
        assert_eq!(host.links.unwrap(), vec!["target-uuid:db".to_string()]);
    }
}
