//! Ping handling and host inventory.

use std::sync::Arc;

use async_trait::async_trait;
use corral_events::{InventoryRecord, PingOptions, Pong};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::AgentError;
use crate::runtime::{ContainerSummary, RuntimeClient};

/// Runtime kind reported for this host's resources.
pub const RUNTIME_KIND: &str = "docker";

const PHYSICAL_HOST_KIND: &str = "physicalHost";
const RUNNING_STATE: &str = "running";

/// Source of the host statistics snapshot attached to the host record.
#[async_trait]
pub trait HostStats: Send + Sync {
    async fn collect(&self) -> Result<Value, AgentError>;
}

/// Builds pong inventories from configuration and the runtime's view.
pub struct PingHandler {
    runtime: Arc<dyn RuntimeClient>,
    config: Arc<Config>,
    stats: Option<Arc<dyn HostStats>>,
}

impl PingHandler {
    pub fn new(
        runtime: Arc<dyn RuntimeClient>,
        config: Arc<Config>,
        stats: Option<Arc<dyn HostStats>>,
    ) -> Self {
        Self {
            runtime,
            config,
            stats,
        }
    }

    pub async fn pong(&self, options: &PingOptions) -> Result<Pong, AgentError> {
        let mut pong = Pong::default();

        if !self.config.docker_enabled {
            debug!("Runtime disabled, answering empty pong");
            return Ok(pong);
        }

        if options.resources {
            self.add_resources(options, &mut pong).await;
        }
        if options.instances {
            self.add_instances(&mut pong).await?;
        }

        Ok(pong)
    }

    async fn add_resources(&self, options: &PingOptions, pong: &mut Pong) {
        let config = &self.config;

        let info = if options.stats {
            self.collect_stats().await
        } else {
            None
        };

        pong.add(InventoryRecord::PhysicalHost {
            uuid: config.physical_host_uuid.clone(),
            kind: PHYSICAL_HOST_KIND.to_string(),
            name: config.hostname.clone(),
        });
        pong.add(InventoryRecord::Host {
            uuid: config.docker_uuid.clone(),
            kind: RUNTIME_KIND.to_string(),
            name: config.hostname.clone(),
            physical_host_uuid: config.physical_host_uuid.clone(),
            info,
            api_proxy: config.host_api_proxy.clone(),
        });
        pong.add(InventoryRecord::StoragePool {
            uuid: format!("{}-pool", config.docker_uuid),
            kind: RUNTIME_KIND.to_string(),
            name: format!("{} Storage Pool", config.hostname),
            host_uuid: config.docker_uuid.clone(),
        });
        pong.add(InventoryRecord::IpAddress {
            uuid: config.docker_host_ip.clone(),
            address: config.docker_host_ip.clone(),
            host_uuid: config.docker_uuid.clone(),
        });
    }

    async fn collect_stats(&self) -> Option<Value> {
        let stats = self.stats.as_ref()?;
        match stats.collect().await {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!(error = %e, "Failed to collect host stats, omitting them");
                None
            }
        }
    }

    /// One record per `/`-prefixed name of every running container.
    async fn add_instances(&self, pong: &mut Pong) -> Result<(), AgentError> {
        let containers = self.runtime.list_containers(false, None).await?;

        for container in &containers {
            for record in instance_records(container) {
                pong.add(record);
            }
        }

        pong.options.instances = true;
        Ok(())
    }
}

fn instance_records(container: &ContainerSummary) -> impl Iterator<Item = InventoryRecord> + '_ {
    container
        .names
        .iter()
        .filter_map(|name| name.strip_prefix('/'))
        .filter(|uuid| !uuid.is_empty())
        .map(|uuid| InventoryRecord::Instance {
            uuid: uuid.to_string(),
            state: RUNNING_STATE.to_string(),
            docker_id: container.id.clone(),
        })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::runtime::MockRuntime;

    struct FixedStats(Result<Value, String>);

    #[async_trait]
    impl HostStats for FixedStats {
        async fn collect(&self) -> Result<Value, AgentError> {
            self.0.clone().map_err(AgentError::Stats)
        }
    }

    fn handler(stats: Option<Arc<dyn HostStats>>) -> (Arc<MockRuntime>, PingHandler) {
        let runtime = Arc::new(MockRuntime::new());
        let config = Arc::new(Config::for_state_dir("/tmp/corral-ping-test"));
        let handler = PingHandler::new(runtime.clone(), config, stats);
        (runtime, handler)
    }

    #[tokio::test]
    async fn test_empty_options_empty_pong() {
        let (_runtime, handler) = handler(None);
        let pong = handler.pong(&PingOptions::default()).await.unwrap();
        assert!(pong.resources.is_empty());
        assert!(!pong.options.instances);
    }

    #[tokio::test]
    async fn test_resources_with_stats() {
        let stats: Arc<dyn HostStats> = Arc::new(FixedStats(Ok(json!({"cpuCount": 4}))));
        let (_runtime, handler) = handler(Some(stats));

        let pong = handler
            .pong(&PingOptions {
                resources: true,
                stats: true,
                instances: false,
            })
            .await
            .unwrap();

        assert_eq!(pong.resources.len(), 4);
        match &pong.resources[1] {
            InventoryRecord::Host {
                uuid,
                physical_host_uuid,
                info,
                ..
            } => {
                assert_eq!(uuid, "docker-uuid");
                assert_eq!(physical_host_uuid, "physical-host-uuid");
                assert_eq!(info, &Some(json!({"cpuCount": 4})));
            }
            other => panic!("unexpected record {:?}", other),
        }
        assert_eq!(
            pong.resources[2],
            InventoryRecord::StoragePool {
                uuid: "docker-uuid-pool".to_string(),
                kind: "docker".to_string(),
                name: "node-1 Storage Pool".to_string(),
                host_uuid: "docker-uuid".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_stats_failure_degrades() {
        let stats: Arc<dyn HostStats> = Arc::new(FixedStats(Err("no cgroups".to_string())));
        let (_runtime, handler) = handler(Some(stats));

        let pong = handler
            .pong(&PingOptions {
                resources: true,
                stats: true,
                instances: false,
            })
            .await
            .unwrap();

        assert!(matches!(
            &pong.resources[1],
            InventoryRecord::Host { info: None, .. }
        ));
    }

    #[tokio::test]
    async fn test_instances_from_running_containers() {
        let (runtime, handler) = handler(None);
        let running = runtime.add_container("inst-a", "busybox", true);
        runtime.add_container("inst-b", "busybox", false);

        let pong = handler
            .pong(&PingOptions {
                resources: false,
                stats: false,
                instances: true,
            })
            .await
            .unwrap();

        assert!(pong.options.instances);
        assert_eq!(
            pong.resources,
            vec![InventoryRecord::Instance {
                uuid: "inst-a".to_string(),
                state: "running".to_string(),
                docker_id: running,
            }]
        );
    }

    #[test]
    fn test_every_slash_name_is_an_instance() {
        let container = ContainerSummary {
            id: "abc123".to_string(),
            names: vec![
                "/web-1".to_string(),
                "/lb-1/web".to_string(),
                "no-slash".to_string(),
            ],
            ports: vec![],
            raw: Value::Null,
        };

        let uuids: Vec<String> = instance_records(&container)
            .map(|record| match record {
                InventoryRecord::Instance { uuid, docker_id, .. } => {
                    assert_eq!(docker_id, "abc123");
                    uuid
                }
                other => panic!("unexpected record {:?}", other),
            })
            .collect();

        assert_eq!(uuids, vec!["web-1".to_string(), "lb-1/web".to_string()]);
    }
}
