//! Event dispatch.
//!
//! Routes are resolved from the event name to a handler through a table built
//! once at startup. Every handler result is turned into a reply here.

use std::collections::HashMap;
use std::sync::Arc;

use corral_events::{
    Event, EventError, Reply, ResourceKind, Route, Transition,
};
use corral_reconcile::LockManager;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::delegate::DelegateHandler;
use crate::error::AgentError;
use crate::image::ImageReconciler;
use crate::instance::{ActivationMode, InstanceReconciler};
use crate::ping::{HostStats, PingHandler, RUNTIME_KIND};
use crate::progress::Progress;
use crate::runtime::RuntimeClient;
use crate::volume::VolumeReconciler;

/// Operation bound to a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handler {
    Ping,
    InstanceActivate,
    InstanceDeactivate,
    ImageActivate,
    VolumeActivate,
    VolumeDeactivate,
    VolumeRemove,
    DelegateRequest,
}

/// Every route the agent answers.
pub fn handler_table() -> HashMap<Route, Handler> {
    use ResourceKind::*;
    use Transition::*;

    HashMap::from([
        (Route::Ping, Handler::Ping),
        (Route::Resource(Instance, Activate), Handler::InstanceActivate),
        (Route::Resource(Instance, Deactivate), Handler::InstanceDeactivate),
        (Route::Resource(Image, Activate), Handler::ImageActivate),
        (Route::Resource(Volume, Activate), Handler::VolumeActivate),
        (Route::Resource(Volume, Deactivate), Handler::VolumeDeactivate),
        (Route::Resource(Volume, Remove), Handler::VolumeRemove),
        (Route::Resource(Delegate, Request), Handler::DelegateRequest),
    ])
}

pub struct Dispatcher {
    instances: InstanceReconciler,
    images: Arc<ImageReconciler>,
    volumes: VolumeReconciler,
    ping: PingHandler,
    delegate: DelegateHandler,
    handlers: HashMap<Route, Handler>,
}

impl Dispatcher {
    pub fn new(
        config: Arc<Config>,
        runtime: Arc<dyn RuntimeClient>,
        stats: Option<Arc<dyn HostStats>>,
    ) -> Result<Self, AgentError> {
        let locks = Arc::new(LockManager::with_timeout(config.lock_timeout));
        let images = Arc::new(ImageReconciler::new(runtime.clone(), locks.clone()));
        let instances =
            InstanceReconciler::new(runtime.clone(), config.clone(), locks.clone(), images.clone());
        let volumes = VolumeReconciler::new(runtime.clone(), config.clone(), locks);
        let delegate = DelegateHandler::new(runtime.clone(), config.delegate_timeout)?;
        let ping = PingHandler::new(runtime, config, stats);

        Ok(Self {
            instances,
            images,
            volumes,
            ping,
            delegate,
            handlers: handler_table(),
        })
    }

    /// Replace the delegate handler.
    pub fn with_delegate(mut self, delegate: DelegateHandler) -> Self {
        self.delegate = delegate;
        self
    }

    pub fn instances(&self) -> &InstanceReconciler {
        &self.instances
    }

    pub fn volumes(&self) -> &VolumeReconciler {
        &self.volumes
    }

    /// Handle one event. `None` means nothing is sent back.
    pub async fn dispatch(&self, event: &Event, progress: &dyn Progress) -> Option<Reply> {
        if let Some(kind) = event.kind.as_deref() {
            if kind != RUNTIME_KIND {
                debug!(event_id = %event.id, kind = %kind, "Event for another runtime kind, ignoring");
                return None;
            }
        }

        let handler = match event.route() {
            Ok(route) => self.handlers.get(&route).copied(),
            Err(e) => {
                warn!(event_id = %event.id, name = %event.name, error = %e, "Unroutable event");
                None
            }
        };
        let Some(handler) = handler else {
            warn!(event_id = %event.id, name = %event.name, "No handler for event");
            return None;
        };

        if event.is_ping() {
            debug!(event_id = %event.id, "Handling ping");
        } else {
            info!(
                event_id = %event.id,
                name = %event.name,
                resource_id = ?event.resource_id,
                "Handling event"
            );
        }

        match self.run(handler, event, progress).await {
            Ok(Some(data)) => Reply::success(event, data),
            Ok(None) => None,
            Err(e) => {
                error!(event_id = %event.id, name = %event.name, error = %e, "Event failed");
                Reply::error(event, e.to_string())
            }
        }
    }

    async fn run(
        &self,
        handler: Handler,
        event: &Event,
        progress: &dyn Progress,
    ) -> Result<Option<Value>, AgentError> {
        let data = &event.data;
        let missing = |member: &'static str| EventError::MissingData {
            event: event.name.clone(),
            member,
        };

        let payload = match handler {
            Handler::Ping => {
                let options = data.options.unwrap_or_default();
                let pong = self.ping.pong(&options).await?;
                serde_json::to_value(pong).map_err(EventError::from)?
            }
            Handler::InstanceActivate => {
                let map = data.instance_host_map.as_ref().ok_or_else(|| missing("instanceHostMap"))?;
                self.instances
                    .activate(
                        &map.instance,
                        map.host.as_ref(),
                        ActivationMode::for_event(event),
                        progress,
                    )
                    .await?
            }
            Handler::InstanceDeactivate => {
                let map = data.instance_host_map.as_ref().ok_or_else(|| missing("instanceHostMap"))?;
                self.instances
                    .deactivate(&map.instance, data.process_data.as_ref())
                    .await?
            }
            Handler::ImageActivate => {
                let map = data
                    .image_storage_pool_map
                    .as_ref()
                    .ok_or_else(|| missing("imageStoragePoolMap"))?;
                self.images.activate(&map.image, progress).await?
            }
            Handler::VolumeActivate => {
                let map = data
                    .volume_storage_pool_map
                    .as_ref()
                    .ok_or_else(|| missing("volumeStoragePoolMap"))?;
                self.volumes.activate(&map.volume).await?
            }
            Handler::VolumeDeactivate => {
                let map = data
                    .volume_storage_pool_map
                    .as_ref()
                    .ok_or_else(|| missing("volumeStoragePoolMap"))?;
                self.volumes.deactivate(&map.volume).await?
            }
            Handler::VolumeRemove => {
                let map = data
                    .volume_storage_pool_map
                    .as_ref()
                    .ok_or_else(|| missing("volumeStoragePoolMap"))?;
                self.volumes.remove(&map.volume).await?
            }
            Handler::DelegateRequest => return self.delegate.handle(event, progress).await,
        };

        Ok(Some(payload))
    }
}
