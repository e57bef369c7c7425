//! Delegated requests.
//!
//! A delegate request carries an inner event meant for an agent running
//! inside a container. The inner event is posted to that container's event
//! endpoint and the container's answer becomes the reply.

use std::sync::Arc;
use std::time::Duration;

use corral_events::{Event, EventError};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error, info};
use url::Url;

use crate::error::AgentError;
use crate::progress::Progress;
use crate::runtime::{self, ContainerFilter, RuntimeClient};

/// Port the in-container agent listens on.
pub const DELEGATE_PORT: u16 = 8080;

const CONTAINER_KIND: &str = "container";
const CONFIG_UPDATE_EVENT: &str = "config.update";

/// Answer of the in-container agent.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DelegateResponse {
    #[serde(default)]
    exit_code: i64,
    #[serde(default)]
    output: String,
    #[serde(default)]
    data: Value,
}

pub struct DelegateHandler {
    runtime: Arc<dyn RuntimeClient>,
    http: reqwest::Client,
    port: u16,
}

impl DelegateHandler {
    pub fn new(runtime: Arc<dyn RuntimeClient>, timeout: Duration) -> Result<Self, AgentError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AgentError::configuration("delegate HTTP client", e.to_string()))?;

        Ok(Self {
            runtime,
            http,
            port: DELEGATE_PORT,
        })
    }

    /// Post to `port` instead of the default endpoint port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Forward the inner event. `None` means no reply is sent.
    pub async fn handle(
        &self,
        event: &Event,
        progress: &dyn Progress,
    ) -> Result<Option<Value>, AgentError> {
        let target = event.data.instance_data.as_ref().ok_or_else(|| EventError::MissingData {
            event: event.name.clone(),
            member: "instanceData",
        })?;
        let inner = event.data.event.as_deref().ok_or_else(|| EventError::MissingData {
            event: event.name.clone(),
            member: "event",
        })?;

        let Some(token) = target.token.as_deref().filter(|t| !t.is_empty()) else {
            debug!(instance_uuid = %target.uuid, "Delegate target has no token, ignoring");
            return Ok(None);
        };
        if target.kind.as_deref() != Some(CONTAINER_KIND) {
            debug!(instance_uuid = %target.uuid, kind = ?target.kind, "Delegate target is not a container, ignoring");
            return Ok(None);
        }

        let Some(container) = runtime::find_container(
            self.runtime.as_ref(),
            ContainerFilter::Name(format!("/{}", target.uuid)),
        )
        .await?
        else {
            info!(instance_uuid = %target.uuid, "Delegate target has no container");
            return Ok(None);
        };

        let inspect = self.runtime.inspect_container(&container.id).await?;
        if !inspect.is_running() {
            error!(instance_uuid = %target.uuid, container_id = %container.id, "Can not delegate to a stopped container");
            return Ok(None);
        }

        if inner.name == CONFIG_UPDATE_EVENT && has_no_items(inner) {
            debug!(instance_uuid = %target.uuid, "Empty config update, nothing to delegate");
            return Ok(Some(Value::Null));
        }

        let ip = inspect
            .ip_address
            .as_deref()
            .filter(|ip| !ip.is_empty())
            .ok_or_else(|| AgentError::Delegate {
                target: target.uuid.clone(),
                message: "container has no IP address".to_string(),
            })?;

        let response = self.post(&target.uuid, ip, token, inner).await?;
        if response.exit_code == 0 {
            Ok(Some(response.data))
        } else {
            info!(
                instance_uuid = %target.uuid,
                exit_code = response.exit_code,
                "Delegated event failed"
            );
            progress.update(
                "Update failed",
                Some(json!({
                    "exitCode": response.exit_code,
                    "output": response.output,
                })),
            );
            Ok(None)
        }
    }

    async fn post(
        &self,
        target: &str,
        ip: &str,
        token: &str,
        inner: &Event,
    ) -> Result<DelegateResponse, AgentError> {
        let delegate_error = |message: String| AgentError::Delegate {
            target: target.to_string(),
            message,
        };

        let mut url = Url::parse(&format!("http://{}:{}/events", ip, self.port))
            .map_err(|e| delegate_error(e.to_string()))?;
        url.query_pairs_mut().append_pair("token", token);

        debug!(instance_uuid = %target, url = %url.as_str(), event = %inner.name, "Delegating event");
        let response = self
            .http
            .post(url)
            .json(inner)
            .send()
            .await
            .map_err(|e| delegate_error(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| delegate_error(e.to_string()))?;

        if status != reqwest::StatusCode::OK {
            return Ok(DelegateResponse {
                exit_code: i64::from(status.as_u16()),
                output: body,
                data: Value::Null,
            });
        }

        serde_json::from_str(&body).map_err(|e| delegate_error(format!("invalid response: {}", e)))
    }
}

fn has_no_items(event: &Event) -> bool {
    match event.data.extra.get("items") {
        None | Some(Value::Null) => true,
        Some(Value::Array(items)) => items.is_empty(),
        Some(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use corral_events::{DelegateTarget, EventData};
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::progress::RecordingProgress;
    use crate::runtime::MockRuntime;

    fn delegate_event(uuid: &str, inner: Event) -> Event {
        Event::new("delegate.request")
            .with_reply_to("reply-1")
            .with_data(EventData {
                instance_data: Some(DelegateTarget {
                    uuid: uuid.to_string(),
                    kind: Some("container".to_string()),
                    token: Some("secret".to_string()),
                }),
                event: Some(Box::new(inner)),
                ..Default::default()
            })
    }

    fn config_update(items: Value) -> Event {
        let mut inner = Event::new("config.update");
        inner.data.extra.insert("items".to_string(), items);
        inner
    }

    async fn setup(server: &MockServer) -> (Arc<MockRuntime>, DelegateHandler) {
        let runtime = Arc::new(MockRuntime::new());
        let id = runtime.add_container("agent-1", "agent", true);
        runtime.set_ip_address(&id, "127.0.0.1");

        let port = server.address().port();
        let handler = DelegateHandler::new(runtime.clone(), Duration::from_secs(5))
            .unwrap()
            .with_port(port);
        (runtime, handler)
    }

    #[tokio::test]
    async fn test_forwards_and_returns_data() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/events"))
            .and(query_param("token", "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "exitCode": 0,
                "output": "",
                "data": {"applied": true}
            })))
            .expect(1)
            .mount(&server)
            .await;
        let (_runtime, handler) = setup(&server).await;

        let event = delegate_event("agent-1", config_update(json!([{"name": "hosts"}])));
        let data = handler
            .handle(&event, &RecordingProgress::new())
            .await
            .unwrap();
        assert_eq!(data, Some(json!({"applied": true})));
    }

    #[tokio::test]
    async fn test_failed_exit_reports_progress() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;
        let (_runtime, handler) = setup(&server).await;
        let progress = RecordingProgress::new();

        let event = delegate_event("agent-1", config_update(json!([{"name": "hosts"}])));
        let data = handler.handle(&event, &progress).await.unwrap();

        assert!(data.is_none());
        let updates = progress.updates();
        assert_eq!(updates[0].0, "Update failed");
        assert_eq!(
            updates[0].1,
            Some(json!({"exitCode": 500, "output": "boom"}))
        );
    }

    #[tokio::test]
    async fn test_empty_config_update_short_circuits() {
        let server = MockServer::start().await;
        let (_runtime, handler) = setup(&server).await;

        let event = delegate_event("agent-1", config_update(json!([])));
        let data = handler
            .handle(&event, &RecordingProgress::new())
            .await
            .unwrap();
        assert_eq!(data, Some(Value::Null));
        assert!(server.received_requests().await.unwrap_or_default().is_empty());
    }

    #[tokio::test]
    async fn test_stopped_or_missing_container_no_reply() {
        let server = MockServer::start().await;
        let (runtime, handler) = setup(&server).await;
        runtime.add_container("stopped", "agent", false);

        for uuid in ["stopped", "missing"] {
            let event = delegate_event(uuid, config_update(json!([{"name": "hosts"}])));
            let data = handler
                .handle(&event, &RecordingProgress::new())
                .await
                .unwrap();
            assert!(data.is_none());
        }
    }

    #[tokio::test]
    async fn test_missing_target_is_error() {
        let server = MockServer::start().await;
        let (_runtime, handler) = setup(&server).await;

        let err = handler
            .handle(&Event::new("delegate.request"), &RecordingProgress::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Event(EventError::MissingData { .. })));
    }
}
