//! Event envelope - the request and reply wrappers exchanged with the control plane.

use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::EventError;
use crate::ping::PingOptions;
use crate::types::{DelegateTarget, Host, Image, Instance, StoragePool, Volume};

/// Event name used for heartbeat pings.
pub const PING_EVENT: &str = "ping";

/// Origin process for container-event replays; activation under it records
/// state without touching the runtime.
pub const CONTAINER_EVENT_CREATE: &str = "containerevent.create";

// =============================================================================
// Request
// =============================================================================

/// An inbound event request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Event identifier, echoed in `previousIds` of the reply.
    pub id: String,

    /// Event name (`compute.instance.activate`, `storage.volume.remove`, `ping`, ...).
    pub name: String,

    /// Runtime kind the event is addressed to. Absent means "any".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    /// Reply channel name. No reply is produced when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,

    #[serde(default)]
    pub data: EventData,

    #[serde(default)]
    pub context: EventContext,

    /// Members the agent does not interpret; kept so delegated events
    /// are forwarded unchanged.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Context attached to an event by the issuing process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_process_name: Option<String>,
}

/// Declared resources an event applies to.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_host_map: Option<InstanceHostMap>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_storage_pool_map: Option<ImageStoragePoolMap>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_storage_pool_map: Option<VolumeStoragePoolMap>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_data: Option<ProcessData>,

    /// Requested inventory sections (ping only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<PingOptions>,

    /// Target container of a delegated request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_data: Option<DelegateTarget>,

    /// Inner event of a delegated request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<Box<Event>>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceHostMap {
    pub instance: Instance,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<Host>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageStoragePoolMap {
    pub image: Image,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_pool: Option<StoragePool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeStoragePoolMap {
    pub volume: Volume,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_pool: Option<StoragePool>,
}

/// Per-operation hints supplied by the issuing process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessData {
    /// Stop timeout in seconds, as a number or numeric string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Value>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ProcessData {
    /// The stop timeout in seconds, if one was supplied and parses.
    pub fn timeout_secs(&self) -> Option<u64> {
        match self.timeout.as_ref()? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

impl Event {
    /// Create an event with a fresh id.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn with_data(mut self, data: EventData) -> Self {
        self.data = data;
        self
    }

    pub fn with_top_process(mut self, name: impl Into<String>) -> Self {
        self.context.top_process_name = Some(name.into());
        self
    }

    /// Resolve the event name into a dispatch route.
    pub fn route(&self) -> Result<Route, EventError> {
        self.name.parse()
    }

    /// True when the event replays a container creation that already happened.
    pub fn is_container_event_replay(&self) -> bool {
        self.context.top_process_name.as_deref() == Some(CONTAINER_EVENT_CREATE)
    }

    /// Whether this is a heartbeat ping (logged at debug level).
    pub fn is_ping(&self) -> bool {
        self.name == PING_EVENT
    }
}

// =============================================================================
// Routing
// =============================================================================

/// Resource kinds the agent reconciles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Instance,
    Image,
    Volume,
    Delegate,
}

impl FromStr for ResourceKind {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "instance" => Ok(Self::Instance),
            "image" => Ok(Self::Image),
            "volume" => Ok(Self::Volume),
            "delegate" => Ok(Self::Delegate),
            other => Err(EventError::UnknownEventName(other.to_string())),
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Instance => "instance",
            Self::Image => "image",
            Self::Volume => "volume",
            Self::Delegate => "delegate",
        };
        write!(f, "{}", s)
    }
}

/// Requested state transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transition {
    Activate,
    Deactivate,
    Remove,
    Request,
}

impl FromStr for Transition {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "activate" => Ok(Self::Activate),
            "deactivate" => Ok(Self::Deactivate),
            "remove" => Ok(Self::Remove),
            "request" => Ok(Self::Request),
            other => Err(EventError::UnknownEventName(other.to_string())),
        }
    }
}

impl std::fmt::Display for Transition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Activate => "activate",
            Self::Deactivate => "deactivate",
            Self::Remove => "remove",
            Self::Request => "request",
        };
        write!(f, "{}", s)
    }
}

/// Where an event is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    Ping,
    Resource(ResourceKind, Transition),
}

impl FromStr for Route {
    type Err = EventError;

    /// Parses `[<scope>.]<kind>.<transition>`; only the last two segments matter.
    fn from_str(name: &str) -> Result<Self, Self::Err> {
        if name == PING_EVENT {
            return Ok(Route::Ping);
        }

        let mut segments = name.rsplit('.');
        let (Some(transition), Some(kind)) = (segments.next(), segments.next()) else {
            return Err(EventError::UnknownEventName(name.to_string()));
        };

        let kind = kind
            .parse()
            .map_err(|_| EventError::UnknownEventName(name.to_string()))?;
        let transition = transition
            .parse()
            .map_err(|_| EventError::UnknownEventName(name.to_string()))?;

        Ok(Route::Resource(kind, transition))
    }
}

// =============================================================================
// Reply
// =============================================================================

/// Transitioning marker carried by progress and error replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transitioning {
    /// Work is in progress; the message is a status line.
    Yes,
    /// The transition failed; the message describes why.
    Error,
}

/// Reply to an event that declared a `replyTo`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reply {
    pub id: String,
    pub name: String,
    pub data: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,

    pub previous_ids: Vec<String>,
    pub previous_names: Vec<String>,

    /// Epoch milliseconds.
    pub time: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transitioning: Option<Transitioning>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transitioning_message: Option<String>,
}

impl Reply {
    fn build(event: &Event, data: Value) -> Option<Self> {
        let name = event.reply_to.clone()?;
        Some(Self {
            id: uuid::Uuid::new_v4().to_string(),
            name,
            data,
            resource_type: event.resource_type.clone(),
            resource_id: event.resource_id.clone(),
            previous_ids: vec![event.id.clone()],
            previous_names: vec![event.name.clone()],
            time: Utc::now().timestamp_millis(),
            transitioning: None,
            transitioning_message: None,
        })
    }

    /// Successful reply carrying the post-state payload.
    ///
    /// Returns `None` when the event does not expect a reply.
    pub fn success(event: &Event, data: Value) -> Option<Self> {
        Self::build(event, data)
    }

    /// Failed reply carrying an error description.
    pub fn error(event: &Event, message: impl Into<String>) -> Option<Self> {
        let mut reply = Self::build(event, Value::Object(Map::new()))?;
        reply.transitioning = Some(Transitioning::Error);
        reply.transitioning_message = Some(message.into());
        Some(reply)
    }

    /// Progress update for a long-running transition.
    pub fn progress(event: &Event, message: impl Into<String>, data: Option<Value>) -> Option<Self> {
        let mut reply = Self::build(event, data.unwrap_or_else(|| Value::Object(Map::new())))?;
        reply.transitioning = Some(Transitioning::Yes);
        reply.transitioning_message = Some(message.into());
        Some(reply)
    }

    pub fn is_error(&self) -> bool {
        self.transitioning == Some(Transitioning::Error)
    }
}
