//! Ping options and pong inventory records.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Inventory sections requested by a ping. Every flag defaults to off.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingOptions {
    #[serde(default)]
    pub resources: bool,

    #[serde(default)]
    pub stats: bool,

    #[serde(default)]
    pub instances: bool,
}

/// Options echoed back in a pong.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PongOptions {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub instances: bool,
}

/// Inventory snapshot returned for a ping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pong {
    #[serde(default)]
    pub resources: Vec<InventoryRecord>,

    #[serde(default)]
    pub options: PongOptions,
}

impl Pong {
    pub fn add(&mut self, record: InventoryRecord) {
        self.resources.push(record);
    }
}

/// One locally derived resource reported in a pong.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum InventoryRecord {
    #[serde(rename_all = "camelCase")]
    PhysicalHost {
        uuid: String,
        kind: String,
        name: String,
    },

    #[serde(rename_all = "camelCase")]
    Host {
        uuid: String,
        kind: String,
        name: String,
        physical_host_uuid: String,
        /// Host stats snapshot; `null` when not requested or collection failed.
        info: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        api_proxy: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    StoragePool {
        uuid: String,
        kind: String,
        name: String,
        host_uuid: String,
    },

    #[serde(rename_all = "camelCase")]
    IpAddress {
        uuid: String,
        address: String,
        host_uuid: String,
    },

    #[serde(rename_all = "camelCase")]
    Instance {
        uuid: String,
        state: String,
        docker_id: String,
    },
}
