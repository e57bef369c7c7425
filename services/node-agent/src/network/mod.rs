//! Network setup for container instances.
//!
//! Translates the declared NIC and network-service topology of an instance
//! into container create and start settings:
//! - MAC address of the primary NIC and an IP label
//! - Port publication, suppressed when the network routes ports itself
//! - Link environment, replacing engine links when the network provides links
//! - IPsec tunnel ports for the host's network agent

mod resolver;

pub use resolver::{apply_network_config, primary_nic, LABEL_CONTAINER_IP};
