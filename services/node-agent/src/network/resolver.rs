//! Network configuration resolver.
//!
//! Pure translation; missing data never fails, it only skips the step.

use corral_events::{service_kinds, Host, Instance, Nic, PRIMARY_IP_ROLE};
use tracing::debug;

use crate::runtime::{CreateConfig, ExposedPort, PortBinding, StartConfig};

/// Label carrying the primary address in CIDR form.
pub const LABEL_CONTAINER_IP: &str = "io.corral.container.ip";

const IPSEC_ISAKMP_PORT: u16 = 500;
const IPSEC_NAT_PORT: u16 = 4500;

/// The NIC with the lowest device number.
pub fn primary_nic(instance: &Instance) -> Option<&Nic> {
    instance.nics.iter().min_by_key(|nic| nic.device_number)
}

/// Apply network resolution on top of the assembled configs.
///
/// May remove or override settings made earlier.
pub fn apply_network_config(
    instance: &Instance,
    host: Option<&Host>,
    create: &mut CreateConfig,
    start: &mut StartConfig,
) {
    setup_mac_and_ip(instance, create);
    setup_ports(instance, create, start);
    setup_links(instance, create, start);
    setup_ipsec(instance, host, create, start);
}

fn has_service(instance: &Instance, kind: &str) -> bool {
    primary_nic(instance).is_some_and(|nic| nic.has_service(kind))
}

fn setup_mac_and_ip(instance: &Instance, create: &mut CreateConfig) {
    create.mac_address = primary_nic(instance).and_then(|nic| nic.mac_address.clone());

    // Only the first declared NIC carries the labelled address.
    let Some(nic) = instance.nics.first() else {
        return;
    };

    let primary = nic
        .ip_addresses
        .iter()
        .find(|ip| ip.role.as_deref() == Some(PRIMARY_IP_ROLE));

    let cidr = primary.and_then(|ip| {
        let address = ip.address.as_deref()?;
        let size = ip.subnet.as_ref()?.cidr_size?;
        Some(format!("{}/{}", address, size))
    });

    if let Some(cidr) = cidr {
        create.labels.insert(LABEL_CONTAINER_IP.to_string(), cidr);
    }
}

fn setup_ports(instance: &Instance, create: &mut CreateConfig, start: &mut StartConfig) {
    if !has_service(instance, service_kinds::PORT_SERVICE) {
        return;
    }

    debug!(instance_uuid = %instance.uuid, "Port service present, not publishing ports");
    create.ports.clear();
    start.port_bindings.clear();
    start.publish_all_ports = false;
}

fn setup_links(instance: &Instance, create: &mut CreateConfig, start: &mut StartConfig) {
    if !has_service(instance, service_kinds::LINK_SERVICE) {
        return;
    }

    start.links = None;

    let mut env = Vec::new();
    for link in &instance.instance_links {
        let name = &link.link_name;
        let Some(ports) = link.data.fields.ports.as_ref() else {
            continue;
        };

        for port in ports {
            let (Some(proto), Some(ip), Some(public), Some(private)) = (
                port.protocol.as_deref(),
                port.ip_address.as_deref(),
                port.public_port,
                port.private_port,
            ) else {
                continue;
            };

            let full = format!("{}://{}:{}", proto, ip, public);
            let vars = [
                ("NAME".to_string(), format!("/corral/{}", name)),
                ("PORT".to_string(), full.clone()),
                (format!("PORT_{}_{}", private, proto), full),
                (format!("PORT_{}_{}_ADDR", private, proto), ip.to_string()),
                (format!("PORT_{}_{}_PORT", private, proto), public.to_string()),
                (format!("PORT_{}_{}_PROTO", private, proto), proto.to_string()),
            ];

            for (suffix, value) in vars {
                env.push((format!("{}_{}", name, suffix).to_uppercase(), value));
            }
        }
    }

    if !env.is_empty() {
        create.environment.extend(env);
    }
}

fn setup_ipsec(
    instance: &Instance,
    host: Option<&Host>,
    create: &mut CreateConfig,
    start: &mut StartConfig,
) {
    if !instance.is_network_agent() || !has_service(instance, service_kinds::IPSEC_TUNNEL_SERVICE) {
        return;
    }

    let Some(host_id) = host.and_then(|h| h.id.as_ref()) else {
        return;
    };
    let Some(ports) = instance.data.ipsec.get(&host_id.to_string()) else {
        return;
    };
    let (Some(nat), Some(isakmp)) = (ports.nat, ports.isakmp) else {
        return;
    };

    let isakmp_port = ExposedPort::new(IPSEC_ISAKMP_PORT, "udp");
    let nat_port = ExposedPort::new(IPSEC_NAT_PORT, "udp");

    start
        .port_bindings
        .insert(isakmp_port.key(), vec![any_interface(isakmp)]);
    start.port_bindings.insert(nat_port.key(), vec![any_interface(nat)]);
    create.ports.push(isakmp_port);
    create.ports.push(nat_port);
}

fn any_interface(port: u16) -> PortBinding {
    PortBinding {
        host_ip: Some("0.0.0.0".to_string()),
        host_port: Some(port.to_string()),
    }
}
