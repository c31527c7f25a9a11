//! Host Ethernet port enumeration.
//!
//! Ports are discovered once at startup through `sysinfo` (name, MAC,
//! addresses, MTU) plus sysfs for the attributes sysinfo does not expose
//! (nominal speed, duplex). The capability set is decided here, once:
//! there is no runtime re-probing.

use std::net::IpAddr;

use sysinfo::Networks;

use crate::model::{Mac, PortCapabilities, PortInfo, PortType};

/// Interfaces that are never traffic ports.
fn is_virtual(name: &str) -> bool {
    name == "lo"
        || name.starts_with("veth")
        || name.starts_with("docker")
        || name.starts_with("br-")
        || name.starts_with("virbr")
}

fn sysfs_read(device: &str, attr: &str) -> Option<String> {
    std::fs::read_to_string(format!("/sys/class/net/{device}/{attr}"))
        .ok()
        .map(|s| s.trim().to_string())
}

/// Enumerate the host's Ethernet ports.
pub fn enumerate() -> Vec<PortInfo> {
    let networks = Networks::new_with_refreshed_list();
    let mut ports = Vec::new();

    for (name, data) in networks.iter() {
        if is_virtual(name) {
            continue;
        }
        let mac = Mac(data.mac_address().0);
        if mac == Mac::ZERO {
            continue; // not an Ethernet device
        }

        let mut ipv4 = None;
        let mut ipv4_prefix = None;
        let mut ipv6 = None;
        let mut ipv6_prefix = None;
        for network in data.ip_networks() {
            match network.addr {
                IpAddr::V4(addr) if ipv4.is_none() => {
                    ipv4 = Some(addr);
                    ipv4_prefix = Some(network.prefix);
                }
                // fe80::/10 link-locals are not useful source addresses.
                IpAddr::V6(addr) if ipv6.is_none() && (addr.segments()[0] & 0xffc0) != 0xfe80 => {
                    ipv6 = Some(addr);
                    ipv6_prefix = Some(network.prefix);
                }
                _ => {}
            }
        }

        let speed_mbps: u64 = sysfs_read(name, "speed")
            .and_then(|s| s.parse::<i64>().ok())
            .filter(|&s| s > 0)
            .map(|s| s as u64)
            .unwrap_or(0);
        let mtu = match data.mtu() {
            0 => 1500,
            mtu => mtu as usize,
        };

        let port_type = if speed_mbps >= 10_000 { PortType::Sfp } else { PortType::Copper };
        ports.push(PortInfo {
            name: name.clone(),
            mac,
            ipv4,
            ipv4_prefix,
            ipv6,
            ipv6_prefix,
            speed_mbps,
            port_type,
            // Hardware TX timestamping and the kernel-bypass fast path are
            // declared unavailable until an endpoint backend provides them.
            capabilities: PortCapabilities { hardware_timestamp: false, fast_path_capable: false },
            mtu,
        });
    }

    ports.sort_by(|a, b| a.name.cmp(&b.name));
    tracing::info!(
        "enumerated {} port(s): {}",
        ports.len(),
        ports.iter().map(|p| p.name.as_str()).collect::<Vec<_>>().join(", ")
    );
    ports
}
