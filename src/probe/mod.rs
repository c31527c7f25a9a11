//! Neighbor Prober: keeps per-port ARP/NDP, LLDP, and link-state caches
//! fresh.
//!
//! Read-only toward the kernel: ARP entries come from `/proc/net/arp`,
//! NDP entries from `ip -6 neigh` output, link state from sysfs, and LLDP
//! peers from a host `lldpd` daemon queried through `lldpcli` (when the
//! daemon was sensed at startup). Each scan atomically replaces the
//! port's cache; a timed-out port keeps its previous cache.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::clock;
use crate::config;
use crate::error::CoreError;
use crate::model::{ArpEntry, LinkInfo, LldpEntry, Mac, NeighborCache};
use crate::registry::Registry;

/// Parse `/proc/net/arp` content, keeping entries witnessed on `device`.
pub fn parse_arp_table(table: &str, device: &str) -> Vec<ArpEntry> {
    let mut entries = Vec::new();
    for line in table.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 6 || fields[5] != device {
            continue;
        }
        let (Ok(ip), Ok(mac)) = (fields[0].parse(), fields[3].parse::<Mac>()) else {
            continue;
        };
        if mac == Mac::ZERO {
            continue; // incomplete entry
        }
        let state = match fields[2] {
            "0x2" => "REACHABLE",
            "0x0" => "INCOMPLETE",
            "0x6" => "PERMANENT",
            other => other,
        };
        entries.push(ArpEntry { ip, mac, state: state.to_string() });
    }
    entries
}

/// Parse `ip -6 neigh show dev <dev>` output lines, e.g.
/// `fd00::2 lladdr 52:54:00:12:34:56 router REACHABLE`.
pub fn parse_ndp_output(output: &str) -> Vec<ArpEntry> {
    let mut entries = Vec::new();
    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let Some(ip) = fields.first().and_then(|f| f.parse().ok()) else {
            continue;
        };
        let Some(pos) = fields.iter().position(|f| *f == "lladdr") else {
            continue;
        };
        let Some(mac) = fields.get(pos + 1).and_then(|f| f.parse::<Mac>().ok()) else {
            continue;
        };
        let state = fields.last().copied().unwrap_or("STALE");
        entries.push(ArpEntry { ip, mac, state: state.to_string() });
    }
    entries
}

/// Extract LLDP neighbors for `device` from `lldpcli show neighbors -f json`.
///
/// lldpcli emits either an object or an array under `lldp.interface`
/// depending on the neighbor count; both shapes are handled.
pub fn parse_lldp_json(doc: &serde_json::Value, device: &str) -> Vec<LldpEntry> {
    let mut out = Vec::new();
    let interface = &doc["lldp"]["interface"];
    let ifaces: Vec<&serde_json::Value> = match interface {
        serde_json::Value::Array(list) => list.iter().collect(),
        serde_json::Value::Object(_) => vec![interface],
        _ => return out,
    };

    for iface in ifaces {
        let Some(map) = iface.as_object() else { continue };
        for (name, body) in map {
            if name != device {
                continue;
            }
            let chassis = &body["chassis"];
            let (system_name, chassis_body) = match chassis.as_object().and_then(|m| m.iter().next())
            {
                Some((n, b)) => (n.clone(), b),
                None => continue,
            };
            let port = &body["port"];
            out.push(LldpEntry {
                chassis_id: json_str(&chassis_body["id"]["value"]),
                port_id: json_str(&port["id"]["value"]),
                system_name,
                system_description: json_str(&chassis_body["descr"]),
                ttl: port["ttl"].as_u64().or_else(|| body["ttl"].as_u64()).unwrap_or(0) as u32,
            });
        }
    }
    out
}

fn json_str(v: &serde_json::Value) -> String {
    v.as_str().unwrap_or_default().to_string()
}

/// Read a port's kernel link state from sysfs.
pub fn read_link_info(device: &str) -> LinkInfo {
    let read = |attr: &str| {
        std::fs::read_to_string(format!("/sys/class/net/{device}/{attr}"))
            .map(|s| s.trim().to_string())
            .unwrap_or_default()
    };
    let operstate = read("operstate");
    let carrier = read("carrier");
    LinkInfo {
        up: operstate == "up" || (operstate == "unknown" && carrier == "1"),
        speed_mbps: read("speed").parse().unwrap_or(0),
        duplex: read("duplex"),
    }
}

/// Periodic and on-demand neighbor scanner.
pub struct Prober {
    registry: Arc<Registry>,
    /// Sensed once at startup; when false, LLDP sections stay empty and
    /// `lldpcli` is never invoked.
    lldp_available: bool,
}

impl Prober {
    pub fn new(registry: Arc<Registry>, lldp_available: bool) -> Self {
        Prober { registry, lldp_available }
    }

    /// Whether a host lldpd answers on this machine. Decided once.
    pub async fn sense_lldp() -> bool {
        matches!(
            tokio::process::Command::new("lldpcli")
                .arg("-v")
                .output()
                .await,
            Ok(out) if out.status.success()
        )
    }

    /// Spawn the periodic scan task.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let prober = Arc::clone(self);
        tokio::spawn(async move {
            // First scan one period in: startup already published ports as
            // ready, and an immediate scan would race enumeration.
            let start = tokio::time::Instant::now() + config::PROBE_INTERVAL;
            let mut ticker = tokio::time::interval_at(start, config::PROBE_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                prober.refresh(None).await;
            }
        })
    }

    /// Refresh the named ports (all when `None`). Returns the ports that
    /// timed out, which kept their previous caches.
    pub async fn refresh(&self, ports: Option<&[String]>) -> Vec<String> {
        let names = match ports {
            Some(list) => list.to_vec(),
            None => self.registry.port_names(),
        };
        let mut timed_out = Vec::new();
        for name in names {
            let Some(port) = self.registry.get_port(&name) else {
                continue;
            };
            match timeout(config::PROBE_PORT_TIMEOUT, self.scan_port(&name)).await {
                Ok(cache) => port.set_neighbors(cache),
                Err(_) => {
                    tracing::warn!("neighbor scan of {name} timed out; keeping previous cache");
                    timed_out.push(name);
                }
            }
        }
        timed_out
    }

    /// On-demand variant for the control adapter: refresh, then report a
    /// timeout error if any requested port missed its budget.
    pub async fn discover(&self, ports: Option<&[String]>) -> Result<(), CoreError> {
        let timed_out = self.refresh(ports).await;
        if timed_out.is_empty() {
            Ok(())
        } else {
            Err(CoreError::Timeout(format!(
                "neighbor scan timed out on {}",
                timed_out.join(", ")
            )))
        }
    }

    async fn scan_port(&self, device: &str) -> NeighborCache {
        let mut arp = match tokio::fs::read_to_string("/proc/net/arp").await {
            Ok(table) => parse_arp_table(&table, device),
            Err(e) => {
                tracing::debug!("no ARP table: {e}");
                Vec::new()
            }
        };
        arp.extend(self.scan_ndp(device).await);

        let lldp = if self.lldp_available {
            self.scan_lldp(device).await
        } else {
            Vec::new()
        };

        NeighborCache {
            arp,
            lldp,
            link: read_link_info(device),
            scanned_micros: clock::mono_micros(),
        }
    }

    async fn scan_ndp(&self, device: &str) -> Vec<ArpEntry> {
        let output = tokio::process::Command::new("ip")
            .args(["-6", "neigh", "show", "dev", device])
            .output()
            .await;
        match output {
            Ok(out) if out.status.success() => {
                parse_ndp_output(&String::from_utf8_lossy(&out.stdout))
            }
            _ => Vec::new(),
        }
    }

    async fn scan_lldp(&self, device: &str) -> Vec<LldpEntry> {
        let output = tokio::process::Command::new("lldpcli")
            .args(["show", "neighbors", "-f", "json"])
            .output()
            .await;
        match output {
            Ok(out) if out.status.success() => {
                match serde_json::from_slice::<serde_json::Value>(&out.stdout) {
                    Ok(doc) => parse_lldp_json(&doc, device),
                    Err(e) => {
                        tracing::debug!("unparseable lldpcli output: {e}");
                        Vec::new()
                    }
                }
            }
            _ => Vec::new(),
        }
    }
}
