//! Descriptors, counters, and neighbor entries shared across the core.
//!
//! Everything here is either a plain serde value crossing the control
//! boundary or an atomic counter block hung off a registry entry. Protocol
//! encapsulations are a tagged variant carrying their own fields; the frame
//! builder dispatches on the tag.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::config;
use crate::error::CoreError;

/// A MAC address, serialized as the usual colon-separated hex form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Mac(pub [u8; 6]);

impl Mac {
    pub const BROADCAST: Mac = Mac([0xff; 6]);
    pub const ZERO: Mac = Mac([0; 6]);

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl FromStr for Mac {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(format!("invalid MAC address: {s}"));
        }
        for (i, part) in parts.iter().enumerate() {
            octets[i] = u8::from_str_radix(part, 16).map_err(|_| format!("invalid MAC address: {s}"))?;
        }
        Ok(Mac(octets))
    }
}

impl Serialize for Mac {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Mac {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Physical flavor of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PortType {
    Copper,
    Sfp,
    FastPath,
}

/// Capability set declared for a port at startup. There is no runtime
/// "maybe present" state: either a capability was sensed at enumeration
/// time or the port does not have it.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PortCapabilities {
    /// The device can stamp TX frames in hardware.
    pub hardware_timestamp: bool,
    /// The device is eligible for a kernel-bypass fast path.
    pub fast_path_capable: bool,
}

/// Static identity of a host Ethernet port, read at enumeration time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortInfo {
    pub name: String,
    pub mac: Mac,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<std::net::Ipv4Addr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv4_prefix: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<std::net::Ipv6Addr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv6_prefix: Option<u8>,
    /// Nominal link speed in Mbps, 0 when the kernel does not report one.
    pub speed_mbps: u64,
    pub port_type: PortType,
    pub capabilities: PortCapabilities,
    pub mtu: usize,
}

/// Monotonic TX counters of one port. Written by its transmitter only,
/// read lock-free into snapshots.
#[derive(Debug, Default)]
pub struct PortCounters {
    pub frames: AtomicU64,
    pub bytes: AtomicU64,
    pub dropped: AtomicU64,
    /// Latest TX timestamp in monotonic microseconds (hardware when the
    /// port supports it, otherwise a software reading before the write).
    pub last_tx_micros: AtomicU64,
}

impl PortCounters {
    pub fn snapshot(&self) -> PortCounterSnapshot {
        PortCounterSnapshot {
            frames: self.frames.load(Ordering::Acquire),
            bytes: self.bytes.load(Ordering::Acquire),
            dropped: self.dropped.load(Ordering::Acquire),
            last_tx_micros: self.last_tx_micros.load(Ordering::Acquire),
        }
    }

    pub fn reset(&self) {
        self.frames.store(0, Ordering::Release);
        self.bytes.store(0, Ordering::Release);
        self.dropped.store(0, Ordering::Release);
        self.last_tx_micros.store(0, Ordering::Release);
    }
}

/// Point-in-time copy of a port's TX counters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortCounterSnapshot {
    pub frames: u64,
    pub bytes: u64,
    pub dropped: u64,
    pub last_tx_micros: u64,
}

/// Live counters of one profile. Written by its runner, read lock-free.
#[derive(Debug, Default)]
pub struct ProfileCounters {
    pub frames_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub loss_drops: AtomicU64,
    pub dup_emits: AtomicU64,
    pub reorder_events: AtomicU64,
    pub shaper_overrun: AtomicU64,
    pub last_send_micros: AtomicU64,
}

impl ProfileCounters {
    pub fn snapshot(&self) -> ProfileCounterSnapshot {
        ProfileCounterSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Acquire),
            bytes_sent: self.bytes_sent.load(Ordering::Acquire),
            loss_drops: self.loss_drops.load(Ordering::Acquire),
            dup_emits: self.dup_emits.load(Ordering::Acquire),
            reorder_events: self.reorder_events.load(Ordering::Acquire),
            shaper_overrun: self.shaper_overrun.load(Ordering::Acquire),
            last_send_micros: self.last_send_micros.load(Ordering::Acquire),
        }
    }

    pub fn reset(&self) {
        self.frames_sent.store(0, Ordering::Release);
        self.bytes_sent.store(0, Ordering::Release);
        self.loss_drops.store(0, Ordering::Release);
        self.dup_emits.store(0, Ordering::Release);
        self.reorder_events.store(0, Ordering::Release);
        self.shaper_overrun.store(0, Ordering::Release);
        self.last_send_micros.store(0, Ordering::Release);
    }
}

/// Point-in-time copy of a profile's counters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProfileCounterSnapshot {
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub loss_drops: u64,
    pub dup_emits: u64,
    pub reorder_events: u64,
    pub shaper_overrun: u64,
    pub last_send_micros: u64,
}

/// Impairment block of a profile. Hot-updatable while running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Impairments {
    pub latency_ms: f64,
    pub jitter_ms: f64,
    pub loss_percent: f64,
    pub burst_loss_percent: f64,
    pub reorder_percent: f64,
    pub duplicate_percent: f64,
    /// Optional shaping cap in Mbps, applied after the pacer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shaping_mbps: Option<f64>,
}

impl Impairments {
    /// Largest scheduling delay this block can assign to a frame.
    pub fn max_delay(&self) -> std::time::Duration {
        // Worst-case reorder extra (latency + 2*jitter) only applies when
        // reorder can fire at all.
        let reorder_extra = if self.reorder_percent > 0.0 {
            self.latency_ms + 2.0 * self.jitter_ms
        } else {
            0.0
        };
        let ms = self.latency_ms + self.jitter_ms + reorder_extra;
        std::time::Duration::from_secs_f64((ms / 1000.0).max(0.0))
    }

    /// Clamp the probability fields into range so that
    /// `loss + duplicate + reorder <= 100`. Returns warnings describing
    /// every adjustment made.
    pub fn normalize(&mut self) -> Vec<String> {
        let mut warnings = Vec::new();

        for (label, field) in [
            ("latency_ms", &mut self.latency_ms),
            ("jitter_ms", &mut self.jitter_ms),
        ] {
            if *field < 0.0 {
                warnings.push(format!("{label} clamped from {field} to 0"));
                *field = 0.0;
            }
        }

        for (label, field) in [
            ("loss_percent", &mut self.loss_percent),
            ("burst_loss_percent", &mut self.burst_loss_percent),
            ("reorder_percent", &mut self.reorder_percent),
            ("duplicate_percent", &mut self.duplicate_percent),
        ] {
            if !(0.0..=100.0).contains(field) {
                let clamped = field.clamp(0.0, 100.0);
                warnings.push(format!("{label} clamped from {field} to {clamped}"));
                *field = clamped;
            }
        }

        // loss keeps priority, then duplicate, then reorder.
        let mut budget = 100.0 - self.loss_percent;
        if self.duplicate_percent > budget {
            warnings.push(format!(
                "duplicate_percent clamped from {} to {budget} (loss+duplicate+reorder must stay within 100)",
                self.duplicate_percent
            ));
            self.duplicate_percent = budget;
        }
        budget -= self.duplicate_percent;
        if self.reorder_percent > budget {
            warnings.push(format!(
                "reorder_percent clamped from {} to {budget} (loss+duplicate+reorder must stay within 100)",
                self.reorder_percent
            ));
            self.reorder_percent = budget;
        }

        if let Some(cap) = self.shaping_mbps {
            if cap <= 0.0 {
                warnings.push("shaping_mbps must be positive; cap removed".into());
                self.shaping_mbps = None;
            }
        }

        warnings
    }

    pub fn is_noop(&self) -> bool {
        *self == Impairments::default()
    }
}

/// Wire-level protocol tag as it appears in profile descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProtocolTag {
    Ipv4,
    Ipv6,
    Mpls,
    Vxlan,
    Qinq,
    UdpFlood,
    TcpSynFlood,
    HttpFlood,
    DnsAmp,
}

impl fmt::Display for ProtocolTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProtocolTag::Ipv4 => "ipv4",
            ProtocolTag::Ipv6 => "ipv6",
            ProtocolTag::Mpls => "mpls",
            ProtocolTag::Vxlan => "vxlan",
            ProtocolTag::Qinq => "qinq",
            ProtocolTag::UdpFlood => "udp-flood",
            ProtocolTag::TcpSynFlood => "tcp-syn-flood",
            ProtocolTag::HttpFlood => "http-flood",
            ProtocolTag::DnsAmp => "dns-amp",
        };
        f.write_str(s)
    }
}

/// Validated encapsulation, carrying its protocol-specific fields. The
/// frame builder dispatches on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encapsulation {
    Ipv4,
    Ipv6,
    Mpls { label: u32 },
    Vxlan { vni: u32 },
    Qinq { outer_vid: u16, inner_vid: u16 },
    UdpFlood,
    TcpSynFlood,
    HttpFlood,
    DnsAmp,
}

impl Encapsulation {
    pub fn tag(&self) -> ProtocolTag {
        match self {
            Encapsulation::Ipv4 => ProtocolTag::Ipv4,
            Encapsulation::Ipv6 => ProtocolTag::Ipv6,
            Encapsulation::Mpls { .. } => ProtocolTag::Mpls,
            Encapsulation::Vxlan { .. } => ProtocolTag::Vxlan,
            Encapsulation::Qinq { .. } => ProtocolTag::Qinq,
            Encapsulation::UdpFlood => ProtocolTag::UdpFlood,
            Encapsulation::TcpSynFlood => ProtocolTag::TcpSynFlood,
            Encapsulation::HttpFlood => ProtocolTag::HttpFlood,
            Encapsulation::DnsAmp => ProtocolTag::DnsAmp,
        }
    }
}

/// A named traffic descriptor as it crosses the control boundary.
///
/// Unknown JSON fields are ignored on input; unset optionals are omitted
/// on output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileConfig {
    pub name: String,
    pub src_port: String,
    pub dst_port: String,
    pub dst_addr: IpAddr,
    /// L4 destination port for UDP/TCP/HTTP encapsulations.
    #[serde(default = "default_dst_l4_port")]
    pub l4_dst_port: u16,
    /// L4 source port; absent means a random ephemeral port per frame.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub l4_src_port: Option<u16>,
    pub protocol: ProtocolTag,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mpls_label: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vxlan_vni: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outer_vlan: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inner_vlan: Option<u16>,
    pub bandwidth_mbps: f64,
    pub frame_size: usize,
    #[serde(default)]
    pub dscp: u8,
    #[serde(default)]
    pub impairments: Impairments,
    #[serde(default)]
    pub enabled: bool,
}

fn default_dst_l4_port() -> u16 {
    config::DEFAULT_DST_PORT
}

impl ProfileConfig {
    /// Syntactic validation plus protocol-field resolution. Does not touch
    /// the port registry; port resolution happens at enable time.
    ///
    /// On success returns the validated encapsulation and any clamp
    /// warnings produced while normalizing the impairment block in place.
    pub fn validate(&mut self) -> Result<(Encapsulation, Vec<String>), CoreError> {
        if self.name.is_empty() {
            return Err(CoreError::Validation("profile name must not be empty".into()));
        }
        if self.src_port.is_empty() || self.dst_port.is_empty() {
            return Err(CoreError::Validation(format!(
                "profile {}: src_port and dst_port must be set",
                self.name
            )));
        }
        if !(config::MIN_FRAME_SIZE..=config::MAX_FRAME_SIZE).contains(&self.frame_size) {
            return Err(CoreError::Validation(format!(
                "profile {}: frame_size {} outside {}..={}",
                self.name,
                self.frame_size,
                config::MIN_FRAME_SIZE,
                config::MAX_FRAME_SIZE
            )));
        }
        if self.dscp > 63 {
            return Err(CoreError::Validation(format!(
                "profile {}: dscp {} outside 0..=63",
                self.name, self.dscp
            )));
        }
        if !self.bandwidth_mbps.is_finite() || self.bandwidth_mbps < 0.0 {
            return Err(CoreError::Validation(format!(
                "profile {}: bandwidth_mbps {} must be a non-negative number",
                self.name, self.bandwidth_mbps
            )));
        }

        let encap = self.encapsulation()?;
        let warnings = self.impairments.normalize();
        Ok((encap, warnings))
    }

    /// Resolve the protocol tag plus optional fields into a validated
    /// `Encapsulation`.
    pub fn encapsulation(&self) -> Result<Encapsulation, CoreError> {
        let missing = |what: &str| {
            CoreError::Validation(format!(
                "profile {}: protocol {} requires {what}",
                self.name, self.protocol
            ))
        };
        let encap = match self.protocol {
            ProtocolTag::Ipv4 => Encapsulation::Ipv4,
            ProtocolTag::Ipv6 => Encapsulation::Ipv6,
            ProtocolTag::Mpls => {
                let label = self.mpls_label.ok_or_else(|| missing("mpls_label"))?;
                if label >= 1 << 20 {
                    return Err(CoreError::Validation(format!(
                        "profile {}: mpls_label {label} exceeds 20 bits",
                        self.name
                    )));
                }
                Encapsulation::Mpls { label }
            }
            ProtocolTag::Vxlan => {
                let vni = self.vxlan_vni.ok_or_else(|| missing("vxlan_vni"))?;
                if vni >= 1 << 24 {
                    return Err(CoreError::Validation(format!(
                        "profile {}: vxlan_vni {vni} exceeds 24 bits",
                        self.name
                    )));
                }
                Encapsulation::Vxlan { vni }
            }
            ProtocolTag::Qinq => {
                let outer = self.outer_vlan.ok_or_else(|| missing("outer_vlan"))?;
                let inner = self.inner_vlan.ok_or_else(|| missing("inner_vlan"))?;
                for vid in [outer, inner] {
                    if vid == 0 || vid >= 4095 {
                        return Err(CoreError::Validation(format!(
                            "profile {}: VLAN id {vid} outside 1..=4094",
                            self.name
                        )));
                    }
                }
                Encapsulation::Qinq { outer_vid: outer, inner_vid: inner }
            }
            ProtocolTag::UdpFlood => Encapsulation::UdpFlood,
            ProtocolTag::TcpSynFlood => Encapsulation::TcpSynFlood,
            ProtocolTag::HttpFlood => Encapsulation::HttpFlood,
            ProtocolTag::DnsAmp => Encapsulation::DnsAmp,
        };
        if matches!(encap, Encapsulation::Ipv6) != self.dst_addr.is_ipv6() {
            return Err(CoreError::Validation(format!(
                "profile {}: dst_addr {} does not match protocol {}",
                self.name, self.dst_addr, self.protocol
            )));
        }
        Ok(encap)
    }
}

/// Partial update to a profile descriptor. Absent fields stay unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProfilePatch {
    pub src_port: Option<String>,
    pub dst_port: Option<String>,
    pub dst_addr: Option<IpAddr>,
    pub l4_dst_port: Option<u16>,
    pub l4_src_port: Option<u16>,
    pub protocol: Option<ProtocolTag>,
    pub mpls_label: Option<u32>,
    pub vxlan_vni: Option<u32>,
    pub outer_vlan: Option<u16>,
    pub inner_vlan: Option<u16>,
    pub bandwidth_mbps: Option<f64>,
    pub frame_size: Option<usize>,
    pub dscp: Option<u8>,
    pub impairments: Option<Impairments>,
}

impl ProfilePatch {
    /// True when the patch only touches fields that may change while the
    /// profile is running (bandwidth, frame size, impairment block).
    pub fn is_hot(&self) -> bool {
        self.src_port.is_none()
            && self.dst_port.is_none()
            && self.dst_addr.is_none()
            && self.l4_dst_port.is_none()
            && self.l4_src_port.is_none()
            && self.protocol.is_none()
            && self.mpls_label.is_none()
            && self.vxlan_vni.is_none()
            && self.outer_vlan.is_none()
            && self.inner_vlan.is_none()
    }

    /// Apply the patch to a descriptor copy.
    pub fn apply(&self, cfg: &mut ProfileConfig) {
        macro_rules! set {
            ($field:ident) => {
                if let Some(v) = self.$field.clone() {
                    cfg.$field = v;
                }
            };
        }
        set!(src_port);
        set!(dst_port);
        set!(dst_addr);
        set!(l4_dst_port);
        set!(protocol);
        set!(bandwidth_mbps);
        set!(frame_size);
        set!(dscp);
        set!(impairments);
        if self.l4_src_port.is_some() {
            cfg.l4_src_port = self.l4_src_port;
        }
        if self.mpls_label.is_some() {
            cfg.mpls_label = self.mpls_label;
        }
        if self.vxlan_vni.is_some() {
            cfg.vxlan_vni = self.vxlan_vni;
        }
        if self.outer_vlan.is_some() {
            cfg.outer_vlan = self.outer_vlan;
        }
        if self.inner_vlan.is_some() {
            cfg.inner_vlan = self.inner_vlan;
        }
    }
}

/// Profile runner state as surfaced to the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "state", content = "cause")]
pub enum RunState {
    Idle,
    Starting,
    Running,
    Updating,
    Stopping,
    Failed(String),
}

impl RunState {
    pub fn is_active(&self) -> bool {
        matches!(self, RunState::Starting | RunState::Running | RunState::Updating)
    }

    /// A profile may only be removed from these states.
    pub fn is_removable(&self) -> bool {
        matches!(self, RunState::Idle | RunState::Failed(_))
    }
}

/// One kernel ARP/NDP table entry witnessed on a port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArpEntry {
    pub ip: IpAddr,
    pub mac: Mac,
    pub state: String,
}

/// One LLDP neighbor reported by the host LLDP daemon.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LldpEntry {
    pub chassis_id: String,
    pub port_id: String,
    pub system_name: String,
    pub system_description: String,
    pub ttl: u32,
}

/// Kernel link state of a port.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkInfo {
    pub up: bool,
    pub speed_mbps: u64,
    pub duplex: String,
}

/// Per-port neighbor cache, replaced atomically on every scan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NeighborCache {
    pub arp: Vec<ArpEntry>,
    pub lldp: Vec<LldpEntry>,
    pub link: LinkInfo,
    /// Monotonic microseconds of the last completed scan.
    pub scanned_micros: u64,
}

impl NeighborCache {
    /// MAC a given destination address resolves to, if witnessed.
    pub fn lookup_mac(&self, ip: &IpAddr) -> Option<Mac> {
        self.arp.iter().find(|e| &e.ip == ip).map(|e| e.mac)
    }
}

/// 32-bit FNV-1a, used for the payload signature profile id.
pub fn fnv1a32(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for b in data {
        hash ^= u32::from(*b);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}
