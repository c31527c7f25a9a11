//! Port and profile registry: the single source of truth for descriptors
//! and live counter snapshots.
//!
//! Ports live in a `DashMap` for lock-free reads; each entry owns its
//! atomic counters and a swap-on-update neighbor cache. Profiles sit
//! behind one mutex so every mutation is serialized through a single
//! writer path; readers always get copy-on-read snapshots and never
//! observe partial updates.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::clock;
use crate::error::CoreError;
use crate::frame;
use crate::model::{
    Mac, NeighborCache, PortCounterSnapshot, PortCounters, PortInfo, ProfileConfig,
    ProfileCounterSnapshot, ProfileCounters, ProfilePatch, RunState,
};

/// One registered port. Created at startup, never destroyed.
pub struct PortEntry {
    pub info: PortInfo,
    /// Kernel link state, maintained by the neighbor prober and read by
    /// the transmitter on every send.
    pub link_up: Arc<AtomicBool>,
    pub counters: Arc<PortCounters>,
    neighbors: Mutex<Arc<NeighborCache>>,
}

impl PortEntry {
    pub fn new(info: PortInfo) -> Self {
        PortEntry {
            info,
            link_up: Arc::new(AtomicBool::new(true)),
            counters: Arc::new(PortCounters::default()),
            neighbors: Mutex::new(Arc::new(NeighborCache::default())),
        }
    }

    /// Current neighbor cache (cheap Arc clone).
    pub fn neighbors(&self) -> Arc<NeighborCache> {
        Arc::clone(&self.neighbors.lock().unwrap())
    }

    /// Atomically replace the neighbor cache and track link state.
    pub fn set_neighbors(&self, cache: NeighborCache) {
        self.link_up.store(cache.link.up, Ordering::Release);
        *self.neighbors.lock().unwrap() = Arc::new(cache);
    }

    /// ARP/NDP lookup used by frame builders; never blocks.
    pub fn neighbor_mac(&self, ip: &std::net::IpAddr) -> Option<Mac> {
        self.neighbors().lookup_mac(ip)
    }

    pub fn is_ready(&self) -> bool {
        self.link_up.load(Ordering::Acquire)
    }
}

struct ProfileEntry {
    cfg: ProfileConfig,
    state: RunState,
    counters: Arc<ProfileCounters>,
}

/// External view of one port.
#[derive(Debug, Clone, Serialize)]
pub struct PortSnapshot {
    #[serde(flatten)]
    pub info: PortInfo,
    pub ready: bool,
    pub counters: PortCounterSnapshot,
    pub neighbors: NeighborCache,
}

/// External view of one profile.
#[derive(Debug, Clone, Serialize)]
pub struct ProfileSnapshot {
    #[serde(flatten)]
    pub config: ProfileConfig,
    #[serde(flatten)]
    pub state: RunState,
    pub counters: ProfileCounterSnapshot,
}

/// All counters under a single consistent timestamp.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub timestamp_micros: u64,
    pub ports: Vec<PortStats>,
    pub profiles: Vec<ProfileStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PortStats {
    pub name: String,
    #[serde(flatten)]
    pub counters: PortCounterSnapshot,
    /// TX rates over the window since the previous stats snapshot.
    pub tx_fps: f64,
    pub tx_mbps: f64,
}

/// Counter baseline from the previous snapshot, for rate estimation.
#[derive(Debug, Clone, Copy)]
struct RateBaseline {
    micros: u64,
    frames: u64,
    bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProfileStats {
    pub name: String,
    #[serde(flatten)]
    pub counters: ProfileCounterSnapshot,
}

/// Which counters `reset_stats` zeroes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StatsScope {
    #[default]
    All,
    Ports,
    Profiles,
}

/// Outcome of a profile mutation, for the control adapter to act on.
#[derive(Debug)]
pub struct UpdateOutcome {
    pub config: ProfileConfig,
    pub warnings: Vec<String>,
    /// True when the profile is currently running and the change must be
    /// hot-applied to its runner.
    pub hot_running: bool,
}

#[derive(Default)]
pub struct Registry {
    ports: DashMap<String, Arc<PortEntry>>,
    profiles: Mutex<HashMap<String, ProfileEntry>>,
    rate_baselines: Mutex<HashMap<String, RateBaseline>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- ports ----

    /// Publish a port discovered at startup.
    pub fn add_port(&self, info: PortInfo) -> Arc<PortEntry> {
        let name = info.name.clone();
        let entry = Arc::new(PortEntry::new(info));
        self.ports.insert(name, Arc::clone(&entry));
        entry
    }

    pub fn get_port(&self, name: &str) -> Option<Arc<PortEntry>> {
        self.ports.get(name).map(|e| Arc::clone(&e))
    }

    pub fn port_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.ports.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn list_ports(&self) -> Vec<PortSnapshot> {
        let mut out: Vec<PortSnapshot> = self
            .ports
            .iter()
            .map(|e| PortSnapshot {
                info: e.info.clone(),
                ready: e.is_ready(),
                counters: e.counters.snapshot(),
                neighbors: (*e.neighbors()).clone(),
            })
            .collect();
        out.sort_by(|a, b| a.info.name.cmp(&b.info.name));
        out
    }

    // ---- profiles ----

    /// Insert a new profile. Fails on duplicate name or invalid descriptor.
    pub fn create_profile(&self, mut cfg: ProfileConfig) -> Result<Vec<String>, CoreError> {
        let (_, warnings) = cfg.validate()?;
        let min = frame::min_frame_size(&cfg)?;
        if cfg.frame_size < min {
            return Err(CoreError::Validation(format!(
                "profile {}: frame_size {} below {} minimum {min}",
                cfg.name, cfg.frame_size, cfg.protocol
            )));
        }

        let mut profiles = self.profiles.lock().unwrap();
        if profiles.contains_key(&cfg.name) {
            return Err(CoreError::Duplicate(format!("profile {} already exists", cfg.name)));
        }
        for warning in &warnings {
            tracing::warn!("profile {}: {warning}", cfg.name);
        }
        profiles.insert(
            cfg.name.clone(),
            ProfileEntry {
                cfg,
                state: RunState::Idle,
                counters: Arc::new(ProfileCounters::default()),
            },
        );
        Ok(warnings)
    }

    /// Apply a partial update. While the profile runs, only the hot fields
    /// (bandwidth, frame size, impairments) may change.
    pub fn update_profile(&self, name: &str, patch: &ProfilePatch) -> Result<UpdateOutcome, CoreError> {
        let mut profiles = self.profiles.lock().unwrap();
        let entry = profiles
            .get_mut(name)
            .ok_or_else(|| CoreError::NotFound(format!("profile {name} not found")))?;

        let running = entry.state.is_active();
        if running && !patch.is_hot() {
            return Err(CoreError::ImmutableWhileRunning(format!(
                "profile {name} is running; only bandwidth, frame size, and impairments may change"
            )));
        }

        let mut updated = entry.cfg.clone();
        patch.apply(&mut updated);
        let (_, warnings) = updated.validate()?;
        let min = frame::min_frame_size(&updated)?;
        if updated.frame_size < min {
            return Err(CoreError::Validation(format!(
                "profile {name}: frame_size {} below {} minimum {min}",
                updated.frame_size, updated.protocol
            )));
        }

        entry.cfg = updated.clone();
        Ok(UpdateOutcome { config: updated, warnings, hot_running: running })
    }

    /// Remove a profile. The caller has already driven it to a removable
    /// state.
    pub fn delete_profile(&self, name: &str) -> Result<(), CoreError> {
        let mut profiles = self.profiles.lock().unwrap();
        match profiles.get(name) {
            None => return Err(CoreError::NotFound(format!("profile {name} not found"))),
            Some(entry) if !entry.state.is_removable() => {
                return Err(CoreError::Validation(format!(
                    "profile {name} is {:?}; disable it before deleting",
                    entry.state
                )))
            }
            Some(_) => {}
        }
        profiles.remove(name);
        Ok(())
    }

    pub fn get_profile(&self, name: &str) -> Option<ProfileConfig> {
        self.profiles.lock().unwrap().get(name).map(|e| e.cfg.clone())
    }

    pub fn profile_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.profiles.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn list_profiles(&self) -> Vec<ProfileSnapshot> {
        let profiles = self.profiles.lock().unwrap();
        let mut out: Vec<ProfileSnapshot> = profiles
            .values()
            .map(|e| ProfileSnapshot {
                config: e.cfg.clone(),
                state: e.state.clone(),
                counters: e.counters.snapshot(),
            })
            .collect();
        out.sort_by(|a, b| a.config.name.cmp(&b.config.name));
        out
    }

    pub fn profile_state(&self, name: &str) -> Option<RunState> {
        self.profiles.lock().unwrap().get(name).map(|e| e.state.clone())
    }

    pub fn set_profile_state(&self, name: &str, state: RunState) {
        if let Some(entry) = self.profiles.lock().unwrap().get_mut(name) {
            tracing::debug!("profile {name}: {:?} → {:?}", entry.state, state);
            entry.state = state;
        }
    }

    /// Persisted desired state, flipped by enable/disable.
    pub fn set_profile_enabled(&self, name: &str, enabled: bool) {
        if let Some(entry) = self.profiles.lock().unwrap().get_mut(name) {
            entry.cfg.enabled = enabled;
        }
    }

    pub fn profile_counters(&self, name: &str) -> Option<Arc<ProfileCounters>> {
        self.profiles.lock().unwrap().get(name).map(|e| Arc::clone(&e.counters))
    }

    // ---- stats ----

    /// Copy of every counter under one timestamp. Per-port TX rates are
    /// estimated over the window since the previous snapshot.
    pub fn snapshot_stats(&self) -> StatsSnapshot {
        let timestamp_micros = clock::mono_micros();
        let mut baselines = self.rate_baselines.lock().unwrap();
        let mut ports: Vec<PortStats> = self
            .ports
            .iter()
            .map(|e| {
                let counters = e.counters.snapshot();
                let (tx_fps, tx_mbps) = match baselines.get(e.key()) {
                    Some(base) if timestamp_micros > base.micros => {
                        let dt = (timestamp_micros - base.micros) as f64 / 1e6;
                        (
                            counters.frames.saturating_sub(base.frames) as f64 / dt,
                            counters.bytes.saturating_sub(base.bytes) as f64 * 8.0 / dt / 1e6,
                        )
                    }
                    _ => (0.0, 0.0),
                };
                baselines.insert(
                    e.key().clone(),
                    RateBaseline {
                        micros: timestamp_micros,
                        frames: counters.frames,
                        bytes: counters.bytes,
                    },
                );
                PortStats { name: e.key().clone(), counters, tx_fps, tx_mbps }
            })
            .collect();
        drop(baselines);
        ports.sort_by(|a, b| a.name.cmp(&b.name));

        let profiles_guard = self.profiles.lock().unwrap();
        let mut profiles: Vec<ProfileStats> = profiles_guard
            .iter()
            .map(|(name, e)| ProfileStats { name: name.clone(), counters: e.counters.snapshot() })
            .collect();
        profiles.sort_by(|a, b| a.name.cmp(&b.name));

        StatsSnapshot { timestamp_micros, ports, profiles }
    }

    /// Zero counters in the given scope.
    pub fn reset_stats(&self, scope: StatsScope) {
        if matches!(scope, StatsScope::All | StatsScope::Ports) {
            for entry in self.ports.iter() {
                entry.counters.reset();
            }
        }
        if matches!(scope, StatsScope::All | StatsScope::Profiles) {
            for entry in self.profiles.lock().unwrap().values() {
                entry.counters.reset();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Impairments, PortCapabilities, PortType, ProtocolTag};

    fn port_info(name: &str) -> PortInfo {
        PortInfo {
            name: name.into(),
            mac: Mac([0x02, 0, 0, 0, 0, 1]),
            ipv4: Some("10.0.0.1".parse().unwrap()),
            ipv4_prefix: Some(24),
            ipv6: None,
            ipv6_prefix: None,
            speed_mbps: 1000,
            port_type: PortType::Copper,
            capabilities: PortCapabilities::default(),
            mtu: 1500,
        }
    }

    fn profile(name: &str) -> ProfileConfig {
        ProfileConfig {
            name: name.into(),
            src_port: "eth0".into(),
            dst_port: "eth1".into(),
            dst_addr: "10.0.0.2".parse().unwrap(),
            l4_dst_port: 9999,
            l4_src_port: None,
            protocol: ProtocolTag::Ipv4,
            mpls_label: None,
            vxlan_vni: None,
            outer_vlan: None,
            inner_vlan: None,
            bandwidth_mbps: 100.0,
            frame_size: 1500,
            dscp: 0,
            impairments: Impairments::default(),
            enabled: false,
        }
    }

    #[test]
    fn test_create_and_get_profile_roundtrip() {
        let reg = Registry::new();
        let cfg = profile("p1");
        reg.create_profile(cfg.clone()).unwrap();
        let got = reg.get_profile("p1").unwrap();
        assert_eq!(got, cfg, "descriptor survives create/get unchanged");
        assert_eq!(reg.profile_state("p1"), Some(RunState::Idle));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let reg = Registry::new();
        reg.create_profile(profile("p1")).unwrap();
        let err = reg.create_profile(profile("p1")).unwrap_err();
        assert_eq!(err.kind(), "Duplicate");
    }

    #[test]
    fn test_create_rejects_frame_below_encap_minimum() {
        let reg = Registry::new();
        let mut cfg = profile("vx");
        cfg.protocol = ProtocolTag::Vxlan;
        cfg.vxlan_vni = Some(5000);
        cfg.frame_size = 100; // vxlan minimum is 108
        let err = reg.create_profile(cfg).unwrap_err();
        assert_eq!(err.kind(), "Validation");
    }

    #[test]
    fn test_create_clamps_impairment_sum_with_warning() {
        let reg = Registry::new();
        let mut cfg = profile("lossy");
        cfg.impairments.loss_percent = 80.0;
        cfg.impairments.duplicate_percent = 50.0;
        let warnings = reg.create_profile(cfg).unwrap();
        assert!(!warnings.is_empty());
        let stored = reg.get_profile("lossy").unwrap();
        assert_eq!(stored.impairments.duplicate_percent, 20.0);
    }

    #[test]
    fn test_update_while_running_rejects_cold_fields() {
        let reg = Registry::new();
        reg.create_profile(profile("p1")).unwrap();
        reg.set_profile_state("p1", RunState::Running);

        let cold = ProfilePatch { dst_port: Some("eth9".into()), ..Default::default() };
        let err = reg.update_profile("p1", &cold).unwrap_err();
        assert_eq!(err.kind(), "ImmutableWhileRunning");

        let hot = ProfilePatch { bandwidth_mbps: Some(500.0), ..Default::default() };
        let outcome = reg.update_profile("p1", &hot).unwrap();
        assert!(outcome.hot_running);
        assert_eq!(outcome.config.bandwidth_mbps, 500.0);
    }

    #[test]
    fn test_update_cold_fields_when_idle() {
        let reg = Registry::new();
        reg.create_profile(profile("p1")).unwrap();
        let patch = ProfilePatch { dst_port: Some("eth2".into()), ..Default::default() };
        let outcome = reg.update_profile("p1", &patch).unwrap();
        assert!(!outcome.hot_running);
        assert_eq!(reg.get_profile("p1").unwrap().dst_port, "eth2");
    }

    #[test]
    fn test_update_unknown_profile_not_found() {
        let reg = Registry::new();
        let err = reg
            .update_profile("ghost", &ProfilePatch::default())
            .unwrap_err();
        assert_eq!(err.kind(), "NotFound");
    }

    #[test]
    fn test_delete_requires_removable_state() {
        let reg = Registry::new();
        reg.create_profile(profile("p1")).unwrap();
        reg.set_profile_state("p1", RunState::Running);
        assert!(reg.delete_profile("p1").is_err());

        reg.set_profile_state("p1", RunState::Idle);
        reg.delete_profile("p1").unwrap();
        assert!(reg.get_profile("p1").is_none());

        assert_eq!(reg.delete_profile("p1").unwrap_err().kind(), "NotFound");
    }

    #[test]
    fn test_delete_allowed_from_failed() {
        let reg = Registry::new();
        reg.create_profile(profile("p1")).unwrap();
        reg.set_profile_state("p1", RunState::Failed("no such port".into()));
        reg.delete_profile("p1").unwrap();
    }

    #[test]
    fn test_ports_listed_sorted_with_state() {
        let reg = Registry::new();
        reg.add_port(port_info("eth1"));
        reg.add_port(port_info("eth0"));
        let ports = reg.list_ports();
        assert_eq!(ports.len(), 2);
        assert_eq!(ports[0].info.name, "eth0");
        assert!(ports[0].ready, "ports start ready");
    }

    #[test]
    fn test_neighbor_cache_swap() {
        let reg = Registry::new();
        let port = reg.add_port(port_info("eth0"));
        let ip: std::net::IpAddr = "10.0.0.2".parse().unwrap();
        assert_eq!(port.neighbor_mac(&ip), None);

        let mac = Mac([0x02, 0, 0, 0, 0, 9]);
        port.set_neighbors(NeighborCache {
            arp: vec![crate::model::ArpEntry { ip, mac, state: "REACHABLE".into() }],
            link: crate::model::LinkInfo { up: true, speed_mbps: 1000, duplex: "full".into() },
            ..Default::default()
        });
        assert_eq!(port.neighbor_mac(&ip), Some(mac));
    }

    #[test]
    fn test_link_down_cache_marks_port_unready() {
        let reg = Registry::new();
        let port = reg.add_port(port_info("eth0"));
        port.set_neighbors(NeighborCache {
            link: crate::model::LinkInfo { up: false, ..Default::default() },
            ..Default::default()
        });
        assert!(!port.is_ready());
    }

    #[test]
    fn test_snapshot_stats_consistent_shape() {
        let reg = Registry::new();
        let port = reg.add_port(port_info("eth0"));
        reg.create_profile(profile("p1")).unwrap();
        port.counters.frames.fetch_add(5, Ordering::AcqRel);

        let snap = reg.snapshot_stats();
        assert_eq!(snap.ports.len(), 1);
        assert_eq!(snap.profiles.len(), 1);
        assert_eq!(snap.ports[0].counters.frames, 5);
    }

    #[test]
    fn test_reset_stats_scopes() {
        let reg = Registry::new();
        let port = reg.add_port(port_info("eth0"));
        reg.create_profile(profile("p1")).unwrap();
        port.counters.frames.fetch_add(5, Ordering::AcqRel);
        let counters = reg.profile_counters("p1").unwrap();
        counters.frames_sent.fetch_add(7, Ordering::AcqRel);

        reg.reset_stats(StatsScope::Ports);
        assert_eq!(reg.snapshot_stats().ports[0].counters.frames, 0);
        assert_eq!(
            reg.snapshot_stats().profiles[0].counters.frames_sent,
            7,
            "profile scope untouched"
        );

        reg.reset_stats(StatsScope::All);
        assert_eq!(reg.snapshot_stats().profiles[0].counters.frames_sent, 0);
    }

    #[test]
    fn test_snapshot_rate_estimation_window() {
        let reg = Registry::new();
        let port = reg.add_port(port_info("eth0"));

        // First snapshot establishes the baseline: no rate yet.
        let first = reg.snapshot_stats();
        assert_eq!(first.ports[0].tx_fps, 0.0);

        port.counters.frames.fetch_add(100, Ordering::AcqRel);
        port.counters.bytes.fetch_add(100 * 1500, Ordering::AcqRel);
        std::thread::sleep(std::time::Duration::from_millis(20));

        let second = reg.snapshot_stats();
        assert!(second.ports[0].tx_fps > 0.0, "delta over the window yields a rate");
        assert!(second.ports[0].tx_mbps > 0.0);

        // No further traffic: the next window reads zero again.
        std::thread::sleep(std::time::Duration::from_millis(5));
        let third = reg.snapshot_stats();
        assert_eq!(third.ports[0].tx_fps, 0.0);
    }

    #[test]
    fn test_counter_reset_isolation_between_profiles() {
        let reg = Registry::new();
        reg.create_profile(profile("p1")).unwrap();
        reg.create_profile(profile("p2")).unwrap();
        reg.profile_counters("p1").unwrap().frames_sent.fetch_add(3, Ordering::AcqRel);
        reg.profile_counters("p2").unwrap().frames_sent.fetch_add(9, Ordering::AcqRel);

        // Only p1 resets (as a runner does on re-enable).
        reg.profile_counters("p1").unwrap().reset();
        let profiles = reg.list_profiles();
        assert_eq!(profiles[0].counters.frames_sent, 0);
        assert_eq!(profiles[1].counters.frames_sent, 9, "p2 unaffected");
    }
}
