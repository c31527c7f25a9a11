//! Control Adapter: the one point where external requests cross into the
//! core.
//!
//! An HTTP layer (an external collaborator) maps its endpoints one-to-one
//! onto [`Command`] values; the adapter validates, translates into
//! registry mutations and runner lifecycle events, and returns a
//! structured [`Reply`] that serializes to the wire bodies. Every command
//! runs under a five-second deadline. Registry mutations are applied
//! synchronously under the writer lock, so a deadline can only strike
//! between mutations, never inside one.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::bench::{BenchDriver, BenchPlan, BenchResults};
use crate::config;
use crate::engine::Engine;
use crate::error::CoreError;
use crate::model::{ProfileConfig, ProfilePatch, RunState};
use crate::persist::{ConfigStore, PersistedConfig};
use crate::probe::Prober;
use crate::registry::{PortSnapshot, ProfileSnapshot, Registry, StatsScope, StatsSnapshot};

/// Every request the control surface can make.
#[derive(Debug, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    ListPorts,
    ListProfiles,
    CreateProfile { profile: ProfileConfig },
    UpdateProfile { name: String, #[serde(flatten)] patch: ProfilePatch },
    DeleteProfile { name: String },
    EnableProfile { name: String },
    DisableProfile { name: String },
    StartAll,
    StopAll,
    GetStats,
    ResetStats { #[serde(default)] scope: StatsScope },
    DiscoverNeighbors { #[serde(default)] interfaces: Option<Vec<String>> },
    Rfc2544Start { profile: String, #[serde(default)] tests: BenchPlan },
    Rfc2544Status { profile: String },
}

/// Structured command results; serializes to the control-surface bodies.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum Reply {
    Ports { ports: Vec<PortSnapshot> },
    Profiles { profiles: Vec<ProfileSnapshot> },
    Accepted { name: String, warnings: Vec<String> },
    Stats(StatsSnapshot),
    Bulk { failures: Vec<CommandFailure> },
    Bench(Box<BenchResults>),
    Ok {},
}

#[derive(Debug, Serialize)]
pub struct CommandFailure {
    pub name: String,
    pub error: CoreError,
}

/// Thin boundary over the core's moving parts.
#[derive(Clone)]
pub struct ControlAdapter {
    registry: Arc<Registry>,
    engine: Arc<Engine>,
    prober: Arc<Prober>,
    bench: Arc<BenchDriver>,
    store: Option<Arc<ConfigStore>>,
}

impl ControlAdapter {
    pub fn new(
        registry: Arc<Registry>,
        engine: Arc<Engine>,
        prober: Arc<Prober>,
        bench: Arc<BenchDriver>,
        store: Option<Arc<ConfigStore>>,
    ) -> Self {
        ControlAdapter { registry, engine, prober, bench, store }
    }

    /// Run one command under the control deadline.
    pub async fn execute(&self, command: Command) -> Result<Reply, CoreError> {
        match tokio::time::timeout(config::CONTROL_DEADLINE, self.dispatch(command)).await {
            Ok(result) => result,
            Err(_) => Err(CoreError::Timeout(format!(
                "command exceeded the {:?} deadline",
                config::CONTROL_DEADLINE
            ))),
        }
    }

    async fn dispatch(&self, command: Command) -> Result<Reply, CoreError> {
        match command {
            Command::ListPorts => Ok(Reply::Ports { ports: self.registry.list_ports() }),
            Command::ListProfiles => {
                Ok(Reply::Profiles { profiles: self.registry.list_profiles() })
            }
            Command::CreateProfile { profile } => self.create_profile(profile),
            Command::UpdateProfile { name, patch } => self.update_profile(&name, patch).await,
            Command::DeleteProfile { name } => self.delete_profile(&name).await,
            Command::EnableProfile { name } => self.enable_profile(&name).await,
            Command::DisableProfile { name } => self.disable_profile(&name).await,
            Command::StartAll => {
                let failures = self.engine.start_all().await;
                Ok(Reply::Bulk {
                    failures: failures
                        .into_iter()
                        .map(|(name, error)| CommandFailure { name, error })
                        .collect(),
                })
            }
            Command::StopAll => {
                self.engine.stop_all().await;
                Ok(Reply::Ok {})
            }
            Command::GetStats => Ok(Reply::Stats(self.registry.snapshot_stats())),
            Command::ResetStats { scope } => {
                self.registry.reset_stats(scope);
                Ok(Reply::Ok {})
            }
            Command::DiscoverNeighbors { interfaces } => {
                self.prober.discover(interfaces.as_deref()).await?;
                let mut ports = self.registry.list_ports();
                if let Some(wanted) = interfaces {
                    ports.retain(|p| wanted.contains(&p.info.name));
                }
                Ok(Reply::Ports { ports })
            }
            Command::Rfc2544Start { profile, tests } => {
                self.bench.start(&profile, tests)?;
                Ok(Reply::Accepted { name: profile, warnings: Vec::new() })
            }
            Command::Rfc2544Status { profile } => {
                Ok(Reply::Bench(Box::new(self.bench.status(&profile)?)))
            }
        }
    }

    fn create_profile(&self, profile: ProfileConfig) -> Result<Reply, CoreError> {
        let name = profile.name.clone();
        let warnings = self.registry.create_profile(profile)?;
        self.persist();
        Ok(Reply::Accepted { name, warnings })
    }

    async fn update_profile(&self, name: &str, patch: ProfilePatch) -> Result<Reply, CoreError> {
        let outcome = self.registry.update_profile(name, &patch)?;
        if outcome.hot_running {
            self.engine.apply_hot(name, &outcome.config).await;
        }
        self.persist();
        Ok(Reply::Accepted { name: name.to_string(), warnings: outcome.warnings })
    }

    async fn delete_profile(&self, name: &str) -> Result<Reply, CoreError> {
        // Disable first when needed, then remove.
        if self
            .registry
            .profile_state(name)
            .is_some_and(|s| s.is_active())
        {
            self.engine.disable(name).await?;
        }
        self.registry.delete_profile(name)?;
        self.persist();
        Ok(Reply::Ok {})
    }

    async fn enable_profile(&self, name: &str) -> Result<Reply, CoreError> {
        self.engine.enable(name).await?;
        self.registry.set_profile_enabled(name, true);
        self.persist();
        Ok(Reply::Ok {})
    }

    async fn disable_profile(&self, name: &str) -> Result<Reply, CoreError> {
        self.engine.disable(name).await?;
        self.registry.set_profile_enabled(name, false);
        self.persist();
        Ok(Reply::Ok {})
    }

    /// Rewrite the configuration file after a successful mutation. A
    /// persistence failure is logged, not surfaced: the in-memory registry
    /// already holds the committed state.
    fn persist(&self) {
        let Some(store) = &self.store else { return };
        let profiles = self
            .registry
            .list_profiles()
            .into_iter()
            .map(|snap| snap.config)
            .collect();
        if let Err(e) = store.save(&PersistedConfig { profiles }) {
            tracing::warn!("failed to persist configuration: {e:#}");
        }
    }

    /// Recreate profiles from a persisted configuration at startup,
    /// then bring up the ones that were enabled.
    pub async fn restore(&self, persisted: PersistedConfig) {
        for profile in persisted.profiles {
            let name = profile.name.clone();
            let enabled = profile.enabled;
            if let Err(e) = self.registry.create_profile(profile) {
                tracing::warn!("skipping persisted profile {name}: {e}");
                continue;
            }
            if enabled {
                self.registry.set_profile_enabled(&name, true);
                if let Err(e) = self.engine.enable(&name).await {
                    tracing::warn!("persisted profile {name} failed to start: {e}");
                }
            }
        }
    }

    /// Used by the core's shutdown path: stop traffic without touching the
    /// persisted desired state.
    pub async fn quiesce(&self) {
        self.bench.cancel_all();
        self.engine.stop_all().await;
    }

    pub fn profile_state(&self, name: &str) -> Option<RunState> {
        self.registry.profile_state(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Impairments, Mac, PortCapabilities, PortInfo, PortType, ProtocolTag};
    use crate::transmit::endpoint::{MemoryEndpoint, RawEndpoint};
    use crate::transmit::Transmitter;
    use dashmap::DashMap;
    use std::time::Duration;

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
            mtu: 9000,
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
            bandwidth_mbps: 8.0,
            frame_size: 1000,
            dscp: 0,
            impairments: Impairments::default(),
            enabled: false,
        }
    }

    fn adapter() -> (ControlAdapter, MemoryEndpoint) {
        let registry = Arc::new(Registry::new());
        let eth0 = registry.add_port(port_info("eth0"));
        registry.add_port(port_info("eth1"));

        let wire = MemoryEndpoint::new();
        let transmitters = Arc::new(DashMap::new());
        transmitters.insert(
            "eth0".to_string(),
            Transmitter::spawn(
                "eth0",
                Arc::new(wire.clone()),
                Arc::clone(&eth0.counters),
                Arc::clone(&eth0.link_up),
                9000,
            ),
        );
        let engine = Arc::new(Engine::new(Arc::clone(&registry), Arc::clone(&transmitters)));
        let prober = Arc::new(Prober::new(Arc::clone(&registry), false));
        let rx_wire = wire.clone();
        let bench = Arc::new(BenchDriver::new(
            Arc::clone(&registry),
            transmitters,
            Arc::new(move |_| Ok(Arc::new(rx_wire.peer()) as Arc<dyn RawEndpoint>)),
        ));
        (
            ControlAdapter::new(registry, engine, prober, bench, None),
            wire,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_list_delete_flow() {
        let (adapter, _wire) = adapter();
        let reply = adapter
            .execute(Command::CreateProfile { profile: profile("p1") })
            .await
            .unwrap();
        match reply {
            Reply::Accepted { name, warnings } => {
                assert_eq!(name, "p1");
                assert!(warnings.is_empty());
            }
            other => panic!("unexpected reply {other:?}"),
        }

        match adapter.execute(Command::ListProfiles).await.unwrap() {
            Reply::Profiles { profiles } => assert_eq!(profiles.len(), 1),
            other => panic!("unexpected reply {other:?}"),
        }

        adapter
            .execute(Command::DeleteProfile { name: "p1".into() })
            .await
            .unwrap();
        match adapter.execute(Command::ListProfiles).await.unwrap() {
            Reply::Profiles { profiles } => assert!(profiles.is_empty()),
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_create_fails() {
        let (adapter, _wire) = adapter();
        adapter
            .execute(Command::CreateProfile { profile: profile("p1") })
            .await
            .unwrap();
        let err = adapter
            .execute(Command::CreateProfile { profile: profile("p1") })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "Duplicate");
    }

    #[tokio::test(start_paused = true)]
    async fn test_enable_disable_lifecycle_with_traffic() {
        let (adapter, wire) = adapter();
        adapter
            .execute(Command::CreateProfile { profile: profile("p1") })
            .await
            .unwrap();
        adapter
            .execute(Command::EnableProfile { name: "p1".into() })
            .await
            .unwrap();
        assert_eq!(adapter.profile_state("p1"), Some(RunState::Running));

        tokio::time::sleep(Duration::from_millis(50)).await;
        adapter
            .execute(Command::DisableProfile { name: "p1".into() })
            .await
            .unwrap();
        assert_eq!(adapter.profile_state("p1"), Some(RunState::Idle));
        assert!(wire.sent_count() > 0, "traffic flowed while enabled");
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_running_profile_immutable_fields() {
        let (adapter, _wire) = adapter();
        adapter
            .execute(Command::CreateProfile { profile: profile("p1") })
            .await
            .unwrap();
        adapter
            .execute(Command::EnableProfile { name: "p1".into() })
            .await
            .unwrap();

        let cold = ProfilePatch { dst_port: Some("eth1".into()), ..Default::default() };
        let err = adapter
            .execute(Command::UpdateProfile { name: "p1".into(), patch: cold })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "ImmutableWhileRunning");

        let hot = ProfilePatch { bandwidth_mbps: Some(32.0), ..Default::default() };
        adapter
            .execute(Command::UpdateProfile { name: "p1".into(), patch: hot })
            .await
            .unwrap();
        adapter
            .execute(Command::DisableProfile { name: "p1".into() })
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_running_profile_disables_first() {
        let (adapter, _wire) = adapter();
        adapter
            .execute(Command::CreateProfile { profile: profile("p1") })
            .await
            .unwrap();
        adapter
            .execute(Command::EnableProfile { name: "p1".into() })
            .await
            .unwrap();
        adapter
            .execute(Command::DeleteProfile { name: "p1".into() })
            .await
            .unwrap();
        assert_eq!(adapter.profile_state("p1"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_and_reset() {
        let (adapter, _wire) = adapter();
        adapter
            .execute(Command::CreateProfile { profile: profile("p1") })
            .await
            .unwrap();
        adapter
            .execute(Command::EnableProfile { name: "p1".into() })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stats = match adapter.execute(Command::GetStats).await.unwrap() {
            Reply::Stats(s) => s,
            other => panic!("unexpected reply {other:?}"),
        };
        assert!(stats.profiles[0].counters.frames_sent > 0);
        assert!(stats.ports.iter().any(|p| p.counters.frames > 0));

        adapter
            .execute(Command::ResetStats { scope: StatsScope::All })
            .await
            .unwrap();
        let stats = match adapter.execute(Command::GetStats).await.unwrap() {
            Reply::Stats(s) => s,
            other => panic!("unexpected reply {other:?}"),
        };
        assert_eq!(stats.ports[0].counters.frames, 0);

        adapter
            .execute(Command::DisableProfile { name: "p1".into() })
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_enable_unknown_profile_not_found() {
        let (adapter, _wire) = adapter();
        let err = adapter
            .execute(Command::EnableProfile { name: "ghost".into() })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "NotFound");
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_all_reports_per_profile_failures() {
        let (adapter, _wire) = adapter();
        let mut good = profile("good");
        good.enabled = true;
        let mut bad = profile("bad");
        bad.enabled = true;
        bad.src_port = "missing0".into();
        adapter.execute(Command::CreateProfile { profile: good }).await.unwrap();
        adapter.execute(Command::CreateProfile { profile: bad }).await.unwrap();

        match adapter.execute(Command::StartAll).await.unwrap() {
            Reply::Bulk { failures } => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].name, "bad");
            }
            other => panic!("unexpected reply {other:?}"),
        }
        adapter.execute(Command::StopAll).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_recreates_enabled_profiles() {
        let (adapter, wire) = adapter();
        let mut enabled = profile("was-on");
        enabled.enabled = true;
        let disabled = profile("was-off");
        adapter
            .restore(PersistedConfig { profiles: vec![enabled, disabled] })
            .await;

        assert_eq!(adapter.profile_state("was-on"), Some(RunState::Running));
        assert_eq!(adapter.profile_state("was-off"), Some(RunState::Idle));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(wire.sent_count() > 0, "restored profile transmits");
        adapter.quiesce().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_rfc2544_start_and_status() {
        let (adapter, _wire) = adapter();
        adapter
            .execute(Command::CreateProfile { profile: profile("p1") })
            .await
            .unwrap();
        let plan = BenchPlan {
            frame_sizes: vec![512],
            trial_secs: 1,
            ..Default::default()
        };
        adapter
            .execute(Command::Rfc2544Start { profile: "p1".into(), tests: plan })
            .await
            .unwrap();
        match adapter
            .execute(Command::Rfc2544Status { profile: "p1".into() })
            .await
            .unwrap()
        {
            Reply::Bench(results) => assert_eq!(results.profile, "p1"),
            other => panic!("unexpected reply {other:?}"),
        }
    }

    // Real time: the scan shells out and reads /proc, which does not mix
    // with a paused clock.
    #[tokio::test]
    async fn test_discover_neighbors_on_fake_port() {
        let (adapter, _wire) = adapter();
        // "eth0" here is a registry port, not necessarily a host device;
        // the scan completes with whatever the kernel exposes.
        let reply = adapter
            .execute(Command::DiscoverNeighbors { interfaces: Some(vec!["eth1".into()]) })
            .await
            .unwrap();
        match reply {
            Reply::Ports { ports } => {
                assert_eq!(ports.len(), 1);
                assert_eq!(ports[0].info.name, "eth1");
                assert!(ports[0].neighbors.scanned_micros > 0 || ports[0].neighbors.arp.is_empty());
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn test_command_json_decoding() {
        let cmd: Command = serde_json::from_str(
            r#"{"command": "update_profile", "name": "p1", "bandwidth_mbps": 500}"#,
        )
        .unwrap();
        match cmd {
            Command::UpdateProfile { name, patch } => {
                assert_eq!(name, "p1");
                assert_eq!(patch.bandwidth_mbps, Some(500.0));
                assert!(patch.is_hot());
            }
            other => panic!("unexpected command {other:?}"),
        }

        let cmd: Command =
            serde_json::from_str(r#"{"command": "reset_stats"}"#).unwrap();
        assert!(matches!(cmd, Command::ResetStats { scope: StatsScope::All }));
    }

    #[test]
    fn test_reply_serialization_shapes() {
        let reply = Reply::Accepted { name: "p1".into(), warnings: vec![] };
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["name"], "p1");

        let reply = Reply::Ok {};
        assert_eq!(serde_json::to_value(&reply).unwrap(), serde_json::json!({}));
    }
}
