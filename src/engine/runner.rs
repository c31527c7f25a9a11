//! Profile runner lifecycle and the engine that owns all runners.
//!
//! One runner task per enabled profile drives the pipeline
//! pacer → builder → shaper → transmitter and reacts to hot-config and
//! stop signals. The engine resolves ports against the registry at enable
//! time, spawns and reaps runner tasks, and enforces the drain grace on
//! disable.
//!
//! State machine: idle → starting → running ⇄ updating → stopping → idle,
//! with failed reachable from starting (resolution) and running
//! (encoding). A profile is removable only from idle or failed.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::clock;
use crate::config;
use crate::error::CoreError;
use crate::frame::{FrameBuilder, MacResolver};
use crate::model::{Impairments, ProfileConfig, ProfileCounters, RunState};
use crate::registry::{PortEntry, Registry};
use crate::transmit::Transmitter;

use super::pacer::Pacer;
use super::shaper::Shaper;

/// The live-updatable slice of a profile descriptor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HotConfig {
    pub bandwidth_mbps: f64,
    pub frame_size: usize,
    pub impairments: Impairments,
}

impl From<&ProfileConfig> for HotConfig {
    fn from(cfg: &ProfileConfig) -> Self {
        HotConfig {
            bandwidth_mbps: cfg.bandwidth_mbps,
            frame_size: cfg.frame_size,
            impairments: cfg.impairments,
        }
    }
}

struct RunnerHandle {
    hot_tx: watch::Sender<HotConfig>,
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Owns every profile runner. One per core.
pub struct Engine {
    registry: Arc<Registry>,
    transmitters: Arc<DashMap<String, Transmitter>>,
    runners: tokio::sync::Mutex<HashMap<String, RunnerHandle>>,
}

impl Engine {
    pub fn new(registry: Arc<Registry>, transmitters: Arc<DashMap<String, Transmitter>>) -> Self {
        Engine {
            registry,
            transmitters,
            runners: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Enable a profile: resolve ports, build the pipeline, spawn the
    /// runner. Idempotent while the profile is active.
    pub async fn enable(&self, name: &str) -> Result<(), CoreError> {
        let cfg = self
            .registry
            .get_profile(name)
            .ok_or_else(|| CoreError::NotFound(format!("profile {name} not found")))?;

        let mut runners = self.runners.lock().await;
        if let Some(handle) = runners.get(name) {
            if self
                .registry
                .profile_state(name)
                .is_some_and(|s| s.is_active())
            {
                return Ok(());
            }
            // Stale handle from a failed run.
            handle.task.abort();
            runners.remove(name);
        }

        let encap = cfg.encapsulation()?;
        self.registry.set_profile_state(name, RunState::Starting);

        let (src, transmitter) = match self.resolve(&cfg) {
            Ok(pair) => pair,
            Err(e) => {
                self.registry
                    .set_profile_state(name, RunState::Failed(e.to_string()));
                return Err(e);
            }
        };
        let resolver = {
            let port = Arc::clone(&src);
            MacResolver::Dynamic(Arc::new(move |ip| port.neighbor_mac(ip)))
        };
        let builder = FrameBuilder::new(
            &cfg,
            encap,
            src.info.mac,
            src.info.ipv4,
            src.info.ipv6,
            resolver,
        );
        let max_frame = src.info.mtu + crate::frame::encap::ETH_HLEN + config::TX_VLAN_ALLOWANCE;
        if cfg.frame_size < builder.min_size() || cfg.frame_size > max_frame {
            let e = CoreError::Unencodable(format!(
                "profile {name}: frame_size {} outside {} bounds {}..={max_frame}",
                cfg.frame_size,
                cfg.protocol,
                builder.min_size()
            ));
            self.registry
                .set_profile_state(name, RunState::Failed(e.to_string()));
            return Err(e);
        }

        // Counters restart with every enable.
        let counters = self
            .registry
            .profile_counters(name)
            .ok_or_else(|| CoreError::NotFound(format!("profile {name} not found")))?;
        counters.reset();

        let (hot_tx, hot_rx) = watch::channel(HotConfig::from(&cfg));
        let (stop_tx, stop_rx) = watch::channel(false);
        // Seeded from the descriptor, not the clock: identical
        // configurations replay identical impairment traces.
        let seed = u64::from(builder.profile_id()) << 16 | 0x5eed;

        let ctx = PipelineCtx {
            name: name.to_string(),
            registry: Arc::clone(&self.registry),
            builder,
            transmitter,
            counters,
            seed,
        };
        // Running is published before the task spawns so a fast first-tick
        // failure is not overwritten.
        self.registry.set_profile_state(name, RunState::Running);
        let task = tokio::spawn(run_pipeline(ctx, hot_rx, stop_rx));
        runners.insert(name.to_string(), RunnerHandle { hot_tx, stop_tx, task });
        tracing::info!("profile {name} enabled");
        Ok(())
    }

    /// Disable a profile: stop the pacer, give the pipeline its drain
    /// grace, then force-drop it.
    pub async fn disable(&self, name: &str) -> Result<(), CoreError> {
        if self.registry.get_profile(name).is_none() {
            return Err(CoreError::NotFound(format!("profile {name} not found")));
        }

        let handle = self.runners.lock().await.remove(name);
        let Some(handle) = handle else {
            return Ok(()); // already idle
        };

        self.registry.set_profile_state(name, RunState::Stopping);
        let _ = handle.stop_tx.send(true);

        let grace = handle
            .hot_tx
            .borrow()
            .impairments
            .max_delay()
            .max(config::RUNNER_MIN_GRACE);
        let mut task = handle.task;
        if timeout(grace + config::RUNNER_ABORT_SLACK, &mut task).await.is_err() {
            tracing::warn!("profile {name} missed its drain grace; aborting runner");
            task.abort();
        }

        // A run that ended in failure keeps its cause visible.
        match self.registry.profile_state(name) {
            Some(RunState::Failed(_)) => {}
            _ => self.registry.set_profile_state(name, RunState::Idle),
        }
        tracing::info!("profile {name} disabled");
        Ok(())
    }

    /// Push the hot-updatable fields to a running profile. No-op when the
    /// profile is not running.
    pub async fn apply_hot(&self, name: &str, cfg: &ProfileConfig) {
        if let Some(handle) = self.runners.lock().await.get(name) {
            self.registry.set_profile_state(name, RunState::Updating);
            let _ = handle.hot_tx.send(HotConfig::from(cfg));
        }
    }

    /// Enable every profile whose desired state is enabled.
    pub async fn start_all(&self) -> Vec<(String, CoreError)> {
        let mut failures = Vec::new();
        for snap in self.registry.list_profiles() {
            if snap.config.enabled {
                if let Err(e) = self.enable(&snap.config.name).await {
                    failures.push((snap.config.name, e));
                }
            }
        }
        failures
    }

    /// Disable every active profile.
    pub async fn stop_all(&self) {
        let names: Vec<String> = self.runners.lock().await.keys().cloned().collect();
        for name in names {
            let _ = self.disable(&name).await;
        }
    }

    pub async fn active_count(&self) -> usize {
        self.runners.lock().await.len()
    }

    fn resolve(&self, cfg: &ProfileConfig) -> Result<(Arc<PortEntry>, Transmitter), CoreError> {
        let src = self.registry.get_port(&cfg.src_port).ok_or_else(|| {
            CoreError::PortUnavailable(format!(
                "profile {}: unknown source port {}",
                cfg.name, cfg.src_port
            ))
        })?;
        if self.registry.get_port(&cfg.dst_port).is_none() {
            return Err(CoreError::PortUnavailable(format!(
                "profile {}: unknown destination port {}",
                cfg.name, cfg.dst_port
            )));
        }
        let transmitter = self
            .transmitters
            .get(&cfg.src_port)
            .map(|t| t.clone())
            .ok_or_else(|| {
                CoreError::PortUnavailable(format!(
                    "profile {}: no transmitter on {}",
                    cfg.name, cfg.src_port
                ))
            })?;
        Ok((src, transmitter))
    }
}

struct PipelineCtx {
    name: String,
    registry: Arc<Registry>,
    builder: FrameBuilder,
    transmitter: Transmitter,
    counters: Arc<ProfileCounters>,
    seed: u64,
}

async fn run_pipeline(
    ctx: PipelineCtx,
    mut hot_rx: watch::Receiver<HotConfig>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let hot = *hot_rx.borrow();
    let mut pacer = Pacer::new(hot.bandwidth_mbps, hot.frame_size);
    let mut shaper = Shaper::new(hot.impairments, ctx.seed, Arc::clone(&ctx.counters));
    let mut frame_size = hot.frame_size;
    let mut seq: u32 = 0;

    loop {
        tokio::select! {
            biased;

            _ = stop_rx.changed() => break,

            res = hot_rx.changed() => {
                if res.is_err() {
                    break;
                }
                let hot = *hot_rx.borrow_and_update();
                pacer.set_rate(hot.bandwidth_mbps, hot.frame_size);
                shaper.set_impairments(hot.impairments);
                frame_size = hot.frame_size;
                ctx.registry.set_profile_state(&ctx.name, RunState::Running);
                tracing::debug!("profile {}: hot config applied", ctx.name);
            }

            tick = pacer.next_tick() => {
                let frame = match ctx.builder.build(seq, frame_size, clock::mono_micros_u32()) {
                    Ok(frame) => frame,
                    Err(e) => {
                        // Encoding failure is fatal to this run.
                        tracing::error!("profile {}: {e}", ctx.name);
                        ctx.registry.set_profile_state(&ctx.name, RunState::Failed(e.to_string()));
                        return;
                    }
                };
                let frame_len = frame.len() as u64;
                let emissions = shaper.shape(tick, frame.len());
                let mut frame = Some(frame);
                let last = emissions.len().saturating_sub(1);
                for (i, emission) in emissions.iter().enumerate() {
                    let bytes = if i == last {
                        frame.take().expect("frame consumed once")
                    } else {
                        frame.as_ref().expect("frame still present").clone()
                    };
                    // The emission counts as offered load whether or not
                    // the port accepts it; a down or saturated port shows
                    // up in the port's dropped counter instead.
                    ctx.counters.frames_sent.fetch_add(1, Ordering::AcqRel);
                    ctx.counters.bytes_sent.fetch_add(frame_len, Ordering::AcqRel);
                    ctx.counters.last_send_micros.store(clock::mono_micros(), Ordering::Release);
                    if let Err(CoreError::Overflow(msg)) = ctx.transmitter.send(bytes, emission.due) {
                        tracing::trace!("profile {}: {msg}", ctx.name);
                    }
                }
                seq = seq.wrapping_add(1);
            }
        }
    }

    // Drain: let frames already scheduled on the transmitter go out
    // before the runner reports idle.
    let grace = shaper.max_delay().max(config::RUNNER_MIN_GRACE);
    tokio::time::sleep(grace).await;
    tracing::debug!("profile {} pipeline exited after {seq} ticks", ctx.name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{extract_signature, SIGNATURE_LEN};
    use crate::model::{
        Encapsulation, Impairments, Mac, PortCapabilities, PortInfo, PortType, ProtocolTag,
    };
    use crate::transmit::endpoint::MemoryEndpoint;
    use std::time::Duration;

    fn port_info(name: &str, last: u8) -> PortInfo {
        PortInfo {
            name: name.into(),
            mac: Mac([0x02, 0, 0, 0, 0, last]),
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

    fn profile(name: &str, bandwidth_mbps: f64, frame_size: usize) -> ProfileConfig {
        ProfileConfig {
            name: name.into(),
            src_port: "eth0".into(),
            dst_port: "eth1".into(),
            dst_addr: "10.0.0.2".parse().unwrap(),
            l4_dst_port: 9999,
            l4_src_port: Some(40000),
            protocol: ProtocolTag::Ipv4,
            mpls_label: None,
            vxlan_vni: None,
            outer_vlan: None,
            inner_vlan: None,
            bandwidth_mbps,
            frame_size,
            dscp: 0,
            impairments: Impairments::default(),
            enabled: false,
        }
    }

    struct Rig {
        registry: Arc<Registry>,
        engine: Engine,
        endpoint: MemoryEndpoint,
    }

    fn rig() -> Rig {
        let registry = Arc::new(Registry::new());
        let eth0 = registry.add_port(port_info("eth0", 1));
        registry.add_port(port_info("eth1", 2));

        let endpoint = MemoryEndpoint::new();
        let transmitters = Arc::new(DashMap::new());
        transmitters.insert(
            "eth0".to_string(),
            Transmitter::spawn(
                "eth0",
                Arc::new(endpoint.clone()),
                Arc::clone(&eth0.counters),
                Arc::clone(&eth0.link_up),
                9000,
            ),
        );
        let engine = Engine::new(Arc::clone(&registry), transmitters);
        Rig { registry, engine, endpoint }
    }

    #[tokio::test(start_paused = true)]
    async fn test_enable_runs_pipeline_with_gapless_sequences() {
        let rig = rig();
        // 8 Mbps at 1000 B → 1000 fps → 1 ms per frame.
        rig.registry.create_profile(profile("p1", 8.0, 1000)).unwrap();
        rig.engine.enable("p1").await.unwrap();
        assert_eq!(rig.registry.profile_state("p1"), Some(RunState::Running));

        tokio::time::sleep(Duration::from_millis(100)).await;
        rig.engine.disable("p1").await.unwrap();

        let sent = rig.endpoint.sent();
        assert!(
            (95..=105).contains(&sent.len()),
            "expected ~100 frames, got {}",
            sent.len()
        );
        for (i, frame) in sent.iter().enumerate() {
            assert_eq!(frame.len(), 1000);
            let sig = extract_signature(frame, &Encapsulation::Ipv4).expect("signed frame");
            assert_eq!(sig.seq as usize, i, "sequence numbers are gapless");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_profile_counters_track_offered_load() {
        let rig = rig();
        rig.registry.create_profile(profile("p1", 8.0, 1000)).unwrap();
        rig.engine.enable("p1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        rig.engine.disable("p1").await.unwrap();

        let counters = rig.registry.profile_counters("p1").unwrap().snapshot();
        assert_eq!(counters.frames_sent as usize, rig.endpoint.sent_count());
        assert_eq!(counters.bytes_sent, counters.frames_sent * 1000);
        assert_eq!(counters.loss_drops, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enable_fails_on_unknown_port() {
        let rig = rig();
        let mut cfg = profile("p1", 10.0, 512);
        cfg.src_port = "missing0".into();
        rig.registry.create_profile(cfg).unwrap();

        let err = rig.engine.enable("p1").await.unwrap_err();
        assert_eq!(err.kind(), "PortUnavailable");
        match rig.registry.profile_state("p1") {
            Some(RunState::Failed(cause)) => assert!(cause.contains("missing0")),
            other => panic!("expected failed state, got {other:?}"),
        }

        // Failed is removable.
        rig.registry.delete_profile("p1").unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_disable_then_enable_resets_only_that_profile() {
        let rig = rig();
        rig.registry.create_profile(profile("p1", 8.0, 1000)).unwrap();
        rig.registry.create_profile(profile("p2", 8.0, 1000)).unwrap();

        rig.engine.enable("p1").await.unwrap();
        rig.engine.enable("p2").await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        rig.engine.disable("p1").await.unwrap();

        let p2_before = rig.registry.profile_counters("p2").unwrap().snapshot();
        rig.engine.enable("p1").await.unwrap();
        let p1 = rig.registry.profile_counters("p1").unwrap().snapshot();
        assert_eq!(p1.frames_sent, 0, "re-enable resets p1");
        let p2_after = rig.registry.profile_counters("p2").unwrap().snapshot();
        assert!(p2_after.frames_sent >= p2_before.frames_sent, "p2 untouched");

        rig.engine.stop_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_enable_is_idempotent_while_running() {
        let rig = rig();
        rig.registry.create_profile(profile("p1", 8.0, 1000)).unwrap();
        rig.engine.enable("p1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        rig.engine.enable("p1").await.unwrap();

        // A second enable must not reset counters or restart sequences.
        let counters = rig.registry.profile_counters("p1").unwrap().snapshot();
        assert!(counters.frames_sent > 0, "still running, counters intact");
        rig.engine.disable("p1").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_hot_bandwidth_update_keeps_sequence() {
        let rig = rig();
        rig.registry.create_profile(profile("p1", 8.0, 1000)).unwrap();
        rig.engine.enable("p1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Quadruple the rate mid-run.
        let mut cfg = rig.registry.get_profile("p1").unwrap();
        cfg.bandwidth_mbps = 32.0;
        rig.engine.apply_hot("p1", &cfg).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        rig.engine.disable("p1").await.unwrap();

        let sent = rig.endpoint.sent();
        // ~50 frames in the first half, ~200 in the second.
        assert!(sent.len() > 180, "rate change must take effect, got {}", sent.len());
        for (i, frame) in sent.iter().enumerate() {
            let sig = extract_signature(frame, &Encapsulation::Ipv4).unwrap();
            assert_eq!(sig.seq as usize, i, "sequence survives the transition");
        }
        assert_eq!(rig.registry.profile_state("p1"), Some(RunState::Idle));
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_loss_profile_stays_running() {
        let rig = rig();
        let mut cfg = profile("p1", 8.0, 1000);
        cfg.impairments.loss_percent = 100.0;
        rig.registry.create_profile(cfg).unwrap();
        rig.engine.enable("p1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(rig.registry.profile_state("p1"), Some(RunState::Running));
        assert_eq!(rig.endpoint.sent_count(), 0, "no frame reaches the port");
        let counters = rig.registry.profile_counters("p1").unwrap().snapshot();
        assert!(counters.loss_drops > 0);
        assert_eq!(counters.frames_sent, 0);
        rig.engine.disable("p1").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_duplication_doubles_tx() {
        let rig = rig();
        let mut cfg = profile("p1", 8.0, 1000);
        cfg.impairments.duplicate_percent = 100.0;
        rig.registry.create_profile(cfg).unwrap();
        rig.engine.enable("p1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        rig.engine.disable("p1").await.unwrap();

        let counters = rig.registry.profile_counters("p1").unwrap().snapshot();
        assert_eq!(counters.frames_sent, 2 * counters.dup_emits, "every frame doubled");
        // Duplicates repeat the prior sequence number.
        let sent = rig.endpoint.sent();
        let sig0 = extract_signature(&sent[0], &Encapsulation::Ipv4).unwrap();
        let sig1 = extract_signature(&sent[1], &Encapsulation::Ipv4).unwrap();
        assert_eq!(sig0.seq, sig1.seq, "duplicate shares the sequence number");
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_bandwidth_profile_runs_without_ticks() {
        let rig = rig();
        rig.registry.create_profile(profile("p1", 0.0, 1000)).unwrap();
        rig.engine.enable("p1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(rig.registry.profile_state("p1"), Some(RunState::Running));
        assert_eq!(rig.endpoint.sent_count(), 0, "paused pacer never ticks");
        rig.engine.disable("p1").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_disable_honors_grace_bound() {
        let rig = rig();
        let mut cfg = profile("p1", 8.0, 1000);
        cfg.impairments.latency_ms = 200.0;
        rig.registry.create_profile(cfg).unwrap();
        rig.engine.enable("p1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let before = tokio::time::Instant::now();
        rig.engine.disable("p1").await.unwrap();
        let took = tokio::time::Instant::now().duration_since(before);
        assert!(
            took <= Duration::from_millis(350),
            "disable must return within the grace bound, took {took:?}"
        );
        assert_eq!(rig.registry.profile_state("p1"), Some(RunState::Idle));
    }

    #[tokio::test(start_paused = true)]
    async fn test_port_down_is_soft_error() {
        let rig = rig();
        rig.registry.create_profile(profile("p1", 8.0, 1000)).unwrap();
        rig.engine.enable("p1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Link drops mid-run: the runner keeps running, the port counts drops.
        let port = rig.registry.get_port("eth0").unwrap();
        rig.endpoint.set_down(true);
        port.link_up.store(false, Ordering::Release);
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(rig.registry.profile_state("p1"), Some(RunState::Running));
        assert!(port.counters.snapshot().dropped > 0, "port drops accumulate");

        // Link returns: traffic resumes.
        rig.endpoint.set_down(false);
        port.link_up.store(true, Ordering::Release);
        let before = rig.endpoint.sent_count();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(rig.endpoint.sent_count() > before, "traffic resumes after recovery");
        rig.engine.disable("p1").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_all_and_stop_all() {
        let rig = rig();
        let mut p1 = profile("p1", 8.0, 1000);
        p1.enabled = true;
        let p2 = profile("p2", 8.0, 1000); // not enabled
        let mut p3 = profile("p3", 8.0, 1000);
        p3.enabled = true;
        p3.src_port = "missing0".into();
        rig.registry.create_profile(p1).unwrap();
        rig.registry.create_profile(p2).unwrap();
        rig.registry.create_profile(p3).unwrap();

        let failures = rig.engine.start_all().await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "p3");
        assert_eq!(rig.engine.active_count().await, 1);
        assert_eq!(rig.registry.profile_state("p2"), Some(RunState::Idle));

        rig.engine.stop_all().await;
        assert_eq!(rig.engine.active_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enable_rejects_frame_above_port_mtu() {
        let registry = Arc::new(Registry::new());
        let mut narrow = port_info("eth0", 1);
        narrow.mtu = 1500;
        let eth0 = registry.add_port(narrow);
        registry.add_port(port_info("eth1", 2));

        let endpoint = MemoryEndpoint::new();
        let transmitters = Arc::new(DashMap::new());
        transmitters.insert(
            "eth0".to_string(),
            Transmitter::spawn(
                "eth0",
                Arc::new(endpoint.clone()),
                Arc::clone(&eth0.counters),
                Arc::clone(&eth0.link_up),
                1500,
            ),
        );
        let engine = Engine::new(Arc::clone(&registry), transmitters);

        registry.create_profile(profile("jumbo", 10.0, 9000)).unwrap();
        let err = engine.enable("jumbo").await.unwrap_err();
        assert_eq!(err.kind(), "Unencodable");
        assert!(matches!(
            registry.profile_state("jumbo"),
            Some(RunState::Failed(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_minimum_frame_signature_still_fits() {
        let rig = rig();
        rig.registry.create_profile(profile("tiny", 8.0, 64)).unwrap();
        rig.engine.enable("tiny").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        rig.engine.disable("tiny").await.unwrap();

        let sent = rig.endpoint.sent();
        assert!(!sent.is_empty());
        assert_eq!(sent[0].len(), 64);
        assert!(sent[0].len() >= 42 + SIGNATURE_LEN);
    }
}
