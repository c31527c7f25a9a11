//! RFC2544 benchmark driver.
//!
//! Runs throughput, latency, frame-loss, and back-to-back tests against a
//! named profile without touching its runner pipeline: every sweep owns
//! transient pacers and a captured-receive endpoint on the destination
//! port, and transmits through the source port's single-writer
//! transmitter. The destination port is expected to be looped back to the
//! source by an external test fixture.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::clock;
use crate::config;
use crate::engine::Pacer;
use crate::error::CoreError;
use crate::frame::{carries_signature, extract_signature, FrameBuilder, MacResolver};
use crate::model::{Encapsulation, ProfileConfig};
use crate::registry::Registry;
use crate::transmit::endpoint::RawEndpoint;
use crate::transmit::Transmitter;

/// Which tests to run, with optional overrides of the standard knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BenchPlan {
    pub throughput: bool,
    pub latency: bool,
    pub frame_loss: bool,
    pub back_to_back: bool,
    /// Frame sizes to sweep. Empty means the RFC2544 standard set, clamped
    /// to what the profile's encapsulation can carry.
    pub frame_sizes: Vec<usize>,
    pub trial_secs: u64,
    pub latency_secs: u64,
    /// Offered-rate search bounds in Mbps. Zero high means the source
    /// port's nominal speed.
    pub low_mbps: f64,
    pub high_mbps: f64,
}

impl Default for BenchPlan {
    fn default() -> Self {
        BenchPlan {
            throughput: true,
            latency: false,
            frame_loss: false,
            back_to_back: false,
            frame_sizes: Vec::new(),
            trial_secs: config::BENCH_TRIAL_SECS,
            latency_secs: config::BENCH_LATENCY_SECS,
            low_mbps: 1.0,
            high_mbps: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase", tag = "state", content = "cause")]
pub enum BenchState {
    Running,
    Complete,
    Cancelled,
    Failed(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct ThroughputResult {
    pub frame_size: usize,
    /// Highest passing offered rate.
    pub rate_mbps: f64,
    /// Loss ratio measured at that rate.
    pub loss: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LatencyResult {
    pub rate_mbps: f64,
    pub samples: u64,
    pub min_micros: u32,
    pub mean_micros: u32,
    pub max_micros: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct LossStep {
    pub percent_of_nominal: u32,
    pub offered_mbps: f64,
    pub loss: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackToBackResult {
    /// Longest burst length with zero loss.
    pub longest_burst: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BenchResults {
    pub profile: String,
    #[serde(flatten)]
    pub state: BenchState,
    pub started_micros: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_micros: Option<u64>,
    pub throughput: Vec<ThroughputResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency: Option<LatencyResult>,
    pub frame_loss: Vec<LossStep>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub back_to_back: Option<BackToBackResult>,
    /// Steps that missed their target; the sweep continued past them.
    pub steps_missed: Vec<String>,
}

struct BenchRun {
    results: Arc<Mutex<BenchResults>>,
    cancel: watch::Sender<bool>,
}

/// Opens a captured-receive endpoint on a destination port.
pub type RxProvider = Arc<dyn Fn(&str) -> anyhow::Result<Arc<dyn RawEndpoint>> + Send + Sync>;

pub struct BenchDriver {
    registry: Arc<Registry>,
    transmitters: Arc<DashMap<String, Transmitter>>,
    rx_provider: RxProvider,
    runs: DashMap<String, BenchRun>,
}

impl BenchDriver {
    pub fn new(
        registry: Arc<Registry>,
        transmitters: Arc<DashMap<String, Transmitter>>,
        rx_provider: RxProvider,
    ) -> Self {
        BenchDriver { registry, transmitters, rx_provider, runs: DashMap::new() }
    }

    /// Start a sweep for `profile`. One sweep per profile at a time.
    pub fn start(&self, profile: &str, plan: BenchPlan) -> Result<(), CoreError> {
        let cfg = self
            .registry
            .get_profile(profile)
            .ok_or_else(|| CoreError::NotFound(format!("profile {profile} not found")))?;
        let encap = cfg.encapsulation()?;
        if !carries_signature(&encap) {
            return Err(CoreError::Validation(format!(
                "profile {profile}: {} frames carry no signature; benchmark needs a signed encapsulation",
                cfg.protocol
            )));
        }
        if let Some(run) = self.runs.get(profile) {
            if run.results.lock().unwrap().state == BenchState::Running {
                return Err(CoreError::Duplicate(format!(
                    "an RFC2544 sweep is already running for {profile}"
                )));
            }
        }

        let src = self.registry.get_port(&cfg.src_port).ok_or_else(|| {
            CoreError::PortUnavailable(format!("unknown source port {}", cfg.src_port))
        })?;
        if self.registry.get_port(&cfg.dst_port).is_none() {
            return Err(CoreError::PortUnavailable(format!(
                "unknown destination port {}",
                cfg.dst_port
            )));
        }
        let transmitter = self
            .transmitters
            .get(&cfg.src_port)
            .map(|t| t.clone())
            .ok_or_else(|| {
                CoreError::PortUnavailable(format!("no transmitter on {}", cfg.src_port))
            })?;
        let rx = (self.rx_provider)(&cfg.dst_port).map_err(CoreError::from)?;

        let resolver = {
            let port = Arc::clone(&src);
            MacResolver::Dynamic(Arc::new(move |ip| port.neighbor_mac(ip)))
        };
        let builder = FrameBuilder::new(&cfg, encap, src.info.mac, src.info.ipv4, src.info.ipv6, resolver);

        let nominal = if src.info.speed_mbps > 0 { src.info.speed_mbps as f64 } else { 1000.0 };
        let results = Arc::new(Mutex::new(BenchResults {
            profile: profile.to_string(),
            state: BenchState::Running,
            started_micros: clock::mono_micros(),
            finished_micros: None,
            throughput: Vec::new(),
            latency: None,
            frame_loss: Vec::new(),
            back_to_back: None,
            steps_missed: Vec::new(),
        }));
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let ctx = SweepCtx {
            cfg,
            encap,
            builder,
            transmitter,
            rx,
            nominal,
            plan,
            results: Arc::clone(&results),
            cancel: cancel_rx,
        };
        tokio::spawn(run_sweep(ctx));
        self.runs
            .insert(profile.to_string(), BenchRun { results, cancel: cancel_tx });
        tracing::info!("RFC2544 sweep started for {profile}");
        Ok(())
    }

    /// Current results (running or finished) for a profile.
    pub fn status(&self, profile: &str) -> Result<BenchResults, CoreError> {
        let run = self
            .runs
            .get(profile)
            .ok_or_else(|| CoreError::NotFound(format!("no RFC2544 run for {profile}")))?;
        let results = run.results.lock().unwrap().clone();
        Ok(results)
    }

    /// Request cancellation; honored at the next step boundary.
    pub fn cancel(&self, profile: &str) {
        if let Some(run) = self.runs.get(profile) {
            let _ = run.cancel.send(true);
        }
    }

    pub fn cancel_all(&self) {
        for run in self.runs.iter() {
            let _ = run.cancel.send(true);
        }
    }
}

struct SweepCtx {
    cfg: ProfileConfig,
    encap: Encapsulation,
    builder: FrameBuilder,
    transmitter: Transmitter,
    rx: Arc<dyn RawEndpoint>,
    nominal: f64,
    plan: BenchPlan,
    results: Arc<Mutex<BenchResults>>,
    cancel: watch::Receiver<bool>,
}

/// Receive-side tail linger after the send loop stops.
const RX_LINGER: Duration = Duration::from_millis(200);
/// Binary-search iterations for throughput and back-to-back refinement.
const SEARCH_ITERATIONS: u32 = 10;

async fn run_sweep(mut ctx: SweepCtx) {
    let profile = ctx.cfg.name.clone();

    let outcome = drive_tests(&mut ctx).await;
    let mut results = ctx.results.lock().unwrap();
    results.finished_micros = Some(clock::mono_micros());
    results.state = match outcome {
        Ok(()) if *ctx.cancel.borrow() => BenchState::Cancelled,
        Ok(()) => BenchState::Complete,
        Err(e) => BenchState::Failed(e.to_string()),
    };
    tracing::info!("RFC2544 sweep for {profile} finished: {:?}", results.state);
}

async fn drive_tests(ctx: &mut SweepCtx) -> Result<(), CoreError> {
    let sizes: Vec<usize> = if ctx.plan.frame_sizes.is_empty() {
        let min = ctx.builder.min_size();
        config::BENCH_FRAME_SIZES
            .iter()
            .map(|&s| s.max(min))
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect()
    } else {
        ctx.plan.frame_sizes.clone()
    };

    let mut pass_rate = ctx.nominal;
    if ctx.plan.throughput {
        for &size in &sizes {
            if cancelled(ctx) {
                return Ok(());
            }
            let result = throughput_search(ctx, size).await;
            if let Some(r) = &result {
                pass_rate = pass_rate.min(r.rate_mbps);
            } else {
                ctx.results
                    .lock()
                    .unwrap()
                    .steps_missed
                    .push(format!("throughput@{size}: no passing rate found"));
            }
            if let Some(r) = result {
                ctx.results.lock().unwrap().throughput.push(r);
            }
        }
    }

    if ctx.plan.latency && !cancelled(ctx) {
        let latency = latency_stream(ctx, pass_rate).await;
        match latency {
            Some(l) => ctx.results.lock().unwrap().latency = Some(l),
            None => ctx
                .results
                .lock()
                .unwrap()
                .steps_missed
                .push("latency: no echoed frames captured".into()),
        }
    }

    if ctx.plan.frame_loss && !cancelled(ctx) {
        for pct in (1..=10).rev().map(|s| s * 10) {
            if cancelled(ctx) {
                return Ok(());
            }
            let offered = ctx.nominal * f64::from(pct) / 100.0;
            let size = ctx.cfg.frame_size;
            let duration = trial_duration(ctx);
            let measure = trial(ctx, offered, size, duration).await;
            ctx.results.lock().unwrap().frame_loss.push(LossStep {
                percent_of_nominal: pct,
                offered_mbps: offered,
                loss: measure.loss(),
            });
        }
    }

    if ctx.plan.back_to_back && !cancelled(ctx) {
        let result = back_to_back(ctx).await;
        ctx.results.lock().unwrap().back_to_back = Some(result);
    }

    Ok(())
}

fn cancelled(ctx: &SweepCtx) -> bool {
    *ctx.cancel.borrow()
}

fn trial_duration(ctx: &SweepCtx) -> Duration {
    Duration::from_secs(ctx.plan.trial_secs.max(1))
}

struct TrialMeasure {
    tx: u64,
    rx: u64,
    latencies: Vec<u32>,
}

impl TrialMeasure {
    fn loss(&self) -> f64 {
        if self.tx == 0 {
            return 0.0;
        }
        1.0 - self.rx as f64 / self.tx as f64
    }
}

/// Offer `rate_mbps` for `duration`, counting echoed signatures.
async fn trial(ctx: &mut SweepCtx, rate_mbps: f64, frame_size: usize, duration: Duration) -> TrialMeasure {
    let frame_size = frame_size.max(ctx.builder.min_size());
    // Drain anything left on the wire from a previous step.
    let mut buf = vec![0u8; config::MAX_FRAME_SIZE + 64];
    while ctx.rx.recv(&mut buf).is_ok() {}

    let profile_id = ctx.builder.profile_id();
    let encap = ctx.encap;
    let rx_ep = Arc::clone(&ctx.rx);
    let (rx_stop_tx, mut rx_stop) = watch::channel(false);
    let collector = tokio::spawn(async move {
        let mut buf = vec![0u8; config::MAX_FRAME_SIZE + 64];
        let mut rx = 0u64;
        let mut latencies = Vec::new();
        loop {
            while let Ok(n) = rx_ep.recv(&mut buf) {
                if let Some(sig) = extract_signature(&buf[..n], &encap) {
                    if sig.profile_id == profile_id {
                        rx += 1;
                        latencies.push(clock::mono_micros_u32().wrapping_sub(sig.emit_micros));
                    }
                }
            }
            tokio::select! {
                _ = rx_stop.changed() => break,
                _ = tokio::time::sleep(Duration::from_millis(1)) => {}
            }
        }
        // Final drain after the stop signal.
        while let Ok(n) = rx_ep.recv(&mut buf) {
            if let Some(sig) = extract_signature(&buf[..n], &encap) {
                if sig.profile_id == profile_id {
                    rx += 1;
                    latencies.push(clock::mono_micros_u32().wrapping_sub(sig.emit_micros));
                }
            }
        }
        (rx, latencies)
    });

    let mut pacer = Pacer::new(rate_mbps, frame_size);
    let deadline = Instant::now() + duration;
    let mut seq: u32 = 0;
    let mut tx = 0u64;
    while Instant::now() < deadline && !cancelled(ctx) {
        let tick = tokio::select! {
            _ = ctx.cancel.changed() => break,
            _ = tokio::time::sleep_until(deadline) => break,
            tick = pacer.next_tick() => tick,
        };
        match ctx.builder.build(seq, frame_size, clock::mono_micros_u32()) {
            Ok(frame) => {
                if ctx.transmitter.send(frame, tick).is_ok() {
                    tx += 1;
                }
            }
            Err(e) => {
                tracing::debug!("bench build failed: {e}");
                break;
            }
        }
        seq = seq.wrapping_add(1);
    }

    tokio::time::sleep(RX_LINGER).await;
    let _ = rx_stop_tx.send(true);
    let (rx, latencies) = collector.await.unwrap_or((0, Vec::new()));
    TrialMeasure { tx, rx, latencies }
}

/// Binary search for the highest rate whose loss stays under the pass
/// threshold at one frame size.
async fn throughput_search(ctx: &mut SweepCtx, frame_size: usize) -> Option<ThroughputResult> {
    let mut low = ctx.plan.low_mbps.max(0.001);
    let mut high = if ctx.plan.high_mbps > 0.0 { ctx.plan.high_mbps } else { ctx.nominal };
    let mut best: Option<(f64, f64)> = None;
    let duration = trial_duration(ctx);

    for _ in 0..SEARCH_ITERATIONS {
        if cancelled(ctx) {
            break;
        }
        let rate = (low + high) / 2.0;
        let measure = trial(ctx, rate, frame_size, duration).await;
        let loss = measure.loss();
        if loss <= config::BENCH_PASS_LOSS {
            best = Some((rate, loss));
            low = rate;
        } else {
            high = rate;
        }
        if high - low < ctx.nominal * 0.005 {
            break;
        }
    }
    best.map(|(rate_mbps, loss)| ThroughputResult { frame_size, rate_mbps, loss })
}

/// Stream at the throughput-pass rate, reporting echoed-frame latency.
async fn latency_stream(ctx: &mut SweepCtx, rate_mbps: f64) -> Option<LatencyResult> {
    let duration = Duration::from_secs(ctx.plan.latency_secs.max(1));
    let size = ctx.cfg.frame_size;
    let measure = trial(ctx, rate_mbps, size, duration).await;
    if measure.latencies.is_empty() {
        return None;
    }
    let mut min = u32::MAX;
    let mut max = 0u32;
    let mut sum = 0u64;
    for &sample in &measure.latencies {
        min = min.min(sample);
        max = max.max(sample);
        sum += u64::from(sample);
    }
    Some(LatencyResult {
        rate_mbps,
        samples: measure.latencies.len() as u64,
        min_micros: min,
        mean_micros: (sum / measure.latencies.len() as u64) as u32,
        max_micros: max,
    })
}

/// Send one burst back-to-back at line rate and count the echoes.
async fn burst_trial(ctx: &mut SweepCtx, burst: u64) -> TrialMeasure {
    let frame_size = ctx.cfg.frame_size.max(ctx.builder.min_size());
    let mut buf = vec![0u8; config::MAX_FRAME_SIZE + 64];
    while ctx.rx.recv(&mut buf).is_ok() {}

    let now = Instant::now();
    let mut tx = 0u64;
    for seq in 0..burst {
        match ctx.builder.build(seq as u32, frame_size, clock::mono_micros_u32()) {
            Ok(frame) => {
                if ctx.transmitter.send(frame, now).is_ok() {
                    tx += 1;
                } else {
                    break; // queue saturated: the burst ends here
                }
            }
            Err(_) => break,
        }
    }
    tokio::time::sleep(RX_LINGER).await;

    let mut rx = 0u64;
    while let Ok(n) = ctx.rx.recv(&mut buf) {
        if let Some(sig) = extract_signature(&buf[..n], &ctx.encap) {
            if sig.profile_id == ctx.builder.profile_id() {
                rx += 1;
            }
        }
    }
    TrialMeasure { tx, rx, latencies: Vec::new() }
}

/// Doubling probe then binary refinement for the longest zero-loss burst.
async fn back_to_back(ctx: &mut SweepCtx) -> BackToBackResult {
    let mut good = 0u64;
    let mut burst = 64u64;
    let mut bad = None;

    while bad.is_none() && burst <= 65536 && !cancelled(ctx) {
        let measure = burst_trial(ctx, burst).await;
        if measure.rx == measure.tx && measure.tx == burst {
            good = burst;
            burst *= 2;
        } else {
            bad = Some(burst);
        }
    }

    if let Some(mut bad) = bad {
        for _ in 0..SEARCH_ITERATIONS {
            if bad - good <= 1 || cancelled(ctx) {
                break;
            }
            let mid = (good + bad) / 2;
            let measure = burst_trial(ctx, mid).await;
            if measure.rx == measure.tx && measure.tx == mid {
                good = mid;
            } else {
                bad = mid;
            }
        }
    }
    BackToBackResult { longest_burst: good }
}
