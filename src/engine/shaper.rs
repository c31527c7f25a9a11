//! Impairment shaper: turns pacer ticks into impaired emission schedules.
//!
//! Stages run in a fixed order per frame: independent loss, two-state
//! Markov burst loss, duplication, reorder, base latency plus triangular
//! jitter, and finally an optional shaping-cap release clock. The shaper
//! never fails; it only drops (counted) or reschedules.
//!
//! All draws come from a per-profile PRNG seeded at enable time, so two
//! runs of the same configuration produce statistically identical
//! impairment traces.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::Instant;

use crate::config;
use crate::model::{Impairments, ProfileCounters};

/// One scheduled transmission of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Emission {
    pub due: Instant,
    /// True for the extra copy produced by the duplication stage.
    pub duplicate: bool,
}

#[derive(Debug)]
pub struct Shaper {
    imp: Impairments,
    rng: StdRng,
    /// Markov burst-loss state: frames left in the current bad run.
    burst_left: u32,
    /// Release clock of the shaping cap, when one is set.
    cap_release: Option<Instant>,
    counters: Arc<ProfileCounters>,
}

impl Shaper {
    pub fn new(imp: Impairments, seed: u64, counters: Arc<ProfileCounters>) -> Self {
        Shaper {
            imp,
            rng: StdRng::seed_from_u64(seed),
            burst_left: 0,
            cap_release: None,
            counters,
        }
    }

    /// Swap in a new impairment block (hot update). Markov and cap clocks
    /// carry over so the trace stays continuous.
    pub fn set_impairments(&mut self, imp: Impairments) {
        if imp.shaping_mbps.is_none() {
            self.cap_release = None;
        }
        self.imp = imp;
    }

    /// Upper bound on how long a frame can linger inside the shaper.
    /// Drives the runner's drain grace on disable.
    pub fn max_delay(&self) -> Duration {
        let cap_backlog = if self.imp.shaping_mbps.is_some() {
            config::SHAPER_MAX_BACKLOG
        } else {
            Duration::ZERO
        };
        self.imp.max_delay() + cap_backlog
    }

    /// Shape one frame ticked at `tick`. Returns zero, one, or two
    /// emissions; drops are recorded on the profile counters.
    pub fn shape(&mut self, tick: Instant, frame_len: usize) -> Vec<Emission> {
        let imp = self.imp;

        // 1. Independent loss.
        if imp.loss_percent > 0.0 && self.percent_roll(imp.loss_percent) {
            self.counters.loss_drops.fetch_add(1, Ordering::AcqRel);
            return Vec::new();
        }

        // 2. Burst loss: drop while in the bad state; entering the bad
        //    state drops this frame and draws a geometric run length.
        if self.burst_left > 0 {
            self.burst_left -= 1;
            self.counters.loss_drops.fetch_add(1, Ordering::AcqRel);
            return Vec::new();
        }
        if imp.burst_loss_percent > 0.0 && self.percent_roll(imp.burst_loss_percent) {
            self.burst_left = self.geometric_run(config::BURST_LOSS_MEAN_FRAMES) - 1;
            self.counters.loss_drops.fetch_add(1, Ordering::AcqRel);
            return Vec::new();
        }

        // 3. Duplication.
        let duplicate = imp.duplicate_percent > 0.0 && self.percent_roll(imp.duplicate_percent);

        // 4. Reorder: extra delay on this frame only, overtaking later ones.
        let mut extra = Duration::ZERO;
        if imp.reorder_percent > 0.0 && self.percent_roll(imp.reorder_percent) {
            self.counters.reorder_events.fetch_add(1, Ordering::AcqRel);
            let hi = imp.latency_ms + 2.0 * imp.jitter_ms;
            let ms = self.rng.gen_range(imp.latency_ms..=hi.max(imp.latency_ms));
            extra = Duration::from_secs_f64(ms / 1000.0);
        }

        // 5. Base latency plus symmetric triangular jitter, clamped ≥ 0.
        let jitter_ms = if imp.jitter_ms > 0.0 {
            let tri: f64 = self.rng.gen::<f64>() + self.rng.gen::<f64>() - 1.0;
            tri * imp.jitter_ms
        } else {
            0.0
        };
        let delay_ms = (imp.latency_ms + jitter_ms).max(0.0);
        let mut due = tick + Duration::from_secs_f64(delay_ms / 1000.0) + extra;

        // 6. Shaping cap: release at most cap_mbps, tail-dropping once the
        //    backlog bound is exceeded.
        if let Some(cap_mbps) = imp.shaping_mbps {
            let spacing = Duration::from_secs_f64(frame_len as f64 * 8.0 / (cap_mbps * 1e6));
            let release = match self.cap_release {
                Some(clock) if clock > due => clock,
                _ => due,
            };
            if release.duration_since(tick) > self.max_delay() {
                self.counters.shaper_overrun.fetch_add(1, Ordering::AcqRel);
                return Vec::new();
            }
            self.cap_release = Some(release + spacing);
            due = release;
        }

        let mut emissions = Vec::with_capacity(if duplicate { 2 } else { 1 });
        emissions.push(Emission { due, duplicate: false });
        if duplicate {
            self.counters.dup_emits.fetch_add(1, Ordering::AcqRel);
            emissions.push(Emission {
                due: due + config::DUPLICATE_OFFSET,
                duplicate: true,
            });
        }
        emissions
    }

    fn percent_roll(&mut self, percent: f64) -> bool {
        self.rng.gen::<f64>() * 100.0 < percent
    }

    /// Geometric run length with the given mean, at least 1.
    fn geometric_run(&mut self, mean: f64) -> u32 {
        let p = 1.0 / mean;
        let u: f64 = self.rng.gen();
        let run = ((1.0 - u).ln() / (1.0 - p).ln()).ceil();
        run.max(1.0) as u32
    }
}
