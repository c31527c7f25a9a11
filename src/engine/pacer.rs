//! Token-bucket pacer producing frame emission ticks.
//!
//! The bucket refills in continuous time at the rate needed to realize the
//! configured bandwidth at the configured frame size. `next_tick` returns
//! the instant the consumed token became available rather than the current
//! wall-clock, which preserves the long-term average rate even when the
//! downstream pipeline briefly stalls.

use std::time::Duration;

use tokio::time::Instant;

use crate::config;

/// Frames-per-second equivalent of a bandwidth at a frame size.
pub fn frames_per_second(bandwidth_mbps: f64, frame_size: usize) -> f64 {
    if frame_size == 0 {
        return 0.0;
    }
    bandwidth_mbps * 1e6 / 8.0 / frame_size as f64
}

/// Per-profile emission clock.
#[derive(Debug)]
pub struct Pacer {
    /// Current token count, at most `burst`.
    tokens: f64,
    /// Maximum burst, in frames.
    burst: f64,
    /// Refill rate in frames per second. Zero means paused.
    rate_fps: f64,
    /// Last refill timestamp.
    last_refill: Instant,
    /// Previous tick, to keep the tick sequence monotonic across rebases.
    last_tick: Option<Instant>,
}

impl Pacer {
    pub fn new(bandwidth_mbps: f64, frame_size: usize) -> Self {
        Pacer {
            tokens: 1.0, // first frame goes out immediately
            burst: config::PACER_BURST_FRAMES,
            rate_fps: frames_per_second(bandwidth_mbps, frame_size),
            last_refill: Instant::now(),
            last_tick: None,
        }
    }

    /// Rebase the refill rate. The current token count is deliberately
    /// untouched: no burst on a rate decrease, no starvation on an
    /// increase.
    pub fn set_rate(&mut self, bandwidth_mbps: f64, frame_size: usize) {
        self.refill(Instant::now());
        self.rate_fps = frames_per_second(bandwidth_mbps, frame_size);
    }

    pub fn rate_fps(&self) -> f64 {
        self.rate_fps
    }

    pub fn is_paused(&self) -> bool {
        self.rate_fps <= 0.0
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate_fps).min(self.burst);
        self.last_refill = now;
    }

    /// Wait for the next token and return the instant it became available.
    ///
    /// Cancel-safe: a token is only consumed when the call completes. With
    /// a zero rate this pends forever; the caller's select loop breaks out
    /// of it on a config change.
    pub async fn next_tick(&mut self) -> Instant {
        if self.is_paused() {
            std::future::pending::<()>().await;
            unreachable!("pending never resolves");
        }

        let now = Instant::now();
        self.refill(now);

        let tick = if self.tokens >= 1.0 {
            // The consumed token became available (tokens - 1)/rate ago,
            // when the bucket last crossed a whole frame.
            let ago = Duration::from_secs_f64((self.tokens - 1.0) / self.rate_fps);
            self.tokens -= 1.0;
            now.checked_sub(ago).unwrap_or(now)
        } else {
            let deficit = 1.0 - self.tokens;
            let due = now + Duration::from_secs_f64(deficit / self.rate_fps);
            tokio::time::sleep_until(due).await;
            self.tokens = 0.0;
            self.last_refill = due;
            due
        };

        let tick = match self.last_tick {
            Some(prev) if prev > tick => prev,
            _ => tick,
        };
        self.last_tick = Some(tick);
        tick
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{advance, timeout};

    #[test]
    fn test_frames_per_second_math() {
        // 100 Mbps at 1500-byte frames ≈ 8333.3 fps
        let fps = frames_per_second(100.0, 1500);
        assert!((fps - 8333.333).abs() < 0.01, "got {fps}");
        assert_eq!(frames_per_second(0.0, 1500), 0.0);
        assert_eq!(frames_per_second(100.0, 0), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_realize_average_rate() {
        // 1000 fps → 1 ms spacing. 100 ticks must span ~99 ms of virtual time.
        let mut pacer = Pacer::new(8.0, 1000); // 8 Mbps / 1000 B = 1000 fps
        let start = Instant::now();
        let mut last = None;
        for _ in 0..100 {
            let tick = pacer.next_tick().await;
            if let Some(prev) = last {
                assert!(tick >= prev, "ticks must be monotonic");
            }
            last = Some(tick);
        }
        let elapsed = Instant::now().duration_since(start);
        let expect = Duration::from_millis(99);
        let delta = if elapsed > expect { elapsed - expect } else { expect - elapsed };
        assert!(delta < Duration::from_millis(5), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_credit_capped_at_burst() {
        let mut pacer = Pacer::new(8.0, 1000); // 1000 fps
        // Long idle: far more than burst_depth tokens worth of time.
        advance(Duration::from_secs(10)).await;

        // The first burst_depth ticks must be immediately available.
        let before = Instant::now();
        for _ in 0..(config::PACER_BURST_FRAMES as usize) {
            pacer.next_tick().await;
        }
        assert_eq!(Instant::now(), before, "burst tokens need no sleep");

        // The next tick has to wait for a refill.
        let next = pacer.next_tick().await;
        assert!(next > before, "post-burst tick must wait");
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_bandwidth_is_paused() {
        let mut pacer = Pacer::new(0.0, 1500);
        assert!(pacer.is_paused());
        let res = timeout(Duration::from_millis(50), pacer.next_tick()).await;
        assert!(res.is_err(), "paused pacer must never tick");
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_rebase_keeps_tokens() {
        let mut pacer = Pacer::new(8.0, 1000); // 1000 fps
        pacer.next_tick().await;
        advance(Duration::from_millis(20)).await;
        // ~20 tokens accrued. Dropping the rate must not confiscate them.
        pacer.set_rate(0.8, 1000); // 100 fps
        let before = Instant::now();
        for _ in 0..20 {
            pacer.next_tick().await;
        }
        assert_eq!(Instant::now(), before, "accrued tokens spend at the old credit");

        // And raising the rate must not grant extra credit retroactively.
        pacer.set_rate(8.0, 1000);
        let t = pacer.next_tick().await;
        assert!(t > before, "no free token right after a raise");
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_time_is_token_availability() {
        let mut pacer = Pacer::new(8.0, 1000); // 1 ms per frame
        pacer.next_tick().await;

        // Stall downstream for 5 ms, then drain: tick times must lie in the
        // past (at availability instants), preserving the average rate.
        advance(Duration::from_millis(5)).await;
        let now = Instant::now();
        let t1 = pacer.next_tick().await;
        let t2 = pacer.next_tick().await;
        assert!(t1 <= now && t2 <= now, "stall-era ticks are back-dated");
        assert!(t2 > t1, "and still strictly ordered");
    }
}
