//! Centralized runtime constants for netforge.
//!
//! All tunable intervals, depths, and bounds are collected here so they can
//! be found and adjusted in a single place rather than scattered across modules.

use std::time::Duration;

/// Default token-bucket burst depth of a profile pacer, in frames.
pub const PACER_BURST_FRAMES: f64 = 64.0;

/// Capacity of a port transmitter's inbound frame channel.
/// `send` fails with `Overflow` once this many frames are waiting.
pub const TX_QUEUE_FRAMES: usize = 4096;

/// Number of retries for a raw send that returns EAGAIN before the frame
/// is counted as dropped.
pub const TX_RETRY_LIMIT: u32 = 4;

/// Backoff between EAGAIN retries. Doubles each attempt.
pub const TX_RETRY_BACKOFF: Duration = Duration::from_micros(50);

/// Grace period for a transmitter to drain its heap on shutdown.
pub const TX_SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Extra VLAN allowance on top of the port MTU when checking frame size.
/// Covers one 802.1ad + one 802.1Q tag.
pub const TX_VLAN_ALLOWANCE: usize = 8;

/// Mean run length of the burst-loss bad state, in frames.
pub const BURST_LOSS_MEAN_FRAMES: f64 = 5.0;

/// Due-time offset applied to the duplicate copy of a frame.
pub const DUPLICATE_OFFSET: Duration = Duration::from_micros(50);

/// Maximum backlog the shaping-cap release clock may accumulate before
/// further frames are tail-dropped as `shaper_overrun`.
pub const SHAPER_MAX_BACKLOG: Duration = Duration::from_millis(500);

/// Minimum grace period a profile runner gets to drain on disable.
/// The effective grace is `max(shaper latency, this)`.
pub const RUNNER_MIN_GRACE: Duration = Duration::from_millis(100);

/// Slack added on top of the drain grace before the runner task is
/// forcibly aborted.
pub const RUNNER_ABORT_SLACK: Duration = Duration::from_millis(100);

/// Interval between periodic neighbor-cache refreshes.
pub const PROBE_INTERVAL: Duration = Duration::from_secs(10);

/// Per-port budget for one neighbor scan. A timed-out port keeps its
/// previous cache.
pub const PROBE_PORT_TIMEOUT: Duration = Duration::from_secs(2);

/// Deadline for a single control-adapter command.
pub const CONTROL_DEADLINE: Duration = Duration::from_secs(5);

/// Deadline for an RFC2544 sweep to honor a cancellation request.
pub const BENCH_CANCEL_DEADLINE: Duration = Duration::from_secs(1);

/// Default duration of one RFC2544 throughput / frame-loss trial.
pub const BENCH_TRIAL_SECS: u64 = 60;

/// Default duration of the RFC2544 latency stream.
pub const BENCH_LATENCY_SECS: u64 = 120;

/// Loss ratio below which an RFC2544 throughput trial passes.
pub const BENCH_PASS_LOSS: f64 = 1e-5;

/// Standard RFC2544 frame sizes swept when no single size is pinned.
pub const BENCH_FRAME_SIZES: [usize; 7] = [64, 128, 256, 512, 1024, 1280, 1518];

/// Default destination UDP port for plain ipv4/ipv6 profiles.
pub const DEFAULT_DST_PORT: u16 = 9999;

/// Smallest valid Ethernet frame (without FCS).
pub const MIN_FRAME_SIZE: usize = 64;

/// Largest frame size a profile may request (jumbo).
pub const MAX_FRAME_SIZE: usize = 9000;
