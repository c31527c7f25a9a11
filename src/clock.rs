//! Process-wide monotonic microsecond clock.
//!
//! Payload signatures and counter timestamps all derive from one epoch so
//! that emit and receive readings are directly comparable.

use std::sync::OnceLock;
use std::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Microseconds since the first call in this process.
pub fn mono_micros() -> u64 {
    EPOCH.get_or_init(Instant::now).elapsed().as_micros() as u64
}

/// The 32-bit wrapping form embedded in payload signatures.
pub fn mono_micros_u32() -> u32 {
    mono_micros() as u32
}
