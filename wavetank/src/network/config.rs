//! Configuration for simulated network timing.

use crate::rng::sim_random_range_or_default;
use std::ops::Range;
use std::time::Duration;

/// Latency bands for the simulated network.
///
/// Each operation that would block in a real system draws its delay from
/// one of these ranges through the deterministic RNG, so a fixed seed
/// reproduces identical delivery timing.
#[derive(Debug, Clone)]
pub struct NetworkConfiguration {
    /// Latency range for stream connection establishment.
    pub connect_latency: Range<Duration>,
    /// Latency range for datagram delivery.
    pub datagram_latency: Range<Duration>,
    /// Latency range for stream segment delivery.
    pub write_latency: Range<Duration>,
    /// Latency range for close-notify propagation to a stream peer.
    pub close_latency: Range<Duration>,
}

impl Default for NetworkConfiguration {
    fn default() -> Self {
        Self {
            connect_latency: Duration::from_millis(1)..Duration::from_millis(11),
            datagram_latency: Duration::from_micros(100)..Duration::from_micros(600),
            write_latency: Duration::from_micros(100)..Duration::from_micros(600),
            close_latency: Duration::from_micros(10)..Duration::from_micros(60),
        }
    }
}

impl NetworkConfiguration {
    /// Create a new network configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration optimized for fast local testing: fixed microsecond
    /// delays, no randomness in timing.
    pub fn fast_local() -> Self {
        let one_us = Duration::from_micros(1);
        let ten_us = Duration::from_micros(10);
        Self {
            connect_latency: ten_us..ten_us,
            datagram_latency: one_us..one_us,
            write_latency: one_us..one_us,
            close_latency: one_us..one_us,
        }
    }

    /// Configuration where every network operation completes at the same
    /// virtual instant it was issued. Useful for tests that assert on
    /// exact timestamps, e.g. same-time relay forwarding.
    pub fn zero_latency() -> Self {
        let zero = Duration::ZERO..Duration::ZERO;
        Self {
            connect_latency: zero.clone(),
            datagram_latency: zero.clone(),
            write_latency: zero.clone(),
            close_latency: zero,
        }
    }
}

/// Samples a duration from a latency range using the deterministic RNG.
///
/// A degenerate range (`x..x`) yields `x`.
pub fn sample_duration(range: &Range<Duration>) -> Duration {
    let start_nanos = range.start.as_nanos() as u64;
    let end_nanos = range.end.as_nanos() as u64;
    Duration::from_nanos(sim_random_range_or_default(start_nanos..end_nanos))
}
