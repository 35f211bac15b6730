//! Tick-based pacing limiter for bulk sends.
//!
//! Time is cut into ticks. Each tick may carry `flow_limit` bytes; a caller
//! that has pushed more than that sleeps until the next tick boundary. The
//! limit starts at one MTU and doubles every round-trip's worth of ticks
//! until it reaches the configured rate (slow start).

use std::time::Duration;
use tokio::time::{sleep_until, Instant};

/// Limiter parameters.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Target rate in bits per second; 0 disables limiting.
    pub bits_per_second: u64,
    /// Ticks per second (default: 100).
    pub ticks_per_second: u32,
    /// Estimated round trip in ticks, the slow-start doubling interval (default: 25).
    pub rtt_ticks: u32,
    /// Initial per-tick allowance in bytes (default: 1500).
    pub mtu: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            bits_per_second: 0,
            ticks_per_second: 100,
            rtt_ticks: 25,
            mtu: 1500,
        }
    }
}

impl RateLimitConfig {
    /// Default pacing parameters at `bits_per_second`.
    pub fn with_rate(bits_per_second: u64) -> Self {
        Self {
            bits_per_second,
            ..Self::default()
        }
    }
}

/// Per-stream pacing state. Not shared: each division owns one.
#[derive(Debug)]
pub struct RateLimiter {
    octets_per_tick: u64,
    flow_limit: u64,
    flow: u64,
    tick: Duration,
    rtt_ticks: u32,
    ticks: u32,
    period: Instant,
}

impl RateLimiter {
    /// Creates a limiter, or `None` when the configured rate is 0.
    pub fn new(config: &RateLimitConfig) -> Option<Self> {
        if config.bits_per_second == 0 || config.ticks_per_second == 0 {
            return None;
        }
        let octets_per_tick = (config.bits_per_second / 8 / config.ticks_per_second as u64).max(1);
        let tick = Duration::from_secs(1) / config.ticks_per_second;
        Some(Self {
            octets_per_tick,
            flow_limit: config.mtu.min(octets_per_tick).max(1),
            flow: 0,
            tick,
            rtt_ticks: config.rtt_ticks.max(1),
            ticks: 0,
            period: Instant::now() + tick,
        })
    }

    /// Current per-tick allowance.
    pub fn flow_limit(&self) -> u64 {
        self.flow_limit
    }

    /// Steady-state per-tick allowance.
    pub fn octets_per_tick(&self) -> u64 {
        self.octets_per_tick
    }

    /// Accounts `bytes` just sent, sleeping as long as the flow exceeds the
    /// per-tick allowance.
    pub async fn control(&mut self, bytes: usize) {
        self.flow += bytes as u64;
        while self.flow >= self.flow_limit {
            if Instant::now() < self.period {
                sleep_until(self.period).await;
            }
            self.period = Instant::now() + self.tick;
            self.flow -= self.flow_limit;
            self.ticks += 1;
            if self.ticks >= self.rtt_ticks {
                self.ticks = 0;
                if self.flow_limit < self.octets_per_tick {
                    self.flow_limit = (self.flow_limit * 2).min(self.octets_per_tick);
                }
            }
        }
    }
}

/// Runs `control` only when a limiter is configured.
pub async fn pace(limiter: &mut Option<RateLimiter>, bytes: usize) {
    if let Some(limiter) = limiter.as_mut() {
        limiter.control(bytes).await;
    }
}
