//! Token-bucket rate limiter for downstream metered calls.
//!
//! Capacity `C` is the burst size and tokens refill continuously at
//! `R = requests_per_minute / 60` per second. All bucket mutation happens under
//! one lock; waiting happens outside it, so concurrent callers queue on the
//! clock rather than on each other.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::clock::Clock;
use crate::config::RateLimitConfig;
use crate::error::RateLimitError;

/// Tolerance for float drift in the refill arithmetic
const EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimiterStats {
    pub total_acquired: u64,
    /// Acquisitions that had to wait
    pub total_throttled: u64,
    pub total_waited: Duration,
    /// Rate seen over the stats window, in requests per minute
    pub observed_rpm: f64,
    pub configured_rpm: f64,
    pub available_tokens: f64,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
    total_acquired: u64,
    total_throttled: u64,
    total_waited: Duration,
    recent: VecDeque<Instant>,
}

impl BucketState {
    fn refill(&mut self, now: Instant, rate: f64, capacity: f64) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * rate).min(capacity);
        self.last_refill = now;
    }
}

pub struct RateLimiter {
    capacity: u32,
    /// Tokens per second
    rate: f64,
    window: Duration,
    history: usize,
    clock: Arc<dyn Clock>,
    state: Mutex<BucketState>,
}

impl RateLimiter {
    /// A full bucket built from `config`.
    pub fn new(config: &RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        let capacity = config.capacity.max(1);
        let now = clock.now();
        RateLimiter {
            capacity,
            rate: f64::from(config.requests_per_minute.max(1)) / 60.0,
            window: Duration::from_secs(config.stats_window_secs.max(1)),
            history: config.stats_history.max(2),
            state: Mutex::new(BucketState {
                tokens: f64::from(capacity),
                last_refill: now,
                total_acquired: 0,
                total_throttled: 0,
                total_waited: Duration::ZERO,
                recent: VecDeque::new(),
            }),
            clock,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Refill rate in tokens per second
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Take `cost` tokens, suspending until enough are available.
    ///
    /// Returns how long the caller waited (zero when tokens were on hand).
    pub async fn acquire(&self, cost: u32) -> Result<Duration, RateLimitError> {
        self.check_cost(cost)?;
        let cost_f = f64::from(cost);
        let start = self.clock.now();

        loop {
            let wait = {
                let mut state = self.state.lock();
                let now = self.clock.now();
                state.refill(now, self.rate, f64::from(self.capacity));

                if state.tokens + EPSILON >= cost_f {
                    let waited = now.saturating_duration_since(start);
                    self.take(&mut state, cost_f, now, waited);
                    return Ok(waited);
                }
                Duration::from_secs_f64((cost_f - state.tokens) / self.rate)
            };

            debug!(cost, wait_ms = wait.as_millis() as u64, "Rate limited, waiting for tokens");
            self.clock.sleep(wait.max(Duration::from_nanos(1))).await;
        }
    }

    /// Take `cost` tokens only if they are available right now.
    pub fn try_acquire(&self, cost: u32) -> bool {
        if self.check_cost(cost).is_err() {
            return false;
        }
        let cost_f = f64::from(cost);
        let mut state = self.state.lock();
        let now = self.clock.now();
        state.refill(now, self.rate, f64::from(self.capacity));
        if state.tokens + EPSILON >= cost_f {
            self.take(&mut state, cost_f, now, Duration::ZERO);
            true
        } else {
            false
        }
    }

    fn check_cost(&self, cost: u32) -> Result<(), RateLimitError> {
        if cost > self.capacity {
            return Err(RateLimitError::CostExceedsCapacity {
                cost,
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    fn take(&self, state: &mut BucketState, cost: f64, now: Instant, waited: Duration) {
        state.tokens = (state.tokens - cost).max(0.0);
        state.total_acquired += 1;
        if !waited.is_zero() {
            state.total_throttled += 1;
            state.total_waited += waited;
        }
        if state.recent.len() == self.history {
            state.recent.pop_front();
        }
        state.recent.push_back(now);
    }

    pub fn stats(&self) -> RateLimiterStats {
        let mut state = self.state.lock();
        let now = self.clock.now();
        state.refill(now, self.rate, f64::from(self.capacity));

        let cutoff = now.checked_sub(self.window);
        let in_window: Vec<Instant> = state
            .recent
            .iter()
            .copied()
            .filter(|t| cutoff.map_or(true, |c| *t >= c))
            .collect();

        let observed_rpm = match (in_window.first(), in_window.last()) {
            (Some(first), Some(last)) if in_window.len() > 1 && last > first => {
                let span = last.duration_since(*first).as_secs_f64();
                (in_window.len() - 1) as f64 / span * 60.0
            }
            _ => 0.0,
        };

        RateLimiterStats {
            total_acquired: state.total_acquired,
            total_throttled: state.total_throttled,
            total_waited: state.total_waited,
            observed_rpm,
            configured_rpm: self.rate * 60.0,
            available_tokens: state.tokens,
        }
    }
}
