//! Admission control: a process-wide token bucket in front of every
//! mutation-producing entry point.
//!
//! Defaults to one token of capacity refilled at one token per second.
//! A denial is reported as `Admission::Denied` carrying the time until the
//! next token, so callers can surface "try again" instead of a failure.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Default bucket capacity.
pub const DEFAULT_CAPACITY: u32 = 1;

/// Default tokens added per refill interval.
pub const DEFAULT_REFILL_TOKENS: u32 = 1;

/// Default refill interval in milliseconds.
pub const DEFAULT_INTERVAL_MS: u64 = 1000;

/// Smallest time cost of one token.
const MIN_TOKEN_COST: Duration = Duration::from_nanos(1);

/// Token bucket configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Maximum tokens held (burst size).
    pub capacity: u32,
    /// Tokens added per interval.
    pub refill_tokens: u32,
    /// Refill interval in milliseconds.
    pub interval_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            refill_tokens: DEFAULT_REFILL_TOKENS,
            interval_ms: DEFAULT_INTERVAL_MS,
        }
    }
}

/// Result of an acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Granted,
    Denied { retry_after: Duration },
}

impl Admission {
    pub fn is_granted(&self) -> bool {
        matches!(self, Admission::Granted)
    }
}

#[derive(Debug)]
struct BucketState {
    /// Accumulated credit, measured in time. One token costs `cost`.
    credit: Duration,
    last_refill: Instant,
}

/// Thread-safe token bucket.
///
/// The bucket starts full. Credit is kept as a `Duration` so refill is exact:
/// each token costs `interval / refill_tokens` of elapsed time and the bucket
/// never holds more than `capacity` tokens worth of credit.
#[derive(Debug)]
pub struct TokenBucket {
    cost: Duration,
    max_credit: Duration,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a bucket from configuration.
    ///
    /// Zero capacity, tokens or interval are clamped to the smallest usable
    /// values so the bucket can never wedge permanently. A token always costs
    /// at least one nanosecond, and oversized products saturate.
    pub fn new(config: &RateLimitConfig) -> Self {
        let interval = Duration::from_millis(config.interval_ms.max(1));
        let cost = (interval / config.refill_tokens.max(1)).max(MIN_TOKEN_COST);
        let max_credit = cost.saturating_mul(config.capacity.max(1));

        Self {
            cost,
            max_credit,
            state: Mutex::new(BucketState {
                credit: max_credit,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Lock state, recovering from poison. A poisoned bucket at worst
    /// admits slightly wrong, which beats panicking on the request path.
    fn lock_state(&self) -> MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            warn!("Token bucket mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill);
        state.credit = state.credit.saturating_add(elapsed).min(self.max_credit);
        state.last_refill = now;
    }

    /// Try to take one token without waiting.
    ///
    /// Refill and take happen under one lock, so concurrent callers can
    /// never be granted more tokens than the bucket holds.
    pub fn try_acquire(&self) -> Admission {
        let mut state = self.lock_state();
        self.refill(&mut state);

        if state.credit >= self.cost {
            state.credit -= self.cost;
            Admission::Granted
        } else {
            let retry_after = self.cost - state.credit;
            debug!(retry_after_ms = retry_after.as_millis() as u64, "Admission denied");
            Admission::Denied { retry_after }
        }
    }

    /// Whole tokens currently available (after refill).
    pub fn available(&self) -> u32 {
        let mut state = self.lock_state();
        self.refill(&mut state);
        (state.credit.as_nanos() / self.cost.as_nanos().max(1)) as u32
    }
}

impl Default for TokenBucket {
    fn default() -> Self {
        Self::new(&RateLimitConfig::default())
    }
}

#[cfg(test)]
mod tests;
