//! Retry and startup delay calculations.
//!
//! [`BackoffPolicy`] is the pure doubling ladder used after a failure, [`Backoff`] carries the
//! ladder position across attempts, and [`connection_delay`] spreads the first connection of a
//! whole fleet over a window proportional to its size.

// System
use std::time::Duration;

// Third Party
use rand::Rng;

// Local
use crate::config::{MAXIMUM_BACKOFF, MINIMUM_BACKOFF};

/// Exponential backoff bounded by `[min, max]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    min: Duration,
    max: Duration,
    recovery_threshold: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(MINIMUM_BACKOFF, MAXIMUM_BACKOFF)
    }
}

impl BackoffPolicy {
    /// The recovery threshold defaults to `max`.
    pub const fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            recovery_threshold: max,
        }
    }

    pub const fn with_recovery_threshold(mut self, recovery_threshold: Duration) -> Self {
        self.recovery_threshold = recovery_threshold;
        self
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Delay before the next attempt, given how long the last attempt ran and the delay used
    /// before it.
    ///
    /// An attempt that ran longer than the recovery threshold is treated as healthy, so the ladder
    /// starts again from `min`.
    pub fn next_backoff(&self, runtime: Duration, previous: Duration) -> Duration {
        if runtime > self.recovery_threshold || previous.is_zero() {
            return self.min;
        }
        previous.saturating_mul(2).min(self.max)
    }

    /// [`Self::next_backoff`] plus a uniformly random slack in `[0, base / 2)`.
    pub fn with_jitter(&self, runtime: Duration, previous: Duration) -> Duration {
        let base = self.next_backoff(runtime, previous);
        base.saturating_add(jitter(base / 2))
    }
}

fn jitter(upper: Duration) -> Duration {
    let upper_nanos = u64::try_from(upper.as_nanos()).unwrap_or(u64::MAX);
    if upper_nanos == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(rand::thread_rng().gen_range(0..upper_nanos))
}

/// Position on a backoff ladder for one sequence of attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    previous: Duration,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            previous: Duration::ZERO,
        }
    }

    /// Returns the jittered delay to sleep after an attempt that ran for `runtime`.
    ///
    /// The ladder advances on the un-jittered value so the doubling sequence stays exact.
    pub fn next(&mut self, runtime: Duration) -> Duration {
        let base = self.policy.next_backoff(runtime, self.previous);
        self.previous = base;
        base.saturating_add(jitter(base / 2))
    }

    pub fn previous(&self) -> Duration {
        self.previous
    }

    pub fn reset(&mut self) {
        self.previous = Duration::ZERO;
    }
}

/// Startup delay proportional to fleet size: `per_node_delay * node_count` seconds clamped into
/// `[min_delay, max_delay]`.
///
/// The result never exceeds `max_delay`, even when `min_delay > max_delay`.
pub fn connection_delay(
    per_node_delay: f64,
    node_count: u32,
    min_delay: Duration,
    max_delay: Duration,
) -> Duration {
    let per_node_delay = if per_node_delay.is_finite() {
        per_node_delay.max(0.0)
    } else {
        0.0
    };
    let raw = per_node_delay * f64::from(node_count);
    let max_secs = max_delay.as_secs_f64();
    let secs = raw.max(min_delay.as_secs_f64()).min(max_secs);
    if secs >= max_secs {
        return max_delay;
    }
    Duration::try_from_secs_f64(secs).map_or(max_delay, |delay| delay.min(max_delay))
}

/// Uniformly random delay in `[min(min_delay, bound), bound]` where `bound` is
/// [`connection_delay`].
pub fn random_connection_delay(
    per_node_delay: f64,
    node_count: u32,
    min_delay: Duration,
    max_delay: Duration,
) -> Duration {
    let bound = connection_delay(per_node_delay, node_count, min_delay, max_delay);
    let low = min_delay.min(bound);
    if low == bound {
        return bound;
    }
    let secs = rand::thread_rng().gen_range(low.as_secs_f64()..=bound.as_secs_f64());
    Duration::try_from_secs_f64(secs).map_or(bound, |delay| delay.clamp(low, bound))
}
