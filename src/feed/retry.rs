//! Named backoff policies.
//!
//! Policies are `backon` builders. Most loops in the engine are not plain
//! "retry this call" loops (the bootstrapper must re-check the initialized
//! marker between attempts and every wait must be cancellable), so the
//! builders are consumed as delay iterators rather than through
//! `Retryable::retry`.
//!
//! # Available Policies
//!
//! | Policy | Delay | Attempts | Use Case |
//! |--------|-------|----------|----------|
//! | `bootstrap_policy` | constant `sleep_time` | configurable (0 = unbounded) | bootstrap lock contention |
//! | `store_policy` | 10ms .. 500ms exponential | 3 | transient lease container errors |

use std::time::Duration;

use backon::{BackoffBuilder, ConstantBuilder, ExponentialBuilder};

/// Policy for waiting on the bootstrap lock.
///
/// Yields `max_attempts - 1` delays of `sleep_time`: one wait between each
/// pair of attempts. `max_attempts == 0` yields delays forever.
pub fn bootstrap_policy(sleep_time: Duration, max_attempts: usize) -> ConstantBuilder {
    let retries = if max_attempts == 0 {
        usize::MAX
    } else {
        max_attempts - 1
    };
    ConstantBuilder::default()
        .with_delay(sleep_time)
        .with_max_times(retries)
}

/// Policy for transient lease container failures (`FeedError::Store`).
pub fn store_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(10))
        .with_max_delay(Duration::from_millis(500))
        .with_max_times(3)
        .with_jitter()
}

/// Build a delay iterator from any policy.
pub fn delays<B: BackoffBuilder>(policy: B) -> impl Iterator<Item = Duration> {
    policy.build()
}

/// Apply +/-15% jitter to a timer interval so hosts do not tick in lockstep.
pub fn with_jitter(interval: Duration) -> Duration {
    let factor = 0.85 + fastrand::f64() * 0.30;
    interval.mul_f64(factor)
}
