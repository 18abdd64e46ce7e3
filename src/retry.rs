// SPDX-License-Identifier: MIT
//! Jittered exponential backoff for transient store and I/O errors.
//!
//! [`retry_with_backoff`] keeps calling a fallible async operation until it
//! succeeds, the attempt count runs out, or the total delay budget is
//! spent. At least one attempt is always made, so a zeroed config degrades
//! to a plain call instead of a panic.

use std::time::Duration;
use tracing::{debug, warn};

/// Configuration for [`retry_with_backoff`].
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Upper bound on attempts, counting the first call.
    pub max_attempts: u32,
    /// Pause before the second attempt; grows by `multiplier` per retry
    /// and never exceeds `max_delay`.
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Wall-clock ceiling across the whole call. Once elapsed time passes
    /// this, the next failure is final even if attempts remain.
    pub total_budget: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            total_budget: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Millisecond-scale delays so unit tests finish quickly.
    pub fn fast() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            multiplier: 2.0,
            total_budget: Duration::from_secs(1),
        }
    }

    /// One attempt, no waiting.
    pub fn single_attempt() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
            total_budget: Duration::ZERO,
        }
    }
}

/// Scale `delay` by a factor in [0.5, 1.5) derived from the clock.
/// Spreads concurrent retriers without pulling in a PRNG dependency.
fn jitter(delay: Duration) -> Duration {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    let factor = 0.5 + (nanos % 1000) as f64 / 1000.0;
    delay.mul_f64(factor)
}

/// Call `f` until it succeeds or the config says stop.
///
/// Success short-circuits immediately. A failure either surfaces as the
/// final error (attempts exhausted, or the time budget spent) or triggers
/// a jittered pause before the next try.
pub async fn retry_with_backoff<F, Fut, T, E>(config: &RetryConfig, mut f: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Debug,
{
    let started = std::time::Instant::now();
    let mut delay = config.initial_delay;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let err = match f().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempts = attempt, "operation recovered after retrying");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        let out_of_attempts = attempt >= config.max_attempts;
        let out_of_budget = started.elapsed() >= config.total_budget;
        if out_of_attempts || out_of_budget {
            warn!(
                attempts = attempt,
                out_of_budget,
                err = ?err,
                "giving up on transient operation"
            );
            return Err(err);
        }

        let pause = jitter(delay);
        warn!(
            attempt,
            pause_ms = pause.as_millis() as u64,
            err = ?err,
            "transient failure, backing off"
        );
        tokio::time::sleep(pause).await;

        let grown = delay.as_millis() as f64 * config.multiplier;
        delay = Duration::from_millis(grown.min(config.max_delay.as_millis() as f64) as u64);
    }
}
