//! Backoff helpers shared by the poller, the worker pool and retries.

use crate::config::{BackoffStrategy, RetryPolicy};
use rand::Rng;
use std::time::Duration;

/// Idle backoff in milliseconds after `attempt` consecutive empty rounds.
///
/// Grows exponentially from 10ms, capped at 1s, with a small offset derived
/// from `seed` so that loops started together drift apart.
pub fn calculate_backoff(attempt: u32, seed: u64) -> u64 {
    let base = 10u64.saturating_mul(1u64 << attempt.min(7));
    let capped = base.min(1000);
    capped + (seed % 10)
}

/// Delay before retry number `retry` (1-based) under `policy`.
///
/// The raw delay follows the policy's strategy and is clamped to
/// `max_delay_ms`. With jitter enabled the result is drawn uniformly
/// from `[0, delay]`.
pub fn retry_delay(policy: &RetryPolicy, retry: u32) -> Duration {
    let capped_ms = capped_delay_ms(policy, retry);

    if policy.enable_jitter && capped_ms > 0 {
        let jittered = rand::thread_rng().gen_range(0..=capped_ms);
        Duration::from_millis(jittered)
    } else {
        Duration::from_millis(capped_ms)
    }
}

/// Sum of the un-jittered delays of retries `1..=retries`, an upper bound
/// for what [`retry_delay`] can sleep in total.
pub fn max_total_delay(policy: &RetryPolicy, retries: u32) -> Duration {
    let mut total_ms = 0u64;
    let mut previous = None;
    for retry in 1..=retries {
        let delay_ms = capped_delay_ms(policy, retry);
        if delay_ms >= policy.max_delay_ms || previous == Some(delay_ms) {
            // The delay stopped changing, every later retry sleeps it as well.
            let remaining = u64::from(retries - retry + 1);
            total_ms = total_ms.saturating_add(delay_ms.saturating_mul(remaining));
            break;
        }
        total_ms = total_ms.saturating_add(delay_ms);
        previous = Some(delay_ms);
    }
    Duration::from_millis(total_ms)
}

fn capped_delay_ms(policy: &RetryPolicy, retry: u32) -> u64 {
    let exponent = retry.saturating_sub(1);
    let raw_ms = match &policy.backoff_strategy {
        BackoffStrategy::Fixed => policy.base_delay_ms as f64,
        BackoffStrategy::Linear { increment_ms } => {
            policy.base_delay_ms as f64 + (*increment_ms as f64) * exponent as f64
        }
        BackoffStrategy::Exponential { multiplier } => {
            policy.base_delay_ms as f64 * multiplier.powi(exponent.min(63) as i32)
        }
    };

    raw_ms.min(policy.max_delay_ms as f64).max(0.0) as u64
}
