//! Exponential backoff with jitter, hand-rolled the way the teacher's fetch
//! retry loop does it (`rootsignal-archive`'s `retry_with_backoff`) rather
//! than pulling in a dedicated crate for a three-line formula.

use std::time::Duration;

use rand::Rng;

const BASE: Duration = Duration::from_millis(500);
const CAP: Duration = Duration::from_secs(30);

/// Delay before retry attempt `attempt` (0-indexed): `base * 2^attempt`,
/// capped, plus up to 250ms of jitter to avoid thundering-herd retries
/// across workers.
pub fn delay_for_attempt(attempt: u32) -> Duration {
    let multiplier = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
    let capped = BASE.saturating_mul(multiplier).min(CAP);
    let jitter = Duration::from_millis(rand::rng().random_range(0..250));
    capped + jitter
}

pub async fn sleep_for_attempt(attempt: u32) {
    tokio::time::sleep(delay_for_attempt(attempt)).await;
}
