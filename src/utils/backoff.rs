//! Jittered backoff for conditional-update retries.

use rand::Rng;
use std::time::Duration;

/// Base delay, doubled per attempt and capped well below anything a caller
/// would notice as a stall.
const BASE_MS: u64 = 2;
const CAP_MS: u64 = 50;

/// Delay before retrying after losing race number `attempt` (0-based).
/// Exponential up to a small cap, with uniform jitter so colliding writers
/// do not re-collide in lockstep.
#[must_use]
pub fn jittered(attempt: u32) -> Duration {
    let exp = BASE_MS.saturating_mul(1u64 << attempt.min(6));
    let ceiling = exp.min(CAP_MS);
    let ms = rand::rng().random_range(0..=ceiling);
    Duration::from_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stays_under_cap() {
        for attempt in 0..32 {
            assert!(jittered(attempt) <= Duration::from_millis(CAP_MS));
        }
    }
}
