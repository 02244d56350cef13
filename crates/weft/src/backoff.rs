//! Exponential backoff with jitter.
//!
//! Used by queue retries, the verify poll loop, and deadlock retries on
//! the user row.

use rand::Rng;
use std::cmp::min;
use std::time::Duration;

const EXP_BASE: u64 = 2;

/// Delay before retry number `attempt` (1-based), capped, without jitter.
pub fn delay_for_attempt(base_ms: u64, cap_ms: u64, attempt: u32) -> Duration {
    let factor = EXP_BASE.saturating_pow(attempt.saturating_sub(1));
    let wait_ms = base_ms.saturating_mul(factor);
    Duration::from_millis(min(wait_ms, cap_ms))
}

/// Iterator of capped exponential delays, starting at `base_ms`.
pub fn backoff_iter(base_ms: u64, cap_ms: u64) -> impl Iterator<Item = Duration> {
    (1u32..).map(move |attempt| delay_for_attempt(base_ms, cap_ms, attempt))
}

/// Apply ±25% jitter so synchronized retries fan out.
pub fn with_jitter(d: Duration) -> Duration {
    let ms = d.as_millis() as u64;
    if ms == 0 {
        return d;
    }
    let spread = ms / 4;
    let jittered = ms - spread + rand::thread_rng().gen_range(0..=spread * 2);
    Duration::from_millis(jittered)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_cap() {
        let delays: Vec<u64> = backoff_iter(1_000, 8_000)
            .take(6)
            .map(|d| d.as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 8_000, 8_000]);
    }

    #[test]
    fn no_overflow_at_high_attempts() {
        assert_eq!(
            delay_for_attempt(1_000, 300_000, 200),
            Duration::from_millis(300_000)
        );
    }

    #[test]
    fn jitter_stays_within_bounds() {
        for _ in 0..100 {
            let d = with_jitter(Duration::from_millis(1_000)).as_millis() as u64;
            assert!((750..=1_250).contains(&d), "jittered delay {d} out of range");
        }
    }
}
