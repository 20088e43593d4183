//! Bounded retry and backoff arithmetic for deterministic orchestration.

use std::time::Duration;

/// Delay before retry number `attempt` (0-based): `base * 2^attempt`, capped at `max`.
pub fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(max).min(max)
}

/// Next value of a retry counter, or `None` once `limit` retries have been used.
pub fn next_retry(counter: u32, limit: u32) -> Option<u32> {
    (counter < limit).then_some(counter + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_capped() {
        let base = Duration::from_millis(100);
        let max = Duration::from_millis(500);
        assert_eq!(backoff_delay(base, max, 0), Duration::from_millis(100));
        assert_eq!(backoff_delay(base, max, 2), Duration::from_millis(400));
        assert_eq!(backoff_delay(base, max, 3), max);
        assert_eq!(backoff_delay(base, max, 40), max);
    }

    #[test]
    fn retry_counter_stops_at_limit() {
        assert_eq!(next_retry(0, 2), Some(1));
        assert_eq!(next_retry(1, 2), Some(2));
        assert_eq!(next_retry(2, 2), None);
        assert_eq!(next_retry(0, 0), None);
    }
}
