//! Wall-clock helpers.
//!
//! Persisted timestamps are milliseconds since the Unix epoch. The timer core
//! waits on monotonic [`Instant`]s, so wall-clock deadlines are translated at
//! scheduling time.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Current wall-clock time in milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

/// Translate a wall-clock deadline into a monotonic instant.
///
/// Deadlines that already passed map to `Instant::now()`, so they fire at once.
#[must_use]
pub fn instant_from_wall_clock(deadline_ms: u128) -> Instant {
    let now = now_ms();
    let remaining = deadline_ms.saturating_sub(now);
    let remaining = u64::try_from(remaining).unwrap_or(u64::MAX);
    Instant::now() + Duration::from_millis(remaining)
}

/// Milliseconds elapsed between `since_ms` and now, saturating at zero.
#[must_use]
pub fn elapsed_since(since_ms: u128) -> Duration {
    let elapsed = now_ms().saturating_sub(since_ms);
    Duration::from_millis(u64::try_from(elapsed).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn past_deadline_maps_to_now() {
        let before = Instant::now();
        let at = instant_from_wall_clock(now_ms().saturating_sub(100));
        assert!(at >= before);
        assert!(at <= Instant::now());
    }

    #[test]
    fn future_deadline_maps_forward() {
        let at = instant_from_wall_clock(now_ms() + 10_000);
        assert!(at > Instant::now() + Duration::from_secs(5));
    }
}
