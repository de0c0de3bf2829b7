//! Backoff schedules for bounded polling.

use std::time::Duration;

/// Delay schedule for retried operations. Attempts are 0-based; once
/// `delay_for` returns `None` the caller surfaces a terminal error instead
/// of retrying further.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    Fixed { delay: Duration, max_attempts: u32 },
    Exponential { base: Duration, cap: Duration, max_attempts: u32 },
}

impl RetryPolicy {
    pub fn fixed(delay: Duration, max_attempts: u32) -> Self {
        Self::Fixed { delay, max_attempts }
    }

    pub fn exponential(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self::Exponential { base, cap, max_attempts }
    }

    pub fn max_attempts(&self) -> u32 {
        match *self {
            Self::Fixed { max_attempts, .. } | Self::Exponential { max_attempts, .. } => max_attempts,
        }
    }

    /// Delay to wait before retry number `attempt`, or `None` once the
    /// attempt budget is exhausted.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        match *self {
            Self::Fixed { delay, max_attempts } => (attempt < max_attempts).then_some(delay),
            Self::Exponential { base, cap, max_attempts } => {
                if attempt >= max_attempts {
                    return None;
                }
                let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
                Some(base.checked_mul(factor).map_or(cap, |d| d.min(cap)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_policy_is_flat_then_exhausts() {
        let p = RetryPolicy::fixed(Duration::from_millis(200), 3);
        assert_eq!(p.delay_for(0), Some(Duration::from_millis(200)));
        assert_eq!(p.delay_for(2), Some(Duration::from_millis(200)));
        assert_eq!(p.delay_for(3), None);
        assert_eq!(p.delay_for(100), None);
    }

    #[test]
    fn exponential_doubles_and_saturates_at_cap() {
        let p = RetryPolicy::exponential(Duration::from_millis(100), Duration::from_secs(1), 8);
        assert_eq!(p.delay_for(0), Some(Duration::from_millis(100)));
        assert_eq!(p.delay_for(1), Some(Duration::from_millis(200)));
        assert_eq!(p.delay_for(2), Some(Duration::from_millis(400)));
        assert_eq!(p.delay_for(3), Some(Duration::from_millis(800)));
        assert_eq!(p.delay_for(4), Some(Duration::from_secs(1)));
        assert_eq!(p.delay_for(7), Some(Duration::from_secs(1)));
        assert_eq!(p.delay_for(8), None);
    }

    #[test]
    fn exponential_survives_large_attempt_numbers() {
        let p = RetryPolicy::exponential(Duration::from_millis(1), Duration::from_secs(30), u32::MAX);
        assert_eq!(p.delay_for(40), Some(Duration::from_secs(30)));
    }

    #[test]
    fn zero_attempts_never_retries() {
        assert_eq!(RetryPolicy::fixed(Duration::from_millis(1), 0).delay_for(0), None);
    }
}
