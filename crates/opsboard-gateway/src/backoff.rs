//! Capped exponential reconnect backoff with full jitter.

use rand::Rng;
use std::time::Duration;

/// Delay sequence for gateway reconnect attempts.
///
/// Each delay is drawn uniformly from `[0, min(base * 2^attempt, cap)]`.
/// Once `max_attempts` delays have been handed out the sequence is exhausted
/// and the transport reports the gateway as unreachable instead of retrying.
#[derive(Clone, Debug)]
pub struct ReconnectBackoff {
    base: Duration,
    cap: Duration,
    max_attempts: Option<u32>,
    jittered: bool,
    attempt: u32,
}

impl ReconnectBackoff {
    /// `max_attempts` of 0 means unlimited attempts.
    pub fn new(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            cap,
            max_attempts: (max_attempts > 0).then_some(max_attempts),
            jittered: true,
            attempt: 0,
        }
    }

    /// Disable jitter; delays become the deterministic capped sequence.
    pub fn without_jitter(mut self) -> Self {
        self.jittered = false;
        self
    }

    /// Next delay, or `None` once the attempt budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }

        let base_ms = self.base.as_millis() as u128;
        let cap_ms = self.cap.as_millis() as u128;
        let multiplier = 1u128.checked_shl(self.attempt.min(63)).unwrap_or(u128::MAX);
        let capped_ms = base_ms.saturating_mul(multiplier).min(cap_ms);

        let delay_ms = if self.jittered {
            let capped = capped_ms.min(u64::MAX as u128) as u64;
            rand::thread_rng().gen_range(0..=capped)
        } else {
            capped_ms.min(u64::MAX as u128) as u64
        };

        self.attempt = self.attempt.saturating_add(1);
        Some(Duration::from_millis(delay_ms))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_exhausted(&self) -> bool {
        self.max_attempts.is_some_and(|max| self.attempt >= max)
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30), 8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unjittered_sequence_doubles_up_to_cap() {
        let mut backoff =
            ReconnectBackoff::new(Duration::from_millis(100), Duration::from_millis(350), 4)
                .without_jitter();
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(200)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(350)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(350)));
        assert_eq!(backoff.next_delay(), None);
        assert!(backoff.is_exhausted());
    }

    #[test]
    fn jittered_delay_never_exceeds_cap() {
        let mut backoff =
            ReconnectBackoff::new(Duration::from_millis(500), Duration::from_millis(600), 3);
        while let Some(delay) = backoff.next_delay() {
            assert!(delay <= Duration::from_millis(600));
        }
        assert_eq!(backoff.attempt(), 3);
    }

    #[test]
    fn reset_restores_the_attempt_budget() {
        let mut backoff =
            ReconnectBackoff::new(Duration::from_millis(10), Duration::from_millis(20), 1)
                .without_jitter();
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());
        backoff.reset();
        assert!(backoff.next_delay().is_some());
    }

    #[test]
    fn zero_max_attempts_means_unlimited() {
        let mut backoff =
            ReconnectBackoff::new(Duration::from_millis(1), Duration::from_millis(2), 0)
                .without_jitter();
        for _ in 0..100 {
            assert!(backoff.next_delay().is_some());
        }
        assert!(!backoff.is_exhausted());
    }
}
