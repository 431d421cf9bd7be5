//! Capped exponential backoff for client reconnection.

use std::time::Duration;

use pkg_constants::channel::{RECONNECT_BASE_DELAY_MS, RECONNECT_MAX_DOUBLINGS};

/// Delay grows `base × 2^n`, with the exponent capped; the attempt count is
/// bounded separately (-1 retries forever).
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max_doublings: u32,
    max_attempts: i32,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max_doublings: u32, max_attempts: i32) -> Self {
        Self {
            base,
            max_doublings,
            max_attempts,
            attempt: 0,
        }
    }

    pub fn reconnect(max_attempts: i32) -> Self {
        Self::new(
            Duration::from_millis(RECONNECT_BASE_DELAY_MS),
            RECONNECT_MAX_DOUBLINGS,
            max_attempts,
        )
    }

    /// The delay before the next attempt, or `None` once the attempt budget
    /// is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.max_attempts >= 0 && self.attempt >= self.max_attempts as u32 {
            return None;
        }
        let exponent = self.attempt.min(self.max_doublings);
        self.attempt += 1;
        Some(self.base * 2u32.pow(exponent))
    }

    /// Call after a successful attempt so the next failure starts small.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_then_caps() {
        let mut b = Backoff::new(Duration::from_millis(100), 3, -1);
        let delays: Vec<u64> = (0..6).map(|_| b.next_delay().unwrap().as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 800, 800]);
    }

    #[test]
    fn attempt_budget_is_enforced() {
        let mut b = Backoff::new(Duration::from_millis(10), 5, 2);
        assert!(b.next_delay().is_some());
        assert!(b.next_delay().is_some());
        assert!(b.next_delay().is_none());
    }

    #[test]
    fn negative_budget_means_forever() {
        let mut b = Backoff::new(Duration::from_millis(10), 2, -1);
        for _ in 0..100 {
            assert!(b.next_delay().is_some());
        }
    }

    #[test]
    fn reset_restarts_the_curve() {
        let mut b = Backoff::new(Duration::from_millis(100), 3, -1);
        b.next_delay();
        b.next_delay();
        b.reset();
        assert_eq!(b.next_delay().unwrap(), Duration::from_millis(100));
    }
}
