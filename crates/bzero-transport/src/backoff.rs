//! Capped exponential backoff with a total retry budget.

use std::time::Duration;

/// Backoff schedule for transport reconnects: 500 ms doubling to a 15-minute
/// cap, abandoned once one hour of cumulative waiting has been spent.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    next_delay: Duration,
    cap: Duration,
    budget: Duration,
    spent: Duration,
}

impl Backoff {
    pub const INITIAL: Duration = Duration::from_millis(500);
    pub const CAP: Duration = Duration::from_secs(15 * 60);
    pub const BUDGET: Duration = Duration::from_secs(60 * 60);

    pub fn new() -> Self {
        Self::with(Self::INITIAL, Self::CAP, Self::BUDGET)
    }

    pub fn with(initial: Duration, cap: Duration, budget: Duration) -> Self {
        Self {
            initial,
            next_delay: initial,
            cap,
            budget,
            spent: Duration::ZERO,
        }
    }

    /// The next delay to sleep, or `None` once the budget is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.spent >= self.budget {
            return None;
        }
        let delay = self.next_delay.min(self.budget - self.spent);
        self.spent += delay;
        self.next_delay = (self.next_delay * 2).min(self.cap);
        Some(delay)
    }

    /// Reset after a successful connect so the next failure starts cheap.
    pub fn reset(&mut self) {
        self.next_delay = self.initial;
        self.spent = Duration::ZERO;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubles_to_cap() {
        let mut backoff = Backoff::with(
            Duration::from_millis(500),
            Duration::from_secs(2),
            Duration::from_secs(100),
        );
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(500)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(1)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(2)));
        // capped from here on
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_budget_exhaustion() {
        let mut backoff = Backoff::with(
            Duration::from_secs(4),
            Duration::from_secs(4),
            Duration::from_secs(10),
        );
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(4)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(4)));
        // only 2s of budget left: the final wait is clipped, then exhausted
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(2)));
        assert_eq!(backoff.next_delay(), None);
    }

    #[test]
    fn test_reset_restores_budget() {
        let mut backoff = Backoff::with(
            Duration::from_secs(4),
            Duration::from_secs(4),
            Duration::from_secs(4),
        );
        assert!(backoff.next_delay().is_some());
        assert_eq!(backoff.next_delay(), None);
        backoff.reset();
        assert!(backoff.next_delay().is_some());
    }
}
