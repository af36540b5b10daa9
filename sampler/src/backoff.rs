use std::time::Duration;

/// Exponential reconnect delay with a cap and an optional attempt budget.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    failures: u32,
    max_failures: Option<u32>,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, max_failures: Option<u32>) -> Self {
        let initial = initial.max(Duration::from_millis(1));
        Self {
            initial,
            max: max.max(initial),
            current: initial,
            failures: 0,
            max_failures,
        }
    }

    /// Record a failed attempt. Returns how long to wait before the next
    /// one, or `None` once the attempt budget is spent.
    pub fn on_failure(&mut self) -> Option<Duration> {
        self.failures = self.failures.saturating_add(1);
        if self.max_failures.is_some_and(|max| self.failures >= max) {
            return None;
        }
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        Some(delay)
    }

    /// Reset after a successful connect.
    pub fn on_success(&mut self) {
        self.current = self.initial;
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}
