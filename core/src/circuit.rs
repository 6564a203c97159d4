//! Circuit breaker guarding the memory engine.
//!
//! Closed until `threshold` consecutive transient failures (a permanent
//! failure opens it immediately). While open, calls are skipped. After the
//! cooldown one probe call is let through: success closes the circuit,
//! failure restarts the cooldown.

use std::time::Duration;
use std::time::Instant;

pub(crate) struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    consecutive_errors: u32,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub(crate) fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold,
            cooldown,
            consecutive_errors: 0,
            opened_at: None,
        }
    }

    /// Whether the next call should be skipped. Returning `false` while the
    /// circuit is open means the cooldown elapsed and this call is the probe.
    pub(crate) fn should_skip(&self) -> bool {
        match self.opened_at {
            None => false,
            Some(opened_at) => opened_at.elapsed() < self.cooldown,
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.opened_at.is_some()
    }

    pub(crate) fn record_success(&mut self) {
        self.consecutive_errors = 0;
        self.opened_at = None;
    }

    pub(crate) fn record_transient(&mut self) {
        self.consecutive_errors += 1;
        if self.opened_at.is_some() {
            // Failed probe: restart the cooldown.
            self.opened_at = Some(Instant::now());
        } else if self.consecutive_errors >= self.threshold {
            self.opened_at = Some(Instant::now());
        }
    }

    pub(crate) fn record_permanent(&mut self) {
        self.consecutive_errors = self.consecutive_errors.max(self.threshold);
        self.opened_at = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_threshold_transient_failures() {
        let mut circuit = CircuitBreaker::new(2, Duration::from_secs(60));
        assert!(!circuit.should_skip());
        circuit.record_transient();
        assert!(!circuit.is_open());
        circuit.record_transient();
        assert!(circuit.is_open());
        assert!(circuit.should_skip());
    }

    #[test]
    fn permanent_failures_open_immediately() {
        let mut circuit = CircuitBreaker::new(5, Duration::from_secs(60));
        circuit.record_permanent();
        assert!(circuit.is_open());
        assert!(circuit.should_skip());
    }

    #[test]
    fn probe_is_allowed_after_cooldown_and_success_closes() {
        let mut circuit = CircuitBreaker::new(1, Duration::from_millis(0));
        circuit.record_transient();
        assert!(circuit.is_open());
        // Zero cooldown: the next call is the probe.
        assert!(!circuit.should_skip());
        circuit.record_success();
        assert!(!circuit.is_open());
    }

    #[test]
    fn failed_probe_restarts_the_cooldown() {
        let mut circuit = CircuitBreaker::new(1, Duration::from_secs(60));
        circuit.record_transient();
        let first_open = circuit.opened_at;
        std::thread::sleep(Duration::from_millis(5));
        circuit.record_transient();
        assert!(circuit.opened_at > first_open);
        assert!(circuit.should_skip());
    }
}
