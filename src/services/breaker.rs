//! Circuit breaker for external provider calls
//!
//! Trips after a run of consecutive failures inside a sliding window and
//! half-opens after a recovery period, letting one probe through.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    run_started: Option<Instant>,
    opened_at: Option<Instant>,
}

/// Circuit breaker: trip after `threshold` consecutive failures within
/// `window`; half-open after `recovery`.
pub struct CircuitBreaker {
    state: Mutex<BreakerState>,
    threshold: u32,
    window: Duration,
    recovery: Duration,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, window: Duration, recovery: Duration) -> Self {
        Self {
            state: Mutex::new(BreakerState::default()),
            threshold,
            window,
            recovery,
        }
    }

    /// Provider-call defaults: 5 failures in 30 s, half-open after 60 s.
    pub fn with_defaults() -> Self {
        Self::new(5, Duration::from_secs(30), Duration::from_secs(60))
    }

    /// True while calls must be rejected. After the recovery period the
    /// breaker half-opens: calls are allowed again, and the next outcome
    /// decides whether it closes or re-trips.
    pub fn is_open(&self) -> bool {
        let state = self.state.lock();
        match state.opened_at {
            Some(at) => at.elapsed() < self.recovery,
            None => false,
        }
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        let now = Instant::now();

        let in_window = state
            .run_started
            .map_or(false, |start| now.duration_since(start) < self.window);
        if in_window {
            state.consecutive_failures += 1;
        } else {
            state.consecutive_failures = 1;
            state.run_started = Some(now);
        }

        if state.consecutive_failures >= self.threshold {
            if state.opened_at.is_none() {
                tracing::warn!(
                    "circuit opened after {} consecutive failures",
                    state.consecutive_failures
                );
            }
            state.opened_at = Some(now);
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock();
        state.consecutive_failures = 0;
        state.run_started = None;
        state.opened_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(5, Duration::from_secs(30), Duration::from_secs(60))
    }

    #[test]
    fn test_starts_closed() {
        assert!(!breaker().is_open());
    }

    #[test]
    fn test_opens_after_threshold() {
        let b = breaker();
        for _ in 0..4 {
            b.record_failure();
            assert!(!b.is_open());
        }
        b.record_failure();
        assert!(b.is_open());
    }

    #[test]
    fn test_success_resets_run() {
        let b = breaker();
        for _ in 0..4 {
            b.record_failure();
        }
        b.record_success();
        for _ in 0..4 {
            b.record_failure();
        }
        assert!(!b.is_open(), "success must break the consecutive run");
    }

    #[test]
    fn test_half_open_after_recovery() {
        let b = CircuitBreaker::new(2, Duration::from_secs(30), Duration::from_millis(0));
        b.record_failure();
        b.record_failure();
        std::thread::sleep(Duration::from_millis(2));
        assert!(!b.is_open(), "recovery elapsed, probe allowed");

        // A probe failure re-trips immediately at the threshold.
        b.record_failure();
        b.record_failure();
        assert!(b.is_open());
    }

    #[test]
    fn test_success_closes_after_half_open() {
        let b = CircuitBreaker::new(2, Duration::from_secs(30), Duration::from_millis(0));
        b.record_failure();
        b.record_failure();
        std::thread::sleep(Duration::from_millis(2));
        b.record_success();
        assert!(!b.is_open());
    }
}
