//! Circuit breaker guarding the enrichment provider.
//!
//! Closed: calls flow. After `failure_threshold` consecutive failures the
//! breaker opens and calls are short-circuited. Once `open_cooldown` has
//! passed it goes half-open and admits a single probe; a successful probe
//! closes it, a failed one re-opens it.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    /// Start of the probe currently admitted in half-open state
    probe_started: Option<Instant>,
}

pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    failure_threshold: u32,
    open_cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, open_cooldown: Duration) -> Self {
        CircuitBreaker {
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_started: None,
            }),
            failure_threshold: failure_threshold.max(1),
            open_cooldown,
        }
    }

    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.check_cooldown(&mut inner, Instant::now());
        inner.state
    }

    /// Whether a call may go to the provider now
    pub fn allow_request(&self) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        self.check_cooldown(&mut inner, now);

        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                // A probe that never reported back (e.g. cancelled) is replaced after a cooldown
                let probe_busy = inner
                    .probe_started
                    .map_or(false, |started| now.duration_since(started) < self.open_cooldown);
                if probe_busy {
                    false
                } else {
                    inner.probe_started = Some(now);
                    true
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Closed {
            log::info!("Enrichment circuit closing after successful probe");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.probe_started = None;
    }

    pub fn record_failure(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    log::warn!(
                        "Enrichment circuit opening after {} consecutive failures",
                        inner.consecutive_failures
                    );
                    Self::open(&mut inner, now);
                }
            }
            CircuitState::HalfOpen => {
                log::warn!("Enrichment circuit re-opening after failed probe");
                Self::open(&mut inner, now);
            }
            CircuitState::Open => {}
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    fn open(inner: &mut BreakerInner, now: Instant) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(now);
        inner.probe_started = None;
    }

    fn check_cooldown(&self, inner: &mut BreakerInner, now: Instant) {
        if inner.state != CircuitState::Open {
            return;
        }
        if let Some(opened_at) = inner.opened_at {
            if now.duration_since(opened_at) >= self.open_cooldown {
                log::debug!("Enrichment circuit half-open, admitting a probe");
                inner.state = CircuitState::HalfOpen;
                inner.probe_started = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(30));

        for _ in 0..2 {
            assert!(breaker.allow_request());
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow_request());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(30));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.consecutive_failures(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_single_probe() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(30));
        breaker.record_failure();
        assert!(!breaker.allow_request());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.allow_request());
        assert!(!breaker.allow_request(), "second concurrent probe");

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.allow_request());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_reopens() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(30));
        breaker.record_failure();

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(breaker.allow_request());
        breaker.record_failure();

        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow_request());

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(breaker.allow_request());
    }
}
