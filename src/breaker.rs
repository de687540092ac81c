//! Circuit breaker guarding the external toxicity scorer
//!
//! Three explicit states. Closed counts consecutive failures; at the
//! threshold the breaker opens and calls are skipped entirely. After the
//! open interval elapses, exactly one probe call runs half-open: success
//! closes the breaker and resets the count, failure reopens it.

use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum Inner {
    Closed { failures: u32 },
    Open { since: Instant },
    HalfOpen,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    open_duration: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, open_duration: Duration) -> Self {
        Self {
            failure_threshold,
            open_duration,
            inner: Mutex::new(Inner::Closed { failures: 0 }),
        }
    }

    /// Whether a call may proceed right now.
    ///
    /// Transitions `Open → HalfOpen` when the open interval has elapsed, so
    /// the caller that receives `true` in that window is the probe.
    pub async fn allow(&self) -> bool {
        let mut inner = self.inner.lock().await;
        match *inner {
            Inner::Closed { .. } => true,
            Inner::HalfOpen => false,
            Inner::Open { since } => {
                if since.elapsed() >= self.open_duration {
                    *inner = Inner::HalfOpen;
                    info!("circuit breaker half-open, probing");
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful call.
    pub async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        match *inner {
            Inner::HalfOpen => {
                info!("circuit breaker closed after successful probe");
                *inner = Inner::Closed { failures: 0 };
            }
            Inner::Closed { ref mut failures } => *failures = 0,
            Inner::Open { .. } => {}
        }
    }

    /// Record a failed call.
    pub async fn record_failure(&self) {
        let mut inner = self.inner.lock().await;
        match *inner {
            Inner::HalfOpen => {
                warn!("circuit breaker probe failed, reopening");
                *inner = Inner::Open {
                    since: Instant::now(),
                };
            }
            Inner::Closed { failures } => {
                let failures = failures + 1;
                if failures >= self.failure_threshold {
                    warn!(failures, "circuit breaker opened");
                    *inner = Inner::Open {
                        since: Instant::now(),
                    };
                } else {
                    *inner = Inner::Closed { failures };
                }
            }
            Inner::Open { .. } => {}
        }
    }

    pub async fn state(&self) -> BreakerState {
        match *self.inner.lock().await {
            Inner::Closed { .. } => BreakerState::Closed,
            Inner::Open { .. } => BreakerState::Open,
            Inner::HalfOpen => BreakerState::HalfOpen,
        }
    }
}
