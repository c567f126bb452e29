//! Sliding-window circuit breaker.
//!
//! Failures inside `failure_window` accumulate; hitting the threshold opens
//! the circuit. After `cooldown` the breaker half-opens and a single probe
//! decides: success closes it, failure re-opens immediately. An optional
//! state-change callback lets the gateway pause and resume downstream
//! consumers.

use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

/// Breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Parameters with the gateway defaults.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: usize,
    pub failure_window: Duration,
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
        }
    }
}

type StateCallback = Arc<dyn Fn(BreakerState) + Send + Sync>;

struct Inner {
    failures: Vec<Instant>,
    state: BreakerState,
    opened_at: Option<Instant>,
}

/// One breaker instance, cheap to clone and share.
#[derive(Clone)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Arc<Mutex<Inner>>,
    on_state_change: Option<StateCallback>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Arc::new(Mutex::new(Inner {
                failures: Vec::new(),
                state: BreakerState::Closed,
                opened_at: None,
            })),
            on_state_change: None,
        }
    }

    /// Attach a callback invoked on every state change.
    pub fn with_state_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(BreakerState) + Send + Sync + 'static,
    {
        self.on_state_change = Some(Arc::new(callback));
        self
    }

    /// Current state, auto-promoting OPEN → HALF_OPEN after the cooldown.
    pub fn state(&self) -> BreakerState {
        let mut inner = self.lock();
        if inner.state == BreakerState::Open {
            let elapsed = inner
                .opened_at
                .map(|at| at.elapsed())
                .unwrap_or(Duration::ZERO);
            if elapsed >= self.config.cooldown {
                inner.state = BreakerState::HalfOpen;
                drop(inner);
                self.notify(BreakerState::HalfOpen);
                return BreakerState::HalfOpen;
            }
        }
        inner.state
    }

    /// Requests pass in CLOSED and HALF_OPEN.
    pub fn is_allowed(&self) -> bool {
        matches!(self.state(), BreakerState::Closed | BreakerState::HalfOpen)
    }

    /// Record a success: clears failures and closes from OPEN/HALF_OPEN.
    pub fn record_success(&self) {
        let changed = {
            let mut inner = self.lock();
            inner.failures.clear();
            inner.opened_at = None;
            if inner.state != BreakerState::Closed {
                inner.state = BreakerState::Closed;
                true
            } else {
                false
            }
        };
        if changed {
            self.notify(BreakerState::Closed);
        }
    }

    /// Record a failure, opening the breaker at the threshold. A failure in
    /// HALF_OPEN re-opens immediately.
    pub fn record_failure(&self) {
        let now = Instant::now();
        let opened = {
            let mut inner = self.lock();
            // Auto-promotion must happen before the half-open check.
            if inner.state == BreakerState::Open {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.cooldown {
                    inner.state = BreakerState::HalfOpen;
                }
            }

            if inner.state == BreakerState::HalfOpen {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(now);
                inner.failures.clear();
                true
            } else {
                let window = self.config.failure_window;
                inner.failures.retain(|at| now.duration_since(*at) < window);
                inner.failures.push(now);
                if inner.failures.len() >= self.config.failure_threshold
                    && inner.state == BreakerState::Closed
                {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(now);
                    true
                } else {
                    false
                }
            }
        };
        if opened {
            self.notify(BreakerState::Open);
        }
    }

    fn notify(&self, state: BreakerState) {
        if let Some(callback) = &self.on_state_change {
            callback(state);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_breaker() -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            failure_threshold: 3,
            failure_window: Duration::from_secs(60),
            cooldown: Duration::from_millis(30),
        })
    }

    #[test]
    fn opens_at_threshold() {
        let breaker = fast_breaker();
        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.is_allowed());
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.is_allowed());
    }

    #[test]
    fn success_resets_failure_count() {
        let breaker = fast_breaker();
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.is_allowed(), "count restarted after success");
    }

    #[tokio::test]
    async fn cooldown_half_opens_then_success_closes() {
        let breaker = fast_breaker();
        for _ in 0..3 {
            breaker.record_failure();
        }
        assert!(!breaker.is_allowed());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert!(breaker.is_allowed());

        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens_immediately() {
        let breaker = fast_breaker();
        for _ in 0..3 {
            breaker.record_failure();
        }
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.is_allowed());
    }

    #[tokio::test]
    async fn state_callback_sees_open_and_close() {
        let opens = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        let (o, c) = (opens.clone(), closes.clone());
        let breaker = CircuitBreaker::new(BreakerConfig {
            failure_threshold: 2,
            failure_window: Duration::from_secs(60),
            cooldown: Duration::from_millis(10),
        })
        .with_state_callback(move |state| match state {
            BreakerState::Open => {
                o.fetch_add(1, Ordering::SeqCst);
            }
            BreakerState::Closed => {
                c.fetch_add(1, Ordering::SeqCst);
            }
            BreakerState::HalfOpen => {}
        });

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(opens.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let _ = breaker.state(); // promote to half-open
        breaker.record_success();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stale_failures_pruned_outside_window() {
        let breaker = CircuitBreaker::new(BreakerConfig {
            failure_threshold: 2,
            failure_window: Duration::from_millis(10),
            cooldown: Duration::from_secs(30),
        });
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        breaker.record_failure();
        assert!(breaker.is_allowed(), "first failure aged out of the window");
    }
}
