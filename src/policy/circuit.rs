//! Per-endpoint circuit breaker.
//!
//! ```text
//!            N consecutive Unreachable
//!   Closed ─────────────────────────────► Open { until }
//!     ▲                                      │ cooldown elapsed
//!     │ trial reached the endpoint           ▼
//!     └──────────────────────────────── HalfOpen (single trial)
//!                                            │ trial Unreachable
//!                                            └──────► Open { until }
//! ```

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Circuit breaker configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitConfig {
    /// Consecutive Unreachable outcomes that open the circuit.
    pub failure_threshold: u32,
    /// How long an open circuit rejects calls before a trial call.
    pub cooldown: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(5),
        }
    }
}

/// Externally visible circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open { until: Instant },
    HalfOpen,
}

#[derive(Debug)]
struct CircuitInner {
    state: CircuitState,
    consecutive_failures: u32,
    trial_started: Option<Instant>,
}

/// Circuit breaker guarding one endpoint.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitConfig,
    inner: Mutex<CircuitInner>,
}

impl CircuitBreaker {
    /// Create a closed circuit.
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(CircuitInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                trial_started: None,
            }),
        }
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Ask to send a call through the circuit.
    ///
    /// An open circuit whose cooldown has elapsed half-opens and admits exactly one
    /// trial call. A trial that never reports back is abandoned after another cooldown.
    pub fn try_acquire(&self) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open { until } if now >= until => {
                inner.state = CircuitState::HalfOpen;
                inner.trial_started = Some(now);
                tracing::debug!("circuit half-open, admitting trial call");
                true
            }
            CircuitState::Open { .. } => false,
            CircuitState::HalfOpen => match inner.trial_started {
                Some(started) if now.duration_since(started) < self.config.cooldown => false,
                _ => {
                    inner.trial_started = Some(now);
                    true
                }
            },
        }
    }

    /// Would a call be admitted right now? Does not consume the trial slot.
    pub fn would_admit(&self) -> bool {
        let now = Instant::now();
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open { until } => now >= until,
            CircuitState::HalfOpen => inner
                .trial_started
                .map_or(true, |started| now.duration_since(started) >= self.config.cooldown),
        }
    }

    /// The endpoint answered; close the circuit.
    pub fn on_reachable(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Closed {
            tracing::debug!("circuit closed");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.trial_started = None;
    }

    /// The endpoint could not be reached.
    pub fn on_unreachable(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        let reopen = matches!(inner.state, CircuitState::HalfOpen)
            || inner.consecutive_failures >= self.config.failure_threshold;
        if reopen {
            inner.state = CircuitState::Open {
                until: now + self.config.cooldown,
            };
            inner.trial_started = None;
            tracing::warn!(
                failures = inner.consecutive_failures,
                cooldown_ms = self.config.cooldown.as_millis() as u64,
                "circuit opened"
            );
        }
    }

    /// Consecutive Unreachable outcomes recorded.
    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }
}
