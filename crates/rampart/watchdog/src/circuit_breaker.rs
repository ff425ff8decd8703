//! Circuit breaker for a single component.
//!
//! Tracks failures and successes, transitioning between states:
//! - Closed: normal operation, requests allowed
//! - Open: too many failures (or forced by containment), requests blocked
//! - Half-Open: reset timeout elapsed since the last failure, limited probes allowed

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rampart_types::ComponentId;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::CircuitBreakerConfig;

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Circuit is closed, requests flow normally.
    Closed,

    /// Circuit is open, requests are blocked.
    Open,

    /// Circuit is testing if the component has recovered.
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

struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    half_open_requests: u32,
    /// Monotonic instant of the last failure, or of the forced open when the
    /// breaker was opened without one.
    open_reference: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    last_transition: DateTime<Utc>,
}

/// Circuit breaker for a single component.
pub struct CircuitBreaker {
    component_id: ComponentId,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a new, closed circuit breaker for a component.
    pub fn new(component_id: ComponentId, config: CircuitBreakerConfig) -> Self {
        Self {
            component_id,
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                half_open_requests: 0,
                open_reference: None,
                last_failure_at: None,
                last_transition: Utc::now(),
            }),
        }
    }

    pub fn component_id(&self) -> &ComponentId {
        &self.component_id
    }

    /// Get the current state, applying the open to half-open timeout first.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.check_timeout(&mut inner);
        inner.state
    }

    /// Check if a request should be allowed.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock();
        self.check_timeout(&mut inner);

        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if inner.half_open_requests < self.config.half_open_max_requests {
                    inner.half_open_requests += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful operation.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        self.check_timeout(&mut inner);

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    info!(
                        component = %self.component_id,
                        successes = inner.success_count,
                        "Circuit breaker closing after successful recovery"
                    );
                    self.transition_to(&mut inner, CircuitState::Closed);
                }
            }
            CircuitState::Open => {
                debug!(component = %self.component_id, "Success recorded while circuit open");
            }
        }
    }

    /// Record a failed operation.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        self.check_timeout(&mut inner);

        inner.open_reference = Some(Instant::now());
        inner.last_failure_at = Some(Utc::now());

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    warn!(
                        component = %self.component_id,
                        failures = inner.failure_count,
                        "Circuit breaker opening due to failures"
                    );
                    self.transition_to(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                warn!(
                    component = %self.component_id,
                    "Circuit breaker re-opening after half-open failure"
                );
                self.transition_to(&mut inner, CircuitState::Open);
            }
            CircuitState::Open => {
                inner.failure_count += 1;
            }
        }
    }

    /// Force the circuit to a specific state.
    pub fn force_state(&self, new_state: CircuitState) {
        let mut inner = self.inner.lock();
        info!(
            component = %self.component_id,
            old_state = %inner.state,
            new_state = %new_state,
            "Circuit breaker state forced"
        );
        if new_state == CircuitState::Open && inner.open_reference.is_none() {
            inner.open_reference = Some(Instant::now());
        }
        self.transition_to(&mut inner, new_state);
    }

    /// Reset the circuit breaker to closed state.
    pub fn reset(&self) {
        self.force_state(CircuitState::Closed);
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    /// Get circuit breaker statistics.
    pub fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.inner.lock();
        self.check_timeout(&mut inner);
        CircuitBreakerStats {
            component_id: self.component_id.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            threshold: self.config.failure_threshold,
            last_failure_at: inner.last_failure_at,
            last_transition: inner.last_transition,
        }
    }

    /// Move from open to half-open once the reset timeout has elapsed since
    /// the last failure.
    fn check_timeout(&self, inner: &mut BreakerInner) {
        if inner.state != CircuitState::Open {
            return;
        }
        let Some(reference) = inner.open_reference else {
            return;
        };

        if reference.elapsed() >= self.config.reset_timeout() {
            info!(
                component = %self.component_id,
                "Circuit breaker transitioning to half-open after timeout"
            );
            self.transition_to(inner, CircuitState::HalfOpen);
        }
    }

    fn transition_to(&self, inner: &mut BreakerInner, new_state: CircuitState) {
        inner.state = new_state;
        inner.last_transition = Utc::now();

        match new_state {
            CircuitState::Closed => {
                inner.failure_count = 0;
                inner.success_count = 0;
                inner.half_open_requests = 0;
                inner.open_reference = None;
            }
            CircuitState::Open => {
                inner.success_count = 0;
                inner.half_open_requests = 0;
            }
            CircuitState::HalfOpen => {
                inner.success_count = 0;
                inner.half_open_requests = 0;
            }
        }
    }
}

/// Statistics for a circuit breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerStats {
    pub component_id: ComponentId,

    pub state: CircuitState,

    /// Failures counted since the breaker last closed.
    pub failure_count: u32,

    /// Successes recorded in half-open.
    pub success_count: u32,

    pub threshold: u32,

    pub last_failure_at: Option<DateTime<Utc>>,

    pub last_transition: DateTime<Utc>,
}
