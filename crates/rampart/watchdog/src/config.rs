//! Watchdog configuration.
//!
//! Durations are stored as integer milliseconds or seconds so the structs
//! load cleanly from files and environment variables; use the accessors to
//! get a [`Duration`].

use std::time::Duration;

use rampart_types::BackoffPolicy;
use serde::{Deserialize, Serialize};

use crate::error::{Result, WatchdogError};

/// Configuration for the whole watchdog layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Circuit breaker configuration.
    pub circuit_breaker: CircuitBreakerConfig,

    /// Deadlock detection configuration.
    pub deadlock: DeadlockConfig,

    /// Race detection and retry configuration.
    pub race: RaceConfig,

    /// System recovery planning configuration.
    pub recovery: RecoveryPlanConfig,
}

impl WatchdogConfig {
    /// Reject settings that would make a detector meaningless.
    pub fn validate(&self) -> Result<()> {
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(WatchdogError::Configuration(
                "circuit_breaker.failure_threshold must be at least 1".into(),
            ));
        }
        if self.circuit_breaker.success_threshold == 0 {
            return Err(WatchdogError::Configuration(
                "circuit_breaker.success_threshold must be at least 1".into(),
            ));
        }
        if self.race.backoff.multiplier < 1.0 {
            return Err(WatchdogError::Configuration(
                "race.backoff.multiplier must be >= 1.0".into(),
            ));
        }
        Ok(())
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Number of failures to open the circuit.
    pub failure_threshold: u32,

    /// Number of successes in half-open to close the circuit.
    pub success_threshold: u32,

    /// Seconds since the last failure before open moves to half-open.
    pub reset_timeout_secs: u64,

    /// Maximum requests allowed in half-open state.
    pub half_open_max_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 1,
            reset_timeout_secs: 60,
            half_open_max_requests: 1,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_secs(self.reset_timeout_secs)
    }
}

/// Deadlock detection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadlockConfig {
    /// Seconds a lock request may wait before it counts as timed out.
    pub lock_timeout_secs: u64,

    /// Recoveries of the same holder set before the deadlock is treated as
    /// unrecoverable.
    pub max_recovery_attempts: u32,
}

impl Default for DeadlockConfig {
    fn default() -> Self {
        Self {
            lock_timeout_secs: 30,
            max_recovery_attempts: 3,
        }
    }
}

impl DeadlockConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }
}

/// Race detection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RaceConfig {
    /// Two writes closer than this many milliseconds are a race.
    pub window_ms: u64,

    /// Retry policy for contended accesses.
    pub backoff: BackoffPolicy,

    /// Access attempts retained per resource; older ones are dropped.
    pub history_per_resource: usize,
}

impl Default for RaceConfig {
    fn default() -> Self {
        Self {
            window_ms: 100,
            history_per_resource: 1024,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl RaceConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Minute estimates for each recovery plan step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryPlanConfig {
    pub assess_minutes: u32,
    pub restore_services_minutes: u32,
    pub restore_state_minutes: u32,
    pub verify_consistency_minutes: u32,
    pub resume_minutes: u32,
}

impl Default for RecoveryPlanConfig {
    fn default() -> Self {
        Self {
            assess_minutes: 5,
            restore_services_minutes: 15,
            restore_state_minutes: 10,
            verify_consistency_minutes: 10,
            resume_minutes: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WatchdogConfig::default();
        assert_eq!(config.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.circuit_breaker.reset_timeout(), Duration::from_secs(60));
        assert_eq!(config.deadlock.lock_timeout(), Duration::from_secs(30));
        assert_eq!(config.race.window(), Duration::from_millis(100));
        assert_eq!(config.race.backoff.max_retries, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_threshold_rejected() {
        let mut config = WatchdogConfig::default();
        config.circuit_breaker.failure_threshold = 0;
        assert!(config.validate().is_err());
    }
}
