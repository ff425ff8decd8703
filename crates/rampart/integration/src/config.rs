//! Integration layer configuration.

use std::time::Duration;

use rampart_types::BackoffPolicy;
use serde::{Deserialize, Serialize};

use crate::error::{IntegrationError, Result};

/// Configuration for the whole integration layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrationConfig {
    /// Service registry and communicator configuration.
    pub service: ServiceConfig,

    /// Consistency manager configuration.
    pub consistency: ConsistencyConfig,

    /// Cross-component integrator configuration.
    pub integrator: IntegratorConfig,
}

impl IntegrationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.service.healthy_threshold_ms >= self.service.degraded_threshold_ms {
            return Err(IntegrationError::Configuration(
                "service.healthy_threshold_ms must be below service.degraded_threshold_ms".into(),
            ));
        }
        if self.consistency.default_monitor_interval_secs == 0 {
            return Err(IntegrationError::Configuration(
                "consistency.default_monitor_interval_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Retry policy for service requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Backoff between attempts.
    pub backoff: BackoffPolicy,

    /// Status codes worth retrying.
    pub retry_on_status: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy {
                initial_backoff_ms: 1_000,
                multiplier: 2.0,
                max_backoff_ms: 30_000,
                max_retries: 3,
            },
            retry_on_status: vec![500, 502, 503, 504],
        }
    }
}

impl RetryPolicy {
    /// Whether a response with `status_code` after `attempt` should be retried.
    pub fn should_retry(&self, attempt: u32, status_code: u16) -> bool {
        !self.backoff.is_exhausted(attempt) && self.retry_on_status.contains(&status_code)
    }
}

/// Service registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Default request timeout in milliseconds.
    pub request_timeout_ms: u64,

    /// Health results older than this read as unknown.
    pub health_ttl_secs: u64,

    /// Probes faster than this are healthy.
    pub healthy_threshold_ms: u64,

    /// Probes faster than this (but not healthy) are degraded.
    pub degraded_threshold_ms: u64,

    /// Default retry policy for tenants without their own.
    pub retry: RetryPolicy,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
            health_ttl_secs: 300,
            healthy_threshold_ms: 100,
            degraded_threshold_ms: 500,
            retry: RetryPolicy::default(),
        }
    }
}

impl ServiceConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn health_ttl(&self) -> Duration {
        Duration::from_secs(self.health_ttl_secs)
    }
}

/// Consistency manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsistencyConfig {
    /// Monitor interval used when the caller passes none.
    pub default_monitor_interval_secs: u64,
}

impl Default for ConsistencyConfig {
    fn default() -> Self {
        Self {
            default_monitor_interval_secs: 60,
        }
    }
}

impl ConsistencyConfig {
    pub fn default_monitor_interval(&self) -> Duration {
        Duration::from_secs(self.default_monitor_interval_secs)
    }
}

/// Cross-component integrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegratorConfig {
    /// Errors affecting more components than this are escalated.
    pub escalation_affected_threshold: usize,
}

impl Default for IntegratorConfig {
    fn default() -> Self {
        Self {
            escalation_affected_threshold: 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_defaults() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(1, 503));
        assert!(policy.should_retry(2, 500));
        assert!(!policy.should_retry(3, 503));
        assert!(!policy.should_retry(1, 404));
        assert_eq!(policy.backoff.backoff_delay(2), Duration::from_secs(2));
    }

    #[test]
    fn test_validate_thresholds() {
        let mut config = IntegrationConfig::default();
        assert!(config.validate().is_ok());

        config.service.healthy_threshold_ms = 600;
        assert!(config.validate().is_err());
    }
}
