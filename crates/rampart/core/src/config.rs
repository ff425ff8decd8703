//! Layered configuration: defaults, then an optional file, then
//! `RAMPART_`-prefixed environment variables.

use rampart_integration::IntegrationConfig;
use rampart_watchdog::WatchdogConfig;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::telemetry::TelemetryConfig;

/// Preset tuning for an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    /// Lenient breakers, verbose logs.
    Development,
    #[default]
    Standard,
    /// Trip early, recover cautiously, escalate sooner.
    Strict,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RampartConfig {
    pub profile: Profile,
    pub watchdog: WatchdogConfig,
    pub integration: IntegrationConfig,
    pub telemetry: TelemetryConfig,
}

impl RampartConfig {
    /// Load configuration.
    ///
    /// Nested keys are separated by `__` in environment variables, e.g.
    /// `RAMPART_WATCHDOG__CIRCUIT_BREAKER__FAILURE_THRESHOLD=5`.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&RampartConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("RAMPART")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: RampartConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// The preset for `profile`.
    pub fn for_profile(profile: Profile) -> Self {
        let mut config = Self {
            profile,
            ..Default::default()
        };

        match profile {
            Profile::Development => {
                config.watchdog.circuit_breaker.failure_threshold = 5;
                config.watchdog.circuit_breaker.reset_timeout_secs = 10;
                config.watchdog.deadlock.lock_timeout_secs = 60;
                config.telemetry.log_level = "debug".to_string();
            }
            Profile::Standard => {}
            Profile::Strict => {
                config.watchdog.circuit_breaker.failure_threshold = 2;
                config.watchdog.circuit_breaker.success_threshold = 2;
                config.watchdog.circuit_breaker.reset_timeout_secs = 120;
                config.watchdog.deadlock.lock_timeout_secs = 10;
                config.watchdog.deadlock.max_recovery_attempts = 1;
                config.watchdog.race.backoff.max_retries = 3;
                config.integration.service.retry.backoff.max_retries = 2;
                config.integration.integrator.escalation_affected_threshold = 1;
                config.telemetry.json_format = true;
            }
        }

        config
    }

    pub fn validate(&self) -> Result<()> {
        self.watchdog.validate()?;
        self.integration.validate()?;
        Ok(())
    }
}
