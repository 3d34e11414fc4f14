//! Orchestrator configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{retry::RetryPolicy, utils::serde::millis};

/// Configuration of a caller's orchestration loop and of the simulated cluster.
///
/// All durations are (de)serialized as milliseconds. Missing fields take their
/// default values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    #[serde(flatten)]
    pub retry: RetryPolicy,
    /// How often the simulated cluster polls the ledger for queued records.
    #[serde(with = "millis")]
    pub pickup_poll_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            pickup_poll_interval: Duration::from_millis(10),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("max_attempts must be at least 1")]
    NoAttempts,
    #[error("finalization_timeout must not be zero")]
    ZeroTimeout,
    #[error("backoff multiplier must be at least 1")]
    ZeroMultiplier,
    #[error("initial backoff {initial:?} exceeds its cap {max:?}")]
    BackoffAboveCap { initial: Duration, max: Duration },
}

impl OrchestratorConfig {
    /// Checks that the configuration describes a usable retry loop.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let retry = &self.retry;
        if retry.max_attempts == 0 {
            return Err(ConfigError::NoAttempts);
        }
        if retry.finalization_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        if retry.backoff.multiplier == 0 {
            return Err(ConfigError::ZeroMultiplier);
        }
        if retry.backoff.initial > retry.backoff.max {
            return Err(ConfigError::BackoffAboveCap {
                initial: retry.backoff.initial,
                max: retry.backoff.max,
            });
        }
        Ok(())
    }
}
