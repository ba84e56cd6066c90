use std::time::Duration;

use crate::error::ConfigError;

/// Exponential backoff for transient exchange failures.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    base_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    max_attempts: u32,
}

impl BackoffPolicy {
    pub fn new(
        base_delay: Duration,
        max_delay: Duration,
        multiplier: f64,
        max_attempts: u32,
    ) -> Result<Self, ConfigError> {
        if max_attempts == 0 {
            return Err(ConfigError::Zero { field: "execution.max_attempts" });
        }
        if multiplier < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "execution.backoff_multiplier must be >= 1, got {}",
                multiplier
            )));
        }
        if max_delay < base_delay {
            return Err(ConfigError::Invalid(
                "execution.max_delay_ms must be >= execution.base_delay_ms".to_string(),
            ));
        }
        Ok(Self {
            base_delay,
            max_delay,
            multiplier,
            max_attempts,
        })
    }

    /// No waiting between attempts. Used by tests.
    pub fn immediate(max_attempts: u32) -> Result<Self, ConfigError> {
        Self::new(Duration::ZERO, Duration::ZERO, 1.0, max_attempts)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay to wait after the given (1-based) failed attempt.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let millis = self.base_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}
