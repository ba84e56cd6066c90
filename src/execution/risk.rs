use serde::Deserialize;

use crate::error::ConfigError;

/// Account risk limits, in contracts.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RiskLimits {
    pub max_position_per_market: i64,
    pub max_total_exposure: i64,
}

impl RiskLimits {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_position_per_market < 0 {
            return Err(ConfigError::Negative {
                field: "risk.max_position_per_market",
                value: self.max_position_per_market as f64,
            });
        }
        if self.max_total_exposure < 0 {
            return Err(ConfigError::Negative {
                field: "risk.max_total_exposure",
                value: self.max_total_exposure as f64,
            });
        }
        Ok(())
    }

    /// Contracts that may still be added given current exposures.
    pub fn headroom(&self, market_exposure: u64, total_exposure: u64) -> u64 {
        let room = |limit: i64, used: u64| (limit.max(0) as u64).saturating_sub(used);
        room(self.max_position_per_market, market_exposure)
            .min(room(self.max_total_exposure, total_exposure))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headroom_takes_tighter_limit() {
        let limits = RiskLimits {
            max_position_per_market: 100,
            max_total_exposure: 150,
        };
        assert_eq!(limits.headroom(90, 90), 10);
        assert_eq!(limits.headroom(20, 145), 5);
        assert_eq!(limits.headroom(120, 120), 0);
    }

    #[test]
    fn test_negative_limit_is_config_error() {
        let limits = RiskLimits {
            max_position_per_market: 10,
            max_total_exposure: -5,
        };
        assert!(matches!(
            limits.validate(),
            Err(ConfigError::Negative { field: "risk.max_total_exposure", .. })
        ));
    }
}
