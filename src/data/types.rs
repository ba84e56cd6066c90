use serde::{Deserialize, Serialize};
use chrono::{DateTime, NaiveDate, Utc};

use crate::error::DataError;

/// Quote snapshot for one market. Prices are fractions of the $1 payout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Market {
    pub id: String,
    /// Resolution condition, e.g. "Highest temperature in Philadelphia > 45°F".
    pub condition: String,
    pub expiration: DateTime<Utc>,
    pub bid: f64,
    pub ask: f64,
    pub tick_size: f64,
    pub quoted_at: DateTime<Utc>,
}

impl Market {
    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }

    pub fn spread(&self) -> f64 {
        self.ask - self.bid
    }

    /// Cost of a NO contract: the complement of the YES bid.
    pub fn no_ask(&self) -> f64 {
        1.0 - self.bid
    }

    /// Round a price to the market's tick grid.
    pub fn round_to_tick(&self, price: f64) -> f64 {
        if self.tick_size <= 0.0 {
            return price;
        }
        let ticks = (price / self.tick_size).round();
        // Trim float noise so 0.65 stays 0.65
        ((ticks * self.tick_size) * 1e6).round() / 1e6
    }

    pub fn check(&self) -> Result<(), DataError> {
        let in_range = |p: f64| (0.0..=1.0).contains(&p);
        if !in_range(self.bid) || !in_range(self.ask) {
            return Err(DataError::malformed(
                &self.id,
                format!("quote outside [0,1]: bid={} ask={}", self.bid, self.ask),
            ));
        }
        if self.bid > self.ask {
            return Err(DataError::malformed(
                &self.id,
                format!("crossed quote: bid={} > ask={}", self.bid, self.ask),
            ));
        }
        Ok(())
    }
}

/// Model probability that a market resolves YES. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastProbability {
    pub market_id: String,
    pub probability: f64,
    pub generated_at: DateTime<Utc>,
    /// Spread of the estimate in probability units (0 = certain).
    pub uncertainty: f64,
}

/// Resolution condition parsed from a market ticker, in °F.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Strike {
    Above(f64),
    Below(f64),
    Between(f64, f64),
}

/// Inputs the probability estimator works from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherFeatures {
    pub target_date: NaiveDate,
    pub mean_high_f: f64,
    pub std_dev_f: f64,
    pub observed_at: DateTime<Utc>,
    pub source: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quote(bid: f64, ask: f64) -> Market {
        Market {
            id: "KXHIGHPHIL-25JAN01-T45".to_string(),
            condition: "High > 45°F".to_string(),
            expiration: Utc::now(),
            bid,
            ask,
            tick_size: 0.01,
            quoted_at: Utc::now(),
        }
    }

    #[test]
    fn test_mid_and_spread() {
        let m = quote(0.55, 0.65);
        assert!((m.mid() - 0.60).abs() < 1e-9);
        assert!((m.spread() - 0.10).abs() < 1e-9);
        assert!((m.no_ask() - 0.45).abs() < 1e-9);
    }

    #[test]
    fn test_round_to_tick() {
        let m = quote(0.55, 0.65);
        assert_eq!(m.round_to_tick(0.6549), 0.65);
        assert_eq!(m.round_to_tick(0.651), 0.65);
    }

    #[test]
    fn test_crossed_quote_is_malformed() {
        assert!(matches!(quote(0.7, 0.6).check(), Err(DataError::Malformed { .. })));
        assert!(quote(0.6, 0.7).check().is_ok());
    }
}
