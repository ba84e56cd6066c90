use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::config::StrategyConfig;
use crate::data::types::{ForecastProbability, Market};
use crate::error::DataError;
use crate::strategies::types::{EdgeSignal, Recommendation};

/// Absorbs float noise in price arithmetic (0.65 - 0.55 is not exactly 0.10).
const PRICE_EPSILON: f64 = 1e-9;

/// Compares the model probability against the market-implied probability.
///
/// Pure: the same forecast, quote and `now` always give the same signal.
#[derive(Debug, Clone)]
pub struct EdgeEvaluator {
    min_edge: f64,
    max_spread: f64,
    max_staleness: chrono::Duration,
}

impl EdgeEvaluator {
    pub fn new(config: &StrategyConfig) -> Self {
        Self {
            min_edge: config.min_edge,
            max_spread: config.max_spread,
            max_staleness: config.max_staleness(),
        }
    }

    pub fn evaluate(
        &self,
        forecast: &ForecastProbability,
        market: &Market,
        now: DateTime<Utc>,
    ) -> Result<EdgeSignal, DataError> {
        if forecast.market_id != market.id {
            return Err(DataError::malformed(
                &market.id,
                format!("forecast is for {}", forecast.market_id),
            ));
        }
        if !(0.0..=1.0).contains(&forecast.probability) {
            return Err(DataError::malformed(
                &market.id,
                format!("forecast probability {} outside [0,1]", forecast.probability),
            ));
        }
        market.check()?;
        self.check_fresh(&market.id, "quote", market.quoted_at, now)?;
        self.check_fresh(&market.id, "forecast", forecast.generated_at, now)?;

        let implied = market.mid();
        let edge = forecast.probability - implied;
        let spread = market.spread();

        let (recommendation, note) = if spread - self.max_spread > PRICE_EPSILON {
            (
                Recommendation::NoTrade,
                Some(format!("spread {:.3} wider than {:.3}", spread, self.max_spread)),
            )
        } else if edge - self.min_edge > PRICE_EPSILON {
            (Recommendation::BuyYes, None)
        } else if -edge - self.min_edge > PRICE_EPSILON {
            (Recommendation::BuyNo, None)
        } else {
            (
                Recommendation::NoTrade,
                Some(format!("|edge| {:.3} within {:.3}", edge.abs(), self.min_edge)),
            )
        };

        info!(
            "Edge calculation {}: forecast={:.1}%, market={:.1}%, edge={:+.1}%, spread={:.1}% -> {:?}",
            market.id,
            forecast.probability * 100.0,
            implied * 100.0,
            edge * 100.0,
            spread * 100.0,
            recommendation
        );

        Ok(EdgeSignal {
            market_id: market.id.clone(),
            edge,
            recommendation,
            forecast_probability: forecast.probability,
            implied_probability: implied,
            spread,
            uncertainty: forecast.uncertainty,
            evaluated_at: now,
            note,
        })
    }

    fn check_fresh(
        &self,
        market_id: &str,
        source_name: &'static str,
        at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), DataError> {
        let age = now - at;
        if age > self.max_staleness {
            debug!("{} for {} is {}s old", source_name, market_id, age.num_seconds());
            return Err(DataError::Stale {
                market_id: market_id.to_string(),
                source_name,
                age_secs: age.num_seconds(),
                max_age_secs: self.max_staleness.num_seconds(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap()
    }

    fn evaluator(min_edge: f64, max_spread: f64) -> EdgeEvaluator {
        EdgeEvaluator::new(&StrategyConfig {
            min_edge,
            max_spread,
            max_staleness_secs: 300,
            kelly_fraction: 0.25,
            volatility_reference: 0.10,
            bankroll_usd: 1_000.0,
        })
    }

    fn market(bid: f64, ask: f64) -> Market {
        Market {
            id: "KXHIGHPHIL-25JAN01-T45".to_string(),
            condition: "High > 45°F".to_string(),
            expiration: now() + chrono::Duration::hours(12),
            bid,
            ask,
            tick_size: 0.01,
            quoted_at: now(),
        }
    }

    fn forecast(probability: f64) -> ForecastProbability {
        ForecastProbability {
            market_id: "KXHIGHPHIL-25JAN01-T45".to_string(),
            probability,
            generated_at: now(),
            uncertainty: 0.05,
        }
    }

    #[test]
    fn test_buy_yes_on_positive_edge() {
        let signal = evaluator(0.05, 0.10)
            .evaluate(&forecast(0.80), &market(0.55, 0.65), now())
            .unwrap();
        assert_eq!(signal.recommendation, Recommendation::BuyYes);
        assert!((signal.edge - 0.20).abs() < 1e-9);
        assert!((signal.implied_probability - 0.60).abs() < 1e-9);
        assert_eq!(signal.note, None);
    }

    #[test]
    fn test_buy_no_on_negative_edge() {
        let signal = evaluator(0.05, 0.10)
            .evaluate(&forecast(0.30), &market(0.55, 0.65), now())
            .unwrap();
        assert_eq!(signal.recommendation, Recommendation::BuyNo);
        assert!((signal.edge + 0.30).abs() < 1e-9);
    }

    #[test]
    fn test_wide_spread_forces_no_trade() {
        let signal = evaluator(0.05, 0.10)
            .evaluate(&forecast(0.80), &market(0.55, 0.90), now())
            .unwrap();
        assert_eq!(signal.recommendation, Recommendation::NoTrade);
        assert!(signal.note.is_some());
    }

    #[test]
    fn test_edge_at_threshold_is_no_trade() {
        let signal = evaluator(0.05, 0.10)
            .evaluate(&forecast(0.65), &market(0.55, 0.65), now())
            .unwrap();
        assert_eq!(signal.recommendation, Recommendation::NoTrade);
    }

    #[test]
    fn test_same_inputs_same_signal() {
        let ev = evaluator(0.05, 0.10);
        let a = ev.evaluate(&forecast(0.72), &market(0.50, 0.58), now()).unwrap();
        let b = ev.evaluate(&forecast(0.72), &market(0.50, 0.58), now()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_stale_forecast_is_reported() {
        let mut old = forecast(0.80);
        old.generated_at = now() - chrono::Duration::minutes(10);
        let err = evaluator(0.05, 0.10)
            .evaluate(&old, &market(0.55, 0.65), now())
            .unwrap_err();
        assert!(matches!(err, DataError::Stale { source_name: "forecast", age_secs: 600, .. }));
        assert!(err.is_skippable());
    }

    #[test]
    fn test_stale_quote_is_reported() {
        let mut quote = market(0.55, 0.65);
        quote.quoted_at = now() - chrono::Duration::seconds(301);
        let err = evaluator(0.05, 0.10).evaluate(&forecast(0.80), &quote, now()).unwrap_err();
        assert!(matches!(err, DataError::Stale { source_name: "quote", .. }));
    }

    #[test]
    fn test_mismatched_market_is_malformed() {
        let mut other = forecast(0.80);
        other.market_id = "OTHER".to_string();
        let err = evaluator(0.05, 0.10)
            .evaluate(&other, &market(0.55, 0.65), now())
            .unwrap_err();
        assert!(matches!(err, DataError::Malformed { .. }));
    }
}
