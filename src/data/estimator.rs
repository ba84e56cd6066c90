//! Probability estimation from weather features.
//!
//! The trading core only sees [`ForecastProvider`]; estimators are plugged in
//! behind [`ModelForecastProvider`] so a statistical model, a heuristic or a
//! test stub can be swapped without touching the loop.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::sync::Arc;
use tracing::debug;

use crate::data::kalshi::parse_ticker;
use crate::data::types::{ForecastProbability, Strike, WeatherFeatures};
use crate::data::{ForecastProvider, StrikeSource};
use crate::error::DataError;

pub trait ProbabilityEstimator: Send + Sync {
    fn estimate_probability(&self, features: &WeatherFeatures, strike: &Strike) -> f64;

    /// Half the probability swing caused by a ±1°F error in the forecast mean.
    fn uncertainty(&self, features: &WeatherFeatures, strike: &Strike) -> f64 {
        let mut warmer = features.clone();
        warmer.mean_high_f += 1.0;
        let mut cooler = features.clone();
        cooler.mean_high_f -= 1.0;
        (self.estimate_probability(&warmer, strike) - self.estimate_probability(&cooler, strike))
            .abs()
            / 2.0
    }
}

/// Models the daily high as N(mean, σ²) and integrates over the strike.
#[derive(Debug, Clone, Default)]
pub struct NormalCdfEstimator;

impl ProbabilityEstimator for NormalCdfEstimator {
    fn estimate_probability(&self, features: &WeatherFeatures, strike: &Strike) -> f64 {
        let sigma = features.std_dev_f.max(f64::EPSILON);
        let cdf = |x: f64| normal_cdf((x - features.mean_high_f) / sigma);

        let p = match *strike {
            Strike::Above(t) => 1.0 - cdf(t),
            Strike::Below(t) => cdf(t),
            Strike::Between(lo, hi) => cdf(hi) - cdf(lo),
        };
        p.clamp(0.0, 1.0)
    }
}

/// Fixed-probability model. Placeholder when no trained model is available.
#[derive(Debug, Clone)]
pub struct ConstantEstimator(pub f64);

impl ProbabilityEstimator for ConstantEstimator {
    fn estimate_probability(&self, _features: &WeatherFeatures, _strike: &Strike) -> f64 {
        self.0
    }

    fn uncertainty(&self, _features: &WeatherFeatures, _strike: &Strike) -> f64 {
        0.0
    }
}

/// Standard normal cumulative distribution function
pub fn normal_cdf(z: f64) -> f64 {
    0.5 * (1.0 + erf(z / f64::sqrt(2.0)))
}

/// Error function approximation (Abramowitz & Stegun 7.1.26)
fn erf(x: f64) -> f64 {
    let a1 = 0.254829592;
    let a2 = -0.284496736;
    let a3 = 1.421413741;
    let a4 = -1.453152027;
    let a5 = 1.061405429;
    let p = 0.3275911;

    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();

    let t = 1.0 / (1.0 + p * x);
    let y = 1.0 - (((((a5 * t + a4) * t) + a3) * t + a2) * t + a1) * t * (-x * x).exp();

    sign * y
}

/// Source of weather features for a resolution date.
#[async_trait]
pub trait FeatureSource: Send + Sync {
    async fn features(&self, target_date: NaiveDate) -> Result<WeatherFeatures, DataError>;
}

/// Feature source + estimator, exposed to the core as a [`ForecastProvider`].
///
/// The resolution date comes from the ticker; the strike comes from the
/// exchange, since a ticker threshold does not say which tail it prices.
pub struct ModelForecastProvider {
    features: Arc<dyn FeatureSource>,
    estimator: Arc<dyn ProbabilityEstimator>,
    strikes: Arc<dyn StrikeSource>,
}

impl ModelForecastProvider {
    pub fn new(
        features: Arc<dyn FeatureSource>,
        estimator: Arc<dyn ProbabilityEstimator>,
        strikes: Arc<dyn StrikeSource>,
    ) -> Self {
        Self {
            features,
            estimator,
            strikes,
        }
    }
}

#[async_trait]
impl ForecastProvider for ModelForecastProvider {
    async fn get_forecast(
        &self,
        market_id: &str,
        _as_of: DateTime<Utc>,
    ) -> Result<ForecastProbability, DataError> {
        let ticker = parse_ticker(market_id)?;
        let strike = self.strikes.strike(market_id).await?;
        let features = self.features.features(ticker.date).await.map_err(|e| match e {
            DataError::Unavailable { reason, .. } => DataError::unavailable(market_id, reason),
            other => other,
        })?;

        let probability = self.estimator.estimate_probability(&features, &strike);
        let uncertainty = self.estimator.uncertainty(&features, &strike);

        debug!(
            market_id,
            mean_high_f = features.mean_high_f,
            std_dev_f = features.std_dev_f,
            probability,
            uncertainty,
            "Forecast estimated"
        );

        Ok(ForecastProbability {
            market_id: market_id.to_string(),
            probability,
            generated_at: features.observed_at,
            uncertainty,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features(mean: f64) -> WeatherFeatures {
        WeatherFeatures {
            target_date: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            mean_high_f: mean,
            std_dev_f: 4.5,
            observed_at: Utc::now(),
            source: "test".to_string(),
        }
    }

    #[test]
    fn test_normal_cdf() {
        assert!((normal_cdf(0.0) - 0.5).abs() < 0.001);
        assert!((normal_cdf(1.0) - 0.8413).abs() < 0.01);
        assert!((normal_cdf(-1.0) - 0.1587).abs() < 0.01);
    }

    #[test]
    fn test_above_and_below_are_complements() {
        let est = NormalCdfEstimator;
        let f = features(47.0);
        let above = est.estimate_probability(&f, &Strike::Above(45.0));
        let below = est.estimate_probability(&f, &Strike::Below(45.0));
        assert!((above + below - 1.0).abs() < 1e-9);
        assert!(above > 0.6);
    }

    #[test]
    fn test_bucket_probability_peaks_at_mean() {
        let est = NormalCdfEstimator;
        let centred = est.estimate_probability(&features(45.0), &Strike::Between(44.0, 46.0));
        let offset = est.estimate_probability(&features(52.0), &Strike::Between(44.0, 46.0));
        assert!(centred > offset);
        assert!(centred < 0.5);
    }

    #[test]
    fn test_uncertainty_highest_near_threshold() {
        let est = NormalCdfEstimator;
        let near = est.uncertainty(&features(45.0), &Strike::Above(45.0));
        let far = est.uncertainty(&features(60.0), &Strike::Above(45.0));
        assert!(near > far);
        assert_eq!(ConstantEstimator(0.5).uncertainty(&features(45.0), &Strike::Above(45.0)), 0.0);
    }

    struct FixedFeatures(WeatherFeatures);

    #[async_trait]
    impl FeatureSource for FixedFeatures {
        async fn features(&self, _target_date: NaiveDate) -> Result<WeatherFeatures, DataError> {
            Ok(self.0.clone())
        }
    }

    struct FixedStrike(Strike);

    #[async_trait]
    impl StrikeSource for FixedStrike {
        async fn strike(&self, _market_id: &str) -> Result<Strike, DataError> {
            Ok(self.0)
        }
    }

    #[tokio::test]
    async fn test_model_provider_prices_exchange_strike() {
        let f = features(50.0);
        let observed_at = f.observed_at;
        let provider = ModelForecastProvider::new(
            Arc::new(FixedFeatures(f)),
            Arc::new(NormalCdfEstimator),
            Arc::new(FixedStrike(Strike::Above(45.0))),
        );

        let forecast = provider
            .get_forecast("KXHIGHPHIL-25JAN01-T45", Utc::now())
            .await
            .unwrap();

        assert!(forecast.probability > 0.8);
        assert_eq!(forecast.generated_at, observed_at);
        assert_eq!(forecast.market_id, "KXHIGHPHIL-25JAN01-T45");
    }

    #[tokio::test]
    async fn test_model_provider_prices_low_tail_threshold() {
        let provider = ModelForecastProvider::new(
            Arc::new(FixedFeatures(features(35.0))),
            Arc::new(NormalCdfEstimator),
            Arc::new(FixedStrike(Strike::Below(40.0))),
        );

        let forecast = provider
            .get_forecast("KXHIGHPHIL-25JAN01-T40", Utc::now())
            .await
            .unwrap();

        assert!((forecast.probability - 0.867).abs() < 0.01);
    }

    #[tokio::test]
    async fn test_model_provider_rejects_unparseable_ticker() {
        let provider = ModelForecastProvider::new(
            Arc::new(FixedFeatures(features(50.0))),
            Arc::new(ConstantEstimator(0.5)),
            Arc::new(FixedStrike(Strike::Above(45.0))),
        );
        let err = provider.get_forecast("NOT-A-TICKER", Utc::now()).await.unwrap_err();
        assert!(matches!(err, DataError::Malformed { .. }));
    }
}
