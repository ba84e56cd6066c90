pub mod cache;
pub mod estimator;
pub mod kalshi;
pub mod replay;
pub mod types;
pub mod weather;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DataError;
use types::{ForecastProbability, Market, Strike};

/// Produces the model probability for a market's resolution condition.
#[async_trait]
pub trait ForecastProvider: Send + Sync {
    async fn get_forecast(
        &self,
        market_id: &str,
        as_of: DateTime<Utc>,
    ) -> Result<ForecastProbability, DataError>;
}

/// Current best bid/ask for a market.
#[async_trait]
pub trait QuoteSource: Send + Sync {
    async fn get_quote(&self, market_id: &str) -> Result<Market, DataError>;
}

/// Resolution strike of a market, as the exchange defines it.
#[async_trait]
pub trait StrikeSource: Send + Sync {
    async fn strike(&self, market_id: &str) -> Result<Strike, DataError>;
}
