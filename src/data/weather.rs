use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::WeatherConfig;
use crate::data::cache::TtlCache;
use crate::data::estimator::FeatureSource;
use crate::data::types::WeatherFeatures;
use crate::error::DataError;

const NOAA_BASE_URL: &str = "https://api.weather.gov";
const USER_AGENT: &str = "CelsiusTrader/1.0";
const SOURCE: &str = "noaa";

/// Forecast location. Kalshi settles Philadelphia highs on the PHL station.
#[derive(Debug, Clone, Copy)]
pub struct Location {
    pub lat: f64,
    pub lon: f64,
}

pub const PHILADELPHIA: Location = Location {
    lat: 39.8729,
    lon: -75.2437,
};

#[derive(Debug, Deserialize)]
struct NoaaPoints {
    properties: NoaaPointProperties,
}

#[derive(Debug, Deserialize)]
struct NoaaPointProperties {
    #[serde(rename = "forecastHourly")]
    forecast_hourly: String,
}

#[derive(Debug, Deserialize)]
struct NoaaResponse {
    properties: NoaaProperties,
}

#[derive(Debug, Deserialize)]
struct NoaaProperties {
    periods: Vec<NoaaPeriod>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NoaaPeriod {
    start_time: DateTime<FixedOffset>,
    temperature: f64,
    temperature_unit: String,
}

/// NOAA hourly forecast as a [`FeatureSource`]: the day's forecast high with
/// a fixed forecast error.
pub struct WeatherClient {
    client: Client,
    location: Location,
    std_dev_f: f64,
    cache: TtlCache<NaiveDate, WeatherFeatures>,
}

impl WeatherClient {
    pub fn new(config: &WeatherConfig, location: Location) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .context("Failed to build NOAA HTTP client")?;

        Ok(Self {
            client,
            location,
            std_dev_f: config.forecast_std_dev_f,
            cache: TtlCache::new(Duration::from_secs(config.forecast_cache_ttl_secs)),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, DataError> {
        let response = self
            .client
            .get(url)
            .header("User-Agent", USER_AGENT)
            .send()
            .await
            .map_err(|e| DataError::unavailable(SOURCE, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DataError::unavailable(SOURCE, format!("{} returned {}", url, status)));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| DataError::malformed(SOURCE, e.to_string()))
    }

    async fn fetch_periods(&self) -> Result<Vec<NoaaPeriod>, DataError> {
        let grid_url = format!(
            "{}/points/{:.4},{:.4}",
            NOAA_BASE_URL, self.location.lat, self.location.lon
        );
        let grid: NoaaPoints = self.get_json(&grid_url).await?;
        let forecast: NoaaResponse = self.get_json(&grid.properties.forecast_hourly).await?;
        Ok(forecast.properties.periods)
    }
}

#[async_trait]
impl FeatureSource for WeatherClient {
    async fn features(&self, target_date: NaiveDate) -> Result<WeatherFeatures, DataError> {
        if let Some(cached) = self.cache.get(&target_date) {
            debug!("NOAA features for {} served from cache", target_date);
            return Ok(cached);
        }

        let periods = self.fetch_periods().await?;
        let high = daily_high(&periods, target_date).ok_or_else(|| {
            DataError::unavailable(SOURCE, format!("no hourly periods for {}", target_date))
        })?;

        info!("NOAA forecast high for {}: {:.1}°F", target_date, high);

        let features = WeatherFeatures {
            target_date,
            mean_high_f: high,
            std_dev_f: self.std_dev_f,
            observed_at: Utc::now(),
            source: "NOAA-hourly".to_string(),
        };
        self.cache.insert(target_date, features.clone());
        Ok(features)
    }
}

/// Highest hourly temperature (°F) on `date`, in the station's local time.
fn daily_high(periods: &[NoaaPeriod], date: NaiveDate) -> Option<f64> {
    periods
        .iter()
        .filter(|p| p.start_time.date_naive() == date)
        .map(|p| {
            if p.temperature_unit == "C" {
                p.temperature * 9.0 / 5.0 + 32.0
            } else {
                p.temperature
            }
        })
        .fold(None, |max: Option<f64>, t| Some(max.map_or(t, |m| m.max(t))))
}
