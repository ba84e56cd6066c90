use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::sync::Arc;

use crate::data::types::{ForecastProbability, Market};
use crate::data::{ForecastProvider, QuoteSource};
use crate::engine::clock::Clock;
use crate::error::DataError;

fn default_tick_size() -> f64 {
    0.01
}

/// One recorded (forecast, quote) observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRow {
    pub timestamp: DateTime<Utc>,
    pub market_id: String,
    pub probability: f64,
    #[serde(default)]
    pub uncertainty: f64,
    pub bid: f64,
    pub ask: f64,
    #[serde(default = "default_tick_size")]
    pub tick_size: f64,
    /// Known once the market has settled.
    #[serde(default)]
    pub resolved_yes: Option<bool>,
}

/// Recorded observations, indexed by market and time.
#[derive(Debug, Clone, Default)]
pub struct History {
    series: HashMap<String, BTreeMap<DateTime<Utc>, HistoryRow>>,
}

impl History {
    pub fn from_rows(rows: impl IntoIterator<Item = HistoryRow>) -> Self {
        let mut series: HashMap<String, BTreeMap<DateTime<Utc>, HistoryRow>> = HashMap::new();
        for row in rows {
            series
                .entry(row.market_id.clone())
                .or_default()
                .insert(row.timestamp, row);
        }
        Self { series }
    }

    /// One JSON object per line; blank lines are ignored.
    pub fn parse_jsonl(contents: &str) -> Result<Self> {
        let rows = contents
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(i, line)| {
                serde_json::from_str::<HistoryRow>(line)
                    .with_context(|| format!("Invalid history row on line {}", i + 1))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::from_rows(rows))
    }

    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read history file: {}", path))?;
        Self::parse_jsonl(&contents)
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    pub fn markets(&self) -> Vec<String> {
        let mut markets: Vec<String> = self.series.keys().cloned().collect();
        markets.sort();
        markets
    }

    /// Every distinct observation time, ascending.
    pub fn timestamps(&self) -> Vec<DateTime<Utc>> {
        self.series
            .values()
            .flat_map(|s| s.keys().copied())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Settlement per market, from the last row that carries one.
    pub fn resolutions(&self) -> HashMap<String, bool> {
        self.series
            .iter()
            .filter_map(|(market_id, rows)| {
                rows.values()
                    .rev()
                    .find_map(|r| r.resolved_yes)
                    .map(|resolved| (market_id.clone(), resolved))
            })
            .collect()
    }

    fn latest(&self, market_id: &str, as_of: DateTime<Utc>) -> Result<&HistoryRow, DataError> {
        self.series
            .get(market_id)
            .and_then(|rows| rows.range(..=as_of).next_back())
            .map(|(_, row)| row)
            .ok_or_else(|| {
                DataError::unavailable(
                    market_id,
                    format!("no recorded data at or before {}", as_of),
                )
            })
    }

    fn last_timestamp(&self, market_id: &str) -> Option<DateTime<Utc>> {
        self.series
            .get(market_id)
            .and_then(|rows| rows.keys().next_back().copied())
    }
}

/// Recorded forecasts, served as of the cycle time.
pub struct ReplayForecasts {
    history: Arc<History>,
}

impl ReplayForecasts {
    pub fn new(history: Arc<History>) -> Self {
        Self { history }
    }
}

#[async_trait]
impl ForecastProvider for ReplayForecasts {
    async fn get_forecast(
        &self,
        market_id: &str,
        as_of: DateTime<Utc>,
    ) -> Result<ForecastProbability, DataError> {
        let row = self.history.latest(market_id, as_of)?;
        Ok(ForecastProbability {
            market_id: market_id.to_string(),
            probability: row.probability,
            generated_at: row.timestamp,
            uncertainty: row.uncertainty,
        })
    }
}

/// Recorded quotes, served as of the clock's current time.
pub struct ReplayQuotes {
    history: Arc<History>,
    clock: Arc<dyn Clock>,
}

impl ReplayQuotes {
    pub fn new(history: Arc<History>, clock: Arc<dyn Clock>) -> Self {
        Self { history, clock }
    }
}

#[async_trait]
impl QuoteSource for ReplayQuotes {
    async fn get_quote(&self, market_id: &str) -> Result<Market, DataError> {
        let row = self.history.latest(market_id, self.clock.now())?;
        Ok(Market {
            id: market_id.to_string(),
            condition: String::new(),
            expiration: self.history.last_timestamp(market_id).unwrap_or(row.timestamp),
            bid: row.bid,
            ask: row.ask,
            tick_size: row.tick_size,
            quoted_at: row.timestamp,
        })
    }
}
