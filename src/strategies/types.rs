use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Yes,
    No,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Yes => write!(f, "yes"),
            Side::No => write!(f, "no"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    BuyYes,
    BuyNo,
    NoTrade,
}

/// Edge between model and market, with the inputs that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeSignal {
    pub market_id: String,
    /// Forecast probability minus market-implied probability.
    pub edge: f64,
    pub recommendation: Recommendation,
    pub forecast_probability: f64,
    pub implied_probability: f64,
    pub spread: f64,
    pub uncertainty: f64,
    pub evaluated_at: DateTime<Utc>,
    /// Why no trade was recommended, when it wasn't.
    pub note: Option<String>,
}

impl EdgeSignal {
    pub fn side(&self) -> Option<Side> {
        match self.recommendation {
            Recommendation::BuyYes => Some(Side::Yes),
            Recommendation::BuyNo => Some(Side::No),
            Recommendation::NoTrade => None,
        }
    }
}
