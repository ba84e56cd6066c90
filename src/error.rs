use thiserror::Error;

/// Forecast or quote inputs could not be used this cycle.
///
/// Recovered locally: the market is skipped and retried on the next cycle.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DataError {
    #[error("data unavailable for {market_id}: {reason}")]
    Unavailable { market_id: String, reason: String },

    #[error("stale {source_name} for {market_id}: {age_secs}s old (max {max_age_secs}s)")]
    Stale {
        market_id: String,
        source_name: &'static str,
        age_secs: i64,
        max_age_secs: i64,
    },

    #[error("malformed data for {market_id}: {reason}")]
    Malformed { market_id: String, reason: String },
}

impl DataError {
    pub fn unavailable(market_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            market_id: market_id.into(),
            reason: reason.into(),
        }
    }

    pub fn malformed(market_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Malformed {
            market_id: market_id.into(),
            reason: reason.into(),
        }
    }

    /// Unavailable and stale inputs skip the cycle; anything else is a failure.
    pub fn is_skippable(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Stale { .. })
    }
}

/// Invalid risk limits or thresholds. Fatal at startup.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("{field} must be non-negative, got {value}")]
    Negative { field: &'static str, value: f64 },

    #[error("{field} must be within [0, 1], got {value}")]
    OutOfUnitRange { field: &'static str, value: f64 },

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("{0}")]
    Invalid(String),
}

/// Failure reported by the exchange boundary.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExchangeError {
    /// Timeout, rate limit or 5xx. Retried with backoff.
    #[error("transient exchange error: {0}")]
    Transient(String),

    /// Exchange-confirmed refusal. Never retried.
    #[error("rejected by exchange: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("duplicate cycle record for {market_id} at {cycle_ts}")]
    Duplicate { market_id: String, cycle_ts: String },
}
