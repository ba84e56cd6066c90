use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::data::types::{ForecastProbability, Market};
use crate::strategies::types::{EdgeSignal, Side};

/// A sized order, consumed exactly once by the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderIntent {
    pub market_id: String,
    pub side: Side,
    pub quantity: u64,
    pub limit_price: f64,
    pub idempotency_key: String,
    pub cycle_ts: DateTime<Utc>,
}

impl OrderIntent {
    pub fn new(
        market_id: &str,
        side: Side,
        quantity: u64,
        limit_price: f64,
        cycle_ts: DateTime<Utc>,
    ) -> Self {
        Self {
            market_id: market_id.to_string(),
            side,
            quantity,
            limit_price,
            idempotency_key: idempotency_key(market_id, cycle_ts, side),
            cycle_ts,
        }
    }
}

/// Same market, cycle and side always yield the same key.
pub fn idempotency_key(market_id: &str, cycle_ts: DateTime<Utc>, side: Side) -> String {
    format!("{}-{}-{}", market_id, cycle_ts.timestamp_millis(), side)
}

/// Terminal result of one cycle's order attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OrderOutcome {
    Filled { quantity: u64, price: f64 },
    PartiallyFilled { quantity: u64, price: f64 },
    /// Exchange refused the order.
    Rejected { reason: String },
    /// Exchange-side state unknown; needs reconciliation.
    Failed { reason: String },
    Skipped { reason: String },
}

impl OrderOutcome {
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped { reason: reason.into() }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed { reason: reason.into() }
    }

    /// Confirmed fill quantity and price, if any.
    pub fn fill(&self) -> Option<(u64, f64)> {
        match *self {
            Self::Filled { quantity, price } | Self::PartiallyFilled { quantity, price } => {
                Some((quantity, price))
            }
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Filled { .. } => "filled",
            Self::PartiallyFilled { .. } => "partially_filled",
            Self::Rejected { .. } => "rejected",
            Self::Failed { .. } => "failed",
            Self::Skipped { .. } => "skipped",
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Rejected { reason } | Self::Failed { reason } | Self::Skipped { reason } => {
                Some(reason)
            }
            _ => None,
        }
    }
}

/// Net holdings in one market, in YES-equivalent contracts.
///
/// Buying NO at price `p` is booked as selling YES at `1 - p`, so a long NO
/// position shows a negative `net_quantity`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub market_id: String,
    pub net_quantity: i64,
    pub avg_entry_price: f64,
    pub realized_pnl: f64,
}

impl Position {
    pub fn new(market_id: &str) -> Self {
        Self {
            market_id: market_id.to_string(),
            ..Default::default()
        }
    }

    /// Contracts currently at risk.
    pub fn exposure(&self) -> u64 {
        self.net_quantity.unsigned_abs()
    }

    pub fn unrealized_pnl(&self, mark: f64) -> f64 {
        self.net_quantity as f64 * (mark - self.avg_entry_price)
    }

    /// Book a confirmed fill. The only way a position changes.
    pub fn apply_fill(&mut self, side: Side, quantity: u64, price: f64) {
        if quantity == 0 {
            return;
        }
        let (delta, yes_price) = match side {
            Side::Yes => (quantity as i64, price),
            Side::No => (-(quantity as i64), 1.0 - price),
        };

        let net = self.net_quantity;
        if net == 0 || net.signum() == delta.signum() {
            let held = net.unsigned_abs() as f64;
            self.avg_entry_price =
                (self.avg_entry_price * held + yes_price * quantity as f64)
                    / (held + quantity as f64);
            self.net_quantity += delta;
            return;
        }

        let closing = net.unsigned_abs().min(quantity);
        self.realized_pnl +=
            closing as f64 * (yes_price - self.avg_entry_price) * net.signum() as f64;
        self.net_quantity += delta;

        if self.net_quantity == 0 {
            self.avg_entry_price = 0.0;
        } else if self.net_quantity.signum() != net.signum() {
            // Flipped through flat: the remainder opened at this fill's price
            self.avg_entry_price = yes_price;
        }
    }

    /// Settle at expiry: YES pays 1, NO pays 0.
    pub fn settle(&mut self, resolved_yes: bool) -> f64 {
        let payout = if resolved_yes { 1.0 } else { 0.0 };
        let pnl = self.unrealized_pnl(payout);
        self.realized_pnl += pnl;
        self.net_quantity = 0;
        self.avg_entry_price = 0.0;
        pnl
    }

    /// Rebuild from the cycle log.
    pub fn replay<'a>(market_id: &str, records: impl IntoIterator<Item = &'a CycleRecord>) -> Self {
        let mut position = Self::new(market_id);
        for record in records.into_iter().filter(|r| r.market_id == market_id) {
            if let (Some(intent), Some((quantity, price))) =
                (&record.intent, record.outcome.fill())
            {
                position.apply_fill(intent.side, quantity, price);
            }
        }
        position
    }
}

/// One market, one cycle: inputs, decision and outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleRecord {
    pub market_id: String,
    pub cycle_ts: DateTime<Utc>,
    pub market: Option<Market>,
    pub forecast: Option<ForecastProbability>,
    pub signal: Option<EdgeSignal>,
    pub intent: Option<OrderIntent>,
    pub outcome: OrderOutcome,
}

impl CycleRecord {
    pub fn new(market_id: &str, cycle_ts: DateTime<Utc>, outcome: OrderOutcome) -> Self {
        Self {
            market_id: market_id.to_string(),
            cycle_ts,
            market: None,
            forecast: None,
            signal: None,
            intent: None,
            outcome,
        }
    }
}
