use dashmap::DashMap;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use crate::execution::types::{OrderIntent, Position};

/// Where a market is within its current cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketState {
    Idle,
    QuotingFetched,
    EdgeComputed,
    Sized,
    Submitted,
    Settled,
}

impl fmt::Display for MarketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MarketState::Idle => "idle",
            MarketState::QuotingFetched => "quoting_fetched",
            MarketState::EdgeComputed => "edge_computed",
            MarketState::Sized => "sized",
            MarketState::Submitted => "submitted",
            MarketState::Settled => "settled",
        };
        write!(f, "{}", name)
    }
}

/// Per-market bookkeeping owned by the trading loop.
#[derive(Debug, Clone)]
pub struct MarketSlot {
    pub state: MarketState,
    pub position: Position,
}

impl MarketSlot {
    pub fn new(market_id: &str) -> Self {
        Self {
            state: MarketState::Idle,
            position: Position::new(market_id),
        }
    }
}

/// Markets with an order between submission and settlement.
///
/// Cloned handles share the same map. The trading loop is the only writer;
/// other components may read it to see what is outstanding.
#[derive(Debug, Clone, Default)]
pub struct InFlightOrders {
    orders: Arc<DashMap<String, OrderIntent>>,
}

impl InFlightOrders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, market_id: &str) -> bool {
        self.orders.contains_key(market_id)
    }

    pub fn get(&self, market_id: &str) -> Option<OrderIntent> {
        self.orders.get(market_id).map(|i| i.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    pub(crate) fn insert(&self, intent: &OrderIntent) {
        self.orders.insert(intent.market_id.clone(), intent.clone());
    }

    pub(crate) fn remove(&self, market_id: &str) -> Option<OrderIntent> {
        self.orders.remove(market_id).map(|(_, intent)| intent)
    }
}
