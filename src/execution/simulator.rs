use async_trait::async_trait;
use dashmap::DashMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::{debug, info};

use crate::config::PaperTradingConfig;
use crate::error::ExchangeError;
use crate::execution::types::{OrderIntent, OrderOutcome};
use crate::execution::ExchangeTransport;

/// Simulated exchange for paper trading and backtests.
///
/// Fills at the limit price with a seeded RNG, so identical order streams
/// produce identical outcomes. Orders are remembered by idempotency key.
pub struct PaperExchange {
    config: PaperTradingConfig,
    rng: Mutex<StdRng>,
    balance: Mutex<f64>,
    orders: DashMap<String, OrderOutcome>,
    submissions: AtomicU64,
}

impl PaperExchange {
    pub fn new(config: PaperTradingConfig) -> Self {
        let balance = config.initial_balance_usd;
        info!(
            "Paper exchange initialized with ${:.2} (fill rate {:.0}%, seed {})",
            balance,
            config.fill_rate * 100.0,
            config.seed
        );

        Self {
            rng: Mutex::new(StdRng::seed_from_u64(config.seed)),
            balance: Mutex::new(balance),
            orders: DashMap::new(),
            submissions: AtomicU64::new(0),
            config,
        }
    }

    pub fn balance(&self) -> f64 {
        *self.balance.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Orders that reached the matching step, excluding resubmissions.
    pub fn submissions(&self) -> u64 {
        self.submissions.load(Ordering::SeqCst)
    }

    fn simulate(&self, intent: &OrderIntent) -> OrderOutcome {
        let roll: f64 = self.rng.lock().unwrap_or_else(|e| e.into_inner()).gen();

        let quantity = if roll < self.config.fill_rate {
            intent.quantity
        } else if roll < self.config.fill_rate + self.config.partial_fill_rate {
            (intent.quantity / 2).max(1)
        } else {
            return OrderOutcome::Rejected {
                reason: "unfilled at limit (simulated)".to_string(),
            };
        };

        let cost = quantity as f64 * intent.limit_price;
        let mut balance = self.balance.lock().unwrap_or_else(|e| e.into_inner());
        if cost > *balance {
            return OrderOutcome::Rejected {
                reason: format!("insufficient balance: need ${:.2}, have ${:.2}", cost, *balance),
            };
        }
        *balance -= cost;

        if quantity == intent.quantity {
            OrderOutcome::Filled { quantity, price: intent.limit_price }
        } else {
            OrderOutcome::PartiallyFilled { quantity, price: intent.limit_price }
        }
    }
}

#[async_trait]
impl ExchangeTransport for PaperExchange {
    async fn submit_order(&self, intent: &OrderIntent) -> Result<OrderOutcome, ExchangeError> {
        if let Some(existing) = self.orders.get(&intent.idempotency_key) {
            debug!("Duplicate paper order {}, returning recorded outcome", intent.idempotency_key);
            return Ok(existing.clone());
        }

        self.submissions.fetch_add(1, Ordering::SeqCst);
        let outcome = self.simulate(intent);
        info!(
            "Paper order {} {} x{} @ {:.2}: {}",
            intent.market_id,
            intent.side,
            intent.quantity,
            intent.limit_price,
            outcome.label()
        );

        self.orders.insert(intent.idempotency_key.clone(), outcome.clone());
        Ok(outcome)
    }

    async fn lookup_order(
        &self,
        intent: &OrderIntent,
    ) -> Result<Option<OrderOutcome>, ExchangeError> {
        Ok(self.orders.get(&intent.idempotency_key).map(|o| o.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategies::types::Side;
    use chrono::{TimeZone, Utc};

    fn config(fill_rate: f64, partial_fill_rate: f64) -> PaperTradingConfig {
        PaperTradingConfig {
            enabled: true,
            fill_rate,
            partial_fill_rate,
            seed: 42,
            initial_balance_usd: 1_000.0,
        }
    }

    fn intent(minute: u32) -> OrderIntent {
        let ts = Utc.with_ymd_and_hms(2025, 1, 1, 12, minute, 0).unwrap();
        OrderIntent::new("M", Side::Yes, 10, 0.60, ts)
    }

    #[tokio::test]
    async fn test_always_fill_debits_balance() {
        let exchange = PaperExchange::new(config(1.0, 0.0));
        let outcome = exchange.submit_order(&intent(0)).await.unwrap();
        assert_eq!(outcome, OrderOutcome::Filled { quantity: 10, price: 0.60 });
        assert!((exchange.balance() - 994.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_partial_fill_halves_quantity() {
        let exchange = PaperExchange::new(config(0.0, 1.0));
        let outcome = exchange.submit_order(&intent(0)).await.unwrap();
        assert_eq!(outcome, OrderOutcome::PartiallyFilled { quantity: 5, price: 0.60 });
    }

    #[tokio::test]
    async fn test_resubmission_does_not_double_fill() {
        let exchange = PaperExchange::new(config(1.0, 0.0));
        let first = exchange.submit_order(&intent(0)).await.unwrap();
        let second = exchange.submit_order(&intent(0)).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(exchange.submissions(), 1);
        assert!((exchange.balance() - 994.0).abs() < 1e-9);
        assert_eq!(exchange.lookup_order(&intent(0)).await.unwrap(), Some(first));
    }

    #[tokio::test]
    async fn test_same_seed_same_outcomes() {
        let a = PaperExchange::new(config(0.5, 0.2));
        let b = PaperExchange::new(config(0.5, 0.2));
        for minute in 0..20 {
            let order = intent(minute);
            assert_eq!(
                a.submit_order(&order).await.unwrap(),
                b.submit_order(&order).await.unwrap()
            );
        }
    }
}
