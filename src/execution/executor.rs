use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::data::types::{ForecastProbability, Market};
use crate::engine::clock::Clock;
use crate::error::ExchangeError;
use crate::execution::backoff::BackoffPolicy;
use crate::execution::persistence::{append_or_log, CycleJournal};
use crate::execution::types::{CycleRecord, OrderIntent, OrderOutcome};
use crate::execution::ExchangeTransport;
use crate::strategies::types::EdgeSignal;

/// What the cycle saw before it decided to trade; journaled with the outcome.
#[derive(Debug, Clone)]
pub struct CycleInputs {
    pub market: Market,
    pub forecast: ForecastProbability,
    pub signal: EdgeSignal,
}

/// Submits intents with retry, backoff and idempotency.
pub struct OrderExecutor {
    transport: Arc<dyn ExchangeTransport>,
    backoff: BackoffPolicy,
    journal: Arc<dyn CycleJournal>,
    clock: Arc<dyn Clock>,
    settled: DashMap<String, OrderOutcome>,
}

impl OrderExecutor {
    pub fn new(
        transport: Arc<dyn ExchangeTransport>,
        backoff: BackoffPolicy,
        journal: Arc<dyn CycleJournal>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            transport,
            backoff,
            journal,
            clock,
            settled: DashMap::new(),
        }
    }

    /// Submit and journal. The returned record has already been written.
    pub async fn execute(&self, intent: OrderIntent, inputs: CycleInputs) -> CycleRecord {
        let outcome = self.submit(&intent).await;

        let record = CycleRecord {
            market_id: intent.market_id.clone(),
            cycle_ts: intent.cycle_ts,
            market: Some(inputs.market),
            forecast: Some(inputs.forecast),
            signal: Some(inputs.signal),
            intent: Some(intent),
            outcome,
        };
        append_or_log(self.journal.as_ref(), &record);
        record
    }

    /// Drive one intent to a terminal outcome.
    ///
    /// The same idempotency key always yields the same outcome: settled keys
    /// are answered from memory, and retries first ask the exchange whether
    /// an earlier attempt landed.
    pub async fn submit(&self, intent: &OrderIntent) -> OrderOutcome {
        if let Some(outcome) = self.settled.get(&intent.idempotency_key) {
            debug!("Order {} already settled, returning recorded outcome", intent.idempotency_key);
            return outcome.clone();
        }

        let outcome = self.attempt(intent).await;
        self.settled.insert(intent.idempotency_key.clone(), outcome.clone());
        outcome
    }

    async fn attempt(&self, intent: &OrderIntent) -> OrderOutcome {
        let max_attempts = self.backoff.max_attempts();
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                match self.transport.lookup_order(intent).await {
                    Ok(Some(outcome)) => {
                        info!(
                            "Order {} found on exchange after transient error: {}",
                            intent.idempotency_key,
                            outcome.label()
                        );
                        return outcome;
                    }
                    Ok(None) => {}
                    Err(e) => warn!("Lookup for {} failed: {}", intent.idempotency_key, e),
                }
            }

            match self.transport.submit_order(intent).await {
                Ok(outcome) => {
                    info!(
                        "Order {} {} x{} @ {:.2} -> {} (attempt {}/{})",
                        intent.market_id,
                        intent.side,
                        intent.quantity,
                        intent.limit_price,
                        outcome.label(),
                        attempt,
                        max_attempts
                    );
                    return outcome;
                }
                Err(ExchangeError::Rejected(reason)) => {
                    warn!("Order {} rejected: {}", intent.idempotency_key, reason);
                    return OrderOutcome::Rejected { reason };
                }
                Err(ExchangeError::Transient(reason)) => {
                    warn!(
                        "Transient error submitting {} (attempt {}/{}): {}",
                        intent.idempotency_key, attempt, max_attempts, reason
                    );
                    last_error = reason;
                    let delay = self.backoff.delay_after(attempt);
                    if attempt < max_attempts && !delay.is_zero() {
                        self.clock.sleep(delay).await;
                    }
                }
            }
        }

        error!(
            "Giving up on {} after {} attempts; exchange state unknown",
            intent.idempotency_key, max_attempts
        );
        OrderOutcome::failed(format!("gave up after {} attempts: {}", max_attempts, last_error))
    }

    /// Ask the exchange what became of a failed order and record the answer.
    pub async fn reconcile(
        &self,
        intent: &OrderIntent,
    ) -> Result<Option<OrderOutcome>, ExchangeError> {
        let found = self.transport.lookup_order(intent).await?;
        match &found {
            Some(outcome) => {
                info!("Reconciled {}: {}", intent.idempotency_key, outcome.label());
                self.settled.insert(intent.idempotency_key.clone(), outcome.clone());
            }
            None => {
                info!("Exchange has no order {}", intent.idempotency_key);
                self.settled.remove(&intent.idempotency_key);
            }
        }
        Ok(found)
    }
}
