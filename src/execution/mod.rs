pub mod backoff;
pub mod executor;
pub mod persistence;
pub mod risk;
pub mod simulator;
pub mod sizer;
pub mod types;

use async_trait::async_trait;

use crate::error::ExchangeError;
use types::{OrderIntent, OrderOutcome};

/// Exchange boundary. Implementations must treat `intent.idempotency_key` as
/// the client order id so a resubmission never opens a second order.
#[async_trait]
pub trait ExchangeTransport: Send + Sync {
    async fn submit_order(&self, intent: &OrderIntent) -> Result<OrderOutcome, ExchangeError>;

    /// Status of a previously acknowledged order, if the exchange knows the key.
    async fn lookup_order(
        &self,
        intent: &OrderIntent,
    ) -> Result<Option<OrderOutcome>, ExchangeError>;
}
