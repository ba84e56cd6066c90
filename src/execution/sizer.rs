use chrono::{DateTime, Utc};

use crate::config::StrategyConfig;
use crate::data::types::Market;
use crate::error::ConfigError;
use crate::execution::risk::RiskLimits;
use crate::execution::types::{OrderIntent, Position};
use crate::strategies::types::{EdgeSignal, Side};

/// Result of sizing one signal.
#[derive(Debug, Clone, PartialEq)]
pub enum SizedOrder {
    Intent(OrderIntent),
    Skip(String),
}

/// Fractional-Kelly sizing, shrunk by forecast uncertainty and clamped to
/// the risk limits.
#[derive(Debug, Clone)]
pub struct PositionSizer {
    limits: RiskLimits,
    kelly_fraction: f64,
    volatility_reference: f64,
    bankroll_usd: f64,
}

impl PositionSizer {
    pub fn new(limits: RiskLimits, strategy: &StrategyConfig) -> Result<Self, ConfigError> {
        limits.validate()?;
        strategy.validate()?;
        Ok(Self {
            limits,
            kelly_fraction: strategy.kelly_fraction,
            volatility_reference: strategy.volatility_reference,
            bankroll_usd: strategy.bankroll_usd,
        })
    }

    pub fn size(
        &self,
        signal: &EdgeSignal,
        market: &Market,
        position: &Position,
        total_exposure: u64,
        cycle_ts: DateTime<Utc>,
    ) -> SizedOrder {
        let Some(side) = signal.side() else {
            return SizedOrder::Skip(
                signal.note.clone().unwrap_or_else(|| "no trade recommended".to_string()),
            );
        };

        // Marketable limit: lift the YES ask, or the NO ask implied by the YES bid
        let limit_price = match side {
            Side::Yes => market.round_to_tick(market.ask),
            Side::No => market.round_to_tick(market.no_ask()),
        };
        if limit_price <= 0.0 || limit_price >= 1.0 {
            return SizedOrder::Skip(format!("no executable {} price ({:.3})", side, limit_price));
        }

        let full = self.full_size(signal.edge.abs(), limit_price, signal.uncertainty);
        let quantity = self.clamp(full, position.exposure(), total_exposure);
        if quantity == 0 {
            return SizedOrder::Skip(format!(
                "size clamped to zero (unclamped {}, market exposure {}, total exposure {})",
                full,
                position.exposure(),
                total_exposure
            ));
        }

        SizedOrder::Intent(OrderIntent::new(&market.id, side, quantity, limit_price, cycle_ts))
    }

    /// Contracts before risk clamping.
    ///
    /// Kelly for a binary contract bought at `price` is `edge / (1 - price)` of
    /// bankroll. Uncertainty shrinks it by `1 / (1 + uncertainty / reference)`.
    pub fn full_size(&self, edge: f64, price: f64, uncertainty: f64) -> u64 {
        if edge <= 0.0 || price <= 0.0 || price >= 1.0 {
            return 0;
        }
        let kelly = edge / (1.0 - price);
        let shrink = 1.0 / (1.0 + uncertainty.max(0.0) / self.volatility_reference);
        let stake = self.bankroll_usd * self.kelly_fraction * kelly * shrink;
        (stake / price).floor().max(0.0) as u64
    }

    pub fn clamp(&self, full: u64, market_exposure: u64, total_exposure: u64) -> u64 {
        full.min(self.limits.headroom(market_exposure, total_exposure))
    }
}
