use anyhow::{bail, Context, Result};
use futures::StreamExt;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::sync::Arc;
use tracing::info;

use crate::config::Config;
use crate::data::replay::{History, ReplayForecasts, ReplayQuotes};
use crate::engine::clock::SimulatedClock;
use crate::engine::shutdown::Shutdown;
use crate::engine::trading_loop::{TradingContext, TradingLoop};
use crate::execution::backoff::BackoffPolicy;
use crate::execution::executor::OrderExecutor;
use crate::execution::persistence::MemoryJournal;
use crate::execution::simulator::PaperExchange;
use crate::execution::types::{CycleRecord, OrderOutcome, Position};
use crate::strategies::types::Side;

/// Summary metrics for one replay.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BacktestReport {
    pub cycles: usize,
    /// Intents that reached the exchange.
    pub trades: usize,
    pub fills: usize,
    pub partial_fills: usize,
    pub rejected: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Net YES-equivalent contracts per market before settlement.
    pub final_positions: BTreeMap<String, i64>,
    pub realized_pnl: f64,
    pub settlement_pnl: f64,
    pub total_return_pct: f64,
    pub max_drawdown_pct: f64,
    pub win_rate_pct: f64,
}

impl BacktestReport {
    pub fn from_records(
        records: &[CycleRecord],
        resolutions: &HashMap<String, bool>,
        bankroll: f64,
    ) -> Self {
        let mut report = Self {
            cycles: records.len(),
            trades: 0,
            fills: 0,
            partial_fills: 0,
            rejected: 0,
            failed: 0,
            skipped: 0,
            final_positions: BTreeMap::new(),
            realized_pnl: 0.0,
            settlement_pnl: 0.0,
            total_return_pct: 0.0,
            max_drawdown_pct: 0.0,
            win_rate_pct: 0.0,
        };

        let mut positions: BTreeMap<String, Position> = BTreeMap::new();
        let mut marks: HashMap<String, f64> = HashMap::new();
        let mut peak = bankroll;
        let (mut wins, mut judged) = (0usize, 0usize);

        for record in records {
            match record.outcome {
                OrderOutcome::Filled { .. } => report.fills += 1,
                OrderOutcome::PartiallyFilled { .. } => report.partial_fills += 1,
                OrderOutcome::Rejected { .. } => report.rejected += 1,
                OrderOutcome::Failed { .. } => report.failed += 1,
                OrderOutcome::Skipped { .. } => report.skipped += 1,
            }
            if record.intent.is_some() && !matches!(record.outcome, OrderOutcome::Skipped { .. }) {
                report.trades += 1;
            }
            if let Some(market) = &record.market {
                marks.insert(market.id.clone(), market.mid());
            }

            if let (Some(intent), Some((quantity, price))) =
                (&record.intent, record.outcome.fill())
            {
                positions
                    .entry(record.market_id.clone())
                    .or_insert_with(|| Position::new(&record.market_id))
                    .apply_fill(intent.side, quantity, price);

                if let Some(&resolved_yes) = resolutions.get(&record.market_id) {
                    judged += 1;
                    if (intent.side == Side::Yes) == resolved_yes {
                        wins += 1;
                    }
                }
            }

            let equity = bankroll + mark_to_market(&positions, &marks);
            peak = peak.max(equity);
            report.max_drawdown_pct = report.max_drawdown_pct.max(drawdown_pct(peak, equity));
        }

        report.final_positions = positions
            .values()
            .map(|p| (p.market_id.clone(), p.net_quantity))
            .collect();
        report.realized_pnl = positions.values().map(|p| p.realized_pnl).sum();

        for position in positions.values_mut() {
            if let Some(&resolved_yes) = resolutions.get(&position.market_id) {
                report.settlement_pnl += position.settle(resolved_yes);
            }
        }

        let final_equity = bankroll + mark_to_market(&positions, &marks);
        peak = peak.max(final_equity);
        report.max_drawdown_pct = report.max_drawdown_pct.max(drawdown_pct(peak, final_equity));
        if bankroll > 0.0 {
            report.total_return_pct = (final_equity - bankroll) / bankroll * 100.0;
        }
        if judged > 0 {
            report.win_rate_pct = wins as f64 / judged as f64 * 100.0;
        }
        report
    }

    pub fn write_json(&self, path: &str) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).with_context(|| format!("Failed to write report: {}", path))?;
        Ok(())
    }
}

/// Realized P&L plus open positions marked at their last mid.
fn mark_to_market(positions: &BTreeMap<String, Position>, marks: &HashMap<String, f64>) -> f64 {
    positions
        .values()
        .map(|p| {
            let mark = marks.get(&p.market_id).copied().unwrap_or(p.avg_entry_price);
            p.realized_pnl + p.unrealized_pnl(mark)
        })
        .sum()
}

fn drawdown_pct(peak: f64, equity: f64) -> f64 {
    if peak <= 0.0 {
        return 0.0;
    }
    ((peak - equity) / peak * 100.0).max(0.0)
}

/// Everything a replay produced.
#[derive(Debug, Clone)]
pub struct BacktestOutcome {
    pub records: Vec<CycleRecord>,
    pub report: BacktestReport,
}

/// Replays recorded forecasts and quotes through the same trading loop used
/// live, against a seeded paper exchange.
pub struct BacktestRunner {
    config: Config,
}

impl BacktestRunner {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub async fn run(&self, history: History) -> Result<BacktestOutcome> {
        if history.is_empty() {
            bail!("History is empty");
        }
        self.config.paper_trading.validate()?;

        let timestamps = history.timestamps();
        let markets = history.markets();
        let resolutions = history.resolutions();
        let history = Arc::new(history);

        info!(
            "Backtesting {} markets over {} observation times ({} -> {})",
            markets.len(),
            timestamps.len(),
            timestamps.first().map(|t| t.to_rfc3339()).unwrap_or_default(),
            timestamps.last().map(|t| t.to_rfc3339()).unwrap_or_default()
        );

        let clock = Arc::new(
            SimulatedClock::with_schedule(timestamps.iter().copied())
                .context("History has no timestamps")?,
        );
        let journal = Arc::new(MemoryJournal::new());
        let exchange = Arc::new(PaperExchange::new(self.config.paper_trading.clone()));
        // Simulated time must only move between cycles
        let backoff = BackoffPolicy::immediate(self.config.execution.max_attempts)?;
        let executor = OrderExecutor::new(exchange, backoff, journal.clone(), clock.clone());

        let ctx = TradingContext {
            forecasts: Arc::new(ReplayForecasts::new(history.clone())),
            quotes: Arc::new(ReplayQuotes::new(history, clock.clone())),
            executor: Arc::new(executor),
            journal,
            clock,
        };
        let mut engine = TradingLoop::new(ctx, &self.config, Shutdown::never())?;

        let records: Vec<CycleRecord> = engine
            .run_loop(markets, Some(timestamps.len() as u64))
            .collect()
            .await;

        let report = BacktestReport::from_records(
            &records,
            &resolutions,
            self.config.strategy.bankroll_usd,
        );
        info!(
            "Backtest complete: {} cycles, {} trades, return {:.2}%, max drawdown {:.2}%, win rate {:.1}%",
            report.cycles,
            report.trades,
            report.total_return_pct,
            report.max_drawdown_pct,
            report.win_rate_pct
        );

        Ok(BacktestOutcome { records, report })
    }
}
