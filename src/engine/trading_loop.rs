use chrono::{DateTime, Utc};
use futures::stream::{self, Stream};
use futures::FutureExt;
use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::data::{ForecastProvider, QuoteSource};
use crate::engine::clock::Clock;
use crate::engine::shutdown::Shutdown;
use crate::engine::state::{InFlightOrders, MarketSlot, MarketState};
use crate::error::{ConfigError, DataError};
use crate::execution::executor::{CycleInputs, OrderExecutor};
use crate::execution::persistence::{append_or_log, unresolved_orders, CycleJournal};
use crate::execution::sizer::{PositionSizer, SizedOrder};
use crate::execution::types::{CycleRecord, OrderOutcome, Position};
use crate::strategies::edge::EdgeEvaluator;

/// Collaborators a trading loop runs against. Live and backtest runs differ
/// only in what is plugged in here.
pub struct TradingContext {
    pub forecasts: Arc<dyn ForecastProvider>,
    pub quotes: Arc<dyn QuoteSource>,
    pub executor: Arc<OrderExecutor>,
    pub journal: Arc<dyn CycleJournal>,
    pub clock: Arc<dyn Clock>,
}

enum CycleStep {
    /// The executor already journaled this record.
    Journaled(CycleRecord),
    Finished(CycleRecord),
}

pub struct TradingLoop {
    ctx: TradingContext,
    evaluator: EdgeEvaluator,
    sizer: PositionSizer,
    interval: Duration,
    slots: HashMap<String, MarketSlot>,
    in_flight: InFlightOrders,
    shutdown: Shutdown,
}

impl TradingLoop {
    pub fn new(
        ctx: TradingContext,
        config: &Config,
        shutdown: Shutdown,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            ctx,
            evaluator: EdgeEvaluator::new(&config.strategy),
            sizer: PositionSizer::new(config.risk.clone(), &config.strategy)?,
            interval: Duration::from_secs(config.trading_loop.interval_secs),
            slots: HashMap::new(),
            in_flight: InFlightOrders::new(),
            shutdown,
        })
    }

    /// Read-only view of outstanding orders.
    pub fn in_flight(&self) -> InFlightOrders {
        self.in_flight.clone()
    }

    pub fn position(&self, market_id: &str) -> Option<&Position> {
        self.slots.get(market_id).map(|s| &s.position)
    }

    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.slots.values().map(|s| &s.position)
    }

    pub fn state(&self, market_id: &str) -> MarketState {
        self.slots.get(market_id).map(|s| s.state).unwrap_or(MarketState::Idle)
    }

    pub fn total_exposure(&self) -> u64 {
        self.slots.values().map(|s| s.position.exposure()).sum()
    }

    /// Rebuild positions from journaled records after a restart. Orders that
    /// failed without a later reconciliation go back in flight, so their
    /// markets reconcile before trading again.
    pub fn restore_positions(&mut self, records: &[CycleRecord]) {
        let markets: BTreeSet<&str> = records.iter().map(|r| r.market_id.as_str()).collect();
        for market_id in markets {
            let position = Position::replay(market_id, records);
            if position.net_quantity != 0 || position.realized_pnl != 0.0 {
                info!(
                    "Restored position {}: net={} @ {:.3}, realized ${:.2}",
                    market_id,
                    position.net_quantity,
                    position.avg_entry_price,
                    position.realized_pnl
                );
            }
            self.slot_mut(market_id).position = position;
        }

        for record in unresolved_orders(records) {
            if let Some(intent) = &record.intent {
                warn!(
                    "Order {} for {} unresolved at restart; reconciling before trading",
                    intent.idempotency_key, intent.market_id
                );
                self.in_flight.insert(intent);
            }
        }
    }

    /// Run one cycle for one market. Never panics or errors: every outcome,
    /// including a collaborator panic, comes back as a journaled record.
    pub async fn run_cycle(&mut self, market_id: &str) -> CycleRecord {
        let cycle_ts = self.ctx.clock.now();

        let step = AssertUnwindSafe(self.cycle(market_id, cycle_ts)).catch_unwind().await;
        let record = match step {
            Ok(CycleStep::Journaled(record)) => record,
            Ok(CycleStep::Finished(record)) => {
                append_or_log(self.ctx.journal.as_ref(), &record);
                record
            }
            Err(payload) => {
                let reason = panic_message(payload.as_ref());
                error!("Cycle for {} panicked: {}", market_id, reason);
                let record = CycleRecord::new(
                    market_id,
                    cycle_ts,
                    OrderOutcome::failed(format!("cycle panicked: {}", reason)),
                );
                append_or_log(self.ctx.journal.as_ref(), &record);
                record
            }
        };

        // A panic mid-submission leaves the order in flight until reconciled
        self.transition(market_id, MarketState::Idle);

        match record.outcome.reason() {
            Some(reason) => info!(
                "Cycle {} @ {}: {} ({})",
                market_id,
                cycle_ts,
                record.outcome.label(),
                reason
            ),
            None => info!("Cycle {} @ {}: {}", market_id, cycle_ts, record.outcome.label()),
        }
        record
    }

    async fn cycle(&mut self, market_id: &str, cycle_ts: DateTime<Utc>) -> CycleStep {
        if self.in_flight.contains(market_id) {
            return CycleStep::Finished(self.reconcile(market_id, cycle_ts).await);
        }

        let mut record =
            CycleRecord::new(market_id, cycle_ts, OrderOutcome::skipped("shutdown requested"));
        if self.shutdown.is_triggered() {
            return CycleStep::Finished(record);
        }

        let market = match self.ctx.quotes.get_quote(market_id).await {
            Ok(market) => market,
            Err(e) => return CycleStep::Finished(data_failure(record, e)),
        };
        self.transition(market_id, MarketState::QuotingFetched);
        record.market = Some(market.clone());

        if self.shutdown.is_triggered() {
            return CycleStep::Finished(record);
        }

        let forecast = match self.ctx.forecasts.get_forecast(market_id, cycle_ts).await {
            Ok(forecast) => forecast,
            Err(e) => return CycleStep::Finished(data_failure(record, e)),
        };
        record.forecast = Some(forecast.clone());

        let signal = match self.evaluator.evaluate(&forecast, &market, cycle_ts) {
            Ok(signal) => signal,
            Err(e) => return CycleStep::Finished(data_failure(record, e)),
        };
        self.transition(market_id, MarketState::EdgeComputed);
        record.signal = Some(signal.clone());

        let position = self.slot_mut(market_id).position.clone();
        let total_exposure = self.total_exposure();
        let intent = match self.sizer.size(&signal, &market, &position, total_exposure, cycle_ts) {
            SizedOrder::Intent(intent) => intent,
            SizedOrder::Skip(reason) => {
                record.outcome = OrderOutcome::skipped(reason);
                return CycleStep::Finished(record);
            }
        };
        self.transition(market_id, MarketState::Sized);

        if self.shutdown.is_triggered() {
            return CycleStep::Finished(record);
        }

        self.in_flight.insert(&intent);
        self.transition(market_id, MarketState::Submitted);

        let record = self
            .ctx
            .executor
            .execute(intent, CycleInputs { market, forecast, signal })
            .await;

        self.transition(market_id, MarketState::Settled);
        self.settle(&record);
        CycleStep::Journaled(record)
    }

    /// Book a terminal record. Failed orders stay in flight: the exchange
    /// may still hold them.
    fn settle(&mut self, record: &CycleRecord) {
        if let (Some(intent), Some((quantity, price))) = (&record.intent, record.outcome.fill()) {
            self.slot_mut(&record.market_id)
                .position
                .apply_fill(intent.side, quantity, price);
        }
        match record.outcome {
            OrderOutcome::Failed { .. } => warn!(
                "Order for {} needs reconciliation; market paused until resolved",
                record.market_id
            ),
            _ => {
                self.in_flight.remove(&record.market_id);
            }
        }
    }

    /// Resolve an order left in flight by an earlier cycle. This cycle does
    /// not trade; the next one starts clean if the order is resolved.
    async fn reconcile(&mut self, market_id: &str, cycle_ts: DateTime<Utc>) -> CycleRecord {
        let Some(intent) = self.in_flight.get(market_id) else {
            return CycleRecord::new(
                market_id,
                cycle_ts,
                OrderOutcome::skipped("no order in flight"),
            );
        };

        match self.ctx.executor.reconcile(&intent).await {
            Ok(Some(outcome)) => {
                let mut record = CycleRecord::new(market_id, cycle_ts, outcome);
                record.intent = Some(intent);
                self.settle(&record);
                self.in_flight.remove(market_id);
                record
            }
            Ok(None) => {
                self.in_flight.remove(market_id);
                let reason = format!(
                    "prior order {} never reached the exchange",
                    intent.idempotency_key
                );
                let mut record =
                    CycleRecord::new(market_id, cycle_ts, OrderOutcome::skipped(reason));
                // Carrying the intent marks the failure as reconciled in the journal
                record.intent = Some(intent);
                record
            }
            Err(e) => CycleRecord::new(
                market_id,
                cycle_ts,
                OrderOutcome::skipped(format!(
                    "order {} still in flight: {}",
                    intent.idempotency_key, e
                )),
            ),
        }
    }

    /// Cycle every market in ascending id order, pausing `interval` between
    /// passes, until `max_cycles` passes complete or shutdown is requested.
    ///
    /// Lazy: nothing runs until the stream is polled.
    pub fn run_loop(
        &mut self,
        markets: Vec<String>,
        max_cycles: Option<u64>,
    ) -> impl Stream<Item = CycleRecord> + '_ {
        let markets: Vec<String> = markets
            .into_iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        info!(
            "Starting trading loop: {} markets, interval {:?}, max cycles {:?}",
            markets.len(),
            self.interval,
            max_cycles
        );

        let cursor = LoopCursor {
            engine: self,
            markets,
            pass: 0,
            next: 0,
            max_cycles,
        };

        stream::unfold(cursor, |mut cursor| async move {
            if cursor.markets.is_empty() || cursor.finished() {
                return None;
            }
            if cursor.next == cursor.markets.len() {
                cursor.next = 0;
                cursor.pass += 1;
                if cursor.finished() {
                    info!("Completed {} cycles", cursor.pass);
                    return None;
                }
                if !cursor.engine.pause().await {
                    return None;
                }
            }
            if cursor.engine.shutdown.is_triggered() {
                info!("Shutdown requested, stopping trading loop");
                return None;
            }

            let market_id = cursor.markets[cursor.next].clone();
            cursor.next += 1;
            let record = cursor.engine.run_cycle(&market_id).await;
            Some((record, cursor))
        })
    }

    /// Wait out the interval. False if shutdown arrived first.
    async fn pause(&mut self) -> bool {
        let clock = self.ctx.clock.clone();
        let interval = self.interval;
        let shutdown = &mut self.shutdown;

        tokio::select! {
            _ = clock.sleep(interval) => true,
            _ = shutdown.wait() => {
                info!("Shutdown requested during pause");
                false
            }
        }
    }

    fn slot_mut(&mut self, market_id: &str) -> &mut MarketSlot {
        self.slots
            .entry(market_id.to_string())
            .or_insert_with(|| MarketSlot::new(market_id))
    }

    fn transition(&mut self, market_id: &str, to: MarketState) {
        let slot = self.slot_mut(market_id);
        if slot.state != to {
            debug!("{}: {} -> {}", market_id, slot.state, to);
            slot.state = to;
        }
    }
}

struct LoopCursor<'a> {
    engine: &'a mut TradingLoop,
    markets: Vec<String>,
    pass: u64,
    next: usize,
    max_cycles: Option<u64>,
}

impl LoopCursor<'_> {
    fn finished(&self) -> bool {
        self.max_cycles.map_or(false, |max| self.pass >= max)
    }
}

fn data_failure(mut record: CycleRecord, e: DataError) -> CycleRecord {
    if e.is_skippable() {
        warn!("Skipping {}: {}", record.market_id, e);
        record.outcome = OrderOutcome::skipped(e.to_string());
    } else {
        error!("Cycle for {} failed: {}", record.market_id, e);
        record.outcome = OrderOutcome::failed(e.to_string());
    }
    record
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::types::{ForecastProbability, Market};
    use crate::engine::clock::SimulatedClock;
    use crate::error::ExchangeError;
    use crate::execution::backoff::BackoffPolicy;
    use crate::execution::persistence::MemoryJournal;
    use crate::execution::simulator::PaperExchange;
    use crate::execution::types::OrderIntent;
    use crate::execution::ExchangeTransport;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use futures::StreamExt;
    use crate::engine::shutdown::ShutdownHandle;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Mutex;

    const CONFIG: &str = r#"
        [system]
        dry_run = true
        database_path = ":memory:"

        [strategy]
        min_edge = 0.05
        max_spread = 0.10
        bankroll_usd = 1000.0

        [risk]
        max_position_per_market = 100
        max_total_exposure = 300

        [trading_loop]
        markets = ["A", "B"]
        interval_secs = 300

        [paper_trading]
        fill_rate = 1.0
        partial_fill_rate = 0.0
    "#;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap()
    }

    /// Fixed books, stamped with the simulated time so they are never stale.
    struct Books {
        clock: Arc<SimulatedClock>,
        books: HashMap<String, (f64, f64)>,
    }

    #[async_trait]
    impl QuoteSource for Books {
        async fn get_quote(&self, market_id: &str) -> Result<Market, DataError> {
            let (bid, ask) = self
                .books
                .get(market_id)
                .copied()
                .ok_or_else(|| DataError::unavailable(market_id, "no book"))?;
            Ok(Market {
                id: market_id.to_string(),
                condition: "high above 45F".to_string(),
                expiration: start() + chrono::Duration::days(1),
                bid,
                ask,
                tick_size: 0.01,
                quoted_at: self.clock.now(),
            })
        }
    }

    struct Fixed(HashMap<String, f64>);

    #[async_trait]
    impl ForecastProvider for Fixed {
        async fn get_forecast(
            &self,
            market_id: &str,
            as_of: DateTime<Utc>,
        ) -> Result<ForecastProbability, DataError> {
            if market_id == "BOOM" {
                panic!("model blew up");
            }
            let probability = self
                .0
                .get(market_id)
                .copied()
                .ok_or_else(|| DataError::unavailable(market_id, "no forecast"))?;
            Ok(ForecastProbability {
                market_id: market_id.to_string(),
                probability,
                generated_at: as_of,
                uncertainty: 0.0,
            })
        }
    }

    fn books(clock: &Arc<SimulatedClock>, markets: &[&str]) -> Arc<Books> {
        Arc::new(Books {
            clock: clock.clone(),
            books: markets.iter().map(|m| (m.to_string(), (0.55, 0.65))).collect(),
        })
    }

    fn forecasts(markets: &[(&str, f64)]) -> Arc<Fixed> {
        Arc::new(Fixed(markets.iter().map(|(m, p)| (m.to_string(), *p)).collect()))
    }

    fn build(
        quotes: Arc<dyn QuoteSource>,
        forecasts: Arc<dyn ForecastProvider>,
        transport: Arc<dyn ExchangeTransport>,
        clock: Arc<SimulatedClock>,
        journal: Arc<MemoryJournal>,
        shutdown: Shutdown,
    ) -> TradingLoop {
        let config = Config::from_toml(CONFIG).unwrap();
        let executor = OrderExecutor::new(
            transport,
            BackoffPolicy::immediate(config.execution.max_attempts).unwrap(),
            journal.clone(),
            clock.clone(),
        );
        let ctx = TradingContext {
            forecasts,
            quotes,
            executor: Arc::new(executor),
            journal,
            clock,
        };
        TradingLoop::new(ctx, &config, shutdown).unwrap()
    }

    fn paper() -> Arc<PaperExchange> {
        let config = Config::from_toml(CONFIG).unwrap();
        Arc::new(PaperExchange::new(config.paper_trading))
    }

    #[tokio::test]
    async fn test_cycle_trades_and_books_position() {
        let clock = Arc::new(SimulatedClock::new(start()));
        let journal = Arc::new(MemoryJournal::new());
        let mut engine = build(
            books(&clock, &["A"]),
            forecasts(&[("A", 0.80)]),
            paper(),
            clock.clone(),
            journal.clone(),
            Shutdown::never(),
        );

        let record = engine.run_cycle("A").await;

        assert_eq!(record.outcome, OrderOutcome::Filled { quantity: 100, price: 0.65 });
        assert_eq!(engine.position("A").map(|p| p.net_quantity), Some(100));
        assert_eq!(engine.state("A"), MarketState::Idle);
        assert!(engine.in_flight().is_empty());
        assert_eq!(journal.records(), vec![record]);
    }

    #[tokio::test]
    async fn test_failures_are_isolated_per_market() {
        let clock = Arc::new(SimulatedClock::new(start()));
        let journal = Arc::new(MemoryJournal::new());
        let mut engine = build(
            books(&clock, &["A", "BOOM", "C"]),
            forecasts(&[("A", 0.80), ("C", 0.30)]),
            paper(),
            clock.clone(),
            journal.clone(),
            Shutdown::never(),
        );

        let records: Vec<CycleRecord> = engine
            .run_loop(
                vec![
                    "C".to_string(),
                    "BOOM".to_string(),
                    "A".to_string(),
                    "MISSING".to_string(),
                ],
                Some(1),
            )
            .collect()
            .await;

        let labels: Vec<(&str, &str)> = records
            .iter()
            .map(|r| (r.market_id.as_str(), r.outcome.label()))
            .collect();
        assert_eq!(
            labels,
            vec![("A", "filled"), ("BOOM", "failed"), ("C", "filled"), ("MISSING", "skipped")]
        );
        assert_eq!(journal.records().len(), 4);
        assert_eq!(engine.position("C").map(|p| p.net_quantity), Some(-100));
    }

    #[tokio::test]
    async fn test_max_cycles_and_clock_advance() {
        let clock = Arc::new(SimulatedClock::new(start()));
        let journal = Arc::new(MemoryJournal::new());
        let mut engine = build(
            books(&clock, &["A", "B"]),
            forecasts(&[("A", 0.62), ("B", 0.60)]),
            paper(),
            clock.clone(),
            journal.clone(),
            Shutdown::never(),
        );

        let records: Vec<CycleRecord> = engine
            .run_loop(vec!["B".to_string(), "A".to_string()], Some(3))
            .collect()
            .await;

        assert_eq!(records.len(), 6);
        assert_eq!(records[0].cycle_ts, start());
        assert_eq!(records[2].cycle_ts, start() + chrono::Duration::seconds(300));
        assert_eq!(records[5].cycle_ts, start() + chrono::Duration::seconds(600));
        assert!(records.iter().all(|r| matches!(r.outcome, OrderOutcome::Skipped { .. })));
    }

    #[tokio::test]
    async fn test_shutdown_stops_the_loop() {
        let clock = Arc::new(SimulatedClock::new(start()));
        let (handle, shutdown) = Shutdown::new();
        let mut engine = build(
            books(&clock, &["A"]),
            forecasts(&[("A", 0.80)]),
            paper(),
            clock.clone(),
            Arc::new(MemoryJournal::new()),
            shutdown,
        );

        let stream = engine.run_loop(vec!["A".to_string()], None);
        futures::pin_mut!(stream);
        assert!(stream.next().await.is_some());
        handle.trigger();
        assert!(stream.next().await.is_none());
    }

    /// Observes the in-flight registry from inside the exchange call.
    struct Watching {
        registry: Mutex<Option<InFlightOrders>>,
        seen_in_flight: AtomicBool,
        fail: bool,
    }

    #[async_trait]
    impl ExchangeTransport for Watching {
        async fn submit_order(&self, intent: &OrderIntent) -> Result<OrderOutcome, ExchangeError> {
            let registry = self.registry.lock().unwrap().clone();
            if let Some(registry) = registry {
                self.seen_in_flight
                    .store(registry.contains(&intent.market_id), Ordering::SeqCst);
            }
            if self.fail {
                return Err(ExchangeError::Transient("timeout".to_string()));
            }
            Ok(OrderOutcome::Filled { quantity: intent.quantity, price: intent.limit_price })
        }

        async fn lookup_order(
            &self,
            _intent: &OrderIntent,
        ) -> Result<Option<OrderOutcome>, ExchangeError> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_market_is_in_flight_during_submission() {
        let clock = Arc::new(SimulatedClock::new(start()));
        let transport = Arc::new(Watching {
            registry: Mutex::new(None),
            seen_in_flight: AtomicBool::new(false),
            fail: false,
        });
        let mut engine = build(
            books(&clock, &["A"]),
            forecasts(&[("A", 0.80)]),
            transport.clone(),
            clock.clone(),
            Arc::new(MemoryJournal::new()),
            Shutdown::never(),
        );
        *transport.registry.lock().unwrap() = Some(engine.in_flight());

        engine.run_cycle("A").await;

        assert!(transport.seen_in_flight.load(Ordering::SeqCst));
        assert!(!engine.in_flight().contains("A"));
    }

    #[tokio::test]
    async fn test_failed_order_blocks_next_cycle_until_reconciled() {
        let clock = Arc::new(SimulatedClock::new(start()));
        let transport = Arc::new(Watching {
            registry: Mutex::new(None),
            seen_in_flight: AtomicBool::new(false),
            fail: true,
        });
        let mut engine = build(
            books(&clock, &["A"]),
            forecasts(&[("A", 0.80)]),
            transport,
            clock.clone(),
            Arc::new(MemoryJournal::new()),
            Shutdown::never(),
        );

        let first = engine.run_cycle("A").await;
        assert!(matches!(first.outcome, OrderOutcome::Failed { .. }));
        assert!(engine.in_flight().contains("A"));

        clock.advance(Duration::from_secs(300));
        let second = engine.run_cycle("A").await;
        assert!(matches!(second.outcome, OrderOutcome::Skipped { .. }));
        assert_eq!(second.intent, first.intent);
        assert!(!engine.in_flight().contains("A"));
    }

    #[tokio::test]
    async fn test_restore_positions_from_records() {
        let clock = Arc::new(SimulatedClock::new(start()));
        let journal = Arc::new(MemoryJournal::new());
        let mut engine = build(
            books(&clock, &["A"]),
            forecasts(&[("A", 0.80)]),
            paper(),
            clock.clone(),
            journal.clone(),
            Shutdown::never(),
        );
        engine.run_cycle("A").await;

        let mut restarted = build(
            books(&clock, &["A"]),
            forecasts(&[("A", 0.80)]),
            paper(),
            clock.clone(),
            Arc::new(MemoryJournal::new()),
            Shutdown::never(),
        );
        restarted.restore_positions(&journal.records());

        assert_eq!(restarted.position("A"), engine.position("A"));
        assert_eq!(restarted.total_exposure(), 100);
    }

    /// Submits never get an answer; lookups report `landed`.
    struct Unanswered {
        submits: AtomicU32,
        landed: Option<OrderOutcome>,
    }

    impl Unanswered {
        fn new(landed: Option<OrderOutcome>) -> Arc<Self> {
            Arc::new(Self {
                submits: AtomicU32::new(0),
                landed,
            })
        }
    }

    #[async_trait]
    impl ExchangeTransport for Unanswered {
        async fn submit_order(&self, _intent: &OrderIntent) -> Result<OrderOutcome, ExchangeError> {
            self.submits.fetch_add(1, Ordering::SeqCst);
            Err(ExchangeError::Transient("timeout".to_string()))
        }

        async fn lookup_order(
            &self,
            _intent: &OrderIntent,
        ) -> Result<Option<OrderOutcome>, ExchangeError> {
            Ok(self.landed.clone())
        }
    }

    #[tokio::test]
    async fn test_restart_reconciles_failed_order_before_trading() {
        let clock = Arc::new(SimulatedClock::new(start()));
        let journal = Arc::new(MemoryJournal::new());
        let before = Unanswered::new(None);
        let mut engine = build(
            books(&clock, &["A"]),
            forecasts(&[("A", 0.80)]),
            before.clone(),
            clock.clone(),
            journal.clone(),
            Shutdown::never(),
        );
        let failed = engine.run_cycle("A").await;
        assert!(matches!(failed.outcome, OrderOutcome::Failed { .. }));
        assert_eq!(before.submits.load(Ordering::SeqCst), 3);

        // The order did land; the exchange reports it after the restart
        let filled = OrderOutcome::Filled { quantity: 100, price: 0.65 };
        let after = Unanswered::new(Some(filled.clone()));
        let mut restarted = build(
            books(&clock, &["A"]),
            forecasts(&[("A", 0.80)]),
            after.clone(),
            clock.clone(),
            journal.clone(),
            Shutdown::never(),
        );
        restarted.restore_positions(&journal.records());
        assert_eq!(restarted.in_flight().get("A"), failed.intent);

        clock.advance(Duration::from_secs(300));
        let record = restarted.run_cycle("A").await;

        assert_eq!(record.outcome, filled);
        assert_eq!(record.intent, failed.intent);
        assert_eq!(after.submits.load(Ordering::SeqCst), 0);
        assert_eq!(restarted.position("A").map(|p| p.net_quantity), Some(100));
        assert!(restarted.in_flight().is_empty());
        assert!(unresolved_orders(&journal.records()).is_empty());
    }

    /// Requests shutdown from inside a collaborator call.
    struct StopDuringQuote {
        inner: Arc<Books>,
        handle: ShutdownHandle,
    }

    #[async_trait]
    impl QuoteSource for StopDuringQuote {
        async fn get_quote(&self, market_id: &str) -> Result<Market, DataError> {
            self.handle.trigger();
            self.inner.get_quote(market_id).await
        }
    }

    struct StopDuringForecast {
        inner: Arc<Fixed>,
        handle: ShutdownHandle,
    }

    #[async_trait]
    impl ForecastProvider for StopDuringForecast {
        async fn get_forecast(
            &self,
            market_id: &str,
            as_of: DateTime<Utc>,
        ) -> Result<ForecastProbability, DataError> {
            self.handle.trigger();
            self.inner.get_forecast(market_id, as_of).await
        }
    }

    #[tokio::test]
    async fn test_shutdown_during_quote_fetch_submits_nothing() {
        let clock = Arc::new(SimulatedClock::new(start()));
        let (handle, shutdown) = Shutdown::new();
        let exchange = paper();
        let quotes = Arc::new(StopDuringQuote {
            inner: books(&clock, &["A"]),
            handle,
        });
        let mut engine = build(
            quotes,
            forecasts(&[("A", 0.80)]),
            exchange.clone(),
            clock.clone(),
            Arc::new(MemoryJournal::new()),
            shutdown,
        );

        let record = engine.run_cycle("A").await;

        assert_eq!(record.outcome, OrderOutcome::skipped("shutdown requested"));
        assert!(record.forecast.is_none());
        assert!(record.intent.is_none());
        assert_eq!(exchange.submissions(), 0);
        assert!(engine.in_flight().is_empty());
        assert_eq!(engine.state("A"), MarketState::Idle);
    }

    #[tokio::test]
    async fn test_shutdown_during_forecast_fetch_submits_nothing() {
        let clock = Arc::new(SimulatedClock::new(start()));
        let (handle, shutdown) = Shutdown::new();
        let exchange = paper();
        let forecasts = Arc::new(StopDuringForecast {
            inner: forecasts(&[("A", 0.80)]),
            handle,
        });
        let mut engine = build(
            books(&clock, &["A"]),
            forecasts,
            exchange.clone(),
            clock.clone(),
            Arc::new(MemoryJournal::new()),
            shutdown,
        );

        let record = engine.run_cycle("A").await;

        assert_eq!(record.outcome, OrderOutcome::skipped("shutdown requested"));
        assert!(record.signal.is_some());
        assert!(record.intent.is_none());
        assert_eq!(exchange.submissions(), 0);
        assert!(engine.in_flight().is_empty());
    }
}
