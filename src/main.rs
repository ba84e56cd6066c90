use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use std::sync::Arc;
use tracing::{error, info, warn};

use celsius_trader::backtest::BacktestRunner;
use celsius_trader::config::{Config, EnvConfig};
use celsius_trader::data::estimator::{ModelForecastProvider, NormalCdfEstimator};
use celsius_trader::data::kalshi::{KalshiAuth, KalshiClient};
use celsius_trader::data::replay::History;
use celsius_trader::data::weather::{WeatherClient, PHILADELPHIA};
use celsius_trader::engine::shutdown::{wait_for_signal, Shutdown};
use celsius_trader::engine::{SystemClock, TradingContext, TradingLoop};
use celsius_trader::execution::executor::OrderExecutor;
use celsius_trader::execution::persistence::{
    recover_from_journal, CycleJournal, SqliteJournal, TeeJournal,
};
use celsius_trader::execution::simulator::PaperExchange;
use celsius_trader::execution::ExchangeTransport;
use celsius_trader::monitoring::init_tracing;
use celsius_trader::monitoring::logger::CsvLogger;

/// Kalshi weather-market trading engine
#[derive(Parser)]
#[command(name = "celsius-trader", about = "Trades Kalshi temperature markets from NOAA forecasts")]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the live trading loop.
    Trade {
        /// Route orders to the paper exchange regardless of config.
        #[arg(long)]
        paper: bool,
    },
    /// Replay a JSON-lines history file through the trading loop.
    Backtest {
        #[arg(long)]
        history: String,

        #[arg(long, default_value = "backtest_report.json")]
        output: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config)?;
    init_tracing(&config.system.log_level);
    config.validate().context("Invalid configuration")?;

    match cli.command {
        Command::Trade { paper } => trade(config, paper).await,
        Command::Backtest { history, output } => backtest(config, &history, &output).await,
    }
}

async fn trade(config: Config, paper: bool) -> Result<()> {
    let env_config = EnvConfig::load()?;
    let paper = paper
        || config.paper_trading.enabled
        || config.system.dry_run
        || env_config.dry_run;

    info!("🚀 Celsius trader starting...");
    info!("Paper trading: {}", paper);
    info!("Markets: {:?}", config.trading_loop.markets);

    // Initialize journal
    info!("Initializing database: {}", config.system.database_path);
    let sqlite = Arc::new(SqliteJournal::new(&config.system.database_path)?);

    // Perform crash recovery
    let history = recover_from_journal(&sqlite)?;

    let journal: Arc<dyn CycleJournal> = if config.monitoring.csv_logging {
        let csv = Arc::new(CsvLogger::new(&config.monitoring.csv_log_path)?);
        let journals: Vec<Arc<dyn CycleJournal>> = vec![sqlite.clone(), csv];
        Arc::new(TeeJournal::new(journals))
    } else {
        sqlite.clone()
    };

    let auth = match (&env_config.kalshi_api_key, &env_config.kalshi_private_key) {
        (Some(key), Some(pem)) => Some(KalshiAuth::new(key, pem)?),
        _ => {
            warn!("Kalshi credentials not set; market data only");
            None
        }
    };
    let has_auth = auth.is_some();
    let kalshi = Arc::new(KalshiClient::new(&env_config.kalshi_base_url, auth)?);

    let transport: Arc<dyn ExchangeTransport> = if paper {
        Arc::new(PaperExchange::new(config.paper_trading.clone()))
    } else if has_auth {
        kalshi.clone()
    } else {
        bail!("Live trading requires KALSHI_API_KEY and KALSHI_PRIVATE_KEY");
    };

    let weather = Arc::new(WeatherClient::new(&config.weather, PHILADELPHIA)?);
    let forecasts = Arc::new(ModelForecastProvider::new(
        weather,
        Arc::new(NormalCdfEstimator),
        kalshi.clone(),
    ));

    let clock = Arc::new(SystemClock);
    let executor = OrderExecutor::new(
        transport,
        config.execution.backoff_policy()?,
        journal.clone(),
        clock.clone(),
    );
    let ctx = TradingContext {
        forecasts,
        quotes: kalshi,
        executor: Arc::new(executor),
        journal,
        clock,
    };

    let (shutdown_handle, shutdown) = Shutdown::new();
    tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(()) => shutdown_handle.trigger(),
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
    });

    let mut engine = TradingLoop::new(ctx, &config, shutdown)?;
    engine.restore_positions(&history);

    info!("✅ Trader initialized, exposure {} contracts", engine.total_exposure());

    let markets = config.trading_loop.markets.clone();
    let records = engine.run_loop(markets, config.trading_loop.max_cycles);
    futures::pin_mut!(records);
    let mut count = 0usize;
    while records.next().await.is_some() {
        count += 1;
    }

    info!("Shutting down after {} cycle records", count);
    Ok(())
}

async fn backtest(config: Config, history_path: &str, output: &str) -> Result<()> {
    let history = History::load(history_path)?;
    let outcome = BacktestRunner::new(config).run(history).await?;

    outcome.report.write_json(output)?;
    info!("Report written to {}", output);
    println!("{}", serde_json::to_string_pretty(&outcome.report)?);
    Ok(())
}
