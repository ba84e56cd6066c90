pub mod runner;

pub use runner::{BacktestOutcome, BacktestReport, BacktestRunner};
