pub mod backtest;
pub mod config;
pub mod data;
pub mod engine;
pub mod error;
pub mod execution;
pub mod monitoring;
pub mod strategies;
