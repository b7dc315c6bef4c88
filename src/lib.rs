//! Real-time market-data core for a grid-trading bot: provider streams,
//! candle aggregation and reference-counted strategy fan-out.

pub mod error;
pub mod market_data;
pub mod providers;
pub mod runtime_config;
pub mod strategy;
pub mod types;

#[cfg(test)]
pub(crate) mod testkit;

pub use error::{FeedError, FeedResult};
pub use market_data::{CandleAggregator, KlineManager, StreamConnector};
pub use runtime_config::FeedConfig;
pub use strategy::{Strategy, StrategyEngine};
pub use types::{Ohlc, Resolution, StreamEvent, TokenCandles};
