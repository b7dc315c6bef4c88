pub mod aggregator;
pub mod backoff;
pub mod candle_book;
pub mod connector;
pub mod queue;
pub mod transport;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::FeedResult;
use crate::types::TokenCandles;

pub use aggregator::CandleAggregator;
pub use candle_book::{ApplyOutcome, CandleBook};
pub use connector::{ConnectionState, ConnectorSettings, StreamConnector};
pub use transport::{Dialer, NetworkDialer};

/// Source of refreshed per-token candle histories.
#[async_trait]
pub trait KlineManager: Send + Sync {
    fn start(&self) -> FeedResult<()>;

    async fn stop(&self);

    fn subscribe(&self, tokens: &[String]) -> FeedResult<()>;

    fn unsubscribe(&self, tokens: &[String]) -> FeedResult<()>;

    /// Receiving end of the candle queue; handed out once.
    fn take_ohlcs(&self) -> Option<mpsc::Receiver<TokenCandles>>;
}
