// =============================================================================
// Providers - one streaming/history capability, three upstream variants
// =============================================================================
//
// A `Provider` knows how to talk to one upstream WebSocket: where to dial,
// what a subscribe/unsubscribe/keepalive frame looks like and how to turn a
// pushed frame into canonical records.  A `CandleSource` answers "give me N
// candles of token T up to time U at resolution R" over REST.
//
// The connector and aggregator only see these two traits; `ProviderKind`
// picks the concrete variant at construction.
// =============================================================================

pub mod gmgn;
pub mod jupag;
pub mod okx;
pub mod rest;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::Message;

use crate::error::{FeedError, FeedResult};
use crate::runtime_config::FeedConfig;
use crate::types::{Ohlc, Resolution, TokenRecord};

use self::rest::RestClient;

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// Result of decoding one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Price records, one per token update.
    Records(Vec<TokenRecord>),
    /// Keepalive reply, subscription ack or any other frame with nothing to
    /// emit.
    Control,
}

/// Wire protocol of one streaming market-data provider.
pub trait Provider: Send + Sync + 'static {
    fn kind(&self) -> ProviderKind;

    /// WebSocket URL to dial.
    fn endpoint(&self) -> String;

    /// Extra handshake headers (e.g. `origin`). Names must be lowercase.
    fn extra_headers(&self) -> Vec<(&'static str, String)> {
        Vec::new()
    }

    fn heartbeat_interval(&self) -> Duration;

    fn heartbeat_frame(&self) -> Message;

    /// Frames declaring the *full* subscription set. No frames for an empty
    /// set.
    fn encode_subscribe(&self, tokens: &[String]) -> Vec<Message>;

    /// Frames withdrawing `tokens`, for providers that need an explicit
    /// unsubscribe.
    fn encode_unsubscribe(&self, _tokens: &[String]) -> Vec<Message> {
        Vec::new()
    }

    fn decode_frame(&self, text: &str) -> FeedResult<Frame>;
}

/// Historical candle fetch.
#[async_trait]
pub trait CandleSource: Send + Sync {
    /// Up to `limit` candles of `token` whose open time is at or before `to`.
    /// Order is not guaranteed; callers sort.
    async fn fetch_candles(
        &self,
        token: &str,
        to: DateTime<Utc>,
        resolution: Resolution,
        limit: usize,
    ) -> FeedResult<Vec<Ohlc>>;
}

// ---------------------------------------------------------------------------
// Variant selection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    Okx,
    Gmgn,
    Jupag,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Okx => write!(f, "okx"),
            Self::Gmgn => write!(f, "gmgn"),
            Self::Jupag => write!(f, "jupag"),
        }
    }
}

impl FromStr for ProviderKind {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "okx" => Ok(Self::Okx),
            "gmgn" => Ok(Self::Gmgn),
            "jupag" | "jup" | "jupiter" => Ok(Self::Jupag),
            other => Err(FeedError::Config(format!("unknown provider {other:?}"))),
        }
    }
}

/// Stream codec and history client of one provider.
#[derive(Clone)]
pub struct ProviderBundle {
    pub stream: Arc<dyn Provider>,
    pub history: Arc<dyn CandleSource>,
}

/// Build the configured provider variant.
pub fn build(config: &FeedConfig) -> FeedResult<ProviderBundle> {
    let resolution = config.resolution()?;
    let rest = RestClient::new(config.proxy.active())?;
    let chain = config.chain.clone();
    let ws_url = config.ws_url.clone();
    let rest_url = config.rest_base_url.clone();

    let bundle = match config.provider {
        ProviderKind::Okx => ProviderBundle {
            stream: Arc::new(okx::OkxStream::new(chain.clone(), resolution, ws_url)),
            history: Arc::new(okx::OkxHistory::new(rest, chain, rest_url)),
        },
        ProviderKind::Gmgn => ProviderBundle {
            stream: Arc::new(gmgn::GmgnStream::new(chain.clone(), resolution, ws_url)),
            history: Arc::new(gmgn::GmgnHistory::new(rest, chain, rest_url)),
        },
        ProviderKind::Jupag => ProviderBundle {
            stream: Arc::new(jupag::JupagStream::new(ws_url)),
            history: Arc::new(jupag::JupagHistory::new(rest, rest_url)),
        },
    };
    Ok(bundle)
}
