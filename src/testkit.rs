//! Shared test doubles: an in-memory WebSocket dialer and a scripted
//! candle source.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::error::{FeedError, FeedResult};
use crate::market_data::transport::{Dialer, WsConnection};
use crate::providers::CandleSource;
use crate::types::{millis_to_datetime, Ohlc, Resolution};

pub type ServerSocket = WebSocketStream<DuplexStream>;

// ---------------------------------------------------------------------------
// In-memory dialer
// ---------------------------------------------------------------------------

/// Each dial creates a duplex pipe, completes the handshake on both ends and
/// hands the server end to the test.
pub struct DuplexDialer {
    servers: mpsc::UnboundedSender<ServerSocket>,
    fail_remaining: AtomicUsize,
    dials: AtomicUsize,
}

impl DuplexDialer {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerSocket>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dialer = Arc::new(Self {
            servers: tx,
            fail_remaining: AtomicUsize::new(0),
            dials: AtomicUsize::new(0),
        });
        (dialer, rx)
    }

    /// Make the next `n` dials fail with a transport error.
    pub fn fail_next(&self, n: usize) {
        self.fail_remaining.store(n, Ordering::SeqCst);
    }

    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dialer for DuplexDialer {
    async fn dial(
        &self,
        endpoint: &str,
        _headers: &[(&'static str, String)],
    ) -> FeedResult<WsConnection> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(FeedError::Transport("connection refused (test)".into()));
        }

        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let accept = tokio::spawn(tokio_tungstenite::accept_async(server_io));
        let (client, _) = tokio_tungstenite::client_async(endpoint, client_io).await?;
        let server = accept
            .await
            .map_err(|e| FeedError::Transport(e.to_string()))??;

        let _ = self.servers.send(server);
        Ok(WsConnection::from_stream(client))
    }
}

/// Next text frame the server end receives, parsed as JSON.
pub async fn next_json(server: &mut ServerSocket) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), server.next())
            .await
            .expect("timed out waiting for client frame")
            .expect("client went away")
            .expect("server read error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).expect("client frame is not JSON");
        }
    }
}

/// A Jupiter `actions` push: `(token, price, timestamp ms)` per trade, volume 1.
pub fn actions_frame(trades: &[(&str, &str, i64)]) -> Message {
    let data: Vec<Value> = trades
        .iter()
        .map(|(token, price, ms)| {
            json!({ "asset": token, "timestamp": ms, "usdPrice": price, "usdVolume": "1" })
        })
        .collect();
    Message::Text(json!({ "type": "actions", "data": data }).to_string())
}

// ---------------------------------------------------------------------------
// Scripted candle source
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchCall {
    pub token: String,
    pub to: DateTime<Utc>,
    pub limit: usize,
}

/// Returns queued responses in order, then empty histories.
#[derive(Default)]
pub struct MockSource {
    responses: Mutex<VecDeque<FeedResult<Vec<Ohlc>>>>,
    calls: Mutex<Vec<FetchCall>>,
}

impl MockSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_ok(&self, candles: Vec<Ohlc>) {
        self.responses.lock().push_back(Ok(candles));
    }

    pub fn push_err(&self, msg: &str) {
        self.responses
            .lock()
            .push_back(Err(FeedError::Historical(msg.to_string())));
    }

    pub fn calls(&self) -> Vec<FetchCall> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl CandleSource for MockSource {
    async fn fetch_candles(
        &self,
        token: &str,
        to: DateTime<Utc>,
        _resolution: Resolution,
        limit: usize,
    ) -> FeedResult<Vec<Ohlc>> {
        self.calls.lock().push(FetchCall {
            token: token.to_string(),
            to,
            limit,
        });
        let next = self.responses.lock().pop_front();
        next.unwrap_or_else(|| Ok(Vec::new()))
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

pub fn at_secs(secs: i64) -> DateTime<Utc> {
    millis_to_datetime(secs * 1000).expect("timestamp in range")
}

pub fn candle(secs: i64, open: Decimal, close: Decimal, volume: Decimal) -> Ohlc {
    Ohlc {
        open,
        close,
        high: open.max(close),
        low: open.min(close),
        time: at_secs(secs),
        volume,
    }
}
