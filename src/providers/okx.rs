// =============================================================================
// OKX DEX market data - pre-bucketed candle stream + historical candles
// =============================================================================
//
// Stream:
//   -> {"op":"subscribe","args":[{"channel":"dex-token-candle1m",
//                                 "chainIndex":"501",
//                                 "tokenContractAddress":"<mint>"}]}
//   <- {"arg":{...},"data":[["<ts>","<o>","<h>","<l>","<c>","<vol>",...]]}
//   keepalive: text "ping" / "pong"
//
// History:
//   GET /api/v5/dex/market/historical-candles?chainIndex=..&bar=..&after=..
//   rows use the same array layout as the stream, newest first.
// =============================================================================

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use super::rest::{parse_decimal, parse_millis, parse_str, RestClient};
use super::{CandleSource, Frame, Provider, ProviderKind};
use crate::error::{FeedError, FeedResult};
use crate::types::{millis_to_datetime, EventPayload, Ohlc, Resolution, ResolutionUnit, TokenRecord};

const DEFAULT_WS_URL: &str = "wss://wsdex.okx.com/ws/v5/dex";
const DEFAULT_REST_URL: &str = "https://web3.okx.com";
const HEARTBEAT: Duration = Duration::from_secs(25);
const CANDLE_CHANNEL_PREFIX: &str = "dex-token-candle";

/// OKX `bar` code for a resolution (`1m`, `1H`, `1D`).
fn okx_bar(resolution: Resolution) -> String {
    let unit = match resolution.unit() {
        ResolutionUnit::Seconds => "s",
        ResolutionUnit::Minutes => "m",
        ResolutionUnit::Hours => "H",
        ResolutionUnit::Days => "D",
    };
    format!("{}{unit}", resolution.count())
}

/// OKX chain index for a chain short name; unknown names pass through.
fn chain_index(chain: &str) -> String {
    match chain.to_lowercase().as_str() {
        "sol" | "solana" => "501".into(),
        "eth" | "ethereum" => "1".into(),
        "bsc" | "bnb" => "56".into(),
        "base" => "8453".into(),
        other => other.into(),
    }
}

/// One candle row: `[ts, o, h, l, c, vol, ...]`.
fn parse_candle_row(row: &Value) -> FeedResult<Ohlc> {
    let cols = row
        .as_array()
        .ok_or_else(|| FeedError::Protocol("candle row is not an array".into()))?;
    if cols.len() < 6 {
        return Err(FeedError::Protocol(format!(
            "candle row has {} columns, expected at least 6",
            cols.len()
        )));
    }

    let ts = parse_millis(&cols[0], "ts")?;
    let time = millis_to_datetime(ts)
        .ok_or_else(|| FeedError::Protocol(format!("timestamp {ts} out of range")))?;

    Ok(Ohlc {
        open: parse_decimal(&cols[1], "o")?,
        high: parse_decimal(&cols[2], "h")?,
        low: parse_decimal(&cols[3], "l")?,
        close: parse_decimal(&cols[4], "c")?,
        volume: parse_decimal(&cols[5], "vol")?,
        time,
    })
}

// ---------------------------------------------------------------------------
// Stream
// ---------------------------------------------------------------------------

pub struct OkxStream {
    chain_index: String,
    bar: String,
    endpoint: String,
}

impl OkxStream {
    pub fn new(chain: String, resolution: Resolution, ws_url: Option<String>) -> Self {
        Self {
            chain_index: chain_index(&chain),
            bar: okx_bar(resolution),
            endpoint: ws_url.unwrap_or_else(|| DEFAULT_WS_URL.to_string()),
        }
    }

    fn channel(&self) -> String {
        format!("{CANDLE_CHANNEL_PREFIX}{}", self.bar)
    }

    fn op_frame(&self, op: &str, tokens: &[String]) -> Vec<Message> {
        if tokens.is_empty() {
            return Vec::new();
        }
        let channel = self.channel();
        let args: Vec<Value> = tokens
            .iter()
            .map(|t| {
                json!({
                    "channel": channel,
                    "chainIndex": self.chain_index,
                    "tokenContractAddress": t,
                })
            })
            .collect();
        vec![Message::Text(json!({ "op": op, "args": args }).to_string())]
    }
}

impl Provider for OkxStream {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Okx
    }

    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    fn heartbeat_interval(&self) -> Duration {
        HEARTBEAT
    }

    fn heartbeat_frame(&self) -> Message {
        Message::Text("ping".into())
    }

    fn encode_subscribe(&self, tokens: &[String]) -> Vec<Message> {
        self.op_frame("subscribe", tokens)
    }

    fn encode_unsubscribe(&self, tokens: &[String]) -> Vec<Message> {
        self.op_frame("unsubscribe", tokens)
    }

    fn decode_frame(&self, text: &str) -> FeedResult<Frame> {
        if text == "pong" {
            return Ok(Frame::Control);
        }

        let root: Value = serde_json::from_str(text)?;

        if let Some(event) = root.get("event").and_then(Value::as_str) {
            if event == "error" {
                return Err(FeedError::Protocol(format!(
                    "okx error {}: {}",
                    root["code"], root["msg"]
                )));
            }
            debug!(event, "okx control event");
            return Ok(Frame::Control);
        }

        let Some(rows) = root.get("data").and_then(Value::as_array) else {
            return Ok(Frame::Control);
        };
        let arg = &root["arg"];
        let channel = arg["channel"].as_str().unwrap_or_default();
        if !channel.starts_with(CANDLE_CHANNEL_PREFIX) {
            return Ok(Frame::Control);
        }
        let token = parse_str(&arg["tokenContractAddress"], "arg.tokenContractAddress")?;

        let records = rows
            .iter()
            .map(|row| {
                parse_candle_row(row).map(|candle| TokenRecord {
                    token: token.to_string(),
                    payload: EventPayload::Candle(candle),
                })
            })
            .collect::<FeedResult<Vec<_>>>()?;

        Ok(Frame::Records(records))
    }
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

pub struct OkxHistory {
    rest: RestClient,
    chain_index: String,
    base_url: String,
}

impl OkxHistory {
    pub fn new(rest: RestClient, chain: String, base_url: Option<String>) -> Self {
        Self {
            rest,
            chain_index: chain_index(&chain),
            base_url: base_url.unwrap_or_else(|| DEFAULT_REST_URL.to_string()),
        }
    }
}

fn parse_history(body: &Value) -> FeedResult<Vec<Ohlc>> {
    let code = body["code"].as_str().unwrap_or("0");
    if code != "0" {
        return Err(FeedError::Historical(format!(
            "okx history error {code}: {}",
            body["msg"]
        )));
    }
    body["data"]
        .as_array()
        .ok_or_else(|| FeedError::Historical("okx history response missing data".into()))?
        .iter()
        .map(parse_candle_row)
        .collect()
}

#[async_trait]
impl CandleSource for OkxHistory {
    async fn fetch_candles(
        &self,
        token: &str,
        to: DateTime<Utc>,
        resolution: Resolution,
        limit: usize,
    ) -> FeedResult<Vec<Ohlc>> {
        let url = format!("{}/api/v5/dex/market/historical-candles", self.base_url);
        // `after` is exclusive.
        let query = [
            ("chainIndex", self.chain_index.clone()),
            ("tokenContractAddress", token.to_string()),
            ("bar", okx_bar(resolution)),
            ("after", (to.timestamp_millis() + 1).to_string()),
            ("limit", limit.to_string()),
        ];
        let body = self.rest.get_json(&url, &query).await?;
        parse_history(&body)
    }
}
