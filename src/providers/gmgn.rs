// =============================================================================
// GMGN quotation feed - pre-bucketed candle stream + historical klines
// =============================================================================
//
// Stream:
//   -> {"action":"subscribe","channel":"token_kline","id":"<n>",
//       "data":[{"chain":"sol","addresses":"<mint>","interval":"1m"}]}
//   <- {"channel":"token_kline","data":[{"a":"<mint>","t":<ms>,
//       "o":"..","h":"..","l":"..","c":"..","v":".."}]}
//   keepalive: {"action":"ping"} / {"action":"pong"}
//
// History:
//   GET /api/v1/token_kline/<chain>/<mint>?resolution=1m&from=<s>&to=<s>
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message;

use super::rest::{parse_decimal, parse_millis, parse_str, RestClient};
use super::{CandleSource, Frame, Provider, ProviderKind};
use crate::error::{FeedError, FeedResult};
use crate::types::{millis_to_datetime, EventPayload, Ohlc, Resolution, TokenRecord};

const DEFAULT_WS_URL: &str = "wss://ws.gmgn.ai/quotation";
const DEFAULT_REST_URL: &str = "https://gmgn.ai";
const ORIGIN: &str = "https://gmgn.ai";
const HEARTBEAT: Duration = Duration::from_secs(20);
const KLINE_CHANNEL: &str = "token_kline";

fn parse_kline(item: &Value, time_field: &str, fields: [&str; 5]) -> FeedResult<Ohlc> {
    let ts = parse_millis(&item[time_field], time_field)?;
    let time = millis_to_datetime(ts)
        .ok_or_else(|| FeedError::Protocol(format!("timestamp {ts} out of range")))?;
    let [o, h, l, c, v] = fields;
    Ok(Ohlc {
        open: parse_decimal(&item[o], o)?,
        high: parse_decimal(&item[h], h)?,
        low: parse_decimal(&item[l], l)?,
        close: parse_decimal(&item[c], c)?,
        volume: parse_decimal(&item[v], v)?,
        time,
    })
}

// ---------------------------------------------------------------------------
// Stream
// ---------------------------------------------------------------------------

pub struct GmgnStream {
    chain: String,
    interval: String,
    endpoint: String,
    request_id: AtomicU64,
}

impl GmgnStream {
    pub fn new(chain: String, resolution: Resolution, ws_url: Option<String>) -> Self {
        Self {
            chain,
            interval: resolution.to_string(),
            endpoint: ws_url.unwrap_or_else(|| DEFAULT_WS_URL.to_string()),
            request_id: AtomicU64::new(1),
        }
    }

    fn action_frame(&self, action: &str, tokens: &[String]) -> Vec<Message> {
        if tokens.is_empty() {
            return Vec::new();
        }
        let data: Vec<Value> = tokens
            .iter()
            .map(|t| json!({ "chain": self.chain, "addresses": t, "interval": self.interval }))
            .collect();
        let id = self.request_id.fetch_add(1, Ordering::Relaxed);
        let frame = json!({
            "action": action,
            "channel": KLINE_CHANNEL,
            "id": id.to_string(),
            "data": data,
        });
        vec![Message::Text(frame.to_string())]
    }
}

impl Provider for GmgnStream {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gmgn
    }

    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    fn extra_headers(&self) -> Vec<(&'static str, String)> {
        vec![("origin", ORIGIN.to_string())]
    }

    fn heartbeat_interval(&self) -> Duration {
        HEARTBEAT
    }

    fn heartbeat_frame(&self) -> Message {
        Message::Text(json!({ "action": "ping" }).to_string())
    }

    fn encode_subscribe(&self, tokens: &[String]) -> Vec<Message> {
        self.action_frame("subscribe", tokens)
    }

    fn encode_unsubscribe(&self, tokens: &[String]) -> Vec<Message> {
        self.action_frame("unsubscribe", tokens)
    }

    fn decode_frame(&self, text: &str) -> FeedResult<Frame> {
        let root: Value = serde_json::from_str(text)?;

        if let Some(err) = root.get("error").filter(|e| !e.is_null()) {
            return Err(FeedError::Protocol(format!("gmgn error: {err}")));
        }
        if root.get("channel").and_then(Value::as_str) != Some(KLINE_CHANNEL) {
            return Ok(Frame::Control);
        }
        let Some(items) = root.get("data").and_then(Value::as_array) else {
            return Ok(Frame::Control);
        };

        let records = items
            .iter()
            .map(|item| {
                let token = parse_str(&item["a"], "a")?.to_string();
                let candle = parse_kline(item, "t", ["o", "h", "l", "c", "v"])?;
                Ok(TokenRecord {
                    token,
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

pub struct GmgnHistory {
    rest: RestClient,
    chain: String,
    base_url: String,
}

impl GmgnHistory {
    pub fn new(rest: RestClient, chain: String, base_url: Option<String>) -> Self {
        Self {
            rest,
            chain,
            base_url: base_url.unwrap_or_else(|| DEFAULT_REST_URL.to_string()),
        }
    }
}

fn parse_history(body: &Value) -> FeedResult<Vec<Ohlc>> {
    let code = body["code"].as_i64().unwrap_or(0);
    if code != 0 {
        return Err(FeedError::Historical(format!(
            "gmgn history error {code}: {}",
            body["msg"]
        )));
    }
    body["data"]["list"]
        .as_array()
        .ok_or_else(|| FeedError::Historical("gmgn history response missing data.list".into()))?
        .iter()
        .map(|item| parse_kline(item, "time", ["open", "high", "low", "close", "volume"]))
        .collect()
}

#[async_trait]
impl CandleSource for GmgnHistory {
    async fn fetch_candles(
        &self,
        token: &str,
        to: DateTime<Utc>,
        resolution: Resolution,
        limit: usize,
    ) -> FeedResult<Vec<Ohlc>> {
        let url = format!(
            "{}/api/v1/token_kline/{}/{}",
            self.base_url, self.chain, token
        );
        let to_secs = to.timestamp();
        let span_secs = resolution.millis() / 1000 * limit as i64;
        let query = [
            ("resolution", resolution.to_string()),
            ("from", (to_secs - span_secs).to_string()),
            ("to", to_secs.to_string()),
        ];
        let body = self.rest.get_json(&url, &query).await?;
        parse_history(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn stream() -> GmgnStream {
        GmgnStream::new("sol".into(), "5m".parse().unwrap(), None)
    }

    #[test]
    fn subscribe_frame_shape() {
        let frames = stream().encode_subscribe(&["AAA".into(), "BBB".into()]);
        let Message::Text(text) = &frames[0] else {
            panic!("expected text frame");
        };
        let v: Value = serde_json::from_str(text).unwrap();
        assert_eq!(v["action"], "subscribe");
        assert_eq!(v["channel"], "token_kline");
        assert_eq!(v["data"][0]["interval"], "5m");
        assert_eq!(v["data"][1]["addresses"], "BBB");
        assert_eq!(v["data"][0]["chain"], "sol");
    }

    #[test]
    fn request_ids_increase() {
        let s = stream();
        let ids: Vec<String> = (0..2)
            .map(|_| {
                let frames = s.encode_subscribe(&["AAA".into()]);
                let Message::Text(text) = &frames[0] else {
                    panic!("expected text frame");
                };
                let v: Value = serde_json::from_str(text).unwrap();
                v["id"].as_str().unwrap().to_string()
            })
            .collect();
        assert_ne!(ids[0], ids[1]);
    }

    #[test]
    fn sends_origin_header() {
        let headers = stream().extra_headers();
        assert_eq!(headers, vec![("origin", "https://gmgn.ai".to_string())]);
    }

    #[test]
    fn decodes_kline_push() {
        let text = r#"{"channel":"token_kline","data":[
            {"a":"AAA","t":1700000100000,"o":"1","h":"2","l":"0.5","c":"1.5","v":"42"},
            {"a":"BBB","t":1700000100000,"o":3,"h":3,"l":3,"c":3,"v":0}
        ]}"#;
        let Frame::Records(records) = stream().decode_frame(text).unwrap() else {
            panic!("expected records");
        };
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].token, "BBB");
        let EventPayload::Candle(c) = &records[0].payload else {
            panic!("expected candle");
        };
        assert_eq!(c.low, dec!(0.5));
        assert_eq!(c.volume, dec!(42));
    }

    #[test]
    fn pong_and_other_channels_are_control() {
        let s = stream();
        assert_eq!(s.decode_frame(r#"{"action":"pong"}"#).unwrap(), Frame::Control);
        assert_eq!(
            s.decode_frame(r#"{"channel":"token_stat","data":[]}"#).unwrap(),
            Frame::Control
        );
        assert!(s.decode_frame(r#"{"error":"unauthorized"}"#).is_err());
    }

    #[test]
    fn parses_history_list() {
        let body = serde_json::json!({
            "code": 0,
            "data": { "list": [
                { "time": 60000, "open": "1", "high": "1", "low": "1", "close": "1", "volume": "3" }
            ]}
        });
        let candles = parse_history(&body).unwrap();
        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].volume, dec!(3));
    }
}
