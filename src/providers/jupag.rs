// =============================================================================
// Jupiter aggregator feed - raw trade stream + chart history
// =============================================================================
//
// Unlike OKX and GMGN this stream pushes individual swaps, not candles; the
// aggregator buckets them itself.
//
// Stream:
//   -> {"type":"subscribe:txns","assets":["<mint>",...]}
//   -> {"type":"unsubscribe:txns","assets":["<mint>"]}
//   <- {"type":"actions","data":[{"asset":"<mint>","timestamp":..,
//       "usdPrice":..,"usdVolume":..}]}
//   keepalive: {"type":"ping"} / {"type":"pong"}
//
// History:
//   GET /v2/charts/<mint>?interval=1_MINUTE&to=<ms>&candles=<n>&type=price
// =============================================================================

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message;
use tracing::trace;

use super::rest::{parse_decimal, parse_millis, parse_str, RestClient};
use super::{CandleSource, Frame, Provider, ProviderKind};
use crate::error::{FeedError, FeedResult};
use crate::types::{
    millis_to_datetime, EventPayload, Ohlc, Resolution, ResolutionUnit, TokenRecord, Trade,
};

const DEFAULT_WS_URL: &str = "wss://trench-stream.jup.ag/ws";
const DEFAULT_REST_URL: &str = "https://datapi.jup.ag";
const HEARTBEAT: Duration = Duration::from_secs(30);

/// Chart interval code (`1_MINUTE`, `4_HOUR`, ...).
fn chart_interval(resolution: Resolution) -> String {
    let unit = match resolution.unit() {
        ResolutionUnit::Seconds => "SECOND",
        ResolutionUnit::Minutes => "MINUTE",
        ResolutionUnit::Hours => "HOUR",
        ResolutionUnit::Days => "DAY",
    };
    format!("{}_{unit}", resolution.count())
}

/// Swap timestamps arrive as RFC 3339 strings or epoch milliseconds.
fn parse_timestamp(val: &Value) -> FeedResult<DateTime<Utc>> {
    if let Some(s) = val.as_str() {
        if let Ok(t) = DateTime::parse_from_rfc3339(s) {
            return Ok(t.with_timezone(&Utc));
        }
    }
    let ms = parse_millis(val, "timestamp")?;
    millis_to_datetime(ms)
        .ok_or_else(|| FeedError::Protocol(format!("timestamp {ms} out of range")))
}

fn parse_action(item: &Value) -> FeedResult<TokenRecord> {
    let token = parse_str(&item["asset"], "asset")?.to_string();
    let trade = Trade {
        price: parse_decimal(&item["usdPrice"], "usdPrice")?,
        volume: parse_decimal(&item["usdVolume"], "usdVolume")?,
        time: parse_timestamp(&item["timestamp"])?,
    };
    Ok(TokenRecord {
        token,
        payload: EventPayload::Trade(trade),
    })
}

// ---------------------------------------------------------------------------
// Stream
// ---------------------------------------------------------------------------

pub struct JupagStream {
    endpoint: String,
}

impl JupagStream {
    pub fn new(ws_url: Option<String>) -> Self {
        Self {
            endpoint: ws_url.unwrap_or_else(|| DEFAULT_WS_URL.to_string()),
        }
    }

    fn typed_frame(kind: &str, tokens: &[String]) -> Vec<Message> {
        if tokens.is_empty() {
            return Vec::new();
        }
        vec![Message::Text(
            json!({ "type": kind, "assets": tokens }).to_string(),
        )]
    }
}

impl Provider for JupagStream {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Jupag
    }

    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    fn heartbeat_interval(&self) -> Duration {
        HEARTBEAT
    }

    fn heartbeat_frame(&self) -> Message {
        Message::Text(json!({ "type": "ping" }).to_string())
    }

    fn encode_subscribe(&self, tokens: &[String]) -> Vec<Message> {
        Self::typed_frame("subscribe:txns", tokens)
    }

    fn encode_unsubscribe(&self, tokens: &[String]) -> Vec<Message> {
        Self::typed_frame("unsubscribe:txns", tokens)
    }

    fn decode_frame(&self, text: &str) -> FeedResult<Frame> {
        let root: Value = serde_json::from_str(text)?;

        match root.get("type").and_then(Value::as_str) {
            Some("actions") => {}
            Some("error") => {
                return Err(FeedError::Protocol(format!("jupag error: {}", root["message"])));
            }
            other => {
                trace!(kind = ?other, "jupag control frame");
                return Ok(Frame::Control);
            }
        }

        let items = root["data"]
            .as_array()
            .ok_or_else(|| FeedError::Protocol("actions frame without data array".into()))?;

        let records = items
            .iter()
            .map(parse_action)
            .collect::<FeedResult<Vec<_>>>()?;

        Ok(Frame::Records(records))
    }
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

pub struct JupagHistory {
    rest: RestClient,
    base_url: String,
}

impl JupagHistory {
    pub fn new(rest: RestClient, base_url: Option<String>) -> Self {
        Self {
            rest,
            base_url: base_url.unwrap_or_else(|| DEFAULT_REST_URL.to_string()),
        }
    }
}

/// Chart candles carry their open time in epoch seconds.
fn parse_history(body: &Value) -> FeedResult<Vec<Ohlc>> {
    body["candles"]
        .as_array()
        .ok_or_else(|| FeedError::Historical("jupag chart response missing candles".into()))?
        .iter()
        .map(|item| {
            let secs = parse_millis(&item["time"], "time")?;
            let time = secs
                .checked_mul(1000)
                .and_then(millis_to_datetime)
                .ok_or_else(|| FeedError::Protocol(format!("timestamp {secs} out of range")))?;
            Ok(Ohlc {
                open: parse_decimal(&item["open"], "open")?,
                high: parse_decimal(&item["high"], "high")?,
                low: parse_decimal(&item["low"], "low")?,
                close: parse_decimal(&item["close"], "close")?,
                volume: parse_decimal(&item["volume"], "volume")?,
                time,
            })
        })
        .collect()
}

#[async_trait]
impl CandleSource for JupagHistory {
    async fn fetch_candles(
        &self,
        token: &str,
        to: DateTime<Utc>,
        resolution: Resolution,
        limit: usize,
    ) -> FeedResult<Vec<Ohlc>> {
        let url = format!("{}/v2/charts/{}", self.base_url, token);
        let query = [
            ("interval", chart_interval(resolution)),
            ("to", to.timestamp_millis().to_string()),
            ("candles", limit.to_string()),
            ("type", "price".to_string()),
        ];
        let body = self.rest.get_json(&url, &query).await?;
        parse_history(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn interval_codes() {
        assert_eq!(chart_interval("1m".parse().unwrap()), "1_MINUTE");
        assert_eq!(chart_interval("15s".parse().unwrap()), "15_SECOND");
        assert_eq!(chart_interval("4h".parse().unwrap()), "4_HOUR");
    }

    #[test]
    fn subscribe_and_unsubscribe_frames() {
        let s = JupagStream::new(None);
        let Message::Text(sub) = &s.encode_subscribe(&["AAA".into(), "BBB".into()])[0] else {
            panic!("expected text frame");
        };
        let v: Value = serde_json::from_str(sub).unwrap();
        assert_eq!(v["type"], "subscribe:txns");
        assert_eq!(v["assets"], json!(["AAA", "BBB"]));

        let Message::Text(unsub) = &s.encode_unsubscribe(&["AAA".into()])[0] else {
            panic!("expected text frame");
        };
        assert!(unsub.contains("unsubscribe:txns"));
        assert!(s.encode_unsubscribe(&[]).is_empty());
    }

    #[test]
    fn decodes_trades_with_either_timestamp_form() {
        let text = r#"{"type":"actions","data":[
            {"asset":"AAA","timestamp":"2024-01-01T00:00:30Z","usdPrice":1.05,"usdVolume":"10"},
            {"asset":"AAA","timestamp":1704067265000,"usdPrice":"1.10","usdVolume":2}
        ]}"#;
        let Frame::Records(records) = JupagStream::new(None).decode_frame(text).unwrap() else {
            panic!("expected records");
        };
        assert_eq!(records.len(), 2);

        let EventPayload::Trade(first) = &records[0].payload else {
            panic!("expected trade");
        };
        assert_eq!(first.price, dec!(1.05));
        assert_eq!(first.volume, dec!(10));
        assert_eq!(first.time.timestamp(), 1_704_067_230);

        let EventPayload::Trade(second) = &records[1].payload else {
            panic!("expected trade");
        };
        assert_eq!(second.time.timestamp_millis(), 1_704_067_265_000);
    }

    #[test]
    fn pong_is_control() {
        let s = JupagStream::new(None);
        assert_eq!(s.decode_frame(r#"{"type":"pong"}"#).unwrap(), Frame::Control);
        assert!(s.decode_frame(r#"{"type":"actions"}"#).is_err());
    }

    #[test]
    fn parses_chart_candles_in_seconds() {
        let body = json!({ "candles": [
            { "time": 60, "open": 1, "high": 2, "low": 0.5, "close": 1.5, "volume": 9 }
        ]});
        let candles = parse_history(&body).unwrap();
        assert_eq!(candles[0].time.timestamp_millis(), 60_000);
        assert_eq!(candles[0].high, dec!(2));
    }
}
