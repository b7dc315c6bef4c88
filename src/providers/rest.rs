// =============================================================================
// REST Client - shared HTTP plumbing for the historical candle endpoints
// =============================================================================
//
// One `reqwest::Client` per process, optionally tunnelled through the same
// SOCKS5 proxy as the streams.  Providers build their own URLs and parse
// their own payloads; this module only sends GETs and checks status.
// =============================================================================

use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::error::{FeedError, FeedResult};
use crate::runtime_config::ProxyConfig;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct RestClient {
    client: reqwest::Client,
}

impl RestClient {
    pub fn new(proxy: Option<&ProxyConfig>) -> FeedResult<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("gridfeed/", env!("CARGO_PKG_VERSION")));

        if let Some(proxy) = proxy {
            // socks5h: let the proxy resolve hostnames.
            let proxy = reqwest::Proxy::all(format!("socks5h://{}", proxy.address()))
                .map_err(|e| FeedError::Config(format!("invalid proxy: {e}")))?;
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|e| FeedError::Config(format!("failed to build http client: {e}")))?;

        debug!(proxied = proxy.is_some(), "RestClient initialised");
        Ok(Self { client })
    }

    /// GET `url` with `query` and return the JSON body. Non-2xx is an error.
    #[instrument(skip(self, query), name = "rest::get_json")]
    pub async fn get_json(&self, url: &str, query: &[(&str, String)]) -> FeedResult<Value> {
        let resp = self.client.get(url).query(query).send().await?;

        let status = resp.status();
        let body: Value = resp.json().await?;

        if !status.is_success() {
            return Err(FeedError::Historical(format!(
                "GET {url} returned {status}: {body}"
            )));
        }

        debug!(%status, "history response received");
        Ok(body)
    }
}

// ---------------------------------------------------------------------------
// JSON field helpers
// ---------------------------------------------------------------------------

/// Providers send prices either as JSON strings or numbers.
pub fn parse_decimal(val: &Value, name: &str) -> FeedResult<Decimal> {
    match val {
        Value::String(s) => decimal_from_str(s)
            .ok_or_else(|| FeedError::Protocol(format!("field {name} is not a decimal: {s:?}"))),
        Value::Number(n) => decimal_from_str(&n.to_string())
            .ok_or_else(|| FeedError::Protocol(format!("field {name} is not a decimal: {n}"))),
        Value::Null => Err(FeedError::Protocol(format!("missing field {name}"))),
        _ => Err(FeedError::Protocol(format!(
            "field {name} has unexpected JSON type"
        ))),
    }
}

fn decimal_from_str(s: &str) -> Option<Decimal> {
    let s = s.trim();
    Decimal::from_str(s)
        .ok()
        .or_else(|| Decimal::from_scientific(s).ok())
}

/// Millisecond timestamps, sent as numbers or numeric strings.
pub fn parse_millis(val: &Value, name: &str) -> FeedResult<i64> {
    match val {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| FeedError::Protocol(format!("field {name} is not an integer: {n}"))),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| FeedError::Protocol(format!("field {name} is not an integer: {s:?}"))),
        Value::Null => Err(FeedError::Protocol(format!("missing field {name}"))),
        _ => Err(FeedError::Protocol(format!(
            "field {name} has unexpected JSON type"
        ))),
    }
}

pub fn parse_str<'a>(val: &'a Value, name: &str) -> FeedResult<&'a str> {
    val.as_str()
        .ok_or_else(|| FeedError::Protocol(format!("missing field {name}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn decimals_from_strings_and_numbers() {
        assert_eq!(parse_decimal(&json!("1.05"), "p").unwrap(), dec!(1.05));
        assert_eq!(parse_decimal(&json!(2.5), "p").unwrap(), dec!(2.5));
        assert_eq!(parse_decimal(&json!(7), "p").unwrap(), dec!(7));
        assert_eq!(parse_decimal(&json!("1.2e-5"), "p").unwrap(), dec!(0.000012));
        assert!(parse_decimal(&json!("abc"), "p").is_err());
        assert!(parse_decimal(&Value::Null, "p").is_err());
        assert!(parse_decimal(&json!([1]), "p").is_err());
    }

    #[test]
    fn millis_from_strings_and_numbers() {
        assert_eq!(parse_millis(&json!(1_700_000_000_000i64), "t").unwrap(), 1_700_000_000_000);
        assert_eq!(parse_millis(&json!("1700000000000"), "t").unwrap(), 1_700_000_000_000);
        assert!(parse_millis(&json!("soon"), "t").is_err());
    }
}
