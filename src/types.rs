// =============================================================================
// Canonical market-data types shared by connectors, aggregators and strategies
// =============================================================================

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::FeedError;

/// Hard ceiling on the number of candles kept (and requested) per token.
pub const MAX_CANDLES_CAP: usize = 1000;

// ---------------------------------------------------------------------------
// Candles
// ---------------------------------------------------------------------------

/// A single OHLCV candle. `time` is the bucket open time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ohlc {
    pub open: Decimal,
    pub close: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub time: DateTime<Utc>,
    pub volume: Decimal,
}

impl Ohlc {
    /// A candle where every price equals `price` and nothing traded.
    pub fn flat(time: DateTime<Utc>, price: Decimal) -> Self {
        Self {
            open: price,
            close: price,
            high: price,
            low: price,
            time,
            volume: Decimal::ZERO,
        }
    }

    /// A candle opened by a single trade.
    pub fn from_trade(time: DateTime<Utc>, price: Decimal, volume: Decimal) -> Self {
        Self {
            volume,
            ..Self::flat(time, price)
        }
    }

    /// Fold one trade into this candle.
    pub fn apply_trade(&mut self, price: Decimal, volume: Decimal) {
        self.close = price;
        self.low = self.low.min(price);
        self.high = self.high.max(price);
        self.volume += volume;
    }
}

/// The refreshed candle history of one token, oldest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCandles {
    pub token: String,
    pub candles: Vec<Ohlc>,
}

impl TokenCandles {
    pub fn last(&self) -> Option<&Ohlc> {
        self.candles.last()
    }
}

// ---------------------------------------------------------------------------
// Stream events
// ---------------------------------------------------------------------------

/// A single executed trade as reported by a raw-trade provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trade {
    pub price: Decimal,
    pub volume: Decimal,
    pub time: DateTime<Utc>,
}

/// What a provider record carries: a ready-made candle or a raw trade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPayload {
    Candle(Ohlc),
    Trade(Trade),
}

/// Canonical event emitted by a stream connector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEvent {
    pub token: String,
    /// True for the first event of this token since the last (re)connect.
    pub first: bool,
    pub payload: EventPayload,
}

/// A decoded record before the connector stamps the `first` flag on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRecord {
    pub token: String,
    pub payload: EventPayload,
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResolutionUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl ResolutionUnit {
    fn millis(self) -> i64 {
        match self {
            Self::Seconds => 1_000,
            Self::Minutes => 60_000,
            Self::Hours => 3_600_000,
            Self::Days => 86_400_000,
        }
    }

    fn suffix(self) -> char {
        match self {
            Self::Seconds => 's',
            Self::Minutes => 'm',
            Self::Hours => 'h',
            Self::Days => 'd',
        }
    }
}

/// Candle bucket width, written as `<integer><unit>` (e.g. `1m`, `4h`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Resolution {
    count: u32,
    unit: ResolutionUnit,
}

impl Resolution {
    pub fn new(count: u32, unit: ResolutionUnit) -> Result<Self, FeedError> {
        if count == 0 {
            return Err(FeedError::Config("resolution must be non-zero".into()));
        }
        Ok(Self { count, unit })
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn unit(&self) -> ResolutionUnit {
        self.unit
    }

    /// Bucket width in milliseconds.
    pub fn millis(&self) -> i64 {
        i64::from(self.count) * self.unit.millis()
    }

    pub fn as_chrono(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.millis())
    }

    /// Open time of the bucket containing `time`.
    pub fn bucket_start(&self, time: DateTime<Utc>) -> DateTime<Utc> {
        let ms = time.timestamp_millis();
        let aligned = ms - ms.rem_euclid(self.millis());
        millis_to_datetime(aligned).unwrap_or(time)
    }

    /// Whole periods elapsed from `from` to `to`, rounded towards negative
    /// infinity.
    pub fn periods_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
        (to - from).num_milliseconds().div_euclid(self.millis())
    }
}

impl FromStr for Resolution {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let bad = || {
            FeedError::Config(format!(
                "invalid resolution {s:?}, expected <integer><s|m|h|d>"
            ))
        };

        let suffix = s.chars().last().ok_or_else(bad)?;
        let unit = match suffix {
            's' => ResolutionUnit::Seconds,
            'm' => ResolutionUnit::Minutes,
            'h' => ResolutionUnit::Hours,
            'd' => ResolutionUnit::Days,
            _ => return Err(bad()),
        };
        let digits = &s[..s.len() - suffix.len_utf8()];
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(bad());
        }
        let count: u32 = digits.parse().map_err(|_| bad())?;
        Self::new(count, unit).map_err(|_| bad())
    }
}

impl TryFrom<String> for Resolution {
    type Error = FeedError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Resolution> for String {
    fn from(value: Resolution) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.count, self.unit.suffix())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub fn millis_to_datetime(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn parses_supported_units() {
        assert_eq!("1m".parse::<Resolution>().unwrap().millis(), 60_000);
        assert_eq!("5m".parse::<Resolution>().unwrap().millis(), 300_000);
        assert_eq!("1h".parse::<Resolution>().unwrap().millis(), 3_600_000);
        assert_eq!("1d".parse::<Resolution>().unwrap().millis(), 86_400_000);
        assert_eq!("15s".parse::<Resolution>().unwrap().millis(), 15_000);
    }

    #[test]
    fn rejects_malformed_resolution() {
        for bad in ["", "m", "1", "1w", "0m", "-1m", "1.5m", "m1"] {
            assert!(bad.parse::<Resolution>().is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn resolution_display_and_serde() {
        let r: Resolution = "15m".parse().unwrap();
        assert_eq!(r.to_string(), "15m");
        let json = serde_json::to_string(&r).unwrap();
        assert_eq!(json, "\"15m\"");
        let back: Resolution = serde_json::from_str(&json).unwrap();
        assert_eq!(back, r);
        assert!(serde_json::from_str::<Resolution>("\"7x\"").is_err());
    }

    #[test]
    fn bucket_math() {
        let r: Resolution = "1m".parse().unwrap();
        let t = millis_to_datetime(125_000).unwrap();
        assert_eq!(r.bucket_start(t), millis_to_datetime(120_000).unwrap());

        let from = millis_to_datetime(0).unwrap();
        assert_eq!(r.periods_between(from, millis_to_datetime(59_999).unwrap()), 0);
        assert_eq!(r.periods_between(from, millis_to_datetime(60_000).unwrap()), 1);
        assert_eq!(r.periods_between(from, millis_to_datetime(185_000).unwrap()), 3);
        assert_eq!(r.periods_between(millis_to_datetime(60_000).unwrap(), from), -1);
    }

    #[test]
    fn apply_trade_tracks_envelope() {
        let t = millis_to_datetime(0).unwrap();
        let mut c = Ohlc::from_trade(t, dec!(1.00), dec!(2));
        c.apply_trade(dec!(0.90), dec!(1));
        c.apply_trade(dec!(1.20), dec!(3));
        c.apply_trade(dec!(1.10), dec!(0.5));
        assert_eq!(c.open, dec!(1.00));
        assert_eq!(c.close, dec!(1.10));
        assert_eq!(c.high, dec!(1.20));
        assert_eq!(c.low, dec!(0.90));
        assert_eq!(c.volume, dec!(6.5));
    }
}
