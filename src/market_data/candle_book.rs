// =============================================================================
// Candle Book - bounded per-token OHLC history built from stream events
// =============================================================================
//
// Two kinds of input:
//   * pre-bucketed candles: merged into the tail (overwrite same bucket,
//     append newer).  A gap of more than one period, a reconnect (`first`)
//     or a missing cache triggers a historical reload first.
//   * raw trades: seeded from history on `first`/missing cache, then
//     bucketed locally; empty periods between the last candle and the trade
//     are filled with flat candles at the previous close.
//
// A failed reload leaves the cached series untouched and marks the token
// stale, so the next event for it retries.  The book is owned by a single
// task; there is no locking in here.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::error::FeedResult;
use crate::providers::CandleSource;
use crate::types::{
    EventPayload, Ohlc, Resolution, StreamEvent, TokenCandles, Trade, MAX_CANDLES_CAP,
};

/// What an applied event did to the book.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Tail merged or extended.
    Updated,
    /// History was (re)loaded from the candle source, then merged.
    Reloaded,
    /// Record older than the last bucket; nothing changed.
    Ignored,
}

impl ApplyOutcome {
    pub fn changed(self) -> bool {
        !matches!(self, Self::Ignored)
    }
}

pub struct CandleBook {
    resolution: Resolution,
    max_candles: usize,
    source: Arc<dyn CandleSource>,
    series: HashMap<String, Vec<Ohlc>>,
    stale: HashSet<String>,
}

impl CandleBook {
    pub fn new(resolution: Resolution, max_candles: usize, source: Arc<dyn CandleSource>) -> Self {
        Self {
            resolution,
            max_candles: max_candles.clamp(1, MAX_CANDLES_CAP),
            source,
            series: HashMap::new(),
            stale: HashSet::new(),
        }
    }

    pub fn max_candles(&self) -> usize {
        self.max_candles
    }

    pub async fn apply(&mut self, event: &StreamEvent) -> FeedResult<ApplyOutcome> {
        match &event.payload {
            EventPayload::Candle(candle) => {
                self.apply_candle(&event.token, event.first, candle).await
            }
            EventPayload::Trade(trade) => {
                self.apply_trade(&event.token, event.first, trade).await
            }
        }
    }

    /// Owned copy of a token's history.
    pub fn snapshot(&self, token: &str) -> Option<TokenCandles> {
        self.series.get(token).map(|candles| TokenCandles {
            token: token.to_string(),
            candles: candles.clone(),
        })
    }

    pub fn series(&self, token: &str) -> Option<&[Ohlc]> {
        self.series.get(token).map(Vec::as_slice)
    }

    /// Forget a token entirely.
    pub fn remove(&mut self, token: &str) -> bool {
        self.stale.remove(token);
        self.series.remove(token).is_some()
    }

    // -----------------------------------------------------------------------
    // Reload
    // -----------------------------------------------------------------------

    fn needs_reload(&self, token: &str, first: bool) -> bool {
        first || self.stale.contains(token) || !self.series.contains_key(token)
    }

    async fn reload(&mut self, token: &str, to: DateTime<Utc>) -> FeedResult<()> {
        self.stale.insert(token.to_string());

        let fetched = self
            .source
            .fetch_candles(token, to, self.resolution, self.max_candles)
            .await
            .map_err(|e| {
                warn!(token = %token, to = %to, error = %e, "historical reload failed");
                e
            })?;

        let history = normalize(fetched, to, self.max_candles);
        info!(
            token = %token,
            to = %to,
            candles = history.len(),
            "history reloaded"
        );
        self.series.insert(token.to_string(), history);
        self.stale.remove(token);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Pre-bucketed candles
    // -----------------------------------------------------------------------

    async fn apply_candle(
        &mut self,
        token: &str,
        first: bool,
        candle: &Ohlc,
    ) -> FeedResult<ApplyOutcome> {
        let period = self.resolution.as_chrono();
        let gap = self
            .series
            .get(token)
            .and_then(|s| s.last())
            .is_some_and(|last| candle.time - last.time > period);

        let reloaded = self.needs_reload(token, first) || gap;
        if reloaded {
            if gap {
                debug!(token = %token, at = %candle.time, "gap detected");
            }
            self.reload(token, candle.time).await?;
        }

        let resolution = self.resolution;
        let series = self.series.entry(token.to_string()).or_default();
        let tail = series.last().map(|c| c.time);
        let merged = match tail {
            Some(t) if resolution.bucket_start(t) == resolution.bucket_start(candle.time) => {
                if let Some(last) = series.last_mut() {
                    *last = candle.clone();
                }
                true
            }
            Some(t) if candle.time < t => false,
            _ => {
                series.push(candle.clone());
                true
            }
        };
        trim(series, self.max_candles);

        Ok(outcome(reloaded, merged))
    }

    // -----------------------------------------------------------------------
    // Raw trades
    // -----------------------------------------------------------------------

    async fn apply_trade(
        &mut self,
        token: &str,
        first: bool,
        trade: &Trade,
    ) -> FeedResult<ApplyOutcome> {
        let reloaded = self.needs_reload(token, first);
        if reloaded {
            self.reload(token, trade.time).await?;
        }

        let resolution = self.resolution;
        let max = self.max_candles;
        let series = self.series.entry(token.to_string()).or_default();

        let Some((base, close)) = series.last().map(|c| (c.time, c.close)) else {
            let start = resolution.bucket_start(trade.time);
            series.push(Ohlc::from_trade(start, trade.price, trade.volume));
            return Ok(outcome(reloaded, true));
        };
        if trade.time < base {
            return Ok(outcome(reloaded, false));
        }

        let periods = resolution.periods_between(base, trade.time);
        if periods > 0 {
            // Only the newest `max` periods can survive the trim.
            let skipped = periods.saturating_sub(max as i64).max(0);
            for k in (skipped + 1)..=periods {
                let Some(time) = resolution
                    .millis()
                    .checked_mul(k)
                    .and_then(|ms| base.checked_add_signed(chrono::Duration::milliseconds(ms)))
                else {
                    break;
                };
                series.push(Ohlc::flat(time, close));
            }
            if skipped > 0 {
                debug!(token = %token, periods, kept = max, "long trade gap truncated");
            }
        }

        if let Some(tail) = series.last_mut() {
            tail.apply_trade(trade.price, trade.volume);
        }
        trim(series, max);

        Ok(outcome(reloaded, true))
    }
}

fn outcome(reloaded: bool, merged: bool) -> ApplyOutcome {
    match (reloaded, merged) {
        (true, _) => ApplyOutcome::Reloaded,
        (false, true) => ApplyOutcome::Updated,
        (false, false) => ApplyOutcome::Ignored,
    }
}

/// Sort, keep the last row per timestamp, drop rows after `to`, keep the
/// newest `max`.
fn normalize(mut candles: Vec<Ohlc>, to: DateTime<Utc>, max: usize) -> Vec<Ohlc> {
    candles.retain(|c| c.time <= to);
    candles.sort_by_key(|c| c.time);

    let mut out: Vec<Ohlc> = Vec::with_capacity(candles.len());
    for candle in candles {
        match out.last_mut() {
            Some(prev) if prev.time == candle.time => *prev = candle,
            _ => out.push(candle),
        }
    }
    trim(&mut out, max);
    out
}

fn trim(series: &mut Vec<Ohlc>, max: usize) {
    if series.len() > max {
        let excess = series.len() - max;
        series.drain(..excess);
    }
}
