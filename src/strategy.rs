// =============================================================================
// Strategy Engine - reference-counted token subscriptions and tick fan-out
// =============================================================================
//
// Many strategies may watch the same token; the upstream subscription exists
// exactly while at least one of them is registered.
//
// Invariants (under one write lock):
//   * refcounts[token] == number of registered strategies on `token`
//   * a token is subscribed on the kline manager  <=>  refcounts[token] > 0
//
// Dispatch copies the strategy list under the read lock and invokes the
// callbacks with no lock held, so a slow `on_tick` never blocks
// `start_strategies` / `stop_strategy`.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{FeedError, FeedResult};
use crate::market_data::KlineManager;
use crate::types::{Ohlc, TokenCandles};

/// A trading strategy bound to one token.
#[async_trait]
pub trait Strategy: Send + Sync {
    fn id(&self) -> &str;

    fn token_address(&self) -> &str;

    /// Called with the token's full candle history, oldest first, each time
    /// it changes.
    async fn on_tick(&self, cancel: &CancellationToken, candles: &[Ohlc]) -> anyhow::Result<()>;
}

#[derive(Default)]
struct Registry {
    strategies: HashMap<String, Arc<dyn Strategy>>,
    refcounts: HashMap<String, usize>,
}

// =============================================================================
// Strategy Engine
// =============================================================================

pub struct StrategyEngine {
    klines: Arc<dyn KlineManager>,
    registry: Arc<RwLock<Registry>>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl StrategyEngine {
    pub fn new(klines: Arc<dyn KlineManager>) -> Self {
        Self {
            klines,
            registry: Arc::new(RwLock::new(Registry::default())),
            cancel: CancellationToken::new(),
            worker: Mutex::new(None),
        }
    }

    /// Start the kline manager and the dispatch loop. Idempotent.
    pub fn start(&self) -> FeedResult<()> {
        if self.cancel.is_cancelled() {
            return Err(FeedError::Stopped);
        }
        let mut worker = self.worker.lock();
        if worker.is_some() {
            debug!("strategy engine already started");
            return Ok(());
        }

        self.klines.start()?;
        let updates = self
            .klines
            .take_ohlcs()
            .ok_or_else(|| FeedError::Config("kline output already taken".into()))?;

        *worker = Some(tokio::spawn(dispatch_loop(
            updates,
            Arc::clone(&self.registry),
            self.cancel.clone(),
        )));
        info!("strategy engine started");
        Ok(())
    }

    /// Stop dispatching, wait for the loop, then stop the kline manager.
    pub async fn stop(&self) {
        self.cancel.cancel();

        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "strategy dispatch loop panicked");
            }
        }

        self.klines.stop().await;
        info!("strategy engine stopped");
    }

    /// Register a batch of strategies, all or nothing.
    ///
    /// Ids already registered (or repeated within the batch) are skipped.
    /// Tokens that nobody watched before are subscribed in one call; if that
    /// fails no strategy of the batch is registered. Returns how many were
    /// added.
    pub fn start_strategies(&self, strategies: Vec<Arc<dyn Strategy>>) -> FeedResult<usize> {
        let mut reg = self.registry.write();

        // ── 1. Drop known and repeated ids ───────────────────────────────
        let mut seen: HashSet<String> = HashSet::new();
        let fresh: Vec<Arc<dyn Strategy>> = strategies
            .into_iter()
            .filter(|s| {
                let id = s.id();
                let keep = !reg.strategies.contains_key(id) && seen.insert(id.to_string());
                if !keep {
                    debug!(strategy = %id, "strategy already registered; skipped");
                }
                keep
            })
            .collect();
        if fresh.is_empty() {
            return Ok(0);
        }

        // ── 2. Subscribe tokens nobody watches yet ───────────────────────
        let mut new_tokens: Vec<String> = Vec::new();
        for s in &fresh {
            let token = s.token_address();
            let watched = reg.refcounts.get(token).copied().unwrap_or(0) > 0;
            if !watched && !new_tokens.iter().any(|t| t == token) {
                new_tokens.push(token.to_string());
            }
        }
        if !new_tokens.is_empty() {
            self.klines.subscribe(&new_tokens).map_err(|e| {
                warn!(tokens = ?new_tokens, error = %e, "subscribe failed; batch rejected");
                e
            })?;
        }

        // ── 3. Register ──────────────────────────────────────────────────
        let added = fresh.len();
        for s in fresh {
            let token = s.token_address().to_string();
            let count = reg.refcounts.entry(token.clone()).or_insert(0);
            *count += 1;
            info!(strategy = %s.id(), token = %token, refcount = *count, "strategy started");
            reg.strategies.insert(s.id().to_string(), s);
        }
        Ok(added)
    }

    /// Unregister one strategy. Returns `false` if the id was unknown.
    pub fn stop_strategy(&self, id: &str) -> bool {
        let mut reg = self.registry.write();
        let Some(strategy) = reg.strategies.remove(id) else {
            debug!(strategy = %id, "stop requested for unknown strategy");
            return false;
        };

        let token = strategy.token_address().to_string();
        let remaining = match reg.refcounts.get_mut(&token) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => 0,
        };
        info!(strategy = %id, token = %token, refcount = remaining, "strategy stopped");

        if remaining == 0 {
            reg.refcounts.remove(&token);
            if let Err(e) = self.klines.unsubscribe(std::slice::from_ref(&token)) {
                warn!(token = %token, error = %e, "unsubscribe failed");
            }
        }
        true
    }

    pub fn strategy_count(&self) -> usize {
        self.registry.read().strategies.len()
    }

    pub fn refcount(&self, token: &str) -> usize {
        self.registry.read().refcounts.get(token).copied().unwrap_or(0)
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.registry.read().strategies.contains_key(id)
    }
}

impl Drop for StrategyEngine {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// =============================================================================
// Dispatch
// =============================================================================

async fn dispatch_loop(
    mut updates: mpsc::Receiver<TokenCandles>,
    registry: Arc<RwLock<Registry>>,
    cancel: CancellationToken,
) {
    'dispatch: loop {
        let update = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            update = updates.recv() => match update {
                Some(update) => update,
                None => {
                    info!("kline queue closed");
                    break;
                }
            },
        };

        let strategies: Vec<Arc<dyn Strategy>> =
            registry.read().strategies.values().cloned().collect();

        for strategy in strategies
            .iter()
            .filter(|s| s.token_address() == update.token)
        {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => break 'dispatch,
                r = strategy.on_tick(&cancel, &update.candles) => r,
            };
            if let Err(e) = result {
                warn!(
                    strategy = %strategy.id(),
                    token = %update.token,
                    error = %format!("{e:#}"),
                    "strategy tick failed"
                );
            }
        }
    }
    debug!("strategy dispatch loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use anyhow::bail;
    use rust_decimal_macros::dec;

    use crate::testkit::candle;

    // ---------------------------------------------------------------------
    // Mocks
    // ---------------------------------------------------------------------

    struct MockKlines {
        subscribed: Mutex<Vec<Vec<String>>>,
        unsubscribed: Mutex<Vec<Vec<String>>>,
        fail_subscribe: Mutex<bool>,
        fail_unsubscribe: Mutex<bool>,
        tx: mpsc::Sender<TokenCandles>,
        rx: Mutex<Option<mpsc::Receiver<TokenCandles>>>,
        starts: Mutex<usize>,
        stops: Mutex<usize>,
    }

    impl MockKlines {
        fn new() -> Arc<Self> {
            let (tx, rx) = mpsc::channel(16);
            Arc::new(Self {
                subscribed: Mutex::new(Vec::new()),
                unsubscribed: Mutex::new(Vec::new()),
                fail_subscribe: Mutex::new(false),
                fail_unsubscribe: Mutex::new(false),
                tx,
                rx: Mutex::new(Some(rx)),
                starts: Mutex::new(0),
                stops: Mutex::new(0),
            })
        }
    }

    #[async_trait]
    impl KlineManager for MockKlines {
        fn start(&self) -> FeedResult<()> {
            *self.starts.lock() += 1;
            Ok(())
        }

        async fn stop(&self) {
            *self.stops.lock() += 1;
        }

        fn subscribe(&self, tokens: &[String]) -> FeedResult<()> {
            if *self.fail_subscribe.lock() {
                return Err(FeedError::InvalidToken(tokens.join(",")));
            }
            self.subscribed.lock().push(tokens.to_vec());
            Ok(())
        }

        fn unsubscribe(&self, tokens: &[String]) -> FeedResult<()> {
            self.unsubscribed.lock().push(tokens.to_vec());
            if *self.fail_unsubscribe.lock() {
                return Err(FeedError::Transport("socket gone".into()));
            }
            Ok(())
        }

        fn take_ohlcs(&self) -> Option<mpsc::Receiver<TokenCandles>> {
            self.rx.lock().take()
        }
    }

    struct RecordingStrategy {
        id: String,
        token: String,
        fail: bool,
        ticks: Mutex<Vec<usize>>,
    }

    impl RecordingStrategy {
        fn build(id: &str, token: &str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                id: id.into(),
                token: token.into(),
                fail,
                ticks: Mutex::new(Vec::new()),
            })
        }

        fn new(id: &str, token: &str) -> Arc<Self> {
            Self::build(id, token, false)
        }

        fn failing(id: &str, token: &str) -> Arc<Self> {
            Self::build(id, token, true)
        }

        fn ticks(&self) -> Vec<usize> {
            self.ticks.lock().clone()
        }
    }

    #[async_trait]
    impl Strategy for RecordingStrategy {
        fn id(&self) -> &str {
            &self.id
        }

        fn token_address(&self) -> &str {
            &self.token
        }

        async fn on_tick(
            &self,
            _cancel: &CancellationToken,
            candles: &[Ohlc],
        ) -> anyhow::Result<()> {
            self.ticks.lock().push(candles.len());
            if self.fail {
                bail!("strategy {} refused tick", self.id);
            }
            Ok(())
        }
    }

    /// Parks inside `on_tick` until cancelled.
    struct StuckStrategy {
        entered: Mutex<bool>,
    }

    #[async_trait]
    impl Strategy for StuckStrategy {
        fn id(&self) -> &str {
            "stuck"
        }

        fn token_address(&self) -> &str {
            "T"
        }

        async fn on_tick(&self, cancel: &CancellationToken, _: &[Ohlc]) -> anyhow::Result<()> {
            *self.entered.lock() = true;
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(Duration::from_secs(3600)) => {}
            }
            Ok(())
        }
    }

    fn as_dyn(s: &Arc<RecordingStrategy>) -> Arc<dyn Strategy> {
        s.clone()
    }

    fn series(token: &str, n: i64) -> TokenCandles {
        TokenCandles {
            token: token.into(),
            candles: (0..n).map(|i| candle(i * 60, dec!(1), dec!(1), dec!(1))).collect(),
        }
    }

    async fn eventually(check: impl Fn() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    // ---------------------------------------------------------------------
    // Tests
    // ---------------------------------------------------------------------

    #[test]
    fn shared_token_is_subscribed_once() {
        let klines = MockKlines::new();
        let engine = StrategyEngine::new(klines.clone());

        let a = RecordingStrategy::new("a", "T");
        let b = RecordingStrategy::new("b", "T");
        assert_eq!(engine.start_strategies(vec![as_dyn(&a)]).unwrap(), 1);
        assert_eq!(engine.start_strategies(vec![as_dyn(&b)]).unwrap(), 1);

        assert_eq!(*klines.subscribed.lock(), vec![vec!["T".to_string()]]);
        assert_eq!(engine.refcount("T"), 2);

        assert!(engine.stop_strategy("a"));
        assert!(klines.unsubscribed.lock().is_empty());
        assert_eq!(engine.refcount("T"), 1);

        assert!(engine.stop_strategy("b"));
        assert_eq!(*klines.unsubscribed.lock(), vec![vec!["T".to_string()]]);
        assert_eq!(engine.refcount("T"), 0);
        assert_eq!(engine.strategy_count(), 0);
    }

    #[test]
    fn batch_subscribes_distinct_tokens_and_skips_known_ids() {
        let klines = MockKlines::new();
        let engine = StrategyEngine::new(klines.clone());

        let batch = vec![
            as_dyn(&RecordingStrategy::new("a", "T")),
            as_dyn(&RecordingStrategy::new("b", "T")),
            as_dyn(&RecordingStrategy::new("c", "U")),
            as_dyn(&RecordingStrategy::new("a", "V")),
        ];
        assert_eq!(engine.start_strategies(batch).unwrap(), 3);
        assert_eq!(
            *klines.subscribed.lock(),
            vec![vec!["T".to_string(), "U".to_string()]]
        );
        assert_eq!(engine.refcount("T"), 2);
        assert_eq!(engine.refcount("V"), 0);

        // Re-starting a known id is a no-op.
        let again = engine
            .start_strategies(vec![as_dyn(&RecordingStrategy::new("c", "U"))])
            .unwrap();
        assert_eq!(again, 0);
        assert_eq!(klines.subscribed.lock().len(), 1);
        assert_eq!(engine.refcount("U"), 1);
    }

    #[test]
    fn failed_subscribe_registers_nothing() {
        let klines = MockKlines::new();
        *klines.fail_subscribe.lock() = true;
        let engine = StrategyEngine::new(klines.clone());

        let res = engine.start_strategies(vec![
            as_dyn(&RecordingStrategy::new("a", "T")),
            as_dyn(&RecordingStrategy::new("b", "U")),
        ]);
        assert!(res.is_err());
        assert_eq!(engine.strategy_count(), 0);
        assert_eq!(engine.refcount("T"), 0);
        assert!(!engine.is_registered("a"));
    }

    #[test]
    fn unknown_strategy_stop_is_noop() {
        let klines = MockKlines::new();
        let engine = StrategyEngine::new(klines.clone());
        assert!(!engine.stop_strategy("ghost"));
        assert!(klines.unsubscribed.lock().is_empty());
    }

    #[test]
    fn failed_unsubscribe_still_removes_strategy() {
        let klines = MockKlines::new();
        *klines.fail_unsubscribe.lock() = true;
        let engine = StrategyEngine::new(klines.clone());

        engine
            .start_strategies(vec![as_dyn(&RecordingStrategy::new("a", "T"))])
            .unwrap();
        assert!(engine.stop_strategy("a"));

        assert_eq!(engine.strategy_count(), 0);
        assert_eq!(engine.refcount("T"), 0);
        assert!(!engine.is_registered("a"));
        assert_eq!(klines.unsubscribed.lock().len(), 1);
    }

    #[tokio::test]
    async fn slow_tick_does_not_block_registration() {
        let klines = MockKlines::new();
        let engine = StrategyEngine::new(klines.clone());
        engine.start().unwrap();

        let stuck = Arc::new(StuckStrategy {
            entered: Mutex::new(false),
        });
        let parked: Arc<dyn Strategy> = stuck.clone();
        engine.start_strategies(vec![parked]).unwrap();
        klines.tx.send(series("T", 1)).await.unwrap();
        eventually(|| *stuck.entered.lock()).await;

        let registration = tokio::time::timeout(Duration::from_secs(1), async {
            let other = RecordingStrategy::new("other", "U");
            let added = engine.start_strategies(vec![as_dyn(&other)]).unwrap();
            (added, engine.stop_strategy("other"))
        })
        .await
        .expect("registration blocked by a running tick");
        assert_eq!(registration, (1, true));
        assert_eq!(engine.strategy_count(), 1);

        tokio::time::timeout(Duration::from_secs(1), engine.stop())
            .await
            .expect("stop blocked by a running tick");
        assert_eq!(*klines.stops.lock(), 1);
    }

    #[tokio::test]
    async fn ticks_reach_matching_strategies_only() {
        let klines = MockKlines::new();
        let engine = StrategyEngine::new(klines.clone());
        engine.start().unwrap();

        let on_t = RecordingStrategy::new("on-t", "T");
        let broken = RecordingStrategy::failing("broken", "T");
        let on_u = RecordingStrategy::new("on-u", "U");
        engine
            .start_strategies(vec![as_dyn(&broken), as_dyn(&on_t), as_dyn(&on_u)])
            .unwrap();

        klines.tx.send(series("T", 3)).await.unwrap();
        klines.tx.send(series("T", 4)).await.unwrap();

        eventually(|| on_t.ticks().len() == 2).await;
        assert_eq!(on_t.ticks(), vec![3, 4]);
        assert_eq!(broken.ticks(), vec![3, 4]);
        assert!(on_u.ticks().is_empty());

        engine.stop().await;
    }

    #[tokio::test]
    async fn stop_halts_dispatch_and_stops_klines() {
        let klines = MockKlines::new();
        let engine = StrategyEngine::new(klines.clone());
        engine.start().unwrap();
        engine.start().unwrap();
        assert_eq!(*klines.starts.lock(), 1);

        engine.stop().await;
        engine.stop().await;
        assert_eq!(*klines.stops.lock(), 2);
        assert!(matches!(engine.start(), Err(FeedError::Stopped)));
    }
}
