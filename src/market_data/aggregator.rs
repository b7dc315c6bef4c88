// =============================================================================
// Candle Aggregator - connector events in, refreshed candle series out
// =============================================================================
//
// Wraps a `StreamConnector` and a `CandleBook`.  One worker task owns the
// book, applies every event and pushes the token's full history downstream
// whenever it changed.  Output uses the same drop-newest policy as the
// connector: a slow consumer loses updates, the feed never stalls.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::candle_book::{ApplyOutcome, CandleBook};
use super::connector::StreamConnector;
use super::queue::{offer, Offer};
use super::transport::NetworkDialer;
use super::KlineManager;
use crate::error::{FeedError, FeedResult};
use crate::providers;
use crate::runtime_config::FeedConfig;
use crate::types::{StreamEvent, TokenCandles};

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct AggregatorStats {
    updates_emitted: AtomicU64,
    updates_dropped: AtomicU64,
    reloads: AtomicU64,
    reload_failures: AtomicU64,
    late_ignored: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatorStatsSnapshot {
    pub updates_emitted: u64,
    pub updates_dropped: u64,
    pub reloads: u64,
    pub reload_failures: u64,
    pub late_ignored: u64,
}

impl AggregatorStats {
    pub fn snapshot(&self) -> AggregatorStatsSnapshot {
        AggregatorStatsSnapshot {
            updates_emitted: self.updates_emitted.load(Ordering::Relaxed),
            updates_dropped: self.updates_dropped.load(Ordering::Relaxed),
            reloads: self.reloads.load(Ordering::Relaxed),
            reload_failures: self.reload_failures.load(Ordering::Relaxed),
            late_ignored: self.late_ignored.load(Ordering::Relaxed),
        }
    }
}

// ---------------------------------------------------------------------------
// CandleAggregator
// ---------------------------------------------------------------------------

pub struct CandleAggregator {
    connector: Arc<StreamConnector>,
    book: Mutex<Option<CandleBook>>,
    out_tx: Mutex<Option<mpsc::Sender<TokenCandles>>>,
    out_rx: Mutex<Option<mpsc::Receiver<TokenCandles>>>,
    forget_tx: mpsc::UnboundedSender<String>,
    forget_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<AggregatorStats>,
}

impl CandleAggregator {
    pub fn new(connector: Arc<StreamConnector>, book: CandleBook, capacity: usize) -> Self {
        let (out_tx, out_rx) = mpsc::channel(capacity.max(1));
        let (forget_tx, forget_rx) = mpsc::unbounded_channel();
        Self {
            connector,
            book: Mutex::new(Some(book)),
            out_tx: Mutex::new(Some(out_tx)),
            out_rx: Mutex::new(Some(out_rx)),
            forget_tx,
            forget_rx: Mutex::new(Some(forget_rx)),
            cancel: CancellationToken::new(),
            worker: Mutex::new(None),
            stats: Arc::new(AggregatorStats::default()),
        }
    }

    /// Provider, network dialer, connector and book, all from one config.
    pub fn from_config(config: &FeedConfig) -> FeedResult<Self> {
        config.validate()?;
        let bundle = providers::build(config)?;
        let dialer = NetworkDialer::new(config.proxy.active().cloned());
        let connector = StreamConnector::new(
            bundle.stream,
            Arc::new(dialer),
            config.connector_settings()?,
        );
        let book = CandleBook::new(
            config.resolution()?,
            config.effective_max_candles(),
            bundle.history,
        );

        info!(
            provider = %config.provider,
            resolution = %config.resolution,
            max_candles = book.max_candles(),
            "candle aggregator configured"
        );
        Ok(Self::new(Arc::new(connector), book, config.event_capacity))
    }

    pub fn connector(&self) -> &Arc<StreamConnector> {
        &self.connector
    }

    pub fn stats(&self) -> AggregatorStatsSnapshot {
        self.stats.snapshot()
    }
}

#[async_trait]
impl KlineManager for CandleAggregator {
    fn start(&self) -> FeedResult<()> {
        if self.cancel.is_cancelled() {
            return Err(FeedError::Stopped);
        }
        let mut worker = self.worker.lock();
        if worker.is_some() {
            debug!("candle aggregator already started");
            return Ok(());
        }

        // Take nothing before the connector is running.
        self.connector.start()?;

        let events = self
            .connector
            .take_events()
            .ok_or_else(|| FeedError::Config("connector events already taken".into()))?;
        let book = self.book.lock().take().ok_or(FeedError::Stopped)?;
        let out = self.out_tx.lock().clone().ok_or(FeedError::Stopped)?;
        let forget = self.forget_rx.lock().take().ok_or(FeedError::Stopped)?;

        *worker = Some(tokio::spawn(run(Worker {
            book,
            events,
            forget,
            out,
            cancel: self.cancel.clone(),
            connector: Arc::clone(&self.connector),
            stats: Arc::clone(&self.stats),
        })));
        info!("candle aggregator started");
        Ok(())
    }

    async fn stop(&self) {
        self.cancel.cancel();

        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "candle aggregator worker panicked");
            }
        }

        self.connector.stop().await;
        self.out_tx.lock().take();
        info!("candle aggregator stopped");
    }

    fn subscribe(&self, tokens: &[String]) -> FeedResult<()> {
        self.connector.subscribe(tokens)
    }

    /// Also drops the cached history of every removed token.
    fn unsubscribe(&self, tokens: &[String]) -> FeedResult<()> {
        self.connector.unsubscribe(tokens)?;
        for token in tokens {
            let _ = self.forget_tx.send(token.clone());
        }
        Ok(())
    }

    fn take_ohlcs(&self) -> Option<mpsc::Receiver<TokenCandles>> {
        self.out_rx.lock().take()
    }
}

impl Drop for CandleAggregator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

struct Worker {
    book: CandleBook,
    events: mpsc::Receiver<StreamEvent>,
    forget: mpsc::UnboundedReceiver<String>,
    out: mpsc::Sender<TokenCandles>,
    cancel: CancellationToken,
    connector: Arc<StreamConnector>,
    stats: Arc<AggregatorStats>,
}

async fn run(mut w: Worker) {
    loop {
        tokio::select! {
            biased;

            _ = w.cancel.cancelled() => break,

            Some(token) = w.forget.recv() => {
                if w.book.remove(&token) {
                    debug!(token = %token, "candle history dropped");
                }
            }

            event = w.events.recv() => {
                let Some(event) = event else {
                    info!("connector event queue closed");
                    break;
                };
                if !w.connector.is_subscribed(&event.token) {
                    trace!(token = %event.token, "event for unsubscribed token skipped");
                    continue;
                }

                let applied = tokio::select! {
                    biased;
                    _ = w.cancel.cancelled() => break,
                    res = w.book.apply(&event) => res,
                };
                handle_outcome(&w, &event.token, applied);
            }
        }
    }
    debug!("candle aggregator worker exited");
}

fn handle_outcome(w: &Worker, token: &str, applied: FeedResult<ApplyOutcome>) {
    let stats = &w.stats;
    let outcome = match applied {
        Ok(outcome) => outcome,
        Err(e) => {
            stats.reload_failures.fetch_add(1, Ordering::Relaxed);
            warn!(token = %token, error = %e, "candle update aborted; will reload on next event");
            return;
        }
    };

    match outcome {
        ApplyOutcome::Ignored => {
            stats.late_ignored.fetch_add(1, Ordering::Relaxed);
            trace!(token = %token, "late record ignored");
        }
        ApplyOutcome::Reloaded => {
            stats.reloads.fetch_add(1, Ordering::Relaxed);
        }
        ApplyOutcome::Updated => {}
    }
    if !outcome.changed() {
        return;
    }

    let Some(snapshot) = w.book.snapshot(token) else {
        return;
    };
    match offer(&w.out, snapshot) {
        Offer::Sent => {
            stats.updates_emitted.fetch_add(1, Ordering::Relaxed);
        }
        Offer::Dropped => {
            stats.updates_dropped.fetch_add(1, Ordering::Relaxed);
            warn!(token = %token, "candle queue full; dropping newest update");
        }
        Offer::Closed => trace!("candle receiver gone"),
    }
}
