// =============================================================================
// Stream Connector - one long-lived provider socket with reconnect
// =============================================================================
//
// Lifecycle:
//   Idle -> Connecting -> Connected -> Reconnecting -> Connecting -> ...
//   Stopped is terminal and only reached through `stop()`.
//
// The subscription intent (a token set) outlives every connection.  It sits
// behind one mutex together with the outbound queue of the live session, so
// a `subscribe` either lands in the replay of the next session or is queued
// on the current one, never lost between the two.
//
// Each session replays the full intent set, runs a heartbeat ticker and the
// read loop.  Decoded records for subscribed tokens become `StreamEvent`s on
// a bounded queue with drop-newest backpressure.
// =============================================================================

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::backoff::Backoff;
use super::queue::{offer, Offer};
use super::transport::{Dialer, WsConnection};
use crate::error::{FeedError, FeedResult};
use crate::providers::{Frame, Provider};
use crate::types::{StreamEvent, TokenRecord};

pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Time allowed for a close frame to go out on shutdown.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Settings / state / stats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct ConnectorSettings {
    pub backoff: Backoff,
    /// Overrides the provider's keepalive interval.
    pub heartbeat: Option<Duration>,
    pub event_capacity: usize,
}

impl Default for ConnectorSettings {
    fn default() -> Self {
        Self {
            backoff: Backoff::default(),
            heartbeat: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Stopped,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Lock-free connector counters.
#[derive(Debug, Default)]
pub struct ConnectorStats {
    connect_attempts: AtomicU64,
    connects: AtomicU64,
    frames: AtomicU64,
    events_emitted: AtomicU64,
    events_dropped: AtomicU64,
    parse_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorStatsSnapshot {
    pub connect_attempts: u64,
    pub connects: u64,
    pub frames: u64,
    pub events_emitted: u64,
    pub events_dropped: u64,
    pub parse_errors: u64,
}

impl ConnectorStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ConnectorStatsSnapshot {
        ConnectorStatsSnapshot {
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            connects: self.connects.load(Ordering::Relaxed),
            frames: self.frames.load(Ordering::Relaxed),
            events_emitted: self.events_emitted.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct SubscriptionState {
    tokens: BTreeSet<String>,
    /// Outbound queue of the live session; `None` while disconnected.
    outbound: Option<mpsc::UnboundedSender<Message>>,
}

impl SubscriptionState {
    fn full_set(&self) -> Vec<String> {
        self.tokens.iter().cloned().collect()
    }

    /// Queue frames on the live session, if any.
    fn push(&self, frames: Vec<Message>) {
        let Some(out) = &self.outbound else {
            return;
        };
        for frame in frames {
            if out.send(frame).is_err() {
                debug!("session outbound queue closed; frame will be replayed on reconnect");
                return;
            }
        }
    }
}

struct Shared {
    provider: Arc<dyn Provider>,
    dialer: Arc<dyn Dialer>,
    heartbeat: Duration,
    subs: Mutex<SubscriptionState>,
    state_tx: watch::Sender<ConnectionState>,
    connected_tx: watch::Sender<bool>,
    cancel: CancellationToken,
    stats: ConnectorStats,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        let prev = self.state_tx.send_replace(state);
        if prev != state {
            debug!(provider = %self.provider.kind(), from = %prev, to = %state, "connection state");
        }
    }
}

fn validate_tokens(tokens: &[String]) -> FeedResult<()> {
    match tokens.iter().find(|t| t.trim().is_empty()) {
        Some(bad) => Err(FeedError::InvalidToken(bad.clone())),
        None => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// StreamConnector
// ---------------------------------------------------------------------------

/// Keeps one provider stream alive and turns its frames into `StreamEvent`s.
pub struct StreamConnector {
    shared: Arc<Shared>,
    backoff: Backoff,
    event_tx: Mutex<Option<mpsc::Sender<StreamEvent>>>,
    event_rx: Mutex<Option<mpsc::Receiver<StreamEvent>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl StreamConnector {
    pub fn new(
        provider: Arc<dyn Provider>,
        dialer: Arc<dyn Dialer>,
        settings: ConnectorSettings,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(settings.event_capacity.max(1));
        let heartbeat = settings
            .heartbeat
            .unwrap_or_else(|| provider.heartbeat_interval());
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let (connected_tx, _) = watch::channel(false);

        Self {
            shared: Arc::new(Shared {
                provider,
                dialer,
                heartbeat,
                subs: Mutex::new(SubscriptionState {
                    tokens: BTreeSet::new(),
                    outbound: None,
                }),
                state_tx,
                connected_tx,
                cancel: CancellationToken::new(),
                stats: ConnectorStats::default(),
            }),
            backoff: settings.backoff,
            event_tx: Mutex::new(Some(event_tx)),
            event_rx: Mutex::new(Some(event_rx)),
            worker: Mutex::new(None),
        }
    }

    /// Spawn the control loop. Calling it again is a no-op.
    pub fn start(&self) -> FeedResult<()> {
        if self.shared.cancel.is_cancelled() {
            return Err(FeedError::Stopped);
        }
        let mut worker = self.worker.lock();
        if worker.is_some() {
            debug!("stream connector already started");
            return Ok(());
        }
        let events = self.event_tx.lock().clone().ok_or(FeedError::Stopped)?;

        *worker = Some(tokio::spawn(run(
            Arc::clone(&self.shared),
            events,
            self.backoff,
        )));
        info!(
            provider = %self.shared.provider.kind(),
            endpoint = %self.shared.provider.endpoint(),
            "stream connector started"
        );
        Ok(())
    }

    /// Cancel the loop, close the socket, wait for the worker, then close the
    /// event queue. Safe to call more than once.
    pub async fn stop(&self) {
        self.shared.cancel.cancel();

        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "stream connector worker panicked");
            }
        }

        self.event_tx.lock().take();
        self.shared.subs.lock().outbound = None;
        self.shared.set_state(ConnectionState::Stopped);
    }

    /// Resolve once the first connection has been established.
    pub async fn wait_until_connected(&self, timeout: Option<Duration>) -> FeedResult<()> {
        let mut connected = self.shared.connected_tx.subscribe();
        let cancel = self.shared.cancel.clone();

        let wait = async move {
            tokio::select! {
                biased;
                res = connected.wait_for(|ok| *ok) => {
                    res.map(|_| ()).map_err(|_| FeedError::Stopped)
                }
                _ = cancel.cancelled() => Err(FeedError::Stopped),
            }
        };

        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| FeedError::Timeout(limit))?,
            None => wait.await,
        }
    }

    /// Add tokens to the intent set. Pushed right away when connected,
    /// otherwise replayed on the next connect.
    pub fn subscribe(&self, tokens: &[String]) -> FeedResult<()> {
        validate_tokens(tokens)?;

        let mut subs = self.shared.subs.lock();
        let added: Vec<&String> = tokens
            .iter()
            .filter(|t| subs.tokens.insert((*t).clone()))
            .collect();
        if added.is_empty() {
            return Ok(());
        }

        info!(
            added = ?added,
            total = subs.tokens.len(),
            live = subs.outbound.is_some(),
            "stream subscribe"
        );
        let frames = self.shared.provider.encode_subscribe(&subs.full_set());
        subs.push(frames);
        Ok(())
    }

    /// Remove tokens from the intent set.
    pub fn unsubscribe(&self, tokens: &[String]) -> FeedResult<()> {
        validate_tokens(tokens)?;

        let mut subs = self.shared.subs.lock();
        let removed: Vec<String> = tokens
            .iter()
            .filter(|t| subs.tokens.remove(t.as_str()))
            .cloned()
            .collect();
        if removed.is_empty() {
            return Ok(());
        }

        info!(
            removed = ?removed,
            total = subs.tokens.len(),
            live = subs.outbound.is_some(),
            "stream unsubscribe"
        );
        let mut frames = self.shared.provider.encode_unsubscribe(&removed);
        frames.extend(self.shared.provider.encode_subscribe(&subs.full_set()));
        subs.push(frames);
        Ok(())
    }

    /// The event queue's receiving end. Only the first call gets it.
    pub fn take_events(&self) -> Option<mpsc::Receiver<StreamEvent>> {
        self.event_rx.lock().take()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.shared.subs.lock().full_set()
    }

    pub fn is_subscribed(&self, token: &str) -> bool {
        self.shared.subs.lock().tokens.contains(token)
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn stats(&self) -> ConnectorStatsSnapshot {
        self.shared.stats.snapshot()
    }
}

impl Drop for StreamConnector {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

// ---------------------------------------------------------------------------
// Control loop
// ---------------------------------------------------------------------------

enum SessionEnd {
    Cancelled,
    Lost(String),
}

async fn run(shared: Arc<Shared>, events: mpsc::Sender<StreamEvent>, mut backoff: Backoff) {
    let provider = shared.provider.kind();

    loop {
        if shared.cancel.is_cancelled() {
            break;
        }

        shared.set_state(ConnectionState::Connecting);
        ConnectorStats::bump(&shared.stats.connect_attempts);
        let endpoint = shared.provider.endpoint();
        let headers = shared.provider.extra_headers();

        let dialed = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            res = shared.dialer.dial(&endpoint, &headers) => res,
        };

        match dialed {
            Ok(conn) => {
                backoff.reset();
                ConnectorStats::bump(&shared.stats.connects);
                info!(provider = %provider, endpoint = %endpoint, "stream connected");

                match run_session(&shared, conn, &events).await {
                    SessionEnd::Cancelled => break,
                    SessionEnd::Lost(reason) => {
                        warn!(provider = %provider, reason = %reason, "stream session lost");
                    }
                }
            }
            Err(e) => {
                warn!(provider = %provider, endpoint = %endpoint, error = %e, "stream dial failed");
            }
        }

        if shared.cancel.is_cancelled() {
            break;
        }
        shared.set_state(ConnectionState::Reconnecting);
        let delay = backoff.next_delay();
        info!(
            provider = %provider,
            delay_ms = delay.as_millis() as u64,
            "reconnecting after delay"
        );

        tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    shared.subs.lock().outbound = None;
    shared.set_state(ConnectionState::Stopped);
    info!(provider = %provider, "stream connector worker exited");
}

/// One connected session: replay, heartbeat, outbound frames, read loop.
async fn run_session(
    shared: &Shared,
    conn: WsConnection,
    events: &mpsc::Sender<StreamEvent>,
) -> SessionEnd {
    let WsConnection {
        mut sink,
        mut source,
    } = conn;
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();

    {
        let mut subs = shared.subs.lock();
        let replay = subs.full_set();
        for frame in shared.provider.encode_subscribe(&replay) {
            let _ = out_tx.send(frame);
        }
        subs.outbound = Some(out_tx);
        debug!(tokens = replay.len(), "subscription set replayed");
    }
    shared.set_state(ConnectionState::Connected);
    shared.connected_tx.send_replace(true);

    // Message count per token since this connect; drives the `first` flag.
    let mut epoch: HashMap<String, u64> = HashMap::new();

    let period = shared.heartbeat;
    let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let end = loop {
        tokio::select! {
            biased;

            _ = shared.cancel.cancelled() => {
                if tokio::time::timeout(CLOSE_GRACE, sink.close()).await.is_err() {
                    debug!("close frame not flushed before shutdown");
                }
                break SessionEnd::Cancelled;
            }

            _ = heartbeat.tick() => {
                if let Err(e) = sink.send(shared.provider.heartbeat_frame()).await {
                    break SessionEnd::Lost(format!("heartbeat write failed: {e}"));
                }
                trace!("heartbeat sent");
            }

            Some(frame) = out_rx.recv() => {
                if let Err(e) = sink.send(frame).await {
                    break SessionEnd::Lost(format!("write failed: {e}"));
                }
            }

            msg = source.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    handle_text(shared, &text, &mut epoch, events);
                }
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => handle_text(shared, &text, &mut epoch, events),
                    Err(_) => debug!("non-utf8 binary frame skipped"),
                },
                Some(Ok(Message::Close(frame))) => {
                    break SessionEnd::Lost(format!("server closed: {frame:?}"));
                }
                // Pings are answered by tungstenite on the next read/write.
                Some(Ok(_)) => {}
                Some(Err(e)) => break SessionEnd::Lost(format!("read error: {e}")),
                None => break SessionEnd::Lost("stream ended".into()),
            },
        }
    };

    shared.subs.lock().outbound = None;
    end
}

fn handle_text(
    shared: &Shared,
    text: &str,
    epoch: &mut HashMap<String, u64>,
    events: &mpsc::Sender<StreamEvent>,
) {
    let records = match shared.provider.decode_frame(text) {
        Ok(Frame::Records(records)) => records,
        Ok(Frame::Control) => return,
        Err(e) => {
            ConnectorStats::bump(&shared.stats.parse_errors);
            warn!(error = %e, "failed to decode stream frame");
            return;
        }
    };
    ConnectorStats::bump(&shared.stats.frames);

    let records: Vec<TokenRecord> = {
        let subs = shared.subs.lock();
        records
            .into_iter()
            .filter(|r| subs.tokens.contains(&r.token))
            .collect()
    };

    for record in records {
        let seen = epoch.entry(record.token.clone()).or_insert(0);
        let first = *seen == 0;
        *seen += 1;

        let event = StreamEvent {
            token: record.token,
            first,
            payload: record.payload,
        };
        match offer(events, event) {
            Offer::Sent => ConnectorStats::bump(&shared.stats.events_emitted),
            Offer::Dropped => {
                ConnectorStats::bump(&shared.stats.events_dropped);
                warn!("event queue full; dropping newest event");
            }
            Offer::Closed => trace!("event receiver gone"),
        }
    }
}
