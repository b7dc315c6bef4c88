// =============================================================================
// gridfeed - Main Entry Point
// =============================================================================
//
// Streams candles for the configured tokens and logs every update through a
// minimal strategy.  Real strategies plug into the same `StrategyEngine`.
// =============================================================================

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gridfeed::{CandleAggregator, FeedConfig, Ohlc, Strategy, StrategyEngine};

const CONFIG_PATH: &str = "feed_config.json";

/// Logs the latest candle of its token.
struct TickLogger {
    id: String,
    token: String,
}

#[async_trait]
impl Strategy for TickLogger {
    fn id(&self) -> &str {
        &self.id
    }

    fn token_address(&self) -> &str {
        &self.token
    }

    async fn on_tick(&self, _cancel: &CancellationToken, candles: &[Ohlc]) -> anyhow::Result<()> {
        let last = candles.last().context("empty candle history")?;
        info!(
            token = %self.token,
            candles = candles.len(),
            time = %last.time,
            open = %last.open,
            high = %last.high,
            low = %last.low,
            close = %last.close,
            volume = %last.volume,
            "candle update"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = FeedConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load feed config, using defaults");
        FeedConfig::default()
    });
    config
        .apply_env_overrides()
        .context("invalid environment override")?;
    config.validate().context("invalid feed configuration")?;

    info!(
        provider = %config.provider,
        chain = %config.chain,
        resolution = %config.resolution,
        tokens = ?config.tokens,
        proxied = config.proxy.enabled,
        "gridfeed starting"
    );

    // ── 2. Build the pipeline ────────────────────────────────────────────
    let aggregator = Arc::new(
        CandleAggregator::from_config(&config).context("failed to build candle aggregator")?,
    );
    let engine = StrategyEngine::new(aggregator.clone());
    engine.start().context("failed to start strategy engine")?;

    // ── 3. One logging strategy per token ────────────────────────────────
    let strategies: Vec<Arc<dyn Strategy>> = config
        .tokens
        .iter()
        .map(|token| {
            Arc::new(TickLogger {
                id: format!("log-{token}"),
                token: token.clone(),
            }) as Arc<dyn Strategy>
        })
        .collect();
    if strategies.is_empty() {
        warn!("no tokens configured; set GRIDFEED_TOKENS or `tokens` in {CONFIG_PATH}");
    }
    let started = engine
        .start_strategies(strategies)
        .context("failed to start strategies")?;
    info!(strategies = started, "strategies registered");

    match aggregator
        .connector()
        .wait_until_connected(Some(std::time::Duration::from_secs(30)))
        .await
    {
        Ok(()) => info!("stream connected"),
        Err(e) => warn!(error = %e, "stream not connected yet; retrying in background"),
    }

    // ── 4. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");

    engine.stop().await;
    info!(
        connector = ?aggregator.connector().stats(),
        aggregator = ?aggregator.stats(),
        "gridfeed shut down complete"
    );
    Ok(())
}
