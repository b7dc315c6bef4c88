// =============================================================================
// Feed Configuration - provider, resolution, history cap and transport options
// =============================================================================
//
// Loaded from a JSON file with every field carrying `#[serde(default)]`, so a
// partial (or empty) file is valid.  Environment variables override the file
// after `.env` has been read.  `validate()` must pass before any component is
// built: a bad resolution string is a fatal startup error.
//
// Persistence uses the same tmp + rename pattern as every other state file.
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::FeedError;
use crate::market_data::backoff::Backoff;
use crate::market_data::connector::ConnectorSettings;
use crate::providers::ProviderKind;
use crate::types::{Resolution, MAX_CANDLES_CAP};

// =============================================================================
// Default-value helpers
// =============================================================================

fn default_chain() -> String {
    "sol".to_string()
}

fn default_resolution() -> String {
    "1m".to_string()
}

fn default_max_candles() -> usize {
    MAX_CANDLES_CAP
}

fn default_backoff_initial_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_event_capacity() -> usize {
    1024
}

// =============================================================================
// ProxyConfig
// =============================================================================

/// Optional SOCKS5 proxy used for both the stream and the REST history calls.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub enabled: bool,
}

impl ProxyConfig {
    /// `host:port`, suitable for the SOCKS5 handshake.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// `Some(self)` only when the proxy is switched on.
    pub fn active(&self) -> Option<&Self> {
        self.enabled.then_some(self)
    }

    /// Parse `host:port` (as found in `GRIDFEED_SOCKS5`).
    pub fn parse(spec: &str) -> Result<Self, FeedError> {
        let (host, port) = spec
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| FeedError::Config(format!("proxy {spec:?} is not host:port")))?;
        let port: u16 = port
            .parse()
            .map_err(|_| FeedError::Config(format!("proxy port {port:?} is not a number")))?;
        Ok(Self {
            host: host.to_string(),
            port,
            enabled: true,
        })
    }
}

// =============================================================================
// FeedConfig
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Upstream market-data provider.
    #[serde(default)]
    pub provider: ProviderKind,

    /// Chain short name (`sol`, `eth`, `bsc`, `base`); providers map it to
    /// their own identifiers.
    #[serde(default = "default_chain")]
    pub chain: String,

    /// Candle resolution, `<integer><s|m|h|d>`.
    #[serde(default = "default_resolution")]
    pub resolution: String,

    /// History kept per token. Clamped to 1..=1000.
    #[serde(default = "default_max_candles")]
    pub max_candles: usize,

    #[serde(default)]
    pub proxy: ProxyConfig,

    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Overrides the provider's keepalive interval.
    #[serde(default)]
    pub heartbeat_secs: Option<u64>,

    /// Capacity of the connector and aggregator output queues.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Overrides the provider's WebSocket endpoint.
    #[serde(default)]
    pub ws_url: Option<String>,

    /// Overrides the provider's REST base URL for history.
    #[serde(default)]
    pub rest_base_url: Option<String>,

    /// Tokens the binary tracks at startup.
    #[serde(default)]
    pub tokens: Vec<String>,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::default(),
            chain: default_chain(),
            resolution: default_resolution(),
            max_candles: default_max_candles(),
            proxy: ProxyConfig::default(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            heartbeat_secs: None,
            event_capacity: default_event_capacity(),
            ws_url: None,
            rest_base_url: None,
            tokens: Vec::new(),
        }
    }
}

impl FeedConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read feed config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse feed config from {}", path.display()))?;

        info!(
            path = %path.display(),
            provider = %config.provider,
            resolution = %config.resolution,
            "feed config loaded"
        );

        Ok(config)
    }

    /// Persist with an atomic write (tmp sibling, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise feed config")?;
        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "feed config saved (atomic)");
        Ok(())
    }

    /// Apply `GRIDFEED_*` environment overrides.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(provider) = lookup("GRIDFEED_PROVIDER") {
            self.provider = provider
                .parse()
                .with_context(|| format!("GRIDFEED_PROVIDER={provider}"))?;
        }
        if let Some(resolution) = lookup("GRIDFEED_RESOLUTION") {
            self.resolution = resolution.trim().to_string();
        }
        if let Some(chain) = lookup("GRIDFEED_CHAIN") {
            self.chain = chain.trim().to_string();
        }
        if let Some(max) = lookup("GRIDFEED_MAX_CANDLES") {
            self.max_candles = max
                .trim()
                .parse()
                .with_context(|| format!("GRIDFEED_MAX_CANDLES={max}"))?;
        }
        if let Some(tokens) = lookup("GRIDFEED_TOKENS") {
            self.tokens = tokens
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(proxy) = lookup("GRIDFEED_SOCKS5") {
            self.proxy = ProxyConfig::parse(&proxy).context("GRIDFEED_SOCKS5")?;
        }
        Ok(())
    }

    /// Parsed resolution. Errors here are fatal at startup.
    pub fn resolution(&self) -> Result<Resolution, FeedError> {
        self.resolution.parse()
    }

    /// History cap actually used: never above 1000, never zero.
    pub fn effective_max_candles(&self) -> usize {
        if self.max_candles > MAX_CANDLES_CAP {
            warn!(
                requested = self.max_candles,
                cap = MAX_CANDLES_CAP,
                "max_candles above cap, clamping"
            );
        }
        self.max_candles.clamp(1, MAX_CANDLES_CAP)
    }

    /// Check everything that would otherwise fail later at runtime.
    pub fn validate(&self) -> Result<(), FeedError> {
        self.resolution()?;

        if self.backoff_initial_ms == 0 || self.backoff_initial_ms > self.backoff_max_ms {
            return Err(FeedError::Config(format!(
                "backoff bounds invalid: initial={}ms max={}ms",
                self.backoff_initial_ms, self.backoff_max_ms
            )));
        }
        if self.event_capacity == 0 {
            return Err(FeedError::Config("event_capacity must be non-zero".into()));
        }
        if self.heartbeat_secs == Some(0) {
            return Err(FeedError::Config("heartbeat_secs must be non-zero".into()));
        }
        if let Some(proxy) = self.proxy.active() {
            if proxy.host.trim().is_empty() || proxy.port == 0 {
                return Err(FeedError::Config(format!(
                    "proxy enabled but address {:?} is incomplete",
                    proxy.address()
                )));
            }
        }
        Ok(())
    }

    /// Settings for the stream connector derived from this config.
    pub fn connector_settings(&self) -> Result<ConnectorSettings, FeedError> {
        self.validate()?;
        Ok(ConnectorSettings {
            backoff: Backoff::new(
                Duration::from_millis(self.backoff_initial_ms),
                Duration::from_millis(self.backoff_max_ms),
            ),
            heartbeat: self.heartbeat_secs.map(Duration::from_secs),
            event_capacity: self.event_capacity,
        })
    }
}
