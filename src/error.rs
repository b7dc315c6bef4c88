// error.rs

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the feed core.
///
/// Only `InvalidToken`, `Timeout`, `Stopped` and `Config` ever reach callers
/// of the public API. Transport, protocol and historical errors are handled
/// inside the worker loops and only show up in logs.
#[derive(Error, Debug)]
pub enum FeedError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("historical fetch failed: {0}")]
    Historical(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid token: {0:?}")]
    InvalidToken(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("component stopped")]
    Stopped,
}

pub type FeedResult<T> = Result<T, FeedError>;

impl From<serde_json::Error> for FeedError {
    fn from(err: serde_json::Error) -> Self {
        FeedError::Protocol(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for FeedError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        FeedError::Transport(err.to_string())
    }
}

impl From<tokio_socks::Error> for FeedError {
    fn from(err: tokio_socks::Error) -> Self {
        FeedError::Transport(format!("socks5: {err}"))
    }
}

impl From<reqwest::Error> for FeedError {
    fn from(err: reqwest::Error) -> Self {
        FeedError::Historical(err.to_string())
    }
}
