// =============================================================================
// Transport - TCP (direct or SOCKS5), TLS and the WebSocket handshake
// =============================================================================
//
// The connector never touches sockets directly: it asks a `Dialer` for a
// `WsConnection` and gets back a boxed sink/source pair.  `NetworkDialer` is
// the production path; tests plug an in-memory dialer in instead.
//
// Every handshake carries a browser-like header profile picked at random
// from a small fixed pool.
// =============================================================================

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Sink, Stream, StreamExt};
use rand::seq::SliceRandom;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue, Request};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info};

use crate::error::{FeedError, FeedResult};
use crate::runtime_config::ProxyConfig;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

// ---------------------------------------------------------------------------
// Connection halves
// ---------------------------------------------------------------------------

/// Any byte stream a WebSocket can run over.
pub trait Io: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

pub type WsSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;
pub type WsSource = Pin<Box<dyn Stream<Item = Result<Message, WsError>> + Send>>;

/// An established WebSocket, split for concurrent read and write.
pub struct WsConnection {
    pub sink: WsSink,
    pub source: WsSource,
}

impl WsConnection {
    pub fn from_stream<S>(ws: WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, source) = ws.split();
        Self {
            sink: Box::pin(sink),
            source: Box::pin(source),
        }
    }
}

/// Opens WebSocket connections to a provider endpoint.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(
        &self,
        endpoint: &str,
        headers: &[(&'static str, String)],
    ) -> FeedResult<WsConnection>;
}

// ---------------------------------------------------------------------------
// Client header profiles
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct ClientProfile {
    name: &'static str,
    user_agent: &'static str,
    accept_language: &'static str,
}

const PROFILES: &[ClientProfile] = &[
    ClientProfile {
        name: "chrome-win",
        user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
        accept_language: "en-US,en;q=0.9",
    },
    ClientProfile {
        name: "chrome-mac",
        user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
        accept_language: "en-GB,en;q=0.9",
    },
    ClientProfile {
        name: "firefox-win",
        user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
        accept_language: "en-US,en;q=0.5",
    },
    ClientProfile {
        name: "safari-mac",
        user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
        accept_language: "en-US,en;q=0.9",
    },
    ClientProfile {
        name: "edge-win",
        user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36 Edg/124.0.0.0",
        accept_language: "en-US,en;q=0.8",
    },
];

fn random_profile() -> ClientProfile {
    *PROFILES
        .choose(&mut rand::thread_rng())
        .unwrap_or(&PROFILES[0])
}

fn header_value(name: &str, value: &str) -> FeedResult<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| FeedError::Config(format!("invalid {name} header value: {e}")))
}

/// Build the handshake request: endpoint, profile headers, provider headers.
fn build_request(
    endpoint: &str,
    profile: ClientProfile,
    extra: &[(&'static str, String)],
) -> FeedResult<Request<()>> {
    let mut request = endpoint.into_client_request()?;
    let headers = request.headers_mut();
    headers.insert("user-agent", header_value("user-agent", profile.user_agent)?);
    headers.insert(
        "accept-language",
        header_value("accept-language", profile.accept_language)?,
    );
    for &(name, ref value) in extra {
        headers.insert(HeaderName::from_static(name), header_value(name, value)?);
    }
    Ok(request)
}

/// Host and port to open the TCP (or SOCKS5) connection to.
fn target_of(request: &Request<()>) -> FeedResult<(String, u16)> {
    let uri = request.uri();
    let host = uri
        .host()
        .ok_or_else(|| FeedError::Config(format!("endpoint {uri} has no host")))?
        .to_string();
    let port = match (uri.port_u16(), uri.scheme_str()) {
        (Some(port), _) => port,
        (None, Some("ws")) => 80,
        _ => 443,
    };
    Ok((host, port))
}

// ---------------------------------------------------------------------------
// NetworkDialer
// ---------------------------------------------------------------------------

/// Real network dialer: direct TCP or SOCKS5, then TLS (for `wss`) and the
/// WebSocket upgrade, all bounded by one connect timeout.
pub struct NetworkDialer {
    proxy: Option<ProxyConfig>,
    connect_timeout: Duration,
}

impl NetworkDialer {
    pub fn new(proxy: Option<ProxyConfig>) -> Self {
        Self {
            proxy,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    async fn open(&self, host: &str, port: u16) -> FeedResult<Box<dyn Io>> {
        match &self.proxy {
            Some(proxy) => {
                let proxy_addr = proxy.address();
                let stream = Socks5Stream::connect(proxy_addr.as_str(), (host, port)).await?;
                debug!(proxy = %proxy_addr, host, port, "socks5 tunnel established");
                Ok(Box::new(stream))
            }
            None => {
                let stream = TcpStream::connect((host, port))
                    .await
                    .map_err(|e| FeedError::Transport(format!("tcp connect {host}:{port}: {e}")))?;
                stream.set_nodelay(true).ok();
                Ok(Box::new(stream))
            }
        }
    }

    async fn handshake(
        &self,
        endpoint: &str,
        headers: &[(&'static str, String)],
    ) -> FeedResult<WsConnection> {
        let profile = random_profile();
        let request = build_request(endpoint, profile, headers)?;
        let (host, port) = target_of(&request)?;

        let io = self.open(&host, port).await?;
        let (ws, response) = tokio_tungstenite::client_async_tls(request, io).await?;

        info!(
            endpoint,
            profile = profile.name,
            status = %response.status(),
            proxied = self.proxy.is_some(),
            "websocket handshake complete"
        );
        Ok(WsConnection::from_stream(ws))
    }
}

#[async_trait]
impl Dialer for NetworkDialer {
    async fn dial(
        &self,
        endpoint: &str,
        headers: &[(&'static str, String)],
    ) -> FeedResult<WsConnection> {
        tokio::time::timeout(self.connect_timeout, self.handshake(endpoint, headers))
            .await
            .map_err(|_| FeedError::Timeout(self.connect_timeout))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_carries_profile_and_provider_headers() {
        let profile = PROFILES[2];
        let req = build_request(
            "wss://ws.example.com/quotation",
            profile,
            &[("origin", "https://example.com".to_string())],
        )
        .unwrap();

        let h = req.headers();
        assert_eq!(h["user-agent"], profile.user_agent);
        assert_eq!(h["accept-language"], profile.accept_language);
        assert_eq!(h["origin"], "https://example.com");
        // Upgrade headers are still generated by tungstenite.
        assert!(h.contains_key("sec-websocket-key"));
    }

    #[test]
    fn random_profile_comes_from_pool() {
        for _ in 0..20 {
            let p = random_profile();
            assert!(PROFILES.iter().any(|q| q.name == p.name));
        }
    }

    #[test]
    fn target_defaults_port_by_scheme() {
        let req = build_request("wss://a.example.com/ws", PROFILES[0], &[]).unwrap();
        assert_eq!(target_of(&req).unwrap(), ("a.example.com".to_string(), 443));

        let req = build_request("ws://b.example.com:8080/ws", PROFILES[0], &[]).unwrap();
        assert_eq!(target_of(&req).unwrap(), ("b.example.com".to_string(), 8080));

        let req = build_request("ws://c.example.com/ws", PROFILES[0], &[]).unwrap();
        assert_eq!(target_of(&req).unwrap().1, 80);
    }

    #[test]
    fn bad_endpoint_is_rejected() {
        assert!(build_request("not a url", PROFILES[0], &[]).is_err());
    }

    #[tokio::test]
    async fn dial_to_closed_port_fails_fast() {
        let dialer = NetworkDialer::new(None).with_connect_timeout(Duration::from_secs(2));
        // Port 1 on loopback is essentially never listening.
        let res = dialer.dial("ws://127.0.0.1:1/ws", &[]).await;
        assert!(res.is_err());
    }
}
