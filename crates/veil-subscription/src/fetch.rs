//! Subscription fetch over HTTPS.
//!
//! One GET against the panel URL, bounded by a timeout, body size capped,
//! then parsed into a [`SubscriptionPayload`]. Failures are classified so
//! the session core can tell a flaky network from a broken panel from a
//! bad URL.

use crate::types::{SubscriptionPayload, parse_payload};
use async_trait::async_trait;
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::header::{ACCEPT, USER_AGENT};
use hyper::{Method, Request, Uri};
use rustls::ClientConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};
use url::Url;

/// Fetch failure classification.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    #[error("invalid subscription url: {0}")]
    InvalidInput(String),

    #[error("subscription request failed: {0}")]
    Network(String),

    #[error("subscription response malformed: {0}")]
    Parse(String),

    #[error("subscription request timed out after {0:?}")]
    Timeout(Duration),
}

/// The subscription network boundary.
#[async_trait]
pub trait SubscriptionFetcher: Send + Sync {
    /// Fetch and parse the subscription document at `url`.
    async fn fetch(&self, url: &Url) -> Result<SubscriptionPayload, FetchError>;
}

/// Fetcher configuration.
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Bound on the whole fetch (connect + request + body)
    pub timeout: Duration,
    /// User-Agent string
    pub user_agent: String,
    /// Maximum response body size
    pub max_body_size: usize,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            user_agent: "veil/0.1".to_string(),
            max_body_size: 4 * 1024 * 1024, // 4 MB
        }
    }
}

/// HTTPS subscription fetcher (hyper + rustls).
pub struct HttpFetcher {
    config: FetcherConfig,
}

impl HttpFetcher {
    /// Create a fetcher with the given configuration
    pub fn new(config: FetcherConfig) -> Self {
        Self { config }
    }

    /// Create with default configuration
    pub fn with_defaults() -> Self {
        Self::new(FetcherConfig::default())
    }

    async fn fetch_body(&self, url: &Url) -> Result<Vec<u8>, FetchError> {
        let host = url
            .host_str()
            .ok_or_else(|| FetchError::InvalidInput("url has no host".to_string()))?
            .to_string();
        let is_https = match url.scheme() {
            "https" => true,
            "http" => false,
            other => {
                return Err(FetchError::InvalidInput(format!(
                    "unsupported scheme: {other}"
                )));
            }
        };
        let port = url.port().unwrap_or(if is_https { 443 } else { 80 });

        let uri: Uri = url
            .as_str()
            .parse()
            .map_err(|e: hyper::http::uri::InvalidUri| FetchError::InvalidInput(e.to_string()))?;

        let request = Request::builder()
            .method(Method::GET)
            .uri(&uri)
            .header(USER_AGENT, &self.config.user_agent)
            .header(ACCEPT, "application/json")
            .header("Host", &host)
            .body(Empty::<Bytes>::new())
            .map_err(|e| FetchError::Network(e.to_string()))?;

        let stream = TcpStream::connect((host.as_str(), port))
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        let response = if is_https {
            let mut root_store = rustls::RootCertStore::empty();
            root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

            let tls_config = ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth();

            let connector = TlsConnector::from(Arc::new(tls_config));
            let server_name = rustls::pki_types::ServerName::try_from(host.clone())
                .map_err(|_| FetchError::InvalidInput("invalid server name".to_string()))?;

            let tls_stream = connector
                .connect(server_name, stream)
                .await
                .map_err(|e| FetchError::Network(e.to_string()))?;

            let io = hyper_util::rt::TokioIo::new(tls_stream);
            let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
                .await
                .map_err(|e| FetchError::Network(e.to_string()))?;
            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    warn!("subscription connection error: {}", e);
                }
            });

            sender
                .send_request(request)
                .await
                .map_err(|e| FetchError::Network(e.to_string()))?
        } else {
            let io = hyper_util::rt::TokioIo::new(stream);
            let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
                .await
                .map_err(|e| FetchError::Network(e.to_string()))?;
            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    warn!("subscription connection error: {}", e);
                }
            });

            sender
                .send_request(request)
                .await
                .map_err(|e| FetchError::Network(e.to_string()))?
        };

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Network(format!("panel returned {status}")));
        }

        // The cap is enforced per frame, before buffering, so a runaway
        // response cannot exhaust memory.
        let mut body = response.into_body();
        let mut bytes = Vec::new();
        while let Some(frame) = body.frame().await {
            let frame = frame.map_err(|e| FetchError::Network(e.to_string()))?;
            if let Some(chunk) = frame.data_ref() {
                if bytes.len() + chunk.len() > self.config.max_body_size {
                    return Err(FetchError::Network(format!(
                        "response exceeds {} bytes",
                        self.config.max_body_size
                    )));
                }
                bytes.extend_from_slice(chunk);
            }
        }

        debug!(bytes = bytes.len(), %status, "subscription document fetched");
        Ok(bytes)
    }
}

#[async_trait]
impl SubscriptionFetcher for HttpFetcher {
    async fn fetch(&self, url: &Url) -> Result<SubscriptionPayload, FetchError> {
        let body = tokio::time::timeout(self.config.timeout, self.fetch_body(url))
            .await
            .map_err(|_| FetchError::Timeout(self.config.timeout))??;

        parse_payload(&body)
    }
}
