use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Proxy, Url};
use tracing::{debug, warn};

use crate::error::FetchError;
use crate::types::SocksProxy;

const DEFAULT_MAX_BYTES: usize = 10 * 1024 * 1024;

/// Retrieves the bytes at a URL.
///
/// When `proxy` is set the request must go through it; implementations
/// never fall back to a direct connection.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(
        &self,
        url: &str,
        proxy: Option<&SocksProxy>,
        timeout: Duration,
    ) -> Result<Vec<u8>, FetchError>;
}

/// Options for [`HttpFetcher`].
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Responses larger than this are rejected with [`FetchError::TooLarge`].
    pub max_bytes: usize,
    /// Upper bound on establishing a connection (including the proxy
    /// handshake). The per-request timeout still applies if it is shorter.
    pub connect_timeout: Duration,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_BYTES,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// HTTP(S) fetcher backed by `reqwest`.
///
/// A client is built per request so that proxy settings can never bleed
/// between endpoints. Environment proxy variables are ignored.
#[derive(Debug, Clone, Default)]
pub struct HttpFetcher {
    options: FetchOptions,
}

impl HttpFetcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_options(options: FetchOptions) -> Self {
        Self { options }
    }

    fn client(&self, proxy: Option<&SocksProxy>, timeout: Duration) -> Result<Client, FetchError> {
        let builder = Client::builder()
            .timeout(timeout)
            .connect_timeout(self.options.connect_timeout.min(timeout))
            .user_agent(concat!("gpgsync/", env!("CARGO_PKG_VERSION")));

        let builder = match proxy {
            Some(proxy) => {
                let proxy = Proxy::all(proxy.url()).map_err(|_| FetchError::ProxyUnreachable)?;
                builder.proxy(proxy)
            }
            None => builder.no_proxy(),
        };

        builder.build().map_err(|e| {
            warn!(error = %e, "failed to build HTTP client");
            FetchError::ConnectionFailed
        })
    }

    async fn fetch_inner(
        &self,
        client: Client,
        url: Url,
        proxied: bool,
    ) -> Result<Vec<u8>, FetchError> {
        let limit = self.options.max_bytes;
        let mut response = client
            .get(url)
            .send()
            .await
            .map_err(|e| classify_error(&e, proxied))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus(status.as_u16()));
        }

        if let Some(len) = response.content_length()
            && len > limit as u64
        {
            return Err(FetchError::TooLarge { limit });
        }

        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| classify_error(&e, proxied))?
        {
            if body.len() + chunk.len() > limit {
                return Err(FetchError::TooLarge { limit });
            }
            body.extend_from_slice(&chunk);
        }

        Ok(body)
    }
}

#[async_trait]
impl Fetch for HttpFetcher {
    async fn fetch(
        &self,
        url: &str,
        proxy: Option<&SocksProxy>,
        timeout: Duration,
    ) -> Result<Vec<u8>, FetchError> {
        let parsed = parse_http_url(url)?;
        let client = self.client(proxy, timeout)?;
        debug!(url = %parsed, proxied = proxy.is_some(), "fetching");

        tokio::time::timeout(timeout, self.fetch_inner(client, parsed, proxy.is_some()))
            .await
            .map_err(|_| FetchError::Timeout)?
    }
}

/// Parses `url`, accepting only `http` and `https`.
pub(crate) fn parse_http_url(url: &str) -> Result<Url, FetchError> {
    let parsed = Url::parse(url).map_err(|_| FetchError::InvalidUrl(url.to_string()))?;
    match parsed.scheme() {
        "http" | "https" if parsed.host_str().is_some() => Ok(parsed),
        _ => Err(FetchError::InvalidUrl(url.to_string())),
    }
}

fn classify_error(err: &reqwest::Error, proxied: bool) -> FetchError {
    if err.is_timeout() {
        return FetchError::Timeout;
    }
    if let Some(status) = err.status() {
        return FetchError::HttpStatus(status.as_u16());
    }
    // With a SOCKS proxy every connection is opened by the proxy, so any
    // failure to establish one is reported against it.
    if proxied && (err.is_connect() || err.is_request()) {
        return FetchError::ProxyUnreachable;
    }
    debug!(error = %err, "request failed");
    FetchError::ConnectionFailed
}

/// Host dialled to decide whether the network is up at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectivityCheck {
    pub host: String,
    pub port: u16,
    pub timeout: Duration,
}

impl Default for ConnectivityCheck {
    fn default() -> Self {
        Self {
            host: "www.example.com".to_string(),
            port: 80,
            timeout: Duration::from_secs(2),
        }
    }
}

/// Returns true if a TCP connection to the check host succeeds in time.
pub async fn internet_available(check: &ConnectivityCheck) -> bool {
    let connect = tokio::net::TcpStream::connect((check.host.as_str(), check.port));
    match tokio::time::timeout(check.timeout, connect).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            debug!(host = %check.host, error = %e, "connectivity check failed");
            false
        }
        Err(_) => {
            debug!(host = %check.host, "connectivity check timed out");
            false
        }
    }
}
