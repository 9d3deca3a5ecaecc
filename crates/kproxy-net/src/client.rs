//! Proxy-Aware HTTP Client
//!
//! Uses hyper's HTTP/1.1 connection API over tokio. Every request leaves
//! through the configured forward proxy:
//! - `https://` targets: tunnel (CONNECT or SOCKS5), then TLS with rustls
//! - `http://` targets via an HTTP proxy: absolute-form request to the proxy
//! - `http://` targets via SOCKS5: tunnel, then a plain request
//!
//! Connection driver tasks are tracked so [`ProxyClient::close`] can tear
//! them all down, which is the client's notion of evicting its pool.

use crate::pinning::{self, CertificatePin};
use crate::proxy::{ProxyEndpoint, ProxyKind};
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HOST, HeaderMap, PROXY_AUTHORIZATION, USER_AGENT};
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use rustls::ClientConfig;
use rustls::pki_types::ServerName;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};
use url::Url;

/// HTTP client errors
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Proxy rejected tunnel request with status {0}")]
    ProxyRejected(u16),

    #[error("Proxy protocol error: {0}")]
    ProxyProtocol(String),

    #[error("Request timeout")]
    Timeout,

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Body read error: {0}")]
    BodyError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// HTTP client configuration
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Time allowed to reach the proxy, finish its handshake and TLS
    pub connect_timeout: Duration,
    /// Time allowed for response headers and for each body chunk
    pub read_timeout: Duration,
    /// User-Agent string
    pub user_agent: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(30),
            user_agent: format!("kproxy/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Fully buffered HTTP response
#[derive(Debug)]
pub struct Response {
    /// Status code
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
    /// Response body
    pub body: Vec<u8>,
    /// Time to first byte
    pub ttfb: Duration,
    /// Total download time
    pub total_time: Duration,
}

impl Response {
    /// Check if response was successful (2xx)
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Get body as string
    pub fn text(&self) -> Result<String, std::string::FromUtf8Error> {
        String::from_utf8(self.body.clone())
    }
}

/// Response whose body is read chunk by chunk
pub struct BodyStream {
    status: StatusCode,
    body: Incoming,
    read_timeout: Duration,
}

impl BodyStream {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Next data chunk, or `None` once the body is exhausted
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, HttpError> {
        loop {
            let frame = timeout(self.read_timeout, self.body.frame())
                .await
                .map_err(|_| HttpError::Timeout)?;

            match frame {
                None => return Ok(None),
                Some(Ok(frame)) => {
                    // Trailers carry no payload
                    if let Ok(data) = frame.into_data() {
                        return Ok(Some(data));
                    }
                }
                Some(Err(e)) => return Err(HttpError::BodyError(e.to_string())),
            }
        }
    }
}

/// Client statistics
#[derive(Debug, Default)]
pub struct ClientStats {
    pub requests_made: AtomicU64,
    pub requests_failed: AtomicU64,
    pub bytes_downloaded: AtomicU64,
}

/// HTTP client that routes every request through one forward proxy
pub struct ProxyClient {
    /// Upstream proxy
    endpoint: ProxyEndpoint,
    /// Configuration
    config: HttpClientConfig,
    /// TLS configuration (pinned when the endpoint carries a pin)
    tls: Arc<ClientConfig>,
    /// Connection driver tasks
    connections: Mutex<JoinSet<()>>,
    /// Statistics
    stats: ClientStats,
}

impl ProxyClient {
    /// Create a client for `endpoint`
    pub fn new(endpoint: ProxyEndpoint, config: HttpClientConfig) -> Result<Self, HttpError> {
        let pin: Option<(&str, CertificatePin)> = endpoint.pin.map(|pin| (endpoint.host.as_str(), pin));
        let tls = pinning::tls_config(pin)?;

        info!(
            "Proxy client initialized (proxy: {}, auth: {}, pinned: {}, timeout: {:?})",
            endpoint,
            endpoint.credentials.is_some(),
            endpoint.pin.is_some(),
            config.read_timeout
        );

        Ok(Self {
            endpoint,
            config,
            tls,
            connections: Mutex::new(JoinSet::new()),
            stats: ClientStats::default(),
        })
    }

    /// Create with default configuration
    pub fn with_defaults(endpoint: ProxyEndpoint) -> Result<Self, HttpError> {
        Self::new(endpoint, HttpClientConfig::default())
    }

    /// Perform a GET request and buffer the body
    pub async fn get(&self, url: &str) -> Result<Response, HttpError> {
        let start = Instant::now();
        let response = self.send(url).await?;
        let ttfb = start.elapsed();

        let status = response.status();
        let headers = response.headers().clone();
        let collected = timeout(self.config.read_timeout, response.into_body().collect())
            .await
            .map_err(|_| HttpError::Timeout)?
            .map_err(|e| HttpError::BodyError(e.to_string()))?;
        let body = collected.to_bytes().to_vec();

        self.stats
            .bytes_downloaded
            .fetch_add(body.len() as u64, Ordering::Relaxed);

        Ok(Response {
            status,
            headers,
            body,
            ttfb,
            total_time: start.elapsed(),
        })
    }

    /// Perform a GET request and hand back the body as a stream
    pub async fn get_streaming(&self, url: &str) -> Result<BodyStream, HttpError> {
        let response = self.send(url).await?;

        Ok(BodyStream {
            status: response.status(),
            body: response.into_body(),
            read_timeout: self.config.read_timeout,
        })
    }

    /// Abort every open connection
    pub async fn close(&self) {
        let mut connections = self.connections.lock().await;
        let open = connections.len();
        connections.shutdown().await;
        debug!("Proxy client closed ({} connections)", open);
    }

    /// Get client statistics (requests, failures, bytes)
    pub fn stats(&self) -> (u64, u64, u64) {
        (
            self.stats.requests_made.load(Ordering::Relaxed),
            self.stats.requests_failed.load(Ordering::Relaxed),
            self.stats.bytes_downloaded.load(Ordering::Relaxed),
        )
    }

    async fn send(&self, url: &str) -> Result<hyper::Response<Incoming>, HttpError> {
        let start = Instant::now();
        self.stats.requests_made.fetch_add(1, Ordering::Relaxed);
        debug!("--> GET {} via {}", url, self.endpoint);

        let result = self.send_inner(url).await;
        match &result {
            Ok(response) => debug!(
                "<-- {} {} ({}ms)",
                response.status().as_u16(),
                url,
                start.elapsed().as_millis()
            ),
            Err(e) => {
                self.stats.requests_failed.fetch_add(1, Ordering::Relaxed);
                debug!("<-- HTTP FAILED: {} ({})", e, url);
            }
        }
        result
    }

    async fn send_inner(&self, url: &str) -> Result<hyper::Response<Incoming>, HttpError> {
        let target = Url::parse(url).map_err(|e| HttpError::InvalidUrl(e.to_string()))?;
        let host_header = target
            .host_str()
            .ok_or_else(|| HttpError::InvalidUrl("No host in URL".to_string()))?
            .to_string();
        let host = host_header
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = target
            .port_or_known_default()
            .ok_or_else(|| HttpError::InvalidUrl("No port in URL".to_string()))?;
        let host_header = match target.port() {
            Some(p) => format!("{}:{}", host_header, p),
            None => host_header,
        };

        match target.scheme() {
            "https" => {
                let stream = timeout(self.config.connect_timeout, async {
                    let tcp = self.endpoint.connect(&host, port).await?;
                    self.tls_handshake(&host, tcp).await
                })
                .await
                .map_err(|_| HttpError::Timeout)??;

                let request = self.build_request(origin_form(&target), &host_header, false)?;
                self.exchange(stream, request).await
            }
            "http" if self.endpoint.kind == ProxyKind::Http => {
                let stream = timeout(self.config.connect_timeout, self.endpoint.connect_proxy())
                    .await
                    .map_err(|_| HttpError::Timeout)??;

                let request = self.build_request(target.as_str().to_string(), &host_header, true)?;
                self.exchange(stream, request).await
            }
            "http" => {
                let stream = timeout(self.config.connect_timeout, self.endpoint.connect(&host, port))
                    .await
                    .map_err(|_| HttpError::Timeout)??;

                let request = self.build_request(origin_form(&target), &host_header, false)?;
                self.exchange(stream, request).await
            }
            other => Err(HttpError::InvalidUrl(format!("Unsupported scheme: {}", other))),
        }
    }

    /// Build a GET request; `to_proxy` marks requests the proxy reads itself
    fn build_request(
        &self,
        uri: String,
        host: &str,
        to_proxy: bool,
    ) -> Result<Request<Empty<Bytes>>, HttpError> {
        let mut builder = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .header(HOST, host)
            .header(USER_AGENT, &self.config.user_agent);

        if to_proxy {
            if let Some(auth) = self.endpoint.proxy_authorization() {
                builder = builder.header(PROXY_AUTHORIZATION, auth);
            }
        }

        builder
            .body(Empty::<Bytes>::new())
            .map_err(|e| HttpError::HttpError(e.to_string()))
    }

    async fn tls_handshake<S>(
        &self,
        host: &str,
        stream: S,
    ) -> Result<tokio_rustls::client::TlsStream<S>, HttpError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let connector = TlsConnector::from(self.tls.clone());
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| HttpError::TlsError("Invalid server name".to_string()))?;

        connector
            .connect(server_name, stream)
            .await
            .map_err(|e| HttpError::TlsError(e.to_string()))
    }

    async fn exchange<S>(
        &self,
        io: S,
        request: Request<Empty<Bytes>>,
    ) -> Result<hyper::Response<Incoming>, HttpError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io))
            .await
            .map_err(|e| HttpError::HttpError(e.to_string()))?;

        {
            let mut connections = self.connections.lock().await;
            while connections.try_join_next().is_some() {}
            connections.spawn(async move {
                if let Err(e) = conn.await {
                    warn!("Connection error: {}", e);
                }
            });
        }

        timeout(self.config.read_timeout, sender.send_request(request))
            .await
            .map_err(|_| HttpError::Timeout)?
            .map_err(|e| HttpError::HttpError(e.to_string()))
    }
}

fn origin_form(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    }
}
