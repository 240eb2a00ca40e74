//! HTTP clients used by the proxy
//!
//! Plain-HTTP backends and internet pass-through share one pooled client.
//! HTTPS backends get a one-shot TLS connection trusting the local CA, since
//! they only ever present a `localhost` certificate.

use crate::config::ProxyDefaults;
use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderName, HeaderValue};
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Headers meaningful only between the client and the proxy
const PROXY_HOP_HEADERS: [&str; 2] = ["proxy-connection", "proxy-authorization"];

/// Error type for connection pool operations
#[derive(Debug, Error)]
pub enum PoolError {
    /// Error from the pooled HTTP client
    #[error("Client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    /// Could not reach or handshake with a TLS backend
    #[error("Connect error: {0}")]
    Connect(std::io::Error),
    /// HTTP error on a one-shot backend connection
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),
    /// Error building a request
    #[error("Request build error: {0}")]
    RequestBuild(String),
}

/// Statistics for the connection pool
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Requests forwarded to local backends
    pub backend_requests: AtomicU64,
    /// Requests passed through to other hosts
    pub passthrough_requests: AtomicU64,
}

impl PoolStats {
    pub fn record_backend(&self) {
        self.backend_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_passthrough(&self) {
        self.passthrough_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_backend_requests(&self) -> u64 {
        self.backend_requests.load(Ordering::Relaxed)
    }

    pub fn get_passthrough_requests(&self) -> u64 {
        self.passthrough_requests.load(Ordering::Relaxed)
    }
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

impl From<&ProxyDefaults> for PoolConfig {
    fn from(defaults: &ProxyDefaults) -> Self {
        Self {
            max_idle_per_host: defaults.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(defaults.pool_idle_timeout_secs),
        }
    }
}

pub struct ConnectionPool {
    client: Client<HttpConnector, Incoming>,
    stats: Arc<PoolStats>,
    config: PoolConfig,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.config)
            .field("stats", &self.stats)
            .finish()
    }
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Connection pool initialized"
        );

        Self {
            client,
            stats: Arc::new(PoolStats::default()),
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Forward a request to a plain-HTTP backend on `127.0.0.1:port`.
    /// The `Host` header is kept as sent by the client.
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
        port: u16,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, PoolError> {
        let uri = format!("http://127.0.0.1:{}{}", port, path_and_query(req.uri()));
        let backend_req = rebuild(req, &uri)?;

        self.stats.record_backend();
        let response = self.client.request(backend_req).await?;
        Ok(box_response(response))
    }

    /// Pass a proxied (absolute-form) request through unmodified
    pub async fn forward(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, PoolError> {
        let uri = req.uri().to_string();
        let outbound = rebuild(req, &uri)?;

        self.stats.record_passthrough();
        let response = self.client.request(outbound).await?;
        Ok(box_response(response))
    }

    /// Forward a request to an HTTPS backend on `127.0.0.1:port`, verifying
    /// its certificate for `localhost` with `tls`.
    pub async fn send_tls_request(
        &self,
        req: Request<Incoming>,
        port: u16,
        tls: Arc<ClientConfig>,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, PoolError> {
        let stream = TcpStream::connect(("127.0.0.1", port))
            .await
            .map_err(PoolError::Connect)?;
        let server_name = ServerName::try_from("localhost")
            .map_err(|e| PoolError::Connect(std::io::Error::new(std::io::ErrorKind::InvalidInput, e)))?;
        let stream = TlsConnector::from(tls)
            .connect(server_name, stream)
            .await
            .map_err(PoolError::Connect)?;

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(port, error = %e, "Backend TLS connection closed with error");
            }
        });

        let path = path_and_query(req.uri()).to_string();
        let backend_req = rebuild(req, &path)?;

        self.stats.record_backend();
        let response = sender.send_request(backend_req).await?;
        Ok(box_response(response))
    }
}

fn path_and_query(uri: &Uri) -> &str {
    uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
}

fn rebuild(req: Request<Incoming>, uri: &str) -> Result<Request<Incoming>, PoolError> {
    let (parts, body) = req.into_parts();
    let mut builder = Request::builder()
        .method(parts.method)
        .version(hyper::Version::HTTP_11)
        .uri(uri);

    for (key, value) in parts.headers.iter() {
        if is_proxy_hop_header(key) {
            continue;
        }
        builder = builder.header(key, value);
    }

    builder
        .body(body)
        .map_err(|e| PoolError::RequestBuild(e.to_string()))
}

fn is_proxy_hop_header(name: &HeaderName) -> bool {
    PROXY_HOP_HEADERS.contains(&name.as_str())
}

fn box_response(response: Response<Incoming>) -> Response<BoxBody<Bytes, hyper::Error>> {
    let (parts, body) = response.into_parts();
    Response::from_parts(parts, body.boxed())
}

/// Set `name` unless the client already sent it
pub fn set_header_if_absent(req: &mut Request<Incoming>, name: &'static str, value: &str) {
    if req.headers().contains_key(name) {
        return;
    }
    if let Ok(value) = HeaderValue::from_str(value) {
        req.headers_mut().insert(name, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.max_idle_per_host, 10);
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
    }

    #[test]
    fn test_pool_config_from_proxy_defaults() {
        let defaults = ProxyDefaults {
            pool_max_idle_per_host: 3,
            pool_idle_timeout_secs: 15,
            ..ProxyDefaults::default()
        };
        let config = PoolConfig::from(&defaults);
        assert_eq!(config.max_idle_per_host, 3);
        assert_eq!(config.idle_timeout, Duration::from_secs(15));
    }

    #[test]
    fn test_pool_stats() {
        let stats = PoolStats::default();
        assert_eq!(stats.get_backend_requests(), 0);
        assert_eq!(stats.get_passthrough_requests(), 0);

        stats.record_backend();
        stats.record_backend();
        stats.record_passthrough();
        assert_eq!(stats.get_backend_requests(), 2);
        assert_eq!(stats.get_passthrough_requests(), 1);
    }

    #[test]
    fn test_proxy_hop_headers() {
        assert!(is_proxy_hop_header(&HeaderName::from_static("proxy-connection")));
        assert!(!is_proxy_hop_header(&HeaderName::from_static("x-forwarded-port")));
    }

    #[test]
    fn test_pool_error_display() {
        let connect = PoolError::Connect(std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"));
        assert_eq!(connect.to_string(), "Connect error: refused");
        assert!(std::error::Error::source(&connect).is_none());

        let build = PoolError::RequestBuild("bad uri".to_string());
        assert_eq!(build.to_string(), "Request build error: bad uri");
    }
}
