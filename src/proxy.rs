//! Forward proxy for the development TLD.
//!
//! Browsers are pointed at this proxy with the auto-config script served at
//! `/proxy.pac`. Requests for the TLD are routed to the local web server of
//! the project attached to the hostname; everything else passes through.
//!
//! HTTPS arrives as `CONNECT host:443`. When the project is running the
//! tunnel is intercepted: the client handshake is terminated with a
//! certificate from the [`CertCache`] and the decrypted stream is spliced
//! to the backend. When it is not, the tunnel is still accepted and the
//! client gets an explanatory page instead of a handshake failure.

use crate::certs::CertCache;
use crate::domains::DomainRegistry;
use crate::error::{html_error_response, text_error_response, Error, ProxyErrorCode, Result};
use crate::pages;
use crate::pool::{set_header_if_absent, ConnectionPool, PoolConfig};
use crate::projects::merge_configured_and_running;
use crate::record::{ProcessRecord, RecordStore};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, error, info, warn};

const X_FORWARDED_PORT: &str = "x-forwarded-port";

/// Sent when a plaintext client talks to an intercepted TLS tunnel
const PLAINTEXT_ON_TLS_RESPONSE: &[u8] =
    b"HTTP/1.0 400 Bad Request\r\n\r\nClient sent an HTTP request to an HTTPS server.\n";
const BAD_GATEWAY_RESPONSE: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";

/// First byte of a TLS handshake record
const TLS_HANDSHAKE: u8 = 0x16;

type ProxyResponse = Response<BoxBody<Bytes, hyper::Error>>;

struct ProxyState {
    registry: Arc<DomainRegistry>,
    records: RecordStore,
    certs: Option<Arc<CertCache>>,
    pool: ConnectionPool,
    home: Option<PathBuf>,
}

pub struct ProxyServer {
    bind_addr: SocketAddr,
    registry: Arc<DomainRegistry>,
    records: RecordStore,
    certs: Option<Arc<CertCache>>,
    pool_config: PoolConfig,
    home: Option<PathBuf>,
    shutdown_rx: watch::Receiver<bool>,
    watch_registry: bool,
}

impl ProxyServer {
    /// Proxy listening on every interface at the registry's port
    pub fn new(
        registry: Arc<DomainRegistry>,
        records: RecordStore,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], registry.port())),
            registry,
            records,
            certs: None,
            pool_config: PoolConfig::default(),
            home: None,
            shutdown_rx,
            watch_registry: true,
        }
    }

    /// Enable TLS interception
    pub fn with_certs(mut self, certs: Arc<CertCache>) -> Self {
        self.certs = Some(certs);
        self
    }

    pub fn with_pool_config(mut self, config: PoolConfig) -> Self {
        self.pool_config = config;
        self
    }

    /// Home directory, shortened to `~` on the index page
    pub fn with_home_dir(mut self, home: Option<PathBuf>) -> Self {
        self.home = home;
        self
    }

    /// Reload the registry when its file changes (default: on)
    pub fn with_registry_watch(mut self, enabled: bool) -> Self {
        self.watch_registry = enabled;
        self
    }

    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }

    pub fn tls_enabled(&self) -> bool {
        self.certs.is_some()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.run_with_listener(listener).await
    }

    /// Serve connections from an already bound listener until shutdown
    pub async fn run_with_listener(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(addr = %addr, tls = self.tls_enabled(), tld = %self.registry.tld(), "Proxy server listening");

        let registry_watch = if self.watch_registry {
            match self.registry.watch() {
                Ok(handle) => Some(handle),
                Err(e) => {
                    warn!(error = %e, "Unable to watch the domain registry, changes need a restart");
                    None
                }
            }
        } else {
            None
        };

        let state = Arc::new(ProxyState {
            registry: self.registry,
            records: self.records,
            certs: self.certs,
            pool: ConnectionPool::new(self.pool_config),
            home: self.home,
        });

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let state = Arc::clone(&state);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, peer, state).await {
                                    debug!(peer = %peer, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        let stats = state.pool.stats();
                        info!(
                            backend_requests = stats.get_backend_requests(),
                            passthrough_requests = stats.get_passthrough_requests(),
                            "Proxy server shutting down"
                        );
                        break;
                    }
                }
            }
        }

        if let Some(handle) = registry_watch {
            handle.abort();
        }
        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    state: Arc<ProxyState>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&state);
        async move { handle_request(req, state, peer).await }
    });

    http1::Builder::new()
        .preserve_header_case(true)
        .serve_connection(io, service)
        .with_upgrades()
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    state: Arc<ProxyState>,
    peer: SocketAddr,
) -> Result<ProxyResponse, hyper::Error> {
    if req.method() == Method::CONNECT {
        return Ok(handle_connect(req, state).await);
    }

    // Origin-form: the client talks to the proxy itself
    if req.uri().authority().is_none() {
        return Ok(serve_local(&req, &state));
    }

    let Some((host, port)) = request_target(&req) else {
        return Ok(text_error_response(ProxyErrorCode::NotFound, "Not Found\n"));
    };
    debug!(peer = %peer, method = %req.method(), uri = %req.uri(), "Proxy request");

    if !state.registry.tld_matches(&host) {
        return Ok(match state.pool.forward(req).await {
            Ok(response) => response,
            Err(e) => {
                warn!(host = %host, error = %e, "Pass-through request failed");
                text_error_response(ProxyErrorCode::ConnectionFailed, format!("{}\n", e))
            }
        });
    }

    Ok(handle_tld_request(req, &state, &host, port, "http").await)
}

/// Pages served by the proxy itself
fn serve_local(req: &Request<Incoming>, state: &ProxyState) -> ProxyResponse {
    if !req.headers().contains_key(hyper::header::HOST) {
        return text_error_response(
            ProxyErrorCode::MissingHostHeader,
            "Cannot handle requests without a Host header, e.g. HTTP 1.0\n",
        );
    }

    match req.uri().path() {
        "/proxy.pac" => {
            let registry = &state.registry;
            let script = pages::pac_script(&registry.tld(), registry.host(), registry.port());
            full_response(StatusCode::OK, "application/x-ns-proxy-autoconfig", script)
        }
        "/" => {
            let projects =
                merge_configured_and_running(&state.registry, &state.records, state.home.as_deref());
            full_response(StatusCode::OK, "text/html; charset=utf-8", pages::index_page(&projects))
        }
        _ => text_error_response(ProxyErrorCode::NotFound, "Not Found\n"),
    }
}

/// Whether the port is the standard one for the scheme
fn standard_port(scheme: &str, port: u16) -> bool {
    match scheme {
        "https" => port == 443,
        _ => port == 80,
    }
}

/// Running project serving a TLD hostname
fn resolve(registry: &DomainRegistry, records: &RecordStore, host: &str) -> Result<ProcessRecord> {
    let dir = registry.get_dir(host).ok_or_else(|| Error::UnregisteredDomain {
        host: host.to_string(),
    })?;
    let record = records.locate(&dir, &[]);
    if !record.is_running() {
        return Err(Error::BackendNotRunning {
            host: host.to_string(),
            dir,
        });
    }
    Ok(record)
}

/// Guidance page for a hostname that cannot be routed
fn guidance_response(error: &Error, tld: &str) -> ProxyResponse {
    match error {
        Error::UnregisteredDomain { host } => html_error_response(
            ProxyErrorCode::UnregisteredDomain,
            "Proxy Error",
            &pages::unregistered_domain_guidance(host, tld),
        ),
        Error::BackendNotRunning { host, dir } => html_error_response(
            ProxyErrorCode::BackendNotRunning,
            "Proxy Error",
            &pages::backend_not_running_guidance(host, dir),
        ),
        other => text_error_response(ProxyErrorCode::ConnectionFailed, format!("{}\n", other)),
    }
}

/// Route a request for a TLD hostname to its project or explain why not
async fn handle_tld_request(
    mut req: Request<Incoming>,
    state: &ProxyState,
    host: &str,
    port: u16,
    scheme: &str,
) -> ProxyResponse {
    if !standard_port(scheme, port) {
        return html_error_response(
            ProxyErrorCode::WrongPort,
            "Proxy Error",
            &pages::wrong_port_guidance(scheme, port),
        );
    }
    let record = match resolve(&state.registry, &state.records, host) {
        Ok(record) => record,
        Err(e) => {
            debug!(host = %host, error = %e, "Hostname cannot be routed");
            return guidance_response(&e, &state.registry.tld());
        }
    };

    set_header_if_absent(&mut req, X_FORWARDED_PORT, &port.to_string());

    let result = match (&state.certs, record.scheme.as_str()) {
        (Some(certs), "https") => match certs.backend_client_config(b"http/1.1") {
            Ok(tls) => state.pool.send_tls_request(req, record.port, tls).await,
            Err(e) => {
                error!(host = %host, error = %e, "Unable to build backend TLS configuration");
                return text_error_response(ProxyErrorCode::ConnectionFailed, "Bad Gateway\n");
            }
        },
        _ => state.pool.send_request(req, record.port).await,
    };

    match result {
        Ok(response) => response,
        Err(e) => {
            warn!(host = %host, port = record.port, error = %e, "Failed to reach web server");
            text_error_response(ProxyErrorCode::ConnectionFailed, "Bad Gateway\n")
        }
    }
}

/// How a CONNECT tunnel is handled
enum ConnectAction {
    /// Opaque tunnel to an address
    Tunnel(String),
    /// Terminate TLS and splice to the project's web server
    Intercept(ProcessRecord),
    /// Answer locally with an explanatory page
    Explain,
}

async fn handle_connect(req: Request<Incoming>, state: Arc<ProxyState>) -> ProxyResponse {
    let Some(authority) = req.uri().authority().cloned() else {
        return text_error_response(ProxyErrorCode::MissingHostHeader, "CONNECT requires host:port\n");
    };
    let host = authority.host().to_lowercase();
    let port = authority.port_u16().unwrap_or(443);

    let action = if !state.registry.tld_matches(&host) {
        ConnectAction::Tunnel(authority.to_string())
    } else {
        let scheme = if port == 80 { "http" } else { "https" };
        let resolved = if standard_port(scheme, port) {
            resolve(&state.registry, &state.records, &host).ok()
        } else {
            None
        };
        match resolved {
            Some(record) if port == 80 => ConnectAction::Tunnel(format!("127.0.0.1:{}", record.port)),
            Some(record) if state.certs.is_some() => ConnectAction::Intercept(record),
            Some(_) => {
                warn!(host = %host, "TLS interception disabled, rejecting tunnel");
                return text_error_response(ProxyErrorCode::ConnectionFailed, "TLS interception is not available\n");
            }
            None => ConnectAction::Explain,
        }
    };

    // Connect before answering so the client sees a 502 rather than a dead tunnel
    let backend = match &action {
        ConnectAction::Tunnel(addr) => match TcpStream::connect(addr.as_str()).await {
            Ok(stream) => Some(stream),
            Err(e) => {
                debug!(addr = %addr, error = %e, "Tunnel target unreachable");
                return text_error_response(ProxyErrorCode::ConnectionFailed, "Bad Gateway\n");
            }
        },
        _ => None,
    };

    tokio::spawn(async move {
        let upgraded = match hyper::upgrade::on(req).await {
            Ok(upgraded) => TokioIo::new(upgraded),
            Err(e) => {
                debug!(host = %host, error = %e, "CONNECT upgrade failed");
                return;
            }
        };
        match (action, backend) {
            (ConnectAction::Tunnel(addr), Some(backend)) => splice(upgraded, backend, &addr).await,
            (ConnectAction::Intercept(record), _) => intercept(upgraded, &state, &host, record).await,
            (ConnectAction::Explain, _) => explain(upgraded, state, host, port).await,
            (ConnectAction::Tunnel(_), None) => {}
        }
    });

    let mut response = Response::new(empty_body());
    *response.status_mut() = StatusCode::OK;
    response
}

/// Terminate the client's TLS session and splice it to the web server
async fn intercept<S>(client: S, state: &ProxyState, host: &str, record: ProcessRecord)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let Some(certs) = state.certs.as_ref() else {
        return;
    };

    let (prefix, mut client) = match sniff(client).await {
        Ok(sniffed) => sniffed,
        Err(e) => {
            debug!(host = %host, error = %e, "Client closed tunnel before handshake");
            return;
        }
    };
    if looks_like_http(&prefix) {
        debug!(host = %host, "Plaintext request on an intercepted TLS tunnel");
        let _ = client.write_all(PLAINTEXT_ON_TLS_RESPONSE).await;
        let _ = client.shutdown().await;
        return;
    }

    let backend_tls = record.scheme == "https";
    let alpn: &[&[u8]] = if backend_tls {
        &[b"h2", b"http/1.1", b"http/1.0"]
    } else {
        &[b"http/1.1", b"http/1.0"]
    };
    let server_config = match certs.server_config(host, alpn) {
        Ok(config) => config,
        Err(e) => {
            warn!(host = %host, error = %e, "Unable to build TLS configuration");
            return;
        }
    };
    let mut client = match TlsAcceptor::from(server_config).accept(client).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!(host = %host, error = %e, "TLS handshake with client failed");
            return;
        }
    };
    let negotiated = client
        .get_ref()
        .1
        .alpn_protocol()
        .map(|p| p.to_vec())
        .unwrap_or_else(|| b"http/1.1".to_vec());
    debug!(host = %host, port = record.port, alpn = %String::from_utf8_lossy(&negotiated), "Intercepting TLS tunnel");

    let backend = match TcpStream::connect(("127.0.0.1", record.port)).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(host = %host, port = record.port, error = %e, "Web server refused the connection");
            bad_gateway(&mut client).await;
            return;
        }
    };

    if !backend_tls {
        splice(client, backend, host).await;
        return;
    }

    let backend = match connect_backend_tls(certs, &negotiated, backend).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(host = %host, port = record.port, error = %e, "TLS handshake with web server failed");
            bad_gateway(&mut client).await;
            return;
        }
    };
    splice(client, backend, host).await;
}

async fn connect_backend_tls(
    certs: &CertCache,
    alpn: &[u8],
    stream: TcpStream,
) -> io::Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let config = certs
        .backend_client_config(alpn)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
    let server_name = ServerName::try_from("localhost")
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    TlsConnector::from(config).connect(server_name, stream).await
}

async fn bad_gateway<S: AsyncWrite + Unpin>(client: &mut S) {
    let _ = client.write_all(BAD_GATEWAY_RESPONSE).await;
    let _ = client.shutdown().await;
}

/// Serve explanatory pages inside a tunnel whose project cannot be reached.
/// TLS clients get a certificate when interception is available.
async fn explain<S>(client: S, state: Arc<ProxyState>, host: String, port: u16)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (prefix, client) = match sniff(client).await {
        Ok(sniffed) => sniffed,
        Err(e) => {
            debug!(host = %host, error = %e, "Client closed tunnel");
            return;
        }
    };

    if prefix.first() != Some(&TLS_HANDSHAKE) {
        serve_explanations(client, state, host, port, "http").await;
        return;
    }

    let Some(certs) = state.certs.clone() else {
        debug!(host = %host, "TLS client in tunnel but interception is disabled");
        return;
    };
    let server_config = match certs.server_config(&host, &[b"http/1.1", b"http/1.0"]) {
        Ok(config) => config,
        Err(e) => {
            warn!(host = %host, error = %e, "Unable to build TLS configuration");
            return;
        }
    };
    match TlsAcceptor::from(server_config).accept(client).await {
        Ok(stream) => serve_explanations(stream, state, host, port, "https").await,
        Err(e) => debug!(host = %host, error = %e, "TLS handshake with client failed"),
    }
}

async fn serve_explanations<S>(stream: S, state: Arc<ProxyState>, host: String, port: u16, scheme: &'static str)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&state);
        let host = host.clone();
        async move { Ok::<_, hyper::Error>(handle_tld_request(req, &state, &host, port, scheme).await) }
    });

    if let Err(e) = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .await
    {
        debug!(error = %e, "Tunnel connection error");
    }
}

/// Copy both directions until each side closes, shutting down the write
/// half of the other side as its read half reaches EOF.
async fn splice<A, B>(client: A, backend: B, target: &str)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut backend_read, mut backend_write) = tokio::io::split(backend);

    let upstream = async {
        let copied = tokio::io::copy(&mut client_read, &mut backend_write).await;
        let _ = backend_write.shutdown().await;
        copied
    };
    let downstream = async {
        let copied = tokio::io::copy(&mut backend_read, &mut client_write).await;
        let _ = client_write.shutdown().await;
        copied
    };

    match tokio::join!(upstream, downstream) {
        (Ok(sent), Ok(received)) => debug!(target, sent, received, "Tunnel closed"),
        (Err(e), _) | (_, Err(e)) => debug!(target, error = %e, "Tunnel closed with error"),
    }
}

/// Read the first bytes of a stream without consuming them
async fn sniff<S>(mut stream: S) -> io::Result<(Vec<u8>, Rewind<S>)>
where
    S: AsyncRead + Unpin,
{
    let mut prefix = vec![0u8; 5];
    let mut filled = 0;
    while filled < prefix.len() {
        let n = stream.read(&mut prefix[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    if filled == 0 {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "empty tunnel"));
    }
    prefix.truncate(filled);
    Ok((prefix.clone(), Rewind::new(stream, prefix)))
}

/// Whether the first bytes of a would-be TLS stream are an HTTP request line
fn looks_like_http(prefix: &[u8]) -> bool {
    matches!(prefix, b"GET /" | b"HEAD " | b"POST " | b"PUT /" | b"OPTIO")
}

/// Stream replaying already-read bytes before reading from the inner stream
struct Rewind<S> {
    prefix: Option<Bytes>,
    inner: S,
}

impl<S> Rewind<S> {
    fn new(inner: S, prefix: Vec<u8>) -> Self {
        Self {
            prefix: Some(Bytes::from(prefix)),
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewind<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Some(mut prefix) = self.prefix.take() {
            if !prefix.is_empty() {
                let n = prefix.len().min(buf.remaining());
                buf.put_slice(&prefix.split_to(n));
                if !prefix.is_empty() {
                    self.prefix = Some(prefix);
                }
                return Poll::Ready(Ok(()));
            }
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewind<S> {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Host and port an absolute-form request targets; the port defaults by scheme
fn request_target(req: &Request<Incoming>) -> Option<(String, u16)> {
    let default_port = if req.uri().scheme_str() == Some("https") { 443 } else { 80 };
    let authority = req.uri().authority()?;
    Some((
        authority.host().to_lowercase(),
        authority.port_u16().unwrap_or(default_port),
    ))
}

fn full_response(status: StatusCode, content_type: &'static str, body: String) -> ProxyResponse {
    let mut response = Response::new(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed());
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(hyper::header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn empty_body() -> BoxBody<Bytes, hyper::Error> {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}
