//! Integration tests for the devhost proxy

use std::sync::Arc;
use std::time::Duration;

use devhost::certs::{CertCache, CertificateAuthority, LocalAuthority};
use devhost::config::ProxyDefaults;
use devhost::domains::DomainRegistry;
use devhost::process::SystemProbe;
use devhost::proxy::ProxyServer;
use devhost::record::RecordStore;
use rustls::pki_types::ServerName;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::{TlsAcceptor, TlsConnector};

struct TestProxy {
    port: u16,
    registry: Arc<DomainRegistry>,
    records: RecordStore,
    ca: Arc<LocalAuthority>,
    _shutdown: watch::Sender<bool>,
    _tmp: TempDir,
}

impl TestProxy {
    async fn start() -> Self {
        let tmp = TempDir::new().unwrap();
        let registry = Arc::new(
            DomainRegistry::load(tmp.path().join("proxy.json"), &ProxyDefaults::default()).unwrap(),
        );
        let records = RecordStore::new(tmp.path(), Arc::new(SystemProbe), Duration::from_secs(1));
        let ca = Arc::new(LocalAuthority::load_or_create(&tmp.path().join("certs")).unwrap());
        let certs = Arc::new(CertCache::new(Arc::clone(&registry), ca.clone(), 16));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = ProxyServer::new(Arc::clone(&registry), records.clone(), shutdown_rx)
            .with_certs(certs)
            .with_registry_watch(false);
        tokio::spawn(server.run_with_listener(listener));

        Self {
            port,
            registry,
            records,
            ca,
            _shutdown: shutdown_tx,
            _tmp: tmp,
        }
    }

    /// Attach `domain` to `dir` and, with a backend port, mark it running
    fn attach(&self, domain: &str, dir: &str, backend: Option<u16>) {
        self.attach_with_scheme(domain, dir, backend, "http");
    }

    fn attach_with_scheme(&self, domain: &str, dir: &str, backend: Option<u16>, scheme: &str) {
        self.registry
            .add_dir_domains(dir, &[domain.to_string()])
            .unwrap();
        if let Some(port) = backend {
            let mut record = self.records.locate(dir, &[]);
            record.write(std::process::id(), port, scheme).unwrap();
        }
    }

    async fn connect(&self) -> TcpStream {
        TcpStream::connect(("127.0.0.1", self.port)).await.unwrap()
    }
}

/// Backend answering every request with its own request head as the body
async fn start_echo_backend() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let head = match read_head(&mut stream).await {
                    Ok(head) => head,
                    Err(_) => return,
                };
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    head.len(),
                    head
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });
    port
}

#[derive(Debug)]
struct FixedCert(Arc<CertifiedKey>);

impl ResolvesServerCert for FixedCert {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.0))
    }
}

/// TLS backend with a `localhost` certificate from the proxy's CA. It echoes
/// the request head and reports the negotiated ALPN in `X-Alpn`.
async fn start_tls_echo_backend(ca: &LocalAuthority) -> u16 {
    let cert = ca.issue(&["localhost".to_string()]).unwrap();
    let mut config = rustls::ServerConfig::builder_with_provider(devhost::certs::tls_provider())
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(FixedCert(cert)));
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    let acceptor = TlsAcceptor::from(Arc::new(config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let mut stream = match acceptor.accept(stream).await {
                    Ok(stream) => stream,
                    Err(_) => return,
                };
                let alpn = stream
                    .get_ref()
                    .1
                    .alpn_protocol()
                    .map(|p| String::from_utf8_lossy(p).into_owned())
                    .unwrap_or_else(|| "none".to_string());
                let head = match read_head(&mut stream).await {
                    Ok(head) => head,
                    Err(_) => return,
                };
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nX-Alpn: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    alpn,
                    head.len(),
                    head
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });
    port
}

/// Read up to the end of an HTTP head
async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> std::io::Result<String> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if stream.read(&mut byte).await? == 0 {
            break;
        }
        head.push(byte[0]);
    }
    Ok(String::from_utf8_lossy(&head).into_owned())
}

async fn send(stream: &mut TcpStream, request: &str) -> String {
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    tokio::time::timeout(Duration::from_secs(10), stream.read_to_string(&mut response))
        .await
        .unwrap()
        .unwrap();
    response
}

async fn proxy_get(proxy: &TestProxy, url: &str, host: &str) -> String {
    let mut stream = proxy.connect().await;
    send(
        &mut stream,
        &format!("GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n", url, host),
    )
    .await
}

/// Open a CONNECT tunnel and return the stream positioned after the 200
async fn open_tunnel(proxy: &TestProxy, target: &str) -> TcpStream {
    let mut stream = proxy.connect().await;
    stream
        .write_all(format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n\r\n", target, target).as_bytes())
        .await
        .unwrap();
    let head = read_head(&mut stream).await.unwrap();
    assert!(head.starts_with("HTTP/1.1 200"), "unexpected CONNECT answer: {}", head);
    stream
}

// ============================================================================
// Pages served by the proxy itself
// ============================================================================

#[tokio::test]
async fn test_pac_file() {
    let proxy = TestProxy::start().await;
    let response = proxy_get(&proxy, "/proxy.pac", "127.0.0.1").await;

    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.to_lowercase().contains("content-type: application/x-ns-proxy-autoconfig"));
    assert!(response.contains("dnsDomainIs(host, '.wip')"));
    assert!(response.contains("PROXY localhost:7080"));
}

#[tokio::test]
async fn test_index_lists_projects() {
    let proxy = TestProxy::start().await;
    let backend = start_echo_backend().await;
    proxy.attach("shop", "/srv/shop", Some(backend));
    proxy.attach("blog", "/srv/blog", None);

    let response = proxy_get(&proxy, "/", "127.0.0.1").await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("/srv/shop"));
    assert!(response.contains(&backend.to_string()));
    assert!(response.contains("shop.wip"));
    assert!(response.contains("/srv/blog"));
    assert!(response.contains("Not running"));
}

#[tokio::test]
async fn test_unknown_local_path() {
    let proxy = TestProxy::start().await;
    let response = proxy_get(&proxy, "/favicon.ico", "127.0.0.1").await;
    assert!(response.starts_with("HTTP/1.1 404"));
}

#[tokio::test]
async fn test_missing_host_header() {
    let proxy = TestProxy::start().await;
    let mut stream = proxy.connect().await;
    let response = send(&mut stream, "GET /proxy.pac HTTP/1.0\r\n\r\n").await;

    assert!(response.contains(" 400 "));
    assert!(response.contains("Cannot handle requests without a Host header"));
}

// ============================================================================
// Plain HTTP requests for the TLD
// ============================================================================

#[tokio::test]
async fn test_unregistered_domain_guidance() {
    let proxy = TestProxy::start().await;
    let response = proxy_get(&proxy, "http://www.shop.wip/", "www.shop.wip").await;

    assert!(response.starts_with("HTTP/1.1 404"));
    assert!(response.contains("UNREGISTERED_DOMAIN"));
    assert!(response.contains("proxy:domain:attach shop --dir=/some/dir"));
}

#[tokio::test]
async fn test_not_running_guidance() {
    let proxy = TestProxy::start().await;
    proxy.attach("shop", "/srv/shop", None);

    let response = proxy_get(&proxy, "http://shop.wip/", "shop.wip").await;
    assert!(response.starts_with("HTTP/1.1 404"));
    assert!(response.contains("BACKEND_NOT_RUNNING"));
    assert!(response.contains("server:start --daemon --dir=/srv/shop"));
}

#[tokio::test]
async fn test_wrong_port() {
    let proxy = TestProxy::start().await;
    let backend = start_echo_backend().await;
    proxy.attach("shop", "/srv/shop", Some(backend));

    let response = proxy_get(&proxy, "http://shop.wip:8080/", "shop.wip:8080").await;
    assert!(response.starts_with("HTTP/1.1 404"));
    assert!(response.contains("You must use port 80 for HTTP requests (8080 used)"));
}

#[tokio::test]
async fn test_forward_to_running_backend() {
    let proxy = TestProxy::start().await;
    let backend = start_echo_backend().await;
    proxy.attach("shop", "/srv/shop", Some(backend));

    let response = proxy_get(&proxy, "http://shop.wip/cart?id=3", "shop.wip").await;
    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);

    let echoed = response.to_lowercase();
    assert!(echoed.contains("get /cart?id=3 http/1.1"));
    assert!(echoed.contains("host: shop.wip"));
    assert!(echoed.contains("x-forwarded-port: 80"));
}

#[tokio::test]
async fn test_forward_keeps_client_forwarded_port() {
    let proxy = TestProxy::start().await;
    let backend = start_echo_backend().await;
    proxy.attach("shop", "/srv/shop", Some(backend));

    let mut stream = proxy.connect().await;
    let response = send(
        &mut stream,
        "GET http://shop.wip/ HTTP/1.1\r\nHost: shop.wip\r\nX-Forwarded-Port: 9999\r\nConnection: close\r\n\r\n",
    )
    .await;
    let echoed = response.to_lowercase();
    assert!(echoed.contains("x-forwarded-port: 9999"));
    assert!(!echoed.contains("x-forwarded-port: 80"));
}

#[tokio::test]
async fn test_wildcard_domain_routes_to_project() {
    let proxy = TestProxy::start().await;
    let backend = start_echo_backend().await;
    proxy.attach("*.shop", "/srv/shop", Some(backend));

    let response = proxy_get(&proxy, "http://api.shop.wip/", "api.shop.wip").await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.to_lowercase().contains("host: api.shop.wip"));
}

#[tokio::test]
async fn test_dead_backend_is_bad_gateway() {
    let proxy = TestProxy::start().await;
    // bound then dropped so nothing listens there
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    proxy.attach("shop", "/srv/shop", Some(port));

    let response = proxy_get(&proxy, "http://shop.wip/", "shop.wip").await;
    assert!(response.starts_with("HTTP/1.1 502"));
}

#[tokio::test]
async fn test_non_tld_request_passes_through() {
    let proxy = TestProxy::start().await;
    let backend = start_echo_backend().await;
    let url = format!("http://127.0.0.1:{}/outside", backend);

    let response = proxy_get(&proxy, &url, &format!("127.0.0.1:{}", backend)).await;
    assert!(response.starts_with("HTTP/1.1 200"));
    let echoed = response.to_lowercase();
    assert!(echoed.contains("get /outside http/1.1"));
    assert!(!echoed.contains("x-forwarded-port"));
}

// ============================================================================
// CONNECT tunnels
// ============================================================================

#[tokio::test]
async fn test_connect_unregistered_serves_guidance() {
    let proxy = TestProxy::start().await;
    let mut tunnel = open_tunnel(&proxy, "nope.wip:80").await;

    let response = send(
        &mut tunnel,
        "GET / HTTP/1.1\r\nHost: nope.wip\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 404"));
    assert!(response.contains("proxy:domain:attach nope --dir=/some/dir"));
}

#[tokio::test]
async fn test_connect_not_running_over_tls_serves_guidance() {
    let proxy = TestProxy::start().await;
    proxy.attach("shop", "/srv/shop", None);
    let tunnel = open_tunnel(&proxy, "shop.wip:443").await;

    let mut tls = tls_client(&proxy, "shop.wip", tunnel).await;
    tls.write_all(b"GET / HTTP/1.1\r\nHost: shop.wip\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = Vec::new();
    let _ = tls.read_to_end(&mut response).await;
    let response = String::from_utf8_lossy(&response);

    assert!(response.starts_with("HTTP/1.1 404"));
    assert!(response.contains("server:start --daemon --dir=/srv/shop"));
}

#[tokio::test]
async fn test_connect_port_80_tunnels_to_backend() {
    let proxy = TestProxy::start().await;
    let backend = start_echo_backend().await;
    proxy.attach("shop", "/srv/shop", Some(backend));

    let mut tunnel = open_tunnel(&proxy, "shop.wip:80").await;
    let response = send(
        &mut tunnel,
        "GET /tunnel HTTP/1.1\r\nHost: shop.wip\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("GET /tunnel HTTP/1.1"));
}

#[tokio::test]
async fn test_connect_non_tld_tunnels() {
    let proxy = TestProxy::start().await;
    let backend = start_echo_backend().await;

    let mut tunnel = open_tunnel(&proxy, &format!("127.0.0.1:{}", backend)).await;
    let response = send(
        &mut tunnel,
        "GET /raw HTTP/1.1\r\nHost: elsewhere\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(response.contains("GET /raw HTTP/1.1"));
}

#[tokio::test]
async fn test_connect_unreachable_non_tld_is_bad_gateway() {
    let proxy = TestProxy::start().await;
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    let mut stream = proxy.connect().await;
    let response = send(
        &mut stream,
        &format!("CONNECT 127.0.0.1:{0} HTTP/1.1\r\nHost: 127.0.0.1:{0}\r\nConnection: close\r\n\r\n", port),
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 502"));
}

#[tokio::test]
async fn test_plaintext_on_intercepted_tunnel() {
    let proxy = TestProxy::start().await;
    let backend = start_echo_backend().await;
    proxy.attach("shop", "/srv/shop", Some(backend));

    let mut tunnel = open_tunnel(&proxy, "shop.wip:443").await;
    let response = send(&mut tunnel, "GET / HTTP/1.1\r\nHost: shop.wip\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.0 400 Bad Request"));
    assert!(response.contains("Client sent an HTTP request to an HTTPS server."));
}

#[tokio::test]
async fn test_tls_interception_reaches_backend() {
    let proxy = TestProxy::start().await;
    let backend = start_echo_backend().await;
    proxy.attach("shop", "/srv/shop", Some(backend));

    let tunnel = open_tunnel(&proxy, "shop.wip:443").await;
    let mut tls = tls_client(&proxy, "shop.wip", tunnel).await;
    tls.write_all(b"GET /secure HTTP/1.1\r\nHost: shop.wip\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();

    let mut response = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(10), tls.read_to_end(&mut response)).await;
    let response = String::from_utf8_lossy(&response);
    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
    assert!(response.contains("GET /secure HTTP/1.1"));
}

#[tokio::test]
async fn test_connect_host_is_case_insensitive() {
    let proxy = TestProxy::start().await;
    let backend = start_echo_backend().await;
    proxy.attach("shop", "/srv/shop", Some(backend));

    let mut tunnel = open_tunnel(&proxy, "Shop.WIP:80").await;
    let response = send(
        &mut tunnel,
        "GET /mixed HTTP/1.1\r\nHost: shop.wip\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
    assert!(response.contains("GET /mixed HTTP/1.1"));
}

#[tokio::test]
async fn test_connect_mixed_case_unregistered_serves_guidance() {
    let proxy = TestProxy::start().await;
    let mut tunnel = open_tunnel(&proxy, "NOPE.Wip:80").await;

    let response = send(
        &mut tunnel,
        "GET / HTTP/1.1\r\nHost: nope.wip\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 404"));
    assert!(response.contains("UNREGISTERED_DOMAIN"));
}

// ============================================================================
// HTTPS backends
// ============================================================================

#[tokio::test]
async fn test_plain_request_to_https_backend() {
    let proxy = TestProxy::start().await;
    let backend = start_tls_echo_backend(&proxy.ca).await;
    proxy.attach_with_scheme("shop", "/srv/shop", Some(backend), "https");

    let response = proxy_get(&proxy, "http://shop.wip/over-tls", "shop.wip").await;
    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);

    let echoed = response.to_lowercase();
    assert!(echoed.contains("x-alpn: http/1.1"));
    assert!(echoed.contains("get /over-tls http/1.1"));
    assert!(echoed.contains("x-forwarded-port: 80"));
}

#[tokio::test]
async fn test_tls_interception_to_https_backend() {
    let proxy = TestProxy::start().await;
    let backend = start_tls_echo_backend(&proxy.ca).await;
    proxy.attach_with_scheme("shop", "/srv/shop", Some(backend), "https");

    let tunnel = open_tunnel(&proxy, "shop.wip:443").await;
    let mut tls = tls_client_with_alpn(&proxy, "shop.wip", tunnel, &[b"http/1.1"]).await;
    tls.write_all(b"GET /both-legs HTTP/1.1\r\nHost: shop.wip\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();

    let mut response = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(10), tls.read_to_end(&mut response)).await;
    let response = String::from_utf8_lossy(&response);
    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
    assert!(response.contains("X-Alpn: http/1.1"));
    assert!(response.contains("GET /both-legs HTTP/1.1"));
}

#[tokio::test]
async fn test_tls_interception_negotiates_h2_with_https_backend() {
    let proxy = TestProxy::start().await;
    let backend = start_tls_echo_backend(&proxy.ca).await;
    proxy.attach_with_scheme("shop", "/srv/shop", Some(backend), "https");

    let tunnel = open_tunnel(&proxy, "shop.wip:443").await;
    let mut tls = tls_client_with_alpn(&proxy, "shop.wip", tunnel, &[b"h2", b"http/1.1"]).await;
    assert_eq!(tls.get_ref().1.alpn_protocol(), Some(&b"h2"[..]));

    // The h2 connection preface ends with an empty line, so the backend
    // echoes it like a request head.
    tls.write_all(b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n").await.unwrap();

    let mut response = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(10), tls.read_to_end(&mut response)).await;
    let response = String::from_utf8_lossy(&response);
    assert!(response.contains("X-Alpn: h2"), "{}", response);
    assert!(response.contains("PRI * HTTP/2.0"));
}

async fn tls_client(
    proxy: &TestProxy,
    name: &str,
    stream: TcpStream,
) -> tokio_rustls::client::TlsStream<TcpStream> {
    tls_client_with_alpn(proxy, name, stream, &[]).await
}

async fn tls_client_with_alpn(
    proxy: &TestProxy,
    name: &str,
    stream: TcpStream,
    alpn: &[&[u8]],
) -> tokio_rustls::client::TlsStream<TcpStream> {
    let mut roots = rustls::RootCertStore::empty();
    roots.add(proxy.ca.ca_certificate()).unwrap();
    let mut config = rustls::ClientConfig::builder_with_provider(devhost::certs::tls_provider())
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();

    let server_name = ServerName::try_from(name.to_string()).unwrap();
    TlsConnector::from(Arc::new(config))
        .connect(server_name, stream)
        .await
        .unwrap()
}
