//! Leaf certificates for intercepted TLS sessions.
//!
//! A [`CertificateAuthority`] issues certificates; [`LocalAuthority`] is the
//! on-disk implementation backed by `rootCA.pem` / `rootCA-key.pem`.
//! [`CertCache`] sits in front of it, keyed by the normalized domain so every
//! host covered by one wildcard token shares a single certificate.

use crate::domains::DomainRegistry;
use crate::error::{Error, Result};
use lru::LruCache;
use parking_lot::Mutex;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, PKCS_ECDSA_P256_SHA256,
};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::fs;
use std::io::BufReader;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

const CA_CERT_FILE: &str = "rootCA.pem";
const CA_KEY_FILE: &str = "rootCA-key.pem";
const CA_COMMON_NAME: &str = "devhost development CA";
const DEFAULT_CACHE_CAPACITY: usize = 1024;

/// Crypto provider used for every TLS configuration we build
pub fn tls_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Issues leaf certificates trusted by local clients
pub trait CertificateAuthority: Send + Sync {
    /// Certificate chain and key covering `names`
    fn issue(&self, names: &[String]) -> Result<Arc<CertifiedKey>>;

    /// The CA's own certificate, to be trusted by clients
    fn ca_certificate(&self) -> CertificateDer<'static>;
}

/// Certificate authority stored as PEM files in a directory
pub struct LocalAuthority {
    dir: PathBuf,
    ca_der: CertificateDer<'static>,
    issuer: Certificate,
    key: KeyPair,
}

impl std::fmt::Debug for LocalAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalAuthority")
            .field("dir", &self.dir)
            .field("key", &"<KeyPair>")
            .finish()
    }
}

impl LocalAuthority {
    /// Load the CA from `dir`, generating it on first use
    pub fn load_or_create(dir: &Path) -> Result<Self> {
        let cert_path = dir.join(CA_CERT_FILE);
        let key_path = dir.join(CA_KEY_FILE);

        if !cert_path.exists() || !key_path.exists() {
            fs::create_dir_all(dir)?;
            let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).map_err(ca_error)?;
            let cert = ca_params().self_signed(&key).map_err(ca_error)?;
            fs::write(&cert_path, cert.pem())?;
            write_private(&key_path, &key.serialize_pem())?;
            info!(dir = %dir.display(), "Local certificate authority created");
        }

        let key_pem = fs::read_to_string(&key_path)?;
        let key = KeyPair::from_pem(&key_pem).map_err(ca_error)?;

        let cert_pem = fs::read(&cert_path)?;
        let ca_der = rustls_pemfile::certs(&mut BufReader::new(&cert_pem[..]))
            .next()
            .ok_or_else(|| Error::CertIssuance {
                domain: CA_COMMON_NAME.to_string(),
                reason: format!("no certificate found in {}", cert_path.display()),
            })??;

        // Leaves only need the issuer name and key, rebuild it from the
        // fixed parameters rather than parsing the stored certificate.
        let issuer = ca_params().self_signed(&key).map_err(ca_error)?;

        debug!(dir = %dir.display(), "Local certificate authority loaded");
        Ok(Self {
            dir: dir.to_path_buf(),
            ca_der,
            issuer,
            key,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl CertificateAuthority for LocalAuthority {
    fn issue(&self, names: &[String]) -> Result<Arc<CertifiedKey>> {
        let domain = names.first().cloned().unwrap_or_default();
        let fail = |reason: String| Error::CertIssuance {
            domain: domain.clone(),
            reason,
        };

        let mut params = CertificateParams::new(names.to_vec()).map_err(|e| fail(e.to_string()))?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, domain.as_str());
        dn.push(DnType::OrganizationName, "devhost");
        params.distinguished_name = dn;
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).map_err(|e| fail(e.to_string()))?;
        let leaf = params
            .signed_by(&key, &self.issuer, &self.key)
            .map_err(|e| fail(e.to_string()))?;

        let key_der = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key.serialize_der()));
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key_der)
            .map_err(|e| fail(e.to_string()))?;

        let chain = vec![
            CertificateDer::from(leaf.der().to_vec()),
            self.ca_der.clone(),
        ];
        Ok(Arc::new(CertifiedKey::new(chain, signing_key)))
    }

    fn ca_certificate(&self) -> CertificateDer<'static> {
        self.ca_der.clone()
    }
}

fn ca_params() -> CertificateParams {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, CA_COMMON_NAME);
    dn.push(DnType::OrganizationName, "devhost");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params
}

fn ca_error(e: rcgen::Error) -> Error {
    Error::CertIssuance {
        domain: CA_COMMON_NAME.to_string(),
        reason: e.to_string(),
    }
}

#[cfg(unix)]
fn write_private(path: &Path, content: &str) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(content.as_bytes())
}

#[cfg(not(unix))]
fn write_private(path: &Path, content: &str) -> std::io::Result<()> {
    fs::write(path, content)
}

/// Certificates issued so far, keyed by normalized domain
pub struct CertCache {
    registry: Arc<DomainRegistry>,
    ca: Arc<dyn CertificateAuthority>,
    // Plain LRU rather than adaptive replacement: eviction looks at recency only
    cache: Mutex<LruCache<String, Arc<CertifiedKey>>>,
}

impl std::fmt::Debug for CertCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertCache")
            .field("len", &self.cache.lock().len())
            .finish()
    }
}

impl CertCache {
    pub fn new(registry: Arc<DomainRegistry>, ca: Arc<dyn CertificateAuthority>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity)
            .or_else(|| NonZeroUsize::new(DEFAULT_CACHE_CAPACITY))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            registry,
            ca,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Certificate for `server_name`, issued on first use.
    ///
    /// The lock covers lookup and issuance, so concurrent handshakes for
    /// the same name never issue twice.
    pub fn get_certificate(&self, server_name: &str) -> Result<Arc<CertifiedKey>> {
        let name = self.registry.normalize_domain(server_name);
        let mut cache = self.cache.lock();
        if let Some(cert) = cache.get(&name) {
            return Ok(Arc::clone(cert));
        }

        debug!(domain = %name, "Issuing certificate");
        let cert = self.ca.issue(&[name.clone()])?;
        cache.put(name, Arc::clone(&cert));
        Ok(cert)
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Server configuration for one intercepted connection; `fallback_host`
    /// is used when the client sends no SNI.
    pub fn server_config(
        self: &Arc<Self>,
        fallback_host: &str,
        alpn: &[&[u8]],
    ) -> Result<Arc<ServerConfig>> {
        let resolver = ConnectionResolver {
            cache: Arc::clone(self),
            fallback: fallback_host.to_string(),
        };
        let mut config = ServerConfig::builder_with_provider(tls_provider())
            .with_safe_default_protocol_versions()
            .map_err(|e| tls_error(fallback_host, e))?
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(resolver));
        config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
        Ok(Arc::new(config))
    }

    /// Client configuration trusting our CA, for TLS backends
    pub fn backend_client_config(&self, alpn: &[u8]) -> Result<Arc<ClientConfig>> {
        let mut roots = RootCertStore::empty();
        roots
            .add(self.ca.ca_certificate())
            .map_err(|e| tls_error("localhost", e))?;
        let mut config = ClientConfig::builder_with_provider(tls_provider())
            .with_safe_default_protocol_versions()
            .map_err(|e| tls_error("localhost", e))?
            .with_root_certificates(roots)
            .with_no_client_auth();
        config.alpn_protocols = vec![alpn.to_vec()];
        Ok(Arc::new(config))
    }
}

fn tls_error(domain: &str, e: rustls::Error) -> Error {
    Error::CertIssuance {
        domain: domain.to_string(),
        reason: e.to_string(),
    }
}

#[derive(Debug)]
struct ConnectionResolver {
    cache: Arc<CertCache>,
    fallback: String,
}

impl ResolvesServerCert for ConnectionResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let name = client_hello
            .server_name()
            .map(str::to_string)
            .unwrap_or_else(|| self.fallback.clone());
        match self.cache.get_certificate(&name) {
            Ok(cert) => Some(cert),
            Err(e) => {
                warn!(domain = %name, error = %e, "Unable to issue certificate");
                None
            }
        }
    }
}
