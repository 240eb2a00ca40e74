//! Domain registry: which project directory serves which hostname.
//!
//! Persisted as `proxy.json`:
//!
//! ```json
//! {
//!     "tld": "wip",
//!     "host": "localhost",
//!     "port": 7080,
//!     "domains": { "shop": "/home/me/shop", "*.shop": "/home/me/shop" }
//! }
//! ```
//!
//! Tokens never carry the TLD. A token starting with `*.` matches any
//! subdomain; when several wildcards match, the most specific one wins.

use crate::config::ProxyDefaults;
use crate::error::{Error, Result};
use crate::watcher::{self, EventMask};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// On-disk document
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RegistryDocument {
    tld: String,
    #[serde(default)]
    host: String,
    #[serde(default)]
    port: u16,
    #[serde(default)]
    domains: Option<BTreeMap<String, String>>,
}

#[derive(Debug)]
struct RegistryState {
    tld: String,
    domains: HashMap<String, String>,
}

#[derive(Debug)]
pub struct DomainRegistry {
    path: PathBuf,
    host: String,
    port: u16,
    state: RwLock<RegistryState>,
}

impl DomainRegistry {
    /// Load the registry, writing a default document first if it is missing
    pub fn load(path: PathBuf, defaults: &ProxyDefaults) -> Result<Self> {
        if !path.exists() {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let document = RegistryDocument {
                tld: defaults.tld.clone(),
                host: defaults.host.clone(),
                port: defaults.port,
                domains: Some(BTreeMap::new()),
            };
            write_document(&path, &document)?;
            info!(path = %path.display(), "Domain registry created");
        }

        let document = read_document(&path)?;
        let host = if document.host.is_empty() {
            "localhost".to_string()
        } else {
            document.host
        };
        let port = if document.port == 0 { defaults.port } else { document.port };

        Ok(Self {
            path,
            host,
            port,
            state: RwLock::new(RegistryState {
                tld: document.tld,
                domains: document.domains.unwrap_or_default().into_iter().collect(),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn tld(&self) -> String {
        self.state.read().tld.clone()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Listen port; fixed for the lifetime of the registry
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether `host` (optionally with `:port`) belongs to the TLD
    pub fn tld_matches(&self, host: &str) -> bool {
        let state = self.state.read();
        let host = strip_port(host);
        host.len() > state.tld.len() + 1
            && host
                .strip_suffix(state.tld.as_str())
                .map(|rest| rest.ends_with('.'))
                .unwrap_or(false)
    }

    /// Matched fully qualified domain for `domain`: the exact token, the
    /// most specific wildcard, or the bare name with the TLD appended.
    pub fn normalize_domain(&self, domain: &str) -> String {
        let state = self.state.read();
        normalize(&state, domain)
    }

    /// Directory serving `domain`, if any
    pub fn get_dir(&self, domain: &str) -> Option<String> {
        let state = self.state.read();
        let normalized = normalize(&state, strip_port(domain));
        let token = without_tld(&state.tld, &normalized);
        state.domains.get(token).cloned()
    }

    /// Fully qualified domains attached to `dir`, sorted
    pub fn domains_for_dir(&self, dir: &str) -> Vec<String> {
        let state = self.state.read();
        let mut domains: Vec<String> = state
            .domains
            .iter()
            .filter(|(_, d)| d.as_str() == dir)
            .map(|(token, _)| format!("{}.{}", token, state.tld))
            .collect();
        domains.sort();
        domains
    }

    /// Every directory with at least one domain
    pub fn dirs(&self) -> Vec<String> {
        let state = self.state.read();
        let mut dirs: Vec<String> = state.domains.values().cloned().collect();
        dirs.sort();
        dirs.dedup();
        dirs
    }

    /// Attach `domains` to `dir`
    pub fn add_dir_domains(&self, dir: &str, domains: &[String]) -> Result<()> {
        let mut state = self.state.write();
        validate(&state.tld, domains)?;
        for domain in domains {
            state.domains.insert(domain.clone(), dir.to_string());
        }
        self.save(&state)
    }

    /// Replace every domain of `dir` with `domains`
    pub fn replace_dir_domains(&self, dir: &str, domains: &[String]) -> Result<()> {
        let mut state = self.state.write();
        validate(&state.tld, domains)?;
        state.domains.retain(|_, d| d.as_str() != dir);
        for domain in domains {
            state.domains.insert(domain.clone(), dir.to_string());
        }
        self.save(&state)
    }

    /// Detach `domains`, whichever directory they point to
    pub fn remove_dir_domains(&self, domains: &[String]) -> Result<()> {
        let mut state = self.state.write();
        validate(&state.tld, domains)?;
        for domain in domains {
            state.domains.remove(domain);
        }
        self.save(&state)
    }

    fn save(&self, state: &RegistryState) -> Result<()> {
        let document = RegistryDocument {
            tld: state.tld.clone(),
            host: self.host.clone(),
            port: self.port,
            domains: Some(state.domains.clone().into_iter().collect()),
        };
        write_document(&self.path, &document)
    }

    /// Re-read the document, swapping the TLD and domains (never the port)
    pub fn reload(&self) -> Result<()> {
        let document = read_document(&self.path)?;
        let mut state = self.state.write();
        state.tld = document.tld;
        state.domains = document.domains.unwrap_or_default().into_iter().collect();
        debug!(tld = %state.tld, domains = state.domains.len(), "Domain registry reloaded");
        Ok(())
    }

    /// Reload whenever the backing file changes.
    ///
    /// The parent directory is watched so editors replacing the file are
    /// noticed too. The task ends when the returned handle is aborted.
    pub fn watch(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let dir = self
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let file_name = self.path.file_name().map(|n| n.to_os_string());

        let (tx, mut rx) = mpsc::channel(1);
        let watch = watcher::watch(
            &dir,
            false,
            tx,
            EventMask::WRITE | EventMask::CREATE | EventMask::RENAME,
        )?;

        let registry = Arc::clone(self);
        Ok(tokio::spawn(async move {
            let _watch = watch;
            while let Some(event) = rx.recv().await {
                if event.path.file_name().map(|n| n.to_os_string()) != file_name {
                    continue;
                }
                match registry.reload() {
                    Ok(()) => info!(path = %registry.path.display(), "Domain registry changed, reloaded"),
                    Err(e) => warn!(path = %registry.path.display(), error = %e, "Unable to reload domain registry"),
                }
            }
        }))
    }
}

fn read_document(path: &Path) -> Result<RegistryDocument> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

fn write_document(path: &Path, document: &RegistryDocument) -> Result<()> {
    let content = serde_json::to_string_pretty(document)?;
    fs::write(path, content)?;
    Ok(())
}

fn validate(tld: &str, domains: &[String]) -> Result<()> {
    for domain in domains {
        if domain == tld || domain.ends_with(&format!(".{}", tld)) {
            return Err(Error::DomainValidation {
                domain: domain.clone(),
                tld: tld.to_string(),
            });
        }
    }
    Ok(())
}

fn strip_port(host: &str) -> &str {
    match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

fn without_tld<'a>(tld: &str, domain: &'a str) -> &'a str {
    domain
        .strip_suffix(tld)
        .and_then(|rest| rest.strip_suffix('.'))
        .unwrap_or(domain)
}

fn normalize(state: &RegistryState, domain: &str) -> String {
    let domain = without_tld(&state.tld, domain);
    let fqdn = format!("{}.{}", domain, state.tld);
    if state.domains.contains_key(domain) {
        return fqdn;
    }

    let mut best = String::new();
    for token in state.domains.keys() {
        let Some(suffix) = token.strip_prefix('*') else {
            continue;
        };
        if domain.ends_with(suffix) {
            let candidate = format!("{}.{}", token, state.tld);
            if candidate.len() > best.len() {
                best = candidate;
            }
        }
    }

    if best.is_empty() {
        fqdn
    } else {
        best
    }
}
