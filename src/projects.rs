//! Merged view of configured projects (domain registry) and running ones
//! (process records), used by the proxy index page.

use crate::domains::DomainRegistry;
use crate::record::RecordStore;
use std::collections::BTreeMap;
use std::path::Path;

/// A project as shown on the index page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfiguredProject {
    /// Listening port, 0 when not running
    pub port: u16,
    pub scheme: String,
    /// Fully qualified domains (with TLD)
    pub domains: Vec<String>,
}

/// Merge the registry's static view with the record store's live view.
///
/// Keys are directories with the home directory shortened to `~`. Running
/// values (port, scheme) win; directories present in only one source are kept.
pub fn merge_configured_and_running(
    registry: &DomainRegistry,
    records: &RecordStore,
    home: Option<&Path>,
) -> BTreeMap<String, ConfiguredProject> {
    let mut projects: BTreeMap<String, ConfiguredProject> = BTreeMap::new();

    for dir in registry.dirs() {
        projects.insert(
            shorten_home(&dir, home),
            ConfiguredProject {
                port: 0,
                scheme: "https".to_string(),
                domains: registry.domains_for_dir(&dir),
            },
        );
    }

    for record in records.all_running() {
        let key = shorten_home(&record.dir, home);
        let entry = projects.entry(key).or_insert_with(|| ConfiguredProject {
            port: 0,
            scheme: String::new(),
            domains: Vec::new(),
        });
        entry.port = record.port;
        if !record.scheme.is_empty() {
            entry.scheme = record.scheme.clone();
        }
    }

    projects
}

fn shorten_home(dir: &str, home: Option<&Path>) -> String {
    if let Some(home) = home.and_then(|h| h.to_str()) {
        if !home.is_empty() {
            if let Some(rest) = dir.strip_prefix(home) {
                if rest.is_empty() || rest.starts_with('/') || rest.starts_with('\\') {
                    return format!("~{}", rest);
                }
            }
        }
    }
    dir.to_string()
}
