use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the home directory
pub const HOME_ENV: &str = "DEVHOST_HOME";

/// Global configuration, threaded explicitly into every component
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Home directory holding records, logs, certificates and the registry.
    /// Not read from the file; set by the loader.
    #[serde(skip)]
    pub home: PathBuf,

    /// Proxy defaults, used when the domain registry is created
    #[serde(default)]
    pub proxy: ProxyDefaults,

    /// Supervisor timings
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Daemonizer handshake timings
    #[serde(default)]
    pub daemon: DaemonConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyDefaults {
    /// Top level domain served by the proxy (default: wip)
    #[serde(default = "default_tld")]
    pub tld: String,

    /// Host advertised in the proxy auto-config script
    #[serde(default = "default_proxy_host")]
    pub host: String,

    /// Listen port (default: 7080)
    #[serde(default = "default_proxy_port")]
    pub port: u16,

    /// Maximum number of cached leaf certificates (default: 1024)
    #[serde(default = "default_cert_cache_capacity")]
    pub cert_cache_capacity: usize,

    /// Maximum idle connections per backend host (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl Default for ProxyDefaults {
    fn default() -> Self {
        Self {
            tld: default_tld(),
            host: default_proxy_host(),
            port: default_proxy_port(),
            cert_cache_capacity: default_cert_cache_capacity(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SupervisorConfig {
    /// Grace period after start before a boot counts as successful
    #[serde(default = "default_relief_ms")]
    pub relief_ms: u64,

    /// Wait before restarting a command that exited with an error
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: u64,

    /// Time given to a stopped process group before it is killed
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            relief_ms: default_relief_ms(),
            backoff_secs: default_backoff_secs(),
            stop_grace_secs: default_stop_grace_secs(),
        }
    }
}

impl SupervisorConfig {
    pub fn relief(&self) -> Duration {
        Duration::from_millis(self.relief_ms)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.backoff_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DaemonConfig {
    /// Maximum silence from the background process between milestones
    #[serde(default = "default_progress_timeout_secs")]
    pub progress_timeout_secs: u64,

    /// Status file polling interval, covers lost filesystem events
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Liveness polling interval for the watched parent
    #[serde(default = "default_parent_poll_ms")]
    pub parent_poll_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            progress_timeout_secs: default_progress_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            parent_poll_ms: default_parent_poll_ms(),
        }
    }
}

impl DaemonConfig {
    pub fn progress_timeout(&self) -> Duration {
        Duration::from_secs(self.progress_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn parent_poll(&self) -> Duration {
        Duration::from_millis(self.parent_poll_ms)
    }
}

fn default_tld() -> String {
    "wip".to_string()
}

fn default_proxy_host() -> String {
    "localhost".to_string()
}

fn default_proxy_port() -> u16 {
    7080
}

fn default_cert_cache_capacity() -> usize {
    1024
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_relief_ms() -> u64 {
    2000
}

fn default_backoff_secs() -> u64 {
    5
}

fn default_stop_grace_secs() -> u64 {
    5
}

fn default_progress_timeout_secs() -> u64 {
    5
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_parent_poll_ms() -> u64 {
    1000
}

impl Config {
    /// Defaults rooted at `home`
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            proxy: ProxyDefaults::default(),
            supervisor: SupervisorConfig::default(),
            daemon: DaemonConfig::default(),
        }
    }

    pub fn from_toml_str(home: impl Into<PathBuf>, content: &str) -> anyhow::Result<Self> {
        let mut config: Config = toml::from_str(content)?;
        config.home = home.into();
        config.validate()?;
        Ok(config)
    }

    /// Load `path`, rooting the configuration at `home`
    pub fn load<P: AsRef<Path>>(home: impl Into<PathBuf>, path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(home, &content)
    }

    /// Load `<home>/config.toml` when present, defaults otherwise
    pub fn load_or_default(home: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let home = home.into();
        let path = home.join("config.toml");
        if path.exists() {
            Self::load(home, path)
        } else {
            Ok(Self::with_home(home))
        }
    }

    /// Home from `DEVHOST_HOME`, falling back to `~/.devhost`
    pub fn default_home() -> anyhow::Result<PathBuf> {
        if let Some(home) = std::env::var_os(HOME_ENV).filter(|h| !h.is_empty()) {
            return Ok(PathBuf::from(home));
        }
        dirs_next::home_dir()
            .map(|home| home.join(".devhost"))
            .ok_or_else(|| anyhow::anyhow!("Unable to determine the user home directory"))
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        let tld = self.proxy.tld.trim();
        if tld.is_empty() {
            errors.push("proxy.tld must not be empty".to_string());
        } else if tld.starts_with('.') || tld.ends_with('.') {
            errors.push(format!("proxy.tld \"{}\" must not start or end with a dot", tld));
        }
        if self.proxy.port == 0 {
            errors.push("proxy.port must not be 0".to_string());
        }
        if self.proxy.cert_cache_capacity == 0 {
            errors.push("proxy.cert_cache_capacity must be greater than 0".to_string());
        }
        if self.supervisor.relief_ms == 0 {
            errors.push("supervisor.relief_ms must be greater than 0".to_string());
        }
        if self.daemon.poll_interval_ms == 0 {
            errors.push("daemon.poll_interval_ms must be greater than 0".to_string());
        }
        if self.daemon.parent_poll_ms == 0 {
            errors.push("daemon.parent_poll_ms must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    /// Directory of process record files
    pub fn var_dir(&self) -> PathBuf {
        self.home.join("var")
    }

    /// Directory of process log files
    pub fn log_dir(&self) -> PathBuf {
        self.home.join("log")
    }

    /// Local certificate authority material
    pub fn certs_dir(&self) -> PathBuf {
        self.home.join("certs")
    }

    /// Domain registry document
    pub fn registry_path(&self) -> PathBuf {
        self.home.join("proxy.json")
    }

    /// Log of the detached proxy
    pub fn proxy_log_path(&self) -> PathBuf {
        self.log_dir().join("proxy.log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[proxy]
tld = "test"
port = 8080

[supervisor]
relief_ms = 500
backoff_secs = 1

[daemon]
progress_timeout_secs = 10
"#;

        let config = Config::from_toml_str("/tmp/devhost", toml).unwrap();
        assert_eq!(config.home, PathBuf::from("/tmp/devhost"));
        assert_eq!(config.proxy.tld, "test");
        assert_eq!(config.proxy.port, 8080);
        assert_eq!(config.proxy.host, "localhost");
        assert_eq!(config.supervisor.relief(), Duration::from_millis(500));
        assert_eq!(config.supervisor.backoff(), Duration::from_secs(1));
        assert_eq!(config.supervisor.stop_grace(), Duration::from_secs(5));
        assert_eq!(config.daemon.progress_timeout(), Duration::from_secs(10));
        assert_eq!(config.daemon.poll_interval(), Duration::from_millis(500));
    }

    #[test]
    fn test_default_config() {
        let config = Config::with_home("/h");
        assert_eq!(config.proxy.tld, "wip");
        assert_eq!(config.proxy.port, 7080);
        assert_eq!(config.proxy.cert_cache_capacity, 1024);
        assert_eq!(config.supervisor.relief(), Duration::from_secs(2));
        assert_eq!(config.supervisor.backoff(), Duration::from_secs(5));
        assert_eq!(config.daemon.parent_poll(), Duration::from_secs(1));
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = Config::from_toml_str("/h", "").unwrap();
        assert_eq!(config.proxy.tld, "wip");
        assert_eq!(config.supervisor.relief_ms, 2000);
    }

    #[test]
    fn test_derived_paths() {
        let config = Config::with_home("/h");
        assert_eq!(config.var_dir(), PathBuf::from("/h/var"));
        assert_eq!(config.log_dir(), PathBuf::from("/h/log"));
        assert_eq!(config.certs_dir(), PathBuf::from("/h/certs"));
        assert_eq!(config.registry_path(), PathBuf::from("/h/proxy.json"));
        assert_eq!(config.proxy_log_path(), PathBuf::from("/h/log/proxy.log"));
    }

    #[test]
    fn test_validate_collects_errors() {
        let toml = r#"
[proxy]
tld = ".wip"
port = 0
cert_cache_capacity = 0
"#;
        let err = Config::from_toml_str("/h", toml).unwrap_err().to_string();
        assert!(err.contains("must not start or end with a dot"));
        assert!(err.contains("proxy.port must not be 0"));
        assert!(err.contains("cert_cache_capacity"));
    }

    #[test]
    fn test_load_or_default_reads_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(tmp.path().join("config.toml"), "[proxy]\ntld = \"dev\"\n").unwrap();
        let config = Config::load_or_default(tmp.path()).unwrap();
        assert_eq!(config.proxy.tld, "dev");

        let empty = tempfile::TempDir::new().unwrap();
        let config = Config::load_or_default(empty.path()).unwrap();
        assert_eq!(config.proxy.tld, "wip");
    }
}
