//! Process records: one small JSON file per supervised process.
//!
//! Records are keyed by a SHA-1 identity of the project directory (the web
//! server) or of the directory plus the joined argument vector (workers):
//!
//! ```text
//! <home>/var/<h(dir)>.pid
//! <home>/var/<h(dir)>/<h(args)>.pid
//! <home>/log/<h(dir)>.log
//! <home>/log/<h(dir)>/<h(name or args)>.log
//! ```
//!
//! The files double as the coordination point between supervisors, the
//! proxy and the CLI. Liveness is probed with the pid, which can yield a
//! false positive once the pid is reused by an unrelated process.

use crate::error::{Error, Result};
use crate::process::{self, ProcessProbe, SystemProbe};
use crate::watcher::{self, EventMask, FsEvent, Watch};
use serde::{Deserialize, Deserializer, Serialize};
use sha1::{Digest, Sha1};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Directory used for the proxy's own record; never listed
pub const PROXY_IDENTITY: &str = "__proxy__";

/// Hex SHA-1 digest used for record and log file names
pub fn identity(value: &str) -> String {
    hex::encode(Sha1::digest(value.as_bytes()))
}

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn system_probe() -> Arc<dyn ProcessProbe> {
    Arc::new(SystemProbe)
}

/// Metadata of one supervised process
#[derive(Debug, Serialize, Deserialize)]
pub struct ProcessRecord {
    /// Project directory
    pub dir: String,
    /// Paths whose changes restart the process
    #[serde(default, deserialize_with = "null_as_default")]
    pub watch: Vec<String>,
    #[serde(default)]
    pub pid: u32,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub scheme: String,
    /// Empty for the web server, the command line for workers
    #[serde(default, deserialize_with = "null_as_default")]
    pub args: Vec<String>,
    /// Optional human readable name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(skip)]
    path: PathBuf,
    #[serde(skip)]
    log_dir: PathBuf,
    #[serde(skip)]
    log_file: Option<File>,
    #[serde(skip, default = "system_probe")]
    probe: Arc<dyn ProcessProbe>,
    #[serde(skip)]
    stop_grace: Duration,
}

impl ProcessRecord {
    /// Record file location
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_worker(&self) -> bool {
        !self.args.is_empty()
    }

    /// Command binary for workers
    pub fn binary(&self) -> Option<&str> {
        self.args.first().map(|s| s.as_str())
    }

    pub fn command_line(&self) -> String {
        self.args.join(" ")
    }

    /// Name shown to users: custom name, binary name, or "web server"
    pub fn short_name(&self) -> String {
        if let Some(name) = self.name.as_deref().filter(|n| !n.is_empty()) {
            return name.to_string();
        }
        match self.binary() {
            Some(binary) => Path::new(binary)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| binary.to_string()),
            None => "web server".to_string(),
        }
    }

    /// Log file location
    pub fn log_path(&self) -> PathBuf {
        let dir_id = identity(&self.dir);
        if !self.is_worker() {
            return self.log_dir.join(format!("{}.log", dir_id));
        }
        let name = match self.name.as_deref().filter(|n| !n.is_empty()) {
            Some(name) => name.to_string(),
            None => self.command_line(),
        };
        self.log_dir
            .join(dir_id)
            .join(format!("{}.log", identity(&name)))
    }

    pub fn set_watched(&mut self, paths: Vec<String>) {
        self.watch = paths;
    }

    pub fn set_name(&mut self, name: Option<String>) {
        self.name = name;
    }

    /// Best-effort liveness: pid 0 is never running
    pub fn is_running(&self) -> bool {
        self.pid != 0 && self.probe.is_alive(self.pid)
    }

    /// Persist the record, refusing to overwrite a live claimant
    pub fn write(&mut self, pid: u32, port: u16, scheme: &str) -> Result<()> {
        if let Some(existing) = read_record(&self.path) {
            if existing.pid != 0 && self.probe.is_alive(existing.pid) {
                return Err(Error::AlreadyRunning { pid: existing.pid });
            }
        }

        self.pid = pid;
        self.port = port;
        self.scheme = scheme.to_string();

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(&self.path, content)?;
        debug!(path = %self.path.display(), pid, port, "Process record written");
        Ok(())
    }

    /// Terminate the process group and remove the record
    pub async fn stop(&mut self) -> Result<()> {
        let result = if self.pid != 0 {
            process::stop_group(self.pid, self.stop_grace, self.probe.as_ref()).await
        } else {
            Ok(())
        };
        let removed = self.remove();
        result?;
        removed
    }

    /// Delete the record and its log, closing the log writer first
    pub fn remove(&mut self) -> Result<()> {
        self.log_file = None;
        remove_if_exists(&self.path)?;
        remove_if_exists(&self.log_path())?;
        Ok(())
    }

    /// Writer for the child's output; the log is truncated the first time
    /// it is opened for this record and appended to afterwards.
    pub fn log_writer(&mut self) -> Result<File> {
        if self.log_file.is_none() {
            let path = self.log_path();
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            file.set_len(0)?;
            self.log_file = Some(file);
        }
        match &self.log_file {
            Some(file) => Ok(file.try_clone()?),
            None => Err(Error::Io(io::Error::new(io::ErrorKind::Other, "log file unavailable"))),
        }
    }

    /// Resolves once the record file exists
    pub fn wait_for_creation(&self) -> Result<FileWait> {
        FileWait::new(self.path.clone())
    }

    /// Resolves once the log file exists
    pub fn wait_for_logs(&self) -> Result<FileWait> {
        FileWait::new(self.log_path())
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn read_record(path: &Path) -> Option<ProcessRecord> {
    let content = fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

/// Pending wait for a file to appear.
///
/// The watch is registered when this is created, so a file created between
/// setup and [`FileWait::wait`] is not missed.
pub struct FileWait {
    target: PathBuf,
    events: mpsc::Receiver<FsEvent>,
    _watch: Watch,
}

impl FileWait {
    pub fn new(target: PathBuf) -> Result<Self> {
        let parent = target
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        fs::create_dir_all(&parent)?;

        let (tx, rx) = mpsc::channel(16);
        let watch = watcher::watch(&parent, false, tx, EventMask::CREATE | EventMask::RENAME)?;

        Ok(Self {
            target,
            events: rx,
            _watch: watch,
        })
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub async fn wait(mut self) -> Result<()> {
        let mut recheck = tokio::time::interval(Duration::from_millis(250));
        loop {
            if self.target.exists() {
                return Ok(());
            }
            tokio::select! {
                event = self.events.recv() => {
                    match event {
                        Some(event) if event.path.file_name() == self.target.file_name() => return Ok(()),
                        Some(_) => {}
                        None => {
                            return Err(Error::Io(io::Error::new(
                                io::ErrorKind::BrokenPipe,
                                "filesystem watch closed",
                            )));
                        }
                    }
                }
                _ = recheck.tick() => {}
            }
        }
    }
}

/// Store rooted at a home directory (`<home>/var`, `<home>/log`)
#[derive(Debug, Clone)]
pub struct RecordStore {
    var_dir: PathBuf,
    log_dir: PathBuf,
    probe: Arc<dyn ProcessProbe>,
    stop_grace: Duration,
}

impl RecordStore {
    pub fn new(home: &Path, probe: Arc<dyn ProcessProbe>, stop_grace: Duration) -> Self {
        Self {
            var_dir: home.join("var"),
            log_dir: home.join("log"),
            probe,
            stop_grace,
        }
    }

    pub fn from_config(config: &crate::config::Config) -> Self {
        Self::new(&config.home, system_probe(), config.supervisor.stop_grace())
    }

    pub fn var_dir(&self) -> &Path {
        &self.var_dir
    }

    fn record_path(&self, dir: &str, args: &[String]) -> PathBuf {
        let dir_id = identity(dir);
        if args.is_empty() {
            self.var_dir.join(format!("{}.pid", dir_id))
        } else {
            self.var_dir
                .join(dir_id)
                .join(format!("{}.pid", identity(&args.join(" "))))
        }
    }

    fn bind(&self, mut record: ProcessRecord, path: PathBuf) -> ProcessRecord {
        record.path = path;
        record.log_dir = self.log_dir.clone();
        record.probe = Arc::clone(&self.probe);
        record.stop_grace = self.stop_grace;
        record
    }

    /// Existing record for `dir`/`args`, or an empty one bound to that identity.
    /// Unreadable or malformed files count as absent.
    pub fn locate(&self, dir: &str, args: &[String]) -> ProcessRecord {
        let path = self.record_path(dir, args);
        let record = read_record(&path)
            .filter(|r| r.dir == dir)
            .unwrap_or_else(|| ProcessRecord {
                dir: dir.to_string(),
                watch: Vec::new(),
                pid: 0,
                port: 0,
                scheme: String::new(),
                args: args.to_vec(),
                name: None,
                path: PathBuf::new(),
                log_dir: PathBuf::new(),
                log_file: None,
                probe: system_probe(),
                stop_grace: Duration::ZERO,
            });
        self.bind(record, path)
    }

    /// The proxy's own record
    pub fn proxy_record(&self) -> ProcessRecord {
        self.locate(PROXY_IDENTITY, &[])
    }

    /// Records directly under `root` (not recursive).
    ///
    /// Malformed files are skipped, dead records are removed as a side
    /// effect, and the proxy's own record is never returned.
    pub fn enumerate_under(&self, root: &Path) -> Vec<ProcessRecord> {
        let entries = match fs::read_dir(root) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };

        let mut records = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) != Some("pid") {
                continue;
            }
            let Some(record) = read_record(&path) else {
                continue;
            };
            if record.dir.contains(PROXY_IDENTITY) {
                continue;
            }

            let mut record = self.bind(record, path);
            if !record.is_running() {
                debug!(path = %record.path.display(), pid = record.pid, "Pruning stale process record");
                if let Err(e) = record.remove() {
                    warn!(path = %record.path.display(), error = %e, "Failed to prune process record");
                }
                continue;
            }
            records.push(record);
        }

        records.sort_by(|a, b| a.dir.cmp(&b.dir).then_with(|| a.args.cmp(&b.args)));
        records
    }

    /// Running web servers of every project
    pub fn all_running(&self) -> Vec<ProcessRecord> {
        self.enumerate_under(&self.var_dir)
    }

    /// Running workers of one project
    pub fn workers(&self, dir: &str) -> Vec<ProcessRecord> {
        self.enumerate_under(&self.var_dir.join(identity(dir)))
    }
}
