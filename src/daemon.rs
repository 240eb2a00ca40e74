//! Detaching from the terminal by re-executing ourselves.
//!
//! The foreground process creates an empty status file, watches it, and
//! re-launches the current binary in a new session with the status file
//! path in its environment. The background copy writes milestone labels
//! into the file as it boots; the [`UP`] milestone removes the file, which
//! tells the foreground process it can exit successfully.
//!
//! A polling ticker runs next to the file watch so a lost event never hangs
//! the foreground process, and the background copy is killed when it stays
//! silent for longer than the progress timeout.

use crate::config::DaemonConfig;
use crate::error::{Error, Result};
use crate::process::{self, ProcessProbe, SignalListener, SystemProbe};
use crate::watcher::{self, ChangeKind, EventMask};
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Terminal milestone
pub const UP: &str = "up";

/// Status file shared with the foreground process
pub const STATUS_FILE_ENV: &str = "DEVHOST_STATUS_FILE";
/// Pid whose death should make the background process leave
pub const WATCH_PID_ENV: &str = "DEVHOST_WATCH_PID";
/// Original interactive shell, set when we were re-executed in place
pub const SHELL_PID_ENV: &str = "DEVHOST_SHELL_PID";

/// Progress read from the status file
#[derive(Debug, Clone, PartialEq, Eq)]
enum Progress {
    Unchanged,
    Milestone(String),
    Up,
}

/// Status file owned by the foreground process; removed on drop
#[derive(Debug)]
struct StatusFile {
    path: PathBuf,
    last: Option<String>,
}

impl StatusFile {
    fn create(dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}-status", Uuid::new_v4()));
        fs::File::create(&path)?;
        Ok(Self { path, last: None })
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn poll(&mut self) -> Progress {
        match fs::read_to_string(&self.path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Progress::Up,
            Err(_) => Progress::Unchanged,
            Ok(content) => {
                let label = content.trim();
                if label.is_empty() || self.last.as_deref() == Some(label) {
                    return Progress::Unchanged;
                }
                self.last = Some(label.to_string());
                if label == UP {
                    Progress::Up
                } else {
                    Progress::Milestone(label.to_string())
                }
            }
        }
    }
}

impl Drop for StatusFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[derive(Debug, Clone)]
pub struct Daemonizer {
    config: DaemonConfig,
    status_dir: PathBuf,
    /// Launched instead of the current binary with its arguments
    program: Option<(PathBuf, Vec<OsString>)>,
}

impl Daemonizer {
    /// `status_dir` holds the transient status files
    pub fn new(config: DaemonConfig, status_dir: PathBuf) -> Self {
        Self {
            config,
            status_dir,
            program: None,
        }
    }

    /// Launch `binary` with `args` as the background copy
    pub fn with_program<I, A>(mut self, binary: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        self.program = Some((binary.into(), args.into_iter().map(Into::into).collect()));
        self
    }

    /// Whether we are the background copy
    pub fn is_child() -> bool {
        std::env::var_os(WATCH_PID_ENV)
            .map(|v| !v.is_empty())
            .unwrap_or(false)
    }

    /// Re-launch the current binary detached and wait until it reports
    /// [`UP`], exits, or stops making progress.
    ///
    /// `Ok(())` means the background copy is up and the caller should exit.
    pub async fn background(&self) -> Result<()> {
        let mut status = StatusFile::create(&self.status_dir)?;

        let (tx, mut events) = mpsc::channel(10);
        let _watch = watcher::watch(status.path(), false, tx, EventMask::WRITE | EventMask::REMOVE)?;

        let watch_pid = std::env::var(SHELL_PID_ENV)
            .ok()
            .filter(|pid| !pid.is_empty())
            .unwrap_or_else(|| process::parent_pid().to_string());

        let (binary, args) = match &self.program {
            Some((binary, args)) => (binary.clone(), args.clone()),
            None => (
                std::env::current_exe().map_err(|e| Error::RespawnFailure(e.to_string()))?,
                std::env::args_os().skip(1).collect(),
            ),
        };
        let cwd = std::env::current_dir().map_err(|e| Error::RespawnFailure(e.to_string()))?;

        let mut cmd = Command::new(&binary);
        cmd.args(args)
            .current_dir(cwd)
            .env(STATUS_FILE_ENV, status.path())
            .env(WATCH_PID_ENV, &watch_pid)
            .kill_on_drop(false);
        process::detach_session(&mut cmd);

        debug!(binary = %binary.display(), status_file = %status.path().display(), "Going to the background");
        let mut child = cmd
            .spawn()
            .map_err(|e| Error::RespawnFailure(format!("error starting the process: {}", e)))?;
        let child_pid = child.id().unwrap_or(0);

        let mut signals = SignalListener::new()?;
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        let mut deadline = Instant::now() + self.config.progress_timeout();

        loop {
            tokio::select! {
                Some(signal) = signals.recv() => {
                    debug!(pid = child_pid, ?signal, "Forwarding signal to background process");
                    if let Err(e) = process::send_signal(child_pid, signal) {
                        let _ = child.start_kill();
                        return Err(Error::Io(e));
                    }
                }
                Some(event) = events.recv() => {
                    if event.kind == ChangeKind::Remove {
                        return Ok(());
                    }
                    match status.poll() {
                        Progress::Up => return Ok(()),
                        Progress::Milestone(label) => {
                            info!(milestone = %label, "Background process progress");
                            deadline = Instant::now() + self.config.progress_timeout();
                        }
                        Progress::Unchanged => {}
                    }
                }
                exit = child.wait() => {
                    let code = match exit {
                        Ok(status) => status.code().unwrap_or(1),
                        Err(_) => 1,
                    };
                    return Err(Error::DaemonExited(code));
                }
                _ = ticker.tick() => {
                    match status.poll() {
                        Progress::Up => return Ok(()),
                        Progress::Milestone(label) => {
                            info!(milestone = %label, "Background process progress");
                            deadline = Instant::now() + self.config.progress_timeout();
                        }
                        Progress::Unchanged => {
                            if Instant::now() >= deadline {
                                warn!(pid = child_pid, "Background process stopped reporting progress");
                                let _ = child.start_kill();
                                return Err(Error::DaemonTimeout);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Report a milestone to the foreground process.
    ///
    /// A no-op outside of a background copy. [`UP`] detaches standard
    /// streams (to `/dev/null`) and ends the handshake; use
    /// [`Daemonizer::notify_up`] to keep output in a log file instead.
    pub fn notify_foreground(label: &str) -> Result<()> {
        if label == UP {
            return Self::notify_up(None);
        }
        let Some(status_file) = status_file_from_env() else {
            return Ok(());
        };
        fs::write(&status_file, label)?;
        Ok(())
    }

    /// Final milestone: point stdio at `output` (or `/dev/null`) and remove
    /// the status file.
    pub fn notify_up(output: Option<&Path>) -> Result<()> {
        let Some(status_file) = status_file_from_env() else {
            return Ok(());
        };
        redirect_stdio(output)?;
        std::env::remove_var(STATUS_FILE_ENV);
        std::env::remove_var(WATCH_PID_ENV);
        match fs::remove_file(&status_file) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    /// Watch the process recorded as our parent; the receiver fires when it
    /// disappears. `None` when there is nothing to watch.
    pub fn watch_parent(&self) -> Result<Option<oneshot::Receiver<()>>> {
        let Some(raw) = std::env::var_os(WATCH_PID_ENV).filter(|v| !v.is_empty()) else {
            return Ok(None);
        };
        let pid: u32 = raw.to_string_lossy().parse().map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid {}: {:?}", WATCH_PID_ENV, raw),
            )
        })?;
        Ok(Some(watch_pid(pid, self.config.parent_poll(), SystemProbe)))
    }
}

fn status_file_from_env() -> Option<PathBuf> {
    if !Daemonizer::is_child() {
        return None;
    }
    std::env::var_os(STATUS_FILE_ENV)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

/// Poll `pid` every `interval`; the receiver fires once it is gone
pub fn watch_pid<P>(pid: u32, interval: Duration, probe: P) -> oneshot::Receiver<()>
where
    P: ProcessProbe + 'static,
{
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if tx.is_closed() {
                return;
            }
            if !probe.is_alive(pid) {
                info!(pid, "Watched process is gone");
                let _ = tx.send(());
                return;
            }
        }
    });
    rx
}

#[cfg(unix)]
fn redirect_stdio(output: Option<&Path>) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let null = fs::OpenOptions::new().read(true).write(true).open("/dev/null")?;
    let out = match output {
        Some(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::OpenOptions::new().create(true).append(true).open(path)?
        }
        None => null.try_clone()?,
    };

    for (src, dst) in [
        (null.as_raw_fd(), libc::STDIN_FILENO),
        (out.as_raw_fd(), libc::STDOUT_FILENO),
        (out.as_raw_fd(), libc::STDERR_FILENO),
    ] {
        if unsafe { libc::dup2(src, dst) } < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn redirect_stdio(_output: Option<&Path>) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_status_file_progress() {
        let tmp = TempDir::new().unwrap();
        let mut status = StatusFile::create(tmp.path()).unwrap();
        let name = status.path().file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.ends_with("-status"));

        assert_eq!(status.poll(), Progress::Unchanged);

        fs::write(status.path(), "boot").unwrap();
        assert_eq!(status.poll(), Progress::Milestone("boot".to_string()));
        assert_eq!(status.poll(), Progress::Unchanged);

        fs::write(status.path(), "started").unwrap();
        assert_eq!(status.poll(), Progress::Milestone("started".to_string()));

        fs::remove_file(status.path()).unwrap();
        assert_eq!(status.poll(), Progress::Up);
    }

    #[test]
    fn test_status_file_removed_on_drop() {
        let tmp = TempDir::new().unwrap();
        let path = {
            let status = StatusFile::create(tmp.path()).unwrap();
            status.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn test_notify_outside_background_is_noop() {
        if Daemonizer::is_child() {
            return;
        }
        Daemonizer::notify_foreground("boot").unwrap();
        Daemonizer::notify_foreground(UP).unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_watch_pid_fires_when_process_exits() {
        let mut child = Command::new("sleep").arg("0.2").spawn().unwrap();
        let pid = child.id().unwrap();
        let gone = watch_pid(pid, Duration::from_millis(50), SystemProbe);

        child.wait().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), gone)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_watch_pid_stays_quiet_while_alive() {
        let mut gone = watch_pid(std::process::id(), Duration::from_millis(20), SystemProbe);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(gone.try_recv().is_err());
    }

    #[cfg(unix)]
    fn sh_daemonizer(tmp: &TempDir, script: &str) -> Daemonizer {
        let config = DaemonConfig {
            progress_timeout_secs: 1,
            poll_interval_ms: 50,
            ..DaemonConfig::default()
        };
        Daemonizer::new(config, tmp.path().join("status")).with_program("sh", ["-c", script])
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_background_up_when_status_file_removed() {
        let tmp = TempDir::new().unwrap();
        let daemonizer = sh_daemonizer(
            &tmp,
            r#"echo boot > "$DEVHOST_STATUS_FILE"; sleep 0.3; rm -f "$DEVHOST_STATUS_FILE"; sleep 1"#,
        );

        tokio::time::timeout(Duration::from_secs(10), daemonizer.background())
            .await
            .unwrap()
            .unwrap();
        let leftovers = fs::read_dir(tmp.path().join("status")).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_background_up_milestone() {
        let tmp = TempDir::new().unwrap();
        let daemonizer = sh_daemonizer(
            &tmp,
            r#"test -n "$DEVHOST_WATCH_PID" || exit 9; echo started > "$DEVHOST_STATUS_FILE"; sleep 0.3; echo up > "$DEVHOST_STATUS_FILE"; sleep 1"#,
        );

        tokio::time::timeout(Duration::from_secs(10), daemonizer.background())
            .await
            .unwrap()
            .unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_background_reports_early_exit() {
        let tmp = TempDir::new().unwrap();
        let daemonizer = sh_daemonizer(&tmp, r#"echo boot > "$DEVHOST_STATUS_FILE"; exit 7"#);

        let err = tokio::time::timeout(Duration::from_secs(10), daemonizer.background())
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, Error::DaemonExited(7)), "unexpected error: {}", err);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_background_times_out_without_progress() {
        let tmp = TempDir::new().unwrap();
        let daemonizer = sh_daemonizer(&tmp, "exec sleep 30");

        let started = Instant::now();
        let err = tokio::time::timeout(Duration::from_secs(10), daemonizer.background())
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, Error::DaemonTimeout), "unexpected error: {}", err);
        assert!(started.elapsed() >= Duration::from_secs(1));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_background_milestones_extend_deadline() {
        let tmp = TempDir::new().unwrap();
        let daemonizer = sh_daemonizer(
            &tmp,
            r#"for step in one two three; do echo $step > "$DEVHOST_STATUS_FILE"; sleep 0.6; done; rm -f "$DEVHOST_STATUS_FILE"; sleep 1"#,
        );

        tokio::time::timeout(Duration::from_secs(10), daemonizer.background())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_background_spawn_failure() {
        let tmp = TempDir::new().unwrap();
        let daemonizer = Daemonizer::new(DaemonConfig::default(), tmp.path().join("status"))
            .with_program(tmp.path().join("missing-binary"), Vec::<OsString>::new());

        let err = daemonizer.background().await.unwrap_err();
        assert!(matches!(err, Error::RespawnFailure(_)), "unexpected error: {}", err);
    }
}
