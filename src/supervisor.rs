//! Running a command once or under supervision.
//!
//! In loop modes the command is restarted when a watched path changes and,
//! after a back-off, when it exits with an error. Coordination happens
//! through small channels: OS signals, a single-slot restart request
//! (further change events are dropped while one is pending), and a oneshot
//! carrying the child's exit status.

use crate::config::{Config, SupervisorConfig};
use crate::daemon::{self, Daemonizer};
use crate::error::{Error, Result};
use crate::process::{self, Signal, SignalListener};
use crate::record::ProcessRecord;
use crate::watcher::{self, EventMask, FsEvent, Watch};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerMode {
    /// Run once in the foreground, no restart
    Once,
    /// Stay in the foreground and restart
    LoopAttached,
    /// Go to the background, then restart
    LoopDetached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The command finished or was stopped by a signal
    Completed,
    /// A background copy took over; the caller should exit
    Backgrounded,
}

/// Mutates the command before each start
pub type BuildCommandHook = Box<dyn Fn(&mut Command) -> anyhow::Result<()> + Send + Sync>;

pub struct Runner {
    mode: RunnerMode,
    binary: PathBuf,
    command: Vec<String>,
    record: ProcessRecord,
    settings: SupervisorConfig,
    daemonizer: Daemonizer,
    build_command_hook: Option<BuildCommandHook>,
    always_restart_on_exit: bool,
    listen: Option<(u16, String)>,
    watch_parent: bool,
}

impl Runner {
    /// Supervise `command` under `record`.
    ///
    /// The binary is resolved immediately; when it cannot be found the record
    /// is removed and `BinaryNotFound` returned.
    pub fn new(
        mut record: ProcessRecord,
        command: Vec<String>,
        mode: RunnerMode,
        config: &Config,
    ) -> Result<Self> {
        let program = command.first().cloned().unwrap_or_default();
        let binary = match find_binary(&program, Path::new(&record.dir)) {
            Some(binary) => binary,
            None => {
                let _ = record.remove();
                return Err(Error::BinaryNotFound(program));
            }
        };

        Ok(Self {
            mode,
            binary,
            command,
            record,
            settings: config.supervisor.clone(),
            daemonizer: Daemonizer::new(config.daemon.clone(), config.var_dir()),
            build_command_hook: None,
            always_restart_on_exit: false,
            listen: None,
            watch_parent: false,
        })
    }

    pub fn with_build_command_hook(mut self, hook: BuildCommandHook) -> Self {
        self.build_command_hook = Some(hook);
        self
    }

    /// Restart immediately whenever the command exits
    pub fn always_restart_on_exit(mut self, enabled: bool) -> Self {
        self.always_restart_on_exit = enabled;
        self
    }

    /// Port and scheme published in the record (web servers)
    pub fn with_listen(mut self, port: u16, scheme: impl Into<String>) -> Self {
        self.listen = Some((port, scheme.into()));
        self
    }

    /// Daemonizer used by [`RunnerMode::LoopDetached`]
    pub fn with_daemonizer(mut self, daemonizer: Daemonizer) -> Self {
        self.daemonizer = daemonizer;
        self
    }

    /// Leave when the process that started the background copy disappears
    pub fn with_parent_watch(mut self, enabled: bool) -> Self {
        self.watch_parent = enabled;
        self
    }

    pub fn record(&self) -> &ProcessRecord {
        &self.record
    }

    pub fn mode(&self) -> RunnerMode {
        self.mode
    }

    fn label(&self) -> String {
        self.command.join(" ")
    }

    pub async fn run(&mut self) -> Result<RunOutcome> {
        if self.mode == RunnerMode::LoopDetached {
            if !Daemonizer::is_child() {
                match self.daemonizer.background().await {
                    Ok(()) => return Ok(RunOutcome::Backgrounded),
                    Err(e @ Error::DaemonExited(_)) => return Err(e),
                    Err(e) => {
                        warn!(error = %e, "Unable to go to the background, continuing in the foreground");
                        self.mode = RunnerMode::Once;
                    }
                }
            } else {
                Daemonizer::notify_foreground("boot").map_err(|e| {
                    Error::RespawnFailure(format!("unable to report progress: {}", e))
                })?;
            }
        }

        let mut signals = SignalListener::new()?;
        let (restart_tx, mut restart_rx) = mpsc::channel::<()>(1);
        let _watches = self.watch_paths(restart_tx)?;

        let mut parent_gone = if self.watch_parent {
            self.daemonizer.watch_parent()?
        } else {
            None
        };

        let mut first_boot = self.mode != RunnerMode::Once;
        let looping = self.mode != RunnerMode::Once || !self.record.watch.is_empty();
        let mut pid = std::process::id();
        let (port, scheme) = self.listen.clone().unwrap_or((0, String::new()));

        loop {
            let mut cmd = self.build_command()?;
            let mut child = cmd.spawn().map_err(|e| Error::BootFailure {
                command: self.label(),
                reason: format!("failed to start: {}", e),
            })?;
            let child_pid = child.id().unwrap_or(0);
            debug!(command = %self.label(), pid = child_pid, "Command started");

            let (exit_tx, mut exit_rx) = oneshot::channel::<io::Result<ExitStatus>>();
            tokio::spawn(async move {
                let _ = exit_tx.send(child.wait().await);
            });

            let mut early_exit = None;
            if first_boot {
                if self.mode == RunnerMode::LoopDetached {
                    let _ = Daemonizer::notify_foreground("started");
                }
                tokio::select! {
                    exit = &mut exit_rx => {
                        let exit = received(exit);
                        if let Err(e) = check_exit(&self.label(), &exit) {
                            return Err(Error::BootFailure {
                                command: self.label(),
                                reason: e.to_string(),
                            });
                        }
                        early_exit = Some(exit);
                    }
                    _ = tokio::time::sleep(self.settings.relief()) => {}
                }
            }

            if self.mode == RunnerMode::LoopAttached {
                pid = child_pid;
            }
            if first_boot || self.mode == RunnerMode::LoopAttached {
                self.record.write(pid, port, &scheme)?;
            }
            if first_boot && self.mode == RunnerMode::LoopDetached {
                let log_path = self.record.log_path();
                Daemonizer::notify_up(Some(&log_path))?;
            }
            first_boot = false;

            let exit = match early_exit {
                Some(exit) => exit,
                None => {
                    tokio::select! {
                        Some(signal) = signals.recv() => {
                            info!(?signal, command = %self.label(), "Signal received, forwarding to command and exiting");
                            return self.forward_and_wait(child_pid, signal, exit_rx).await;
                        }
                        _ = parent_exit(&mut parent_gone) => {
                            info!("Parent process is gone, leaving");
                            return self.forward_and_wait(child_pid, Signal::Terminate, exit_rx).await;
                        }
                        Some(()) = restart_rx.recv() => {
                            if let Err(e) = process::send_signal(child_pid, Signal::Terminate) {
                                debug!(pid = child_pid, error = %e, "Unable to terminate command");
                            }
                            // drain the exit so the waiter task finishes
                            let _ = exit_rx.await;
                            info!(command = %self.label(), "Restarting command");
                            continue;
                        }
                        exit = &mut exit_rx => received(exit),
                    }
                }
            };

            let result = check_exit(&self.label(), &exit);

            if !looping {
                result?;
                self.record.remove()?;
                return Ok(RunOutcome::Completed);
            }

            if self.always_restart_on_exit {
                warn!(command = %self.label(), "Command exited, restarting it immediately");
                continue;
            }

            match &result {
                Err(e) => error!(
                    error = %e,
                    backoff_secs = self.settings.backoff().as_secs(),
                    "Command failed, waiting before restarting it"
                ),
                Ok(()) => info!(
                    command = %self.label(),
                    backoff_secs = self.settings.backoff().as_secs(),
                    "Command exited, waiting before restarting it"
                ),
            }

            tokio::select! {
                Some(signal) = signals.recv() => {
                    info!(?signal, "Signal received, exiting");
                    return Ok(RunOutcome::Completed);
                }
                _ = parent_exit(&mut parent_gone) => {
                    info!("Parent process is gone, leaving");
                    return Ok(RunOutcome::Completed);
                }
                Some(()) = restart_rx.recv() => {}
                _ = tokio::time::sleep(self.settings.backoff()) => {}
            }

            info!(command = %self.label(), "Restarting command");
        }
    }

    async fn forward_and_wait(
        &self,
        child_pid: u32,
        signal: Signal,
        exit_rx: oneshot::Receiver<io::Result<ExitStatus>>,
    ) -> Result<RunOutcome> {
        process::send_signal(child_pid, signal)?;
        if tokio::time::timeout(self.settings.stop_grace(), exit_rx)
            .await
            .is_err()
        {
            warn!(pid = child_pid, "Command did not exit in time");
        }
        Ok(RunOutcome::Completed)
    }

    fn build_command(&mut self) -> Result<Command> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(self.command.iter().skip(1))
            .current_dir(&self.record.dir)
            .env_remove(daemon::STATUS_FILE_ENV)
            .env_remove(daemon::WATCH_PID_ENV)
            .env_remove(daemon::SHELL_PID_ENV)
            .kill_on_drop(true);

        if self.mode == RunnerMode::Once {
            cmd.stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit());
        } else {
            let log = self.record.log_writer()?;
            cmd.stdin(Stdio::null())
                .stdout(log.try_clone()?)
                .stderr(log);
            process::isolate_process_group(&mut cmd);
        }

        if let Some(hook) = &self.build_command_hook {
            hook(&mut cmd).map_err(|e| Error::BootFailure {
                command: self.label(),
                reason: format!("unable to build the command: {}", e),
            })?;
        }

        Ok(cmd)
    }

    /// Register every watched path; change events feed the single-slot
    /// restart channel.
    fn watch_paths(&self, restart_tx: mpsc::Sender<()>) -> Result<Vec<Watch>> {
        if self.record.watch.is_empty() {
            return Ok(Vec::new());
        }

        let (events_tx, mut events_rx) = mpsc::channel::<FsEvent>(10);
        let mut watches = Vec::new();
        for watched in &self.record.watch {
            let path = resolve(Path::new(&self.record.dir), watched);
            let metadata = match std::fs::metadata(&path) {
                Ok(metadata) => metadata,
                Err(_) => {
                    debug!(path = %path.display(), "Skipping missing watch path");
                    continue;
                }
            };
            if metadata.is_dir() {
                info!(path = %path.display(), "Watching directory");
            } else {
                info!(path = %path.display(), "Watching file");
            }
            watches.push(watcher::watch(&path, metadata.is_dir(), events_tx.clone(), EventMask::ALL)?);
        }
        drop(events_tx);

        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                if watcher::is_editor_backup(&event.path) {
                    continue;
                }
                debug!(path = %event.path.display(), kind = ?event.kind, "Watched path changed");
                let _ = restart_tx.try_send(());
            }
        });

        Ok(watches)
    }
}

async fn parent_exit(parent_gone: &mut Option<oneshot::Receiver<()>>) {
    match parent_gone {
        Some(rx) => {
            let _ = rx.await;
        }
        None => std::future::pending::<()>().await,
    }
}

fn received(exit: std::result::Result<io::Result<ExitStatus>, oneshot::error::RecvError>) -> io::Result<ExitStatus> {
    match exit {
        Ok(exit) => exit,
        Err(_) => Err(io::Error::new(io::ErrorKind::Other, "exit status lost")),
    }
}

fn check_exit(command: &str, exit: &io::Result<ExitStatus>) -> Result<()> {
    match exit {
        Ok(status) if status.success() => Ok(()),
        Ok(status) => Err(Error::CommandFailed {
            command: command.to_string(),
            status: *status,
        }),
        Err(e) => Err(Error::Io(io::Error::new(e.kind(), e.to_string()))),
    }
}

fn resolve(base: &Path, path: &str) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Resolve `program` like a shell would: paths relative to `dir`, bare
/// names on PATH.
pub fn find_binary(program: &str, dir: &Path) -> Option<PathBuf> {
    if program.is_empty() {
        return None;
    }
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        let path = resolve(dir, program);
        return path.is_file().then_some(path);
    }

    let paths = std::env::var_os("PATH")?;
    for entry in std::env::split_paths(&paths) {
        let path = entry.join(program);
        if path.is_file() {
            return Some(path);
        }
        if cfg!(windows) {
            let exe = entry.join(format!("{}.exe", program));
            if exe.is_file() {
                return Some(exe);
            }
        }
    }
    None
}
