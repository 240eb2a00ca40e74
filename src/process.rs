//! OS process capabilities: liveness probing, signalling and process-group
//! termination.
//!
//! Everything platform specific about processes lives here so the record
//! store, the supervisor and the daemonizer never assume POSIX signal
//! semantics directly.

use std::fmt::Debug;
use std::io;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Answers "is this pid alive?" without waiting on the process
pub trait ProcessProbe: Debug + Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
}

/// Probe backed by the operating system: signal 0 on unix, the process
/// table on Windows.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

impl ProcessProbe for SystemProbe {
    #[cfg(unix)]
    fn is_alive(&self, pid: u32) -> bool {
        if pid == 0 || pid > i32::MAX as u32 {
            return false;
        }
        let result = unsafe { libc::kill(pid as libc::pid_t, 0) };
        if result == 0 {
            return true;
        }
        // EPERM means the process exists but belongs to someone else
        io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
    }

    #[cfg(windows)]
    fn is_alive(&self, pid: u32) -> bool {
        if pid == 0 {
            return false;
        }
        let output = std::process::Command::new("tasklist")
            .args(["/FI", &format!("PID eq {}", pid), "/NH", "/FO", "CSV"])
            .output();
        match output {
            Ok(output) => String::from_utf8_lossy(&output.stdout).contains(&format!("\"{}\"", pid)),
            Err(_) => false,
        }
    }
}

/// Signals the supervisor and the daemonizer deliver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Interrupt,
    Terminate,
    Kill,
}

impl Signal {
    #[cfg(unix)]
    fn as_raw(self) -> libc::c_int {
        match self {
            Signal::Interrupt => libc::SIGINT,
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        }
    }
}

/// Deliver `signal` to a single process
#[cfg(unix)]
pub fn send_signal(pid: u32, signal: Signal) -> io::Result<()> {
    if pid == 0 {
        return Ok(());
    }
    let result = unsafe { libc::kill(pid as libc::pid_t, signal.as_raw()) };
    if result != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Windows has no signals, every request ends the process tree
#[cfg(windows)]
pub fn send_signal(pid: u32, _signal: Signal) -> io::Result<()> {
    kill_tree(pid)
}

/// Deliver `signal` to the process group led by `pid`.
///
/// Falls back to the single process when `pid` shares our own group, so a
/// child that was not started in its own group never takes us down with it.
#[cfg(unix)]
pub fn signal_group(pid: u32, signal: Signal) -> io::Result<()> {
    if pid == 0 {
        return Ok(());
    }
    let pgid = unsafe { libc::getpgid(pid as libc::pid_t) };
    if pgid < 0 {
        return Err(io::Error::last_os_error());
    }
    let own = unsafe { libc::getpgrp() };
    if pgid == own || pgid <= 1 {
        return send_signal(pid, signal);
    }
    let result = unsafe { libc::killpg(pgid, signal.as_raw()) };
    if result != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(windows)]
pub fn signal_group(pid: u32, _signal: Signal) -> io::Result<()> {
    kill_tree(pid)
}

/// Kill a process and all of its descendants
#[cfg(windows)]
pub fn kill_tree(pid: u32) -> io::Result<()> {
    let status = std::process::Command::new("taskkill")
        .args(["/F", "/T", "/PID", &pid.to_string()])
        .status()?;
    if !status.success() {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            format!("taskkill exited with {}", status),
        ));
    }
    Ok(())
}

/// Ask a process group to terminate, wait up to `grace`, then kill it
pub async fn stop_group(pid: u32, grace: Duration, probe: &dyn ProcessProbe) -> io::Result<()> {
    if !probe.is_alive(pid) {
        return Ok(());
    }

    debug!(pid, "Sending termination signal to process group");
    if let Err(e) = signal_group(pid, Signal::Terminate) {
        if is_no_such_process(&e) {
            return Ok(());
        }
        return Err(e);
    }

    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if !probe.is_alive(pid) {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    warn!(pid, grace_secs = grace.as_secs(), "Grace period exceeded, killing process group");
    match signal_group(pid, Signal::Kill) {
        Err(e) if !is_no_such_process(&e) => Err(e),
        _ => Ok(()),
    }
}

fn is_no_such_process(err: &io::Error) -> bool {
    #[cfg(unix)]
    {
        err.raw_os_error() == Some(libc::ESRCH)
    }
    #[cfg(not(unix))]
    {
        err.kind() == io::ErrorKind::NotFound
    }
}

/// Pid of our parent process
pub fn parent_pid() -> u32 {
    #[cfg(unix)]
    {
        unsafe { libc::getppid() as u32 }
    }
    #[cfg(not(unix))]
    {
        0
    }
}

/// Start the command in its own process group so a group signal reaches
/// everything it spawns.
pub fn isolate_process_group(cmd: &mut Command) {
    #[cfg(unix)]
    {
        cmd.process_group(0);
    }
    #[cfg(windows)]
    {
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
        cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
    }
}

/// Detach the command from our session and controlling terminal
pub fn detach_session(cmd: &mut Command) {
    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
    #[cfg(windows)]
    {
        const DETACHED_PROCESS: u32 = 0x0000_0008;
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
        cmd.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
    }
}

/// Interrupt and termination requests delivered to this process
pub struct SignalListener {
    #[cfg(unix)]
    interrupt: tokio::signal::unix::Signal,
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl SignalListener {
    pub fn new() -> io::Result<Self> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            Ok(Self {
                interrupt: signal(SignalKind::interrupt())?,
                terminate: signal(SignalKind::terminate())?,
            })
        }
        #[cfg(not(unix))]
        {
            Ok(Self {})
        }
    }

    /// Next signal; `None` once the OS stream is closed
    pub async fn recv(&mut self) -> Option<Signal> {
        #[cfg(unix)]
        {
            tokio::select! {
                s = self.interrupt.recv() => s.map(|_| Signal::Interrupt),
                s = self.terminate.recv() => s.map(|_| Signal::Terminate),
            }
        }
        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await.ok().map(|_| Signal::Interrupt)
        }
    }
}
