//! End-to-end tests driving the devhost binary as a supervisor
#![cfg(unix)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use devhost::daemon::{SHELL_PID_ENV, STATUS_FILE_ENV, WATCH_PID_ENV};
use devhost::process::{send_signal, Signal, SystemProbe};
use devhost::record::{ProcessRecord, RecordStore};
use tempfile::TempDir;
use tokio::process::Command;

const BIN: &str = env!("CARGO_BIN_EXE_devhost");

struct Project {
    home: PathBuf,
    dir: String,
    _tmp: TempDir,
}

impl Project {
    /// Fresh home and project directory with short supervisor timings
    fn new(backoff_secs: u64) -> Self {
        let tmp = TempDir::new().unwrap();
        let home = tmp.path().join("home");
        fs::create_dir_all(&home).unwrap();
        fs::write(
            home.join("config.toml"),
            format!(
                "[supervisor]\nrelief_ms = 300\nbackoff_secs = {}\nstop_grace_secs = 2\n\n[daemon]\nprogress_timeout_secs = 10\npoll_interval_ms = 50\n",
                backoff_secs
            ),
        )
        .unwrap();

        let project = tmp.path().join("project");
        fs::create_dir_all(&project).unwrap();
        let dir = project.canonicalize().unwrap().to_string_lossy().into_owned();

        Self {
            home,
            dir,
            _tmp: tmp,
        }
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(BIN);
        cmd.args(args)
            .env("DEVHOST_HOME", &self.home)
            .env("RUST_LOG", "devhost=debug")
            .env_remove(STATUS_FILE_ENV)
            .env_remove(WATCH_PID_ENV)
            .env_remove(SHELL_PID_ENV)
            .kill_on_drop(true);
        cmd
    }

    fn record(&self) -> ProcessRecord {
        RecordStore::new(&self.home, Arc::new(SystemProbe), Duration::from_secs(2)).locate(&self.dir, &[])
    }

    fn dir_flag(&self) -> String {
        format!("--dir={}", self.dir)
    }
}

async fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("timed out waiting for {}", what);
}

fn read(path: &Path) -> String {
    fs::read_to_string(path).unwrap_or_default()
}

#[tokio::test]
async fn test_daemon_start_returns_once_server_is_up() {
    let project = Project::new(1);
    let out = project.home.join("foreground.out");

    let dir_flag = project.dir_flag();
    let status = project
        .command(&[
            "server:start", "--daemon", &dir_flag, "--port", "18765",
            "--", "sh", "-c", "echo serving on $PORT; exec sleep 30",
        ])
        .stdout(Stdio::from(fs::File::create(&out).unwrap()))
        .stderr(Stdio::null())
        .status();
    let status = tokio::time::timeout(Duration::from_secs(30), status)
        .await
        .unwrap()
        .unwrap();
    assert!(status.success());
    assert!(read(&out).contains("Web server listening on http://127.0.0.1:18765"));

    let mut record = project.record();
    assert!(record.is_running(), "background copy did not leave a live record");
    assert_eq!(record.port, 18765);
    assert_eq!(record.scheme, "http");

    // the background copy points its own output and the command's at the log
    let log = record.log_path();
    wait_for("the command output in the log", || read(&log).contains("serving on 18765")).await;

    record.stop().await.unwrap();
    assert!(!project.record().is_running());
}

#[tokio::test]
async fn test_daemon_boot_failure_fails_foreground() {
    let project = Project::new(1);

    let dir_flag = project.dir_flag();
    let status = project
        .command(&["server:start", "--daemon", &dir_flag, "--port", "18766", "--", "sh", "-c", "exit 3"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    let status = tokio::time::timeout(Duration::from_secs(30), status)
        .await
        .unwrap()
        .unwrap();
    assert!(!status.success());
    assert!(!project.record().is_running());
}

#[tokio::test]
async fn test_signal_cuts_backoff_short() {
    let project = Project::new(30);

    let dir_flag = project.dir_flag();
    let mut supervisor = project
        .command(&["server:start", &dir_flag, "--port", "18767", "--", "sh", "-c", "sleep 0.5; exit 1"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    let supervisor_pid = supervisor.id().unwrap();

    wait_for("the first record", || project.record().pid != 0).await;
    // the command has failed and the supervisor sits in its back-off
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert!(supervisor.try_wait().unwrap().is_none());

    let signalled = Instant::now();
    send_signal(supervisor_pid, Signal::Terminate).unwrap();
    let status = tokio::time::timeout(Duration::from_secs(10), supervisor.wait())
        .await
        .unwrap()
        .unwrap();
    assert!(status.success());
    assert!(signalled.elapsed() < Duration::from_secs(10));
}
