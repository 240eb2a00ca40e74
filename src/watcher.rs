//! Filesystem change notifications.
//!
//! A thin layer over `notify`: [`watch`] registers a path and forwards
//! matching events into a tokio channel. Dropping the returned [`Watch`]
//! stops the watch.

use crate::error::{Error, Result};
use notify::event::ModifyKind;
use notify::{recommended_watcher, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::ops::BitOr;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Kind of a filesystem change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Create,
    Write,
    Remove,
    Rename,
}

impl ChangeKind {
    fn bit(self) -> u8 {
        match self {
            ChangeKind::Create => 0b0001,
            ChangeKind::Write => 0b0010,
            ChangeKind::Remove => 0b0100,
            ChangeKind::Rename => 0b1000,
        }
    }
}

/// Set of change kinds a watch is interested in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventMask(u8);

impl EventMask {
    pub const CREATE: EventMask = EventMask(0b0001);
    pub const WRITE: EventMask = EventMask(0b0010);
    pub const REMOVE: EventMask = EventMask(0b0100);
    pub const RENAME: EventMask = EventMask(0b1000);
    pub const ALL: EventMask = EventMask(0b1111);

    pub fn contains(self, kind: ChangeKind) -> bool {
        self.0 & kind.bit() != 0
    }
}

impl BitOr for EventMask {
    type Output = EventMask;

    fn bitor(self, rhs: EventMask) -> EventMask {
        EventMask(self.0 | rhs.0)
    }
}

/// One change to one path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

/// Active watch; dropping it unregisters the path
pub struct Watch {
    path: PathBuf,
    _watcher: RecommendedWatcher,
}

impl Watch {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for Watch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watch").field("path", &self.path).finish()
    }
}

fn classify(kind: &EventKind) -> Option<ChangeKind> {
    match kind {
        EventKind::Create(_) => Some(ChangeKind::Create),
        EventKind::Modify(ModifyKind::Name(_)) => Some(ChangeKind::Rename),
        EventKind::Modify(_) => Some(ChangeKind::Write),
        EventKind::Remove(_) => Some(ChangeKind::Remove),
        EventKind::Any => Some(ChangeKind::Write),
        EventKind::Access(_) | EventKind::Other => None,
    }
}

/// Watch `path` and forward events matching `mask` into `sender`.
///
/// Events the receiver has no room for are dropped; the OS notification
/// thread never blocks on a slow consumer.
pub fn watch(
    path: &Path,
    recursive: bool,
    sender: mpsc::Sender<FsEvent>,
    mask: EventMask,
) -> Result<Watch> {
    let watch_failure = |source| Error::WatchFailure {
        path: path.to_path_buf(),
        source,
    };

    let mut watcher = recommended_watcher(move |event: notify::Result<notify::Event>| {
        let event = match event {
            Ok(event) => event,
            Err(e) => {
                debug!(error = %e, "Watcher error");
                return;
            }
        };
        let Some(kind) = classify(&event.kind) else {
            return;
        };
        if !mask.contains(kind) {
            return;
        }
        for path in event.paths {
            trace!(path = %path.display(), ?kind, "Filesystem event");
            let _ = sender.try_send(FsEvent { path, kind });
        }
    })
    .map_err(watch_failure)?;

    let mode = if recursive {
        RecursiveMode::Recursive
    } else {
        RecursiveMode::NonRecursive
    };
    watcher.watch(path, mode).map_err(watch_failure)?;

    Ok(Watch {
        path: path.to_path_buf(),
        _watcher: watcher,
    })
}

/// Editor backup files (`file.php~`) never trigger restarts
pub fn is_editor_backup(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.ends_with('~'))
        .unwrap_or(false)
        || path
            .file_name()
            .and_then(|name| name.to_str())
            .map(|name| name.ends_with('~'))
            .unwrap_or(false)
}
