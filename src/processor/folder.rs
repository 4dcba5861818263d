//! Per-folder change detection bounded by a monitoring window.
//!
//! A [`MonitoredFolder`] keeps the last observed snapshot of every file in
//! one folder. Each call to [`MonitoredFolder::compute_changes`] diffs the
//! current listing against that table and reports files that are new or
//! changed, provided their creation or modification time falls inside the
//! folder's [`MonitoringWindow`].

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;

use super::filesystem::{FileSystem, PathFilter};
use crate::types::{FileEvent, FileSnapshot};

/// Time bounds outside of which a detected change is suppressed.
///
/// The start bound only moves forward; the stop bound only moves backward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitoringWindow {
    start: SystemTime,
    stop: Option<SystemTime>,
}

impl MonitoringWindow {
    /// Unbounded window starting at `start`.
    pub fn starting_at(start: SystemTime) -> Self {
        Self { start, stop: None }
    }

    pub fn start(&self) -> SystemTime {
        self.start
    }

    pub fn stop(&self) -> Option<SystemTime> {
        self.stop
    }

    /// Move the start bound to `start` if that is later than the current one.
    pub fn limit_start(&mut self, start: SystemTime) {
        if start > self.start {
            self.start = start;
        }
    }

    /// Move the stop bound to `stop` if that is earlier than the current one.
    pub fn limit_stop(&mut self, stop: SystemTime) {
        self.stop = Some(match self.stop {
            Some(current) if current <= stop => current,
            _ => stop,
        });
    }

    /// Whether `time` lies within `[start, stop]`.
    pub fn contains(&self, time: SystemTime) -> bool {
        time >= self.start && self.stop.is_none_or(|stop| time <= stop)
    }

    fn admits(&self, snapshot: &FileSnapshot) -> bool {
        self.contains(snapshot.created()) || self.contains(snapshot.modified())
    }
}

#[derive(Debug)]
struct FolderState {
    snapshots: HashMap<PathBuf, FileSnapshot>,
    window: MonitoringWindow,
}

/// A watched directory plus its report types and change-detection state.
pub struct MonitoredFolder {
    path: PathBuf,
    filter: Arc<dyn PathFilter>,
    report_types: HashSet<String>,
    /// Snapshot table and window; held for the whole of a scan.
    state: Mutex<FolderState>,
}

impl std::fmt::Debug for MonitoredFolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.try_lock();
        f.debug_struct("MonitoredFolder")
            .field("path", &self.path)
            .field("report_types", &self.report_types)
            .field("tracked_files", &state.as_ref().map(|s| s.snapshots.len()))
            .field("window", &state.as_ref().map(|s| s.window))
            .finish()
    }
}

impl MonitoredFolder {
    /// Create a folder monitored from `start` with no stop bound.
    ///
    /// Duplicate report types are collapsed.
    pub fn new<I, S>(
        path: impl Into<PathBuf>,
        filter: Arc<dyn PathFilter>,
        report_types: I,
        start: SystemTime,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            path: path.into(),
            filter,
            report_types: report_types.into_iter().map(Into::into).collect(),
            state: Mutex::new(FolderState {
                snapshots: HashMap::new(),
                window: MonitoringWindow::starting_at(start),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn report_types(&self) -> &HashSet<String> {
        &self.report_types
    }

    /// Current monitoring window.
    pub fn window(&self) -> MonitoringWindow {
        self.state.lock().window
    }

    /// Number of files currently held in the snapshot table.
    pub fn tracked_files(&self) -> usize {
        self.state.lock().snapshots.len()
    }

    pub fn limit_start(&self, start: SystemTime) {
        self.state.lock().window.limit_start(start);
    }

    pub fn limit_stop(&self, stop: SystemTime) {
        self.state.lock().window.limit_stop(stop);
    }

    /// Diff the folder against the previous call and return new changes.
    ///
    /// Concurrent calls on the same folder are serialized. Deleted files are
    /// forgotten without producing an event; a file re-created later is
    /// therefore reported again even with identical timestamps.
    pub fn compute_changes(&self, fs: &dyn FileSystem) -> Vec<FileEvent> {
        let mut state = self.state.lock();

        let current: HashMap<PathBuf, FileSnapshot> = fs
            .list_files(&self.path, self.filter.as_ref())
            .into_iter()
            .filter(|s| self.filter.accepts(s.path()))
            .map(|s| (s.path().to_path_buf(), s))
            .collect();

        state.snapshots.retain(|path, _| current.contains_key(path));

        let FolderState { snapshots, window } = &mut *state;
        let mut changes = Vec::new();
        for (path, snapshot) in current {
            if snapshots.get(&path) == Some(&snapshot) {
                continue;
            }

            tracing::trace!(
                "[folder] {} changed, window start {:?} stop {:?}",
                path.display(),
                window.start(),
                window.stop()
            );
            if window.admits(&snapshot) {
                changes.push(snapshot.clone());
            }
            snapshots.insert(path, snapshot);
        }

        if !changes.is_empty() {
            crate::debug_event!(
                "folder",
                "changes",
                "{} in {}",
                changes.len(),
                self.path.display()
            );
        }
        changes
    }
}
