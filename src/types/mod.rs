//! Core value types shared by the processor and its collaborators.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Immutable observation of a file: path plus creation and modification times.
///
/// Two snapshots are equal iff all three fields are equal. A newer snapshot
/// for the same path replaces the older one in a folder's snapshot table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileSnapshot {
    path: PathBuf,
    created: SystemTime,
    modified: SystemTime,
}

/// A snapshot that was detected as new or changed and is being delivered.
pub type FileEvent = FileSnapshot;

impl FileSnapshot {
    pub fn new(path: impl Into<PathBuf>, created: SystemTime, modified: SystemTime) -> Self {
        Self {
            path: path.into(),
            created,
            modified,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn created(&self) -> SystemTime {
        self.created
    }

    pub fn modified(&self) -> SystemTime {
        self.modified
    }
}
