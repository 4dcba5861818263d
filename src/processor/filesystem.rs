//! Filesystem collaborators: path predicates and folder listing.
//!
//! The processor never touches the filesystem directly. It asks a
//! [`FileSystem`] for the current files of a folder, filtered by a
//! [`PathFilter`]. All I/O failures are absorbed here and degrade to
//! "file not observed this round".

use std::collections::BTreeMap;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use glob::{MatchOptions, Pattern};
use parking_lot::RwLock;
use walkdir::WalkDir;

use super::error::ProcessorError;
use crate::types::FileSnapshot;

/// Pure predicate deciding which paths a folder monitors.
pub trait PathFilter: Send + Sync {
    fn accepts(&self, path: &Path) -> bool;
}

impl<F> PathFilter for F
where
    F: Fn(&Path) -> bool + Send + Sync,
{
    fn accepts(&self, path: &Path) -> bool {
        self(path)
    }
}

/// Case-insensitive glob patterns matched against the file name.
#[derive(Debug, Clone)]
pub struct GlobFilter {
    patterns: Vec<Pattern>,
}

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

impl GlobFilter {
    /// Compile the given patterns. An empty list accepts nothing.
    pub fn new<I, S>(patterns: I) -> Result<Self, ProcessorError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|p| {
                let p = p.as_ref();
                Pattern::new(p).map_err(|e| ProcessorError::InvalidPattern {
                    pattern: p.to_string(),
                    reason: e.msg.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { patterns })
    }

    /// Filter accepting `*.xml` in any letter case.
    pub fn xml() -> Self {
        Self {
            patterns: vec![Pattern::new("*.xml").expect("static pattern is valid")],
        }
    }
}

impl PathFilter for GlobFilter {
    fn accepts(&self, path: &Path) -> bool {
        let Some(name) = path.file_name() else {
            return false;
        };
        let name = name.to_string_lossy();
        self.patterns
            .iter()
            .any(|p| p.matches_with(&name, MATCH_OPTIONS))
    }
}

/// Capability to list the current files directly inside a folder.
///
/// Implementations must not fail: a missing folder yields an empty list,
/// and files whose attributes cannot be read are omitted.
pub trait FileSystem: Send + Sync {
    fn list_files(&self, folder: &Path, filter: &dyn PathFilter) -> Vec<FileSnapshot>;
}

/// [`FileSystem`] backed by the local disk.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFileSystem;

impl LocalFileSystem {
    pub fn new() -> Self {
        Self
    }
}

fn snapshot_from(path: &Path, metadata: &Metadata) -> std::io::Result<FileSnapshot> {
    let modified = metadata.modified()?;
    // Not every filesystem records a birth time.
    let created = metadata.created().unwrap_or(modified);
    Ok(FileSnapshot::new(path, created, modified))
}

impl FileSystem for LocalFileSystem {
    fn list_files(&self, folder: &Path, filter: &dyn PathFilter) -> Vec<FileSnapshot> {
        if !folder.exists() {
            return Vec::new();
        }

        let mut snapshots = Vec::new();
        let walker = WalkDir::new(folder)
            .min_depth(1)
            .max_depth(1)
            .follow_links(true);

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!("[fs] cannot list {}: {e}", folder.display());
                    continue;
                }
            };

            if entry.file_type().is_dir() || !filter.accepts(entry.path()) {
                continue;
            }

            match entry
                .metadata()
                .map_err(std::io::Error::from)
                .and_then(|meta| snapshot_from(entry.path(), &meta))
            {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => {
                    tracing::warn!("[fs] cannot read {}: {e}", entry.path().display());
                }
            }
        }

        crate::debug_event!(
            "fs",
            "listed",
            "{} files in {}",
            snapshots.len(),
            folder.display()
        );
        snapshots
    }
}

/// In-memory [`FileSystem`] with explicit timestamps.
///
/// Useful for dry runs and for exercising change detection without
/// depending on filesystem timestamp resolution.
#[derive(Debug, Default)]
pub struct MemoryFileSystem {
    files: RwLock<BTreeMap<PathBuf, FileSnapshot>>,
}

impl MemoryFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a file.
    pub fn put(&self, snapshot: FileSnapshot) {
        self.files
            .write()
            .insert(snapshot.path().to_path_buf(), snapshot);
    }

    /// Insert or replace a file stamped with the current time.
    pub fn touch(&self, path: impl Into<PathBuf>) -> FileSnapshot {
        let now = SystemTime::now();
        let snapshot = FileSnapshot::new(path, now, now);
        self.put(snapshot.clone());
        snapshot
    }

    /// Delete a file. Returns `false` if it did not exist.
    pub fn remove(&self, path: &Path) -> bool {
        self.files.write().remove(path).is_some()
    }

    pub fn len(&self) -> usize {
        self.files.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.read().is_empty()
    }
}

impl FileSystem for MemoryFileSystem {
    fn list_files(&self, folder: &Path, filter: &dyn PathFilter) -> Vec<FileSnapshot> {
        self.files
            .read()
            .values()
            .filter(|s| s.path().parent() == Some(folder) && filter.accepts(s.path()))
            .cloned()
            .collect()
    }
}
