//! Concurrent registries of monitored folders and handler slots.
//!
//! Both registries are safe to mutate from the scan scheduler, external
//! callers, and handler callbacks at the same time. Locking is per shard;
//! no guard is held while folders are scanned or handlers run.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::folder::MonitoredFolder;
use super::handler::{HandlerKey, HandlerSlot, ReportHandler};

/// Folders keyed by path; at most one active folder per path.
#[derive(Debug, Default)]
pub(crate) struct FolderRegistry {
    folders: DashMap<PathBuf, Arc<MonitoredFolder>>,
}

impl FolderRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Insert unless a folder with the same path is already registered.
    pub(crate) fn insert(&self, folder: MonitoredFolder) -> bool {
        match self.folders.entry(folder.path().to_path_buf()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(folder));
                true
            }
        }
    }

    pub(crate) fn remove(&self, path: &Path) -> Option<Arc<MonitoredFolder>> {
        self.folders.remove(path).map(|(_, folder)| folder)
    }

    pub(crate) fn get(&self, path: &Path) -> Option<Arc<MonitoredFolder>> {
        self.folders.get(path).map(|e| e.value().clone())
    }

    pub(crate) fn contains(&self, path: &Path) -> bool {
        self.folders.contains_key(path)
    }

    /// Point-in-time copy of the registered folders.
    pub(crate) fn snapshot(&self) -> Vec<Arc<MonitoredFolder>> {
        self.folders.iter().map(|e| e.value().clone()).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.folders.len()
    }
}

/// Handler slots keyed by handler identity.
#[derive(Default)]
pub(crate) struct HandlerRegistry {
    slots: DashMap<HandlerKey, Arc<HandlerSlot>>,
}

impl HandlerRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register unless this handler instance is already registered.
    pub(crate) fn register<I, S>(&self, handler: Arc<dyn ReportHandler>, report_types: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        match self.slots.entry(HandlerKey::of(handler.as_ref())) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(HandlerSlot::new(handler, report_types)));
                true
            }
        }
    }

    /// Remove and deactivate the slot of `handler`.
    pub(crate) fn unregister(&self, handler: &dyn ReportHandler) -> bool {
        match self.slots.remove(&HandlerKey::of(handler)) {
            Some((_, slot)) => {
                slot.deactivate();
                true
            }
            None => false,
        }
    }

    /// Slots subscribed to at least one of `report_types`, each listed once.
    pub(crate) fn interested_in(&self, report_types: &HashSet<String>) -> Vec<Arc<HandlerSlot>> {
        self.slots
            .iter()
            .filter(|e| e.value().matches_any(report_types))
            .map(|e| e.value().clone())
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("slots", &self.slots.len())
            .finish()
    }
}
