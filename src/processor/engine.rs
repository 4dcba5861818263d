//! The report processor: periodic scanning and fan-out to handlers.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use tokio::runtime::Handle;

use super::error::ProcessorError;
use super::filesystem::{FileSystem, GlobFilter, LocalFileSystem, PathFilter};
use super::folder::MonitoredFolder;
use super::handler::ReportHandler;
use super::pool::{DeliveryPool, DeliveryStats};
use super::registry::{FolderRegistry, HandlerRegistry};
use super::scheduler::ScanScheduler;
use crate::config::ProcessorConfig;

/// Lifecycle of a [`ReportProcessor`]. Transitions are one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessorState {
    NotStarted,
    Running,
    StoppingGracefully,
    StoppingForced,
    /// Stopping, and both the scheduler and the delivery pool have quiesced.
    Terminated,
}

impl ProcessorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not-started",
            Self::Running => "running",
            Self::StoppingGracefully => "stopping-gracefully",
            Self::StoppingForced => "stopping-forced",
            Self::Terminated => "terminated",
        }
    }
}

impl std::fmt::Display for ProcessorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct Lifecycle {
    state: ProcessorState,
    started_at: Option<SystemTime>,
}

/// Everything a scan pass needs. Holds no reference to the engine itself.
#[derive(Clone)]
struct ScanContext {
    fs: Arc<dyn FileSystem>,
    handlers: Arc<HandlerRegistry>,
    pool: DeliveryPool,
}

impl ScanContext {
    async fn scan(&self, folders: Vec<Arc<MonitoredFolder>>) {
        for folder in folders {
            self.scan_folder(folder).await;
        }
    }

    /// Detect changes in one folder and queue one delivery per
    /// (event, interested handler) pair.
    async fn scan_folder(&self, folder: Arc<MonitoredFolder>) {
        let fs = self.fs.clone();
        let scanned = folder.clone();
        let events =
            match tokio::task::spawn_blocking(move || scanned.compute_changes(fs.as_ref())).await {
                Ok(events) => events,
                Err(e) => {
                    tracing::error!("[scan] {} failed: {e}", folder.path().display());
                    return;
                }
            };
        if events.is_empty() {
            return;
        }

        let slots = self.handlers.interested_in(folder.report_types());
        if slots.is_empty() {
            crate::debug_event!(
                "scan",
                "no handlers",
                "{} events in {}",
                events.len(),
                folder.path().display()
            );
            return;
        }

        for event in events {
            for slot in &slots {
                if !self.pool.submit(slot.clone(), event.clone()) {
                    tracing::warn!(
                        "[scan] delivery pool closed, dropped {} for {}",
                        event.path().display(),
                        slot.name()
                    );
                }
            }
        }
    }
}

struct Inner {
    scan_period: Duration,
    filter: Arc<dyn PathFilter>,
    folders: FolderRegistry,
    context: ScanContext,
    scheduler: ScanScheduler,
    lifecycle: Mutex<Lifecycle>,
    runtime: Handle,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // A graceful stop keeps draining on its own.
        if self.lifecycle.get_mut().state != ProcessorState::StoppingGracefully {
            self.scheduler.shutdown_now();
            self.context.pool.shutdown_now();
        }
    }
}

/// Folder-watching dispatch engine.
///
/// Periodically scans every monitored folder, detects files created or
/// modified inside the folder's monitoring window, and hands each change to
/// every handler subscribed to one of the folder's report types. Handlers
/// run on a bounded pool, so a slow handler never delays the next scan.
///
/// Cloning yields another handle to the same engine.
#[derive(Clone)]
pub struct ReportProcessor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ReportProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportProcessor")
            .field("state", &self.state())
            .field("scan_period", &self.inner.scan_period)
            .field("folders", &self.inner.folders.len())
            .field("handlers", &self.inner.context.handlers.len())
            .finish()
    }
}

impl ReportProcessor {
    pub fn builder() -> ReportProcessorBuilder {
        ReportProcessorBuilder::new()
    }

    /// Engine watching `*.xml` files on the local disk, on the ambient runtime.
    pub fn xml(scan_period: Duration) -> Result<Self, ProcessorError> {
        Self::builder()
            .file_system(Arc::new(LocalFileSystem::new()))
            .filter(GlobFilter::xml())
            .scan_period(scan_period)
            .build()
    }

    /// Start monitoring `path` for the given report types.
    ///
    /// Returns `false` if the path is already monitored. Files changed before
    /// the folder was added are never reported.
    pub fn add_folder<I, S>(&self, path: impl Into<PathBuf>, report_types: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let path = path.into();
        // Held across the insert so a concurrent start() sees this folder.
        let lifecycle = self.inner.lifecycle.lock();
        let now = SystemTime::now();
        let start = match lifecycle.started_at {
            Some(started) if started > now => started,
            _ => now,
        };

        let folder = MonitoredFolder::new(&path, self.inner.filter.clone(), report_types, start);
        let added = self.inner.folders.insert(folder);
        drop(lifecycle);

        if added {
            crate::log_event!("processor", "folder added", "{}", path.display());
        } else {
            crate::debug_event!("processor", "already monitored", "{}", path.display());
        }
        added
    }

    /// Stop monitoring `path`.
    ///
    /// Files present at removal time are still delivered by one final pass;
    /// files changed after removal are not. Returns `false` if the path was
    /// not monitored.
    pub fn remove_folder(&self, path: &Path) -> bool {
        // Held until the drain is scheduled so a concurrent shutdown either
        // closes the scheduler after it or captures this folder first.
        let lifecycle = self.inner.lifecycle.lock();
        let Some(folder) = self.inner.folders.remove(path) else {
            return false;
        };
        folder.limit_stop(SystemTime::now());

        let context = self.inner.context.clone();
        let scheduled = self
            .inner
            .scheduler
            .schedule_once(async move { context.scan_folder(folder).await });
        let state = lifecycle.state;
        drop(lifecycle);

        if scheduled {
            crate::log_event!("processor", "folder removed", "{}", path.display());
        } else if state == ProcessorState::StoppingGracefully {
            crate::debug_event!(
                "processor",
                "folder removed during shutdown, left to the final pass",
                "{}",
                path.display()
            );
        } else {
            tracing::warn!(
                "[processor] folder removed after forced shutdown, {} not drained",
                path.display()
            );
        }
        true
    }

    /// Subscribe `handler` to the given report types.
    ///
    /// Returns `false` if this handler instance is already registered.
    pub fn register_handler<I, S>(&self, handler: Arc<dyn ReportHandler>, report_types: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let name = handler.name().to_string();
        let registered = self.inner.context.handlers.register(handler, report_types);
        if registered {
            crate::log_event!("processor", "handler registered", "{name}");
        }
        registered
    }

    /// Unsubscribe `handler`. Deliveries to it that have not started yet
    /// are skipped; a delivery already running is not interrupted.
    ///
    /// Safe to call from inside the handler's own callback.
    pub fn unregister_handler(&self, handler: &dyn ReportHandler) -> bool {
        let removed = self.inner.context.handlers.unregister(handler);
        if removed {
            crate::log_event!("processor", "handler unregistered", "{}", handler.name());
        }
        removed
    }

    /// Begin periodic scanning. Only valid once, from `NotStarted`.
    pub fn start(&self) {
        let mut lifecycle = self.inner.lifecycle.lock();
        if lifecycle.state != ProcessorState::NotStarted {
            crate::debug_event!("processor", "start ignored", "{}", lifecycle.state);
            return;
        }

        let now = SystemTime::now();
        lifecycle.state = ProcessorState::Running;
        lifecycle.started_at = Some(now);
        for folder in self.inner.folders.snapshot() {
            folder.limit_start(now);
        }

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        self.inner
            .scheduler
            .schedule_with_fixed_delay(self.inner.scan_period, move || {
                let weak = weak.clone();
                async move {
                    let Some(inner) = weak.upgrade() else {
                        return false;
                    };
                    let folders = inner.folders.snapshot();
                    let context = inner.context.clone();
                    drop(inner);

                    context.scan(folders).await;
                    true
                }
            });
        drop(lifecycle);

        crate::log_event!(
            "processor",
            "started",
            "{} folders, scan every {:?}, {} workers",
            self.inner.folders.len(),
            self.inner.scan_period,
            self.inner.context.pool.workers()
        );
    }

    /// Stop scanning after one last pass over every folder, then let queued
    /// deliveries run to completion. Only valid from `Running`.
    pub fn shutdown(&self) {
        let mut lifecycle = self.inner.lifecycle.lock();
        if lifecycle.state != ProcessorState::Running {
            crate::debug_event!("processor", "shutdown ignored", "{}", lifecycle.state);
            return;
        }
        lifecycle.state = ProcessorState::StoppingGracefully;

        let now = SystemTime::now();
        let folders = self.inner.folders.snapshot();
        for folder in &folders {
            folder.limit_stop(now);
        }

        let context = self.inner.context.clone();
        self.inner
            .scheduler
            .shutdown_after(async move { context.scan(folders).await });

        // The pool may only close once every scheduled pass has queued its
        // deliveries.
        let scheduler = self.inner.scheduler.clone();
        let pool = self.inner.context.pool.clone();
        self.inner.runtime.spawn(async move {
            scheduler.wait().await;
            pool.close();
            crate::debug_event!("processor", "delivery pool closed");
        });
        drop(lifecycle);

        crate::log_event!("processor", "shutting down");
    }

    /// Stop immediately. Queued and running deliveries may be abandoned.
    pub fn shutdown_now(&self) {
        let mut lifecycle = self.inner.lifecycle.lock();
        if lifecycle.state == ProcessorState::StoppingForced {
            return;
        }
        lifecycle.state = ProcessorState::StoppingForced;
        self.inner.scheduler.shutdown_now();
        self.inner.context.pool.shutdown_now();
        drop(lifecycle);

        crate::log_event!("processor", "forced shutdown");
    }

    /// Wait for the scheduler and then the delivery pool to quiesce.
    ///
    /// Both waits share `timeout`. Returns `false` if it elapsed first.
    pub async fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;

        if tokio::time::timeout_at(deadline, self.inner.scheduler.wait())
            .await
            .is_err()
        {
            return false;
        }
        tokio::time::timeout_at(deadline, self.inner.context.pool.wait())
            .await
            .is_ok()
    }

    pub fn state(&self) -> ProcessorState {
        let state = self.inner.lifecycle.lock().state;
        match state {
            ProcessorState::StoppingGracefully | ProcessorState::StoppingForced
                if self.inner.scheduler.is_terminated()
                    && self.inner.context.pool.is_terminated() =>
            {
                ProcessorState::Terminated
            }
            other => other,
        }
    }

    pub fn folder_count(&self) -> usize {
        self.inner.folders.len()
    }

    pub fn handler_count(&self) -> usize {
        self.inner.context.handlers.len()
    }

    pub fn is_monitoring(&self, path: &Path) -> bool {
        self.inner.folders.contains(path)
    }

    /// The monitored folder at `path`, if any.
    pub fn folder(&self, path: &Path) -> Option<Arc<MonitoredFolder>> {
        self.inner.folders.get(path)
    }

    pub fn scan_period(&self) -> Duration {
        self.inner.scan_period
    }

    pub fn delivery_workers(&self) -> usize {
        self.inner.context.pool.workers()
    }

    /// Counters of delivery outcomes so far.
    pub fn delivery_stats(&self) -> DeliveryStats {
        self.inner.context.pool.stats()
    }
}

/// Builder for constructing a [`ReportProcessor`].
pub struct ReportProcessorBuilder {
    fs: Option<Arc<dyn FileSystem>>,
    filter: Option<Arc<dyn PathFilter>>,
    patterns: Option<Vec<String>>,
    scan_period: Duration,
    delivery_workers: usize,
    runtime: Option<Handle>,
}

impl ReportProcessorBuilder {
    /// Create a new builder with defaults.
    pub fn new() -> Self {
        let defaults = ProcessorConfig::default();
        Self {
            fs: None,
            filter: None,
            patterns: None,
            scan_period: defaults.scan_period(),
            delivery_workers: defaults.delivery_workers,
            runtime: None,
        }
    }

    /// Filesystem to scan. Defaults to [`LocalFileSystem`].
    pub fn file_system(mut self, fs: Arc<dyn FileSystem>) -> Self {
        self.fs = Some(fs);
        self
    }

    /// Path predicate for monitored files. Defaults to [`GlobFilter::xml`].
    pub fn filter(mut self, filter: impl PathFilter + 'static) -> Self {
        self.filter = Some(Arc::new(filter));
        self.patterns = None;
        self
    }

    /// Monitor files matching these glob patterns. Validated by `build`.
    pub fn patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.patterns = Some(patterns.into_iter().map(Into::into).collect());
        self.filter = None;
        self
    }

    /// Delay between the end of one scan and the start of the next.
    pub fn scan_period(mut self, period: Duration) -> Self {
        self.scan_period = period;
        self
    }

    /// Maximum number of handler deliveries running at once.
    pub fn delivery_workers(mut self, workers: usize) -> Self {
        self.delivery_workers = workers;
        self
    }

    /// Runtime to spawn on. Defaults to the runtime `build` is called on.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Apply scan period, worker count and file patterns from settings.
    pub fn config(self, config: &ProcessorConfig) -> Self {
        self.scan_period(config.scan_period())
            .delivery_workers(config.delivery_workers)
            .patterns(config.file_patterns.iter().cloned())
    }

    pub fn build(self) -> Result<ReportProcessor, ProcessorError> {
        if self.scan_period.is_zero() {
            return Err(ProcessorError::InvalidConfig {
                reason: "scan period must be greater than zero".to_string(),
            });
        }
        if self.delivery_workers == 0 {
            return Err(ProcessorError::InvalidConfig {
                reason: "at least one delivery worker is required".to_string(),
            });
        }

        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current().map_err(|e| ProcessorError::NoRuntime {
                reason: e.to_string(),
            })?,
        };

        let filter: Arc<dyn PathFilter> = match (self.filter, self.patterns) {
            (_, Some(patterns)) => Arc::new(GlobFilter::new(patterns)?),
            (Some(filter), None) => filter,
            (None, None) => Arc::new(GlobFilter::xml()),
        };
        let fs = self
            .fs
            .unwrap_or_else(|| Arc::new(LocalFileSystem::new()) as Arc<dyn FileSystem>);

        let context = ScanContext {
            fs,
            handlers: Arc::new(HandlerRegistry::new()),
            pool: DeliveryPool::new(self.delivery_workers, runtime.clone()),
        };

        Ok(ReportProcessor {
            inner: Arc::new(Inner {
                scan_period: self.scan_period,
                filter,
                folders: FolderRegistry::new(),
                context,
                scheduler: ScanScheduler::new(runtime.clone()),
                lifecycle: Mutex::new(Lifecycle {
                    state: ProcessorState::NotStarted,
                    started_at: None,
                }),
                runtime,
            }),
        })
    }
}

impl Default for ReportProcessorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::error::HandlerError;
    use crate::processor::filesystem::MemoryFileSystem;
    use crate::processor::handler::handler_fn;
    use crate::types::{FileEvent, FileSnapshot};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;

    const PERIOD: Duration = Duration::from_millis(10);
    const HOUR: Duration = Duration::from_secs(3600);

    #[derive(Default)]
    struct Recorder {
        paths: Mutex<Vec<PathBuf>>,
    }

    impl Recorder {
        fn count(&self) -> usize {
            self.paths.lock().len()
        }

        fn count_of(&self, path: &str) -> usize {
            self.paths
                .lock()
                .iter()
                .filter(|p| p.as_path() == Path::new(path))
                .count()
        }
    }

    #[async_trait]
    impl ReportHandler for Recorder {
        async fn handle(&self, event: &FileEvent) -> Result<(), HandlerError> {
            self.paths.lock().push(event.path().to_path_buf());
            Ok(())
        }
    }

    /// Holds every delivery until the gate opens.
    #[derive(Default)]
    struct Gated {
        gate: CancellationToken,
        running: AtomicUsize,
        done: AtomicUsize,
    }

    #[async_trait]
    impl ReportHandler for Gated {
        async fn handle(&self, _event: &FileEvent) -> Result<(), HandlerError> {
            self.running.fetch_add(1, Ordering::SeqCst);
            self.gate.cancelled().await;
            self.done.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn engine(fs: &Arc<MemoryFileSystem>, period: Duration, workers: usize) -> ReportProcessor {
        ReportProcessor::builder()
            .file_system(fs.clone())
            .scan_period(period)
            .delivery_workers(workers)
            .build()
            .unwrap()
    }

    fn put(fs: &MemoryFileSystem, path: &str, at: SystemTime) {
        fs.put(FileSnapshot::new(path, at, at));
    }

    async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
        for _ in 0..500 {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cond()
    }

    async fn settle() {
        tokio::time::sleep(PERIOD * 10).await;
    }

    #[test]
    fn test_build_outside_runtime_fails() {
        let result = ReportProcessor::builder().build();
        assert!(matches!(result, Err(ProcessorError::NoRuntime { .. })));
    }

    #[test]
    fn test_build_with_explicit_runtime() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let processor = ReportProcessor::builder()
            .runtime(runtime.handle().clone())
            .build()
            .unwrap();
        assert_eq!(processor.state(), ProcessorState::NotStarted);
    }

    #[tokio::test]
    async fn test_build_rejects_invalid_config() {
        let zero_period = ReportProcessor::builder()
            .scan_period(Duration::ZERO)
            .build();
        assert!(matches!(zero_period, Err(ProcessorError::InvalidConfig { .. })));

        let zero_workers = ReportProcessor::builder().delivery_workers(0).build();
        assert!(matches!(zero_workers, Err(ProcessorError::InvalidConfig { .. })));

        let bad_pattern = ReportProcessor::builder().patterns(["[x"]).build();
        assert!(matches!(bad_pattern, Err(ProcessorError::InvalidPattern { .. })));
    }

    #[tokio::test]
    async fn test_duplicate_registrations_are_rejected() {
        let fs = Arc::new(MemoryFileSystem::new());
        let processor = engine(&fs, PERIOD, 1);
        let handler: Arc<dyn ReportHandler> = Arc::new(Recorder::default());

        assert!(processor.add_folder("/in", ["R"]));
        assert!(!processor.add_folder("/in", ["S"]));
        assert_eq!(processor.folder_count(), 1);
        assert!(processor.folder(Path::new("/in")).unwrap().report_types().contains("R"));

        assert!(processor.remove_folder(Path::new("/in")));
        assert!(!processor.remove_folder(Path::new("/in")));
        assert!(!processor.is_monitoring(Path::new("/in")));

        assert!(processor.register_handler(handler.clone(), ["R"]));
        assert!(!processor.register_handler(handler.clone(), ["R"]));
        assert!(processor.unregister_handler(handler.as_ref()));
        assert!(!processor.unregister_handler(handler.as_ref()));
        assert_eq!(processor.handler_count(), 0);
    }

    #[tokio::test]
    async fn test_new_file_is_delivered_exactly_once() {
        let fs = Arc::new(MemoryFileSystem::new());
        let processor = engine(&fs, PERIOD, 2);
        let recorder = Arc::new(Recorder::default());
        processor.register_handler(recorder.clone(), ["R"]);
        processor.add_folder("/in", ["R"]);
        processor.start();

        fs.touch("/in/a.xml");
        assert!(eventually(|| recorder.count() == 1).await);

        settle().await;
        assert_eq!(recorder.count_of("/in/a.xml"), 1);
        assert_eq!(recorder.count(), 1);
    }

    #[tokio::test]
    async fn test_file_older_than_start_is_not_delivered() {
        let fs = Arc::new(MemoryFileSystem::new());
        let processor = engine(&fs, PERIOD, 1);
        let recorder = Arc::new(Recorder::default());
        processor.register_handler(recorder.clone(), ["R"]);
        processor.add_folder("/in", ["R"]);
        put(&fs, "/in/old.xml", SystemTime::now() - HOUR);

        processor.start();
        settle().await;
        assert_eq!(recorder.count(), 0);

        // Modifying it brings it into the window.
        fs.touch("/in/old.xml");
        assert!(eventually(|| recorder.count_of("/in/old.xml") == 1).await);
    }

    #[tokio::test]
    async fn test_folder_added_after_start_ignores_earlier_files() {
        let fs = Arc::new(MemoryFileSystem::new());
        let processor = engine(&fs, PERIOD, 1);
        let recorder = Arc::new(Recorder::default());
        processor.register_handler(recorder.clone(), ["R"]);
        processor.start();

        put(&fs, "/late/before.xml", SystemTime::now());
        tokio::time::sleep(Duration::from_millis(5)).await;
        processor.add_folder("/late", ["R"]);
        fs.touch("/late/after.xml");

        assert!(eventually(|| recorder.count_of("/late/after.xml") == 1).await);
        settle().await;
        assert_eq!(recorder.count_of("/late/before.xml"), 0);
    }

    #[tokio::test]
    async fn test_handler_matching_several_types_is_called_once() {
        let fs = Arc::new(MemoryFileSystem::new());
        let processor = engine(&fs, PERIOD, 2);
        let both = Arc::new(Recorder::default());
        let other = Arc::new(Recorder::default());
        processor.register_handler(both.clone(), ["A", "B"]);
        processor.register_handler(other.clone(), ["C"]);
        processor.add_folder("/in", ["A", "B"]);
        processor.start();

        fs.touch("/in/a.xml");
        assert!(eventually(|| both.count() == 1).await);
        settle().await;
        assert_eq!(both.count(), 1);
        assert_eq!(other.count(), 0);
    }

    #[tokio::test]
    async fn test_failing_handlers_do_not_block_others() {
        struct Panicking;

        #[async_trait]
        impl ReportHandler for Panicking {
            async fn handle(&self, _event: &FileEvent) -> Result<(), HandlerError> {
                panic!("cannot handle reports");
            }
        }

        let fs = Arc::new(MemoryFileSystem::new());
        let processor = engine(&fs, PERIOD, 2);
        let failing = handler_fn("failing", |e: &FileEvent| {
            Err(HandlerError::Failed {
                path: e.path().to_path_buf(),
                reason: "always fails".to_string(),
            })
        });
        let recorder = Arc::new(Recorder::default());
        processor.register_handler(Arc::new(failing), ["R"]);
        processor.register_handler(Arc::new(Panicking), ["R"]);
        processor.register_handler(recorder.clone(), ["R"]);
        processor.add_folder("/in", ["R"]);
        processor.start();

        fs.touch("/in/a.xml");
        assert!(eventually(|| recorder.count() == 1).await);
        fs.touch("/in/b.xml");
        assert!(eventually(|| recorder.count() == 2).await);
        assert!(eventually(|| processor.delivery_stats().failed == 4).await);
    }

    #[tokio::test]
    async fn test_unregistered_handler_receives_nothing_more() {
        let fs = Arc::new(MemoryFileSystem::new());
        let processor = engine(&fs, PERIOD, 1);
        let recorder = Arc::new(Recorder::default());
        processor.register_handler(recorder.clone(), ["R"]);
        processor.add_folder("/in", ["R"]);
        processor.start();

        fs.touch("/in/a.xml");
        assert!(eventually(|| recorder.count() == 1).await);

        assert!(processor.unregister_handler(&*recorder));
        fs.touch("/in/b.xml");
        settle().await;
        assert_eq!(recorder.count(), 1);
    }

    #[tokio::test]
    async fn test_unregister_from_own_callback_suppresses_queued_deliveries() {
        struct SelfRemoving {
            processor: Mutex<Option<ReportProcessor>>,
            calls: AtomicUsize,
        }

        #[async_trait]
        impl ReportHandler for SelfRemoving {
            async fn handle(&self, _event: &FileEvent) -> Result<(), HandlerError> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                let processor = self.processor.lock().take();
                if let Some(processor) = processor {
                    processor.unregister_handler(self);
                }
                Ok(())
            }
        }

        let fs = Arc::new(MemoryFileSystem::new());
        let processor = engine(&fs, PERIOD, 1);
        let handler = Arc::new(SelfRemoving {
            processor: Mutex::new(Some(processor.clone())),
            calls: AtomicUsize::new(0),
        });
        processor.register_handler(handler.clone(), ["R"]);
        processor.add_folder("/in", ["R"]);

        // Stamped ahead of start so the first scan sees all three at once.
        let ahead = SystemTime::now() + HOUR;
        for name in ["/in/1.xml", "/in/2.xml", "/in/3.xml"] {
            put(&fs, name, ahead);
        }
        processor.start();

        assert!(eventually(|| {
            let stats = processor.delivery_stats();
            stats.handled + stats.skipped == 3
        })
        .await);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(processor.delivery_stats().skipped, 2);
        assert_eq!(processor.handler_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_graceful_shutdown_delivers_everything() {
        let fs = Arc::new(MemoryFileSystem::new());
        let processor = engine(&fs, PERIOD, 2);
        let gated = Arc::new(Gated::default());
        processor.register_handler(gated.clone(), ["R"]);
        processor.add_folder("/in", ["R"]);
        processor.start();

        fs.touch("/in/0.xml");
        fs.touch("/in/1.xml");
        assert!(eventually(|| gated.running.load(Ordering::SeqCst) == 2).await);

        for i in 2..10 {
            fs.touch(format!("/in/{i}.xml"));
        }
        processor.shutdown();
        assert_eq!(processor.state(), ProcessorState::StoppingGracefully);

        // Not drained while the handler is still blocked.
        assert!(!processor.await_termination(Duration::from_millis(50)).await);

        gated.gate.cancel();
        assert!(processor.await_termination(Duration::from_secs(5)).await);
        assert_eq!(gated.done.load(Ordering::SeqCst), 10);
        assert_eq!(processor.state(), ProcessorState::Terminated);

        processor.start();
        assert_eq!(processor.state(), ProcessorState::Terminated);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_forced_shutdown_abandons_queued_deliveries() {
        let fs = Arc::new(MemoryFileSystem::new());
        let processor = engine(&fs, PERIOD, 1);
        let gated = Arc::new(Gated::default());
        processor.register_handler(gated.clone(), ["R"]);
        processor.add_folder("/in", ["R"]);

        let ahead = SystemTime::now() + HOUR;
        for i in 0..5 {
            put(&fs, &format!("/in/{i}.xml"), ahead);
        }
        processor.start();
        assert!(eventually(|| gated.running.load(Ordering::SeqCst) == 1).await);

        processor.shutdown_now();
        assert!(processor.await_termination(Duration::from_secs(5)).await);
        assert_eq!(processor.state(), ProcessorState::Terminated);

        gated.gate.cancel();
        settle().await;
        assert_eq!(gated.done.load(Ordering::SeqCst), 0);
        assert_eq!(gated.running.load(Ordering::SeqCst), 1);
        assert_eq!(processor.delivery_stats().abandoned, 5);
    }

    #[tokio::test]
    async fn test_removed_folder_is_drained_once() {
        let fs = Arc::new(MemoryFileSystem::new());
        // Only the immediate first scan runs during the test.
        let processor = engine(&fs, HOUR, 1);
        let recorder = Arc::new(Recorder::default());
        processor.register_handler(recorder.clone(), ["R"]);
        processor.add_folder("/in", ["R"]);
        processor.start();
        settle().await;

        put(&fs, "/in/present.xml", SystemTime::now());
        put(&fs, "/in/later.xml", SystemTime::now() + HOUR);
        assert!(processor.remove_folder(Path::new("/in")));

        assert!(eventually(|| recorder.count() == 1).await);
        settle().await;
        assert_eq!(recorder.count_of("/in/present.xml"), 1);
        assert_eq!(recorder.count_of("/in/later.xml"), 0);
    }

    #[tokio::test]
    async fn test_folder_removed_during_graceful_stop_is_drained() {
        let fs = Arc::new(MemoryFileSystem::new());
        let processor = engine(&fs, HOUR, 1);
        let recorder = Arc::new(Recorder::default());
        processor.register_handler(recorder.clone(), ["R"]);
        processor.add_folder("/in", ["R"]);
        processor.start();
        settle().await;

        put(&fs, "/in/present.xml", SystemTime::now());
        processor.shutdown();
        assert!(processor.remove_folder(Path::new("/in")));
        assert!(!processor.is_monitoring(Path::new("/in")));

        assert!(processor.await_termination(Duration::from_secs(5)).await);
        assert_eq!(recorder.count_of("/in/present.xml"), 1);
        assert_eq!(recorder.count(), 1);
    }

    #[tokio::test]
    async fn test_dropping_running_engine_stops_scanning() {
        let fs = Arc::new(MemoryFileSystem::new());
        let processor = engine(&fs, PERIOD, 1);
        let recorder = Arc::new(Recorder::default());
        processor.register_handler(recorder.clone(), ["R"]);
        processor.add_folder("/in", ["R"]);
        processor.start();

        fs.touch("/in/a.xml");
        assert!(eventually(|| recorder.count() == 1).await);

        drop(processor);
        fs.touch("/in/b.xml");
        settle().await;
        assert_eq!(recorder.count(), 1);
        assert_eq!(recorder.count_of("/in/b.xml"), 0);
    }

    #[tokio::test]
    async fn test_dropping_engine_during_graceful_stop_still_drains() {
        let fs = Arc::new(MemoryFileSystem::new());
        let processor = engine(&fs, HOUR, 1);
        let recorder = Arc::new(Recorder::default());
        processor.register_handler(recorder.clone(), ["R"]);
        processor.add_folder("/in", ["R"]);
        processor.start();
        settle().await;

        let now = SystemTime::now();
        for i in 0..5 {
            put(&fs, &format!("/in/{i}.xml"), now);
        }
        processor.shutdown();
        drop(processor);

        assert!(eventually(|| recorder.count() == 5).await);
    }

    #[tokio::test]
    async fn test_config_patterns_replace_default_filter() {
        let fs = Arc::new(MemoryFileSystem::new());
        let config = ProcessorConfig {
            scan_period_ms: 10,
            delivery_workers: 1,
            file_patterns: vec!["*.rpt".to_string()],
            ..ProcessorConfig::default()
        };
        let processor = ReportProcessor::builder()
            .file_system(fs.clone())
            .config(&config)
            .build()
            .unwrap();
        assert_eq!(processor.scan_period(), PERIOD);
        assert_eq!(processor.delivery_workers(), 1);

        let recorder = Arc::new(Recorder::default());
        processor.register_handler(recorder.clone(), ["R"]);
        processor.add_folder("/in", ["R"]);
        processor.start();

        fs.touch("/in/a.xml");
        fs.touch("/in/a.RPT");
        assert!(eventually(|| recorder.count() == 1).await);
        settle().await;
        assert_eq!(recorder.count_of("/in/a.RPT"), 1);
        assert_eq!(recorder.count_of("/in/a.xml"), 0);
    }

    #[tokio::test]
    async fn test_await_termination_times_out_while_running() {
        let fs = Arc::new(MemoryFileSystem::new());
        let processor = engine(&fs, PERIOD, 1);
        processor.start();

        assert!(!processor.await_termination(Duration::from_millis(30)).await);
        assert_eq!(processor.state(), ProcessorState::Running);

        processor.shutdown();
        processor.shutdown();
        assert!(processor.await_termination(Duration::from_secs(5)).await);
        assert_eq!(processor.state(), ProcessorState::Terminated);
    }

    #[tokio::test]
    async fn test_shutdown_before_start_is_ignored() {
        let fs = Arc::new(MemoryFileSystem::new());
        let processor = engine(&fs, PERIOD, 1);

        processor.shutdown();
        assert_eq!(processor.state(), ProcessorState::NotStarted);

        processor.shutdown_now();
        assert!(processor.await_termination(Duration::from_secs(5)).await);
        assert_eq!(processor.state(), ProcessorState::Terminated);
    }
}
