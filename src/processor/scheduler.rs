//! Scan scheduler: one recurring fixed-delay task plus one-shot passes.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Drives periodic scans and drain passes.
///
/// The recurring task waits `delay` between the end of one tick and the
/// start of the next, so a slow tick never overlaps the following one.
/// Shutting down stops further ticks without interrupting the one in
/// flight; a forced shutdown interrupts everything.
#[derive(Debug, Clone)]
pub(crate) struct ScanScheduler {
    tracker: TaskTracker,
    /// No further ticks.
    stop: CancellationToken,
    /// Interrupt ticks and passes in flight.
    abort: CancellationToken,
    /// Cancelled when the recurring task has exited.
    ticks_done: CancellationToken,
    ticking: Arc<AtomicBool>,
    runtime: Handle,
}

impl ScanScheduler {
    pub(crate) fn new(runtime: Handle) -> Self {
        Self {
            tracker: TaskTracker::new(),
            stop: CancellationToken::new(),
            abort: CancellationToken::new(),
            ticks_done: CancellationToken::new(),
            ticking: Arc::new(AtomicBool::new(false)),
            runtime,
        }
    }

    /// Start the recurring task; the first tick runs immediately.
    ///
    /// The task ends when `tick` resolves to `false` or the scheduler shuts
    /// down. Only one recurring task is allowed.
    pub(crate) fn schedule_with_fixed_delay<F, Fut>(&self, delay: Duration, mut tick: F) -> bool
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        if self.tracker.is_closed() || self.ticking.swap(true, Ordering::SeqCst) {
            return false;
        }

        let stop = self.stop.clone();
        let abort = self.abort.clone();
        let done = self.ticks_done.clone();

        self.tracker.spawn_on(
            async move {
                let _done = done.drop_guard();
                loop {
                    let keep_going = tokio::select! {
                        biased;
                        _ = abort.cancelled() => break,
                        keep = tick() => keep,
                    };
                    if !keep_going || stop.is_cancelled() {
                        break;
                    }

                    tokio::select! {
                        biased;
                        _ = stop.cancelled() => break,
                        _ = sleep(delay) => {}
                    }
                }
                crate::debug_event!("scheduler", "ticks stopped");
            },
            &self.runtime,
        );
        true
    }

    /// Run `pass` once as soon as possible. Returns `false` once closed.
    pub(crate) fn schedule_once<Fut>(&self, pass: Fut) -> bool
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.tracker.is_closed() {
            return false;
        }

        let abort = self.abort.clone();
        self.tracker.spawn_on(
            async move {
                tokio::select! {
                    biased;
                    _ = abort.cancelled() => {}
                    _ = pass => {}
                }
            },
            &self.runtime,
        );
        true
    }

    /// Stop ticking, then run `last` once the tick in flight has finished,
    /// and close the scheduler.
    pub(crate) fn shutdown_after<Fut>(&self, last: Fut) -> bool
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.tracker.is_closed() {
            return false;
        }
        self.stop.cancel();

        let abort = self.abort.clone();
        let done = self.ticks_done.clone();
        let ticking = self.ticking.load(Ordering::SeqCst);

        self.tracker.spawn_on(
            async move {
                if ticking {
                    tokio::select! {
                        biased;
                        _ = abort.cancelled() => return,
                        _ = done.cancelled() => {}
                    }
                }
                tokio::select! {
                    biased;
                    _ = abort.cancelled() => {}
                    _ = last => {}
                }
            },
            &self.runtime,
        );
        self.tracker.close();
        true
    }

    /// Stop ticking, close, and interrupt everything in flight.
    pub(crate) fn shutdown_now(&self) {
        self.stop.cancel();
        self.abort.cancel();
        self.tracker.close();
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.tracker.is_closed() && self.tracker.is_empty()
    }

    /// Wait until closed and every scheduled task has exited.
    pub(crate) async fn wait(&self) {
        self.tracker.wait().await;
    }
}
