//! Bounded pool executing handler deliveries.
//!
//! Each (event, handler) pair becomes one tracked task. At most
//! `workers` deliveries run at once; the rest wait for a permit and check
//! the handler's liveness only once they get one.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::handler::{Delivery, HandlerSlot};
use crate::types::FileEvent;

/// Counters describing what the pool has done so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    pub handled: usize,
    pub skipped: usize,
    pub failed: usize,
    pub abandoned: usize,
}

#[derive(Debug, Default)]
struct Counters {
    handled: AtomicUsize,
    skipped: AtomicUsize,
    failed: AtomicUsize,
    abandoned: AtomicUsize,
}

impl Counters {
    fn record(&self, delivery: Delivery) {
        let counter = match delivery {
            Delivery::Handled => &self.handled,
            Delivery::Skipped => &self.skipped,
            Delivery::Failed | Delivery::Panicked => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Worker pool for delivery tasks.
///
/// Closing stops accepting new deliveries while queued ones run to
/// completion; [`DeliveryPool::shutdown_now`] additionally abandons queued
/// and running deliveries.
#[derive(Debug, Clone)]
pub(crate) struct DeliveryPool {
    tracker: TaskTracker,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
    counters: Arc<Counters>,
    runtime: Handle,
    workers: usize,
}

impl DeliveryPool {
    pub(crate) fn new(workers: usize, runtime: Handle) -> Self {
        let workers = workers.max(1);
        Self {
            tracker: TaskTracker::new(),
            permits: Arc::new(Semaphore::new(workers)),
            cancel: CancellationToken::new(),
            counters: Arc::new(Counters::default()),
            runtime,
            workers,
        }
    }

    pub(crate) fn workers(&self) -> usize {
        self.workers
    }

    /// Queue one delivery. Returns `false` once the pool is closed.
    pub(crate) fn submit(&self, slot: Arc<HandlerSlot>, event: FileEvent) -> bool {
        if self.tracker.is_closed() {
            crate::debug_event!(
                "pool",
                "rejected",
                "{} for {}",
                event.path().display(),
                slot.name()
            );
            return false;
        }

        let permits = self.permits.clone();
        let cancel = self.cancel.clone();
        let counters = self.counters.clone();

        self.tracker.spawn_on(
            async move {
                let _permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        counters.abandoned.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                    permit = permits.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return,
                    },
                };

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        counters.abandoned.fetch_add(1, Ordering::Relaxed);
                        crate::debug_event!(slot.name(), "abandoned", "{}", event.path().display());
                    }
                    delivery = slot.dispatch(&event) => counters.record(delivery),
                }
            },
            &self.runtime,
        );
        true
    }

    /// Stop accepting deliveries; queued ones still run.
    pub(crate) fn close(&self) {
        self.tracker.close();
    }

    /// Stop accepting deliveries and abandon queued and running ones.
    pub(crate) fn shutdown_now(&self) {
        self.tracker.close();
        self.cancel.cancel();
    }

    /// Closed and every delivery task has exited.
    pub(crate) fn is_terminated(&self) -> bool {
        self.tracker.is_closed() && self.tracker.is_empty()
    }

    /// Wait until the pool is closed and drained.
    pub(crate) async fn wait(&self) {
        self.tracker.wait().await;
    }

    pub(crate) fn stats(&self) -> DeliveryStats {
        DeliveryStats {
            handled: self.counters.handled.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            abandoned: self.counters.abandoned.load(Ordering::Relaxed),
        }
    }
}
