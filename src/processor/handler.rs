//! Handler trait and the slot that wraps each registered handler.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::FutureExt;

use super::error::HandlerError;
use crate::types::FileEvent;

/// Receives file events for the report types it is registered for.
///
/// Handlers are invoked concurrently and may see the same file more than
/// once (for example after a modification), so implementations must be
/// thread-safe and tolerate repeats.
#[async_trait]
pub trait ReportHandler: Send + Sync {
    /// Handler name for logging.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Handle one file event.
    async fn handle(&self, event: &FileEvent) -> Result<(), HandlerError>;
}

/// Adapter turning a synchronous closure into a [`ReportHandler`].
pub struct FnHandler<F> {
    name: String,
    f: F,
}

/// Wrap a closure as a named handler.
pub fn handler_fn<F>(name: impl Into<String>, f: F) -> FnHandler<F>
where
    F: Fn(&FileEvent) -> Result<(), HandlerError> + Send + Sync,
{
    FnHandler {
        name: name.into(),
        f,
    }
}

#[async_trait]
impl<F> ReportHandler for FnHandler<F>
where
    F: Fn(&FileEvent) -> Result<(), HandlerError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &FileEvent) -> Result<(), HandlerError> {
        (self.f)(event)
    }
}

/// Identity of a handler: the address of the value behind its `Arc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct HandlerKey(usize);

impl HandlerKey {
    pub(crate) fn of(handler: &dyn ReportHandler) -> Self {
        Self(std::ptr::from_ref(handler).cast::<()>() as usize)
    }
}

/// Result of a single delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Handled,
    /// The handler was unregistered before the delivery started.
    Skipped,
    Failed,
    Panicked,
}

/// A registered handler with its report types and liveness flag.
///
/// Delivery tasks hold the slot itself rather than looking the handler up
/// again, so the liveness check happens when the task runs, not when it is
/// queued.
pub(crate) struct HandlerSlot {
    handler: Arc<dyn ReportHandler>,
    report_types: HashSet<String>,
    active: AtomicBool,
}

impl HandlerSlot {
    pub(crate) fn new<I, S>(handler: Arc<dyn ReportHandler>, report_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            handler,
            report_types: report_types.into_iter().map(Into::into).collect(),
            active: AtomicBool::new(true),
        }
    }

    pub(crate) fn name(&self) -> &str {
        self.handler.name()
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Permanently suppress deliveries that have not started yet.
    pub(crate) fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    pub(crate) fn matches(&self, report_type: &str) -> bool {
        self.report_types.contains(report_type)
    }

    /// Whether any of `report_types` is subscribed.
    pub(crate) fn matches_any(&self, report_types: &HashSet<String>) -> bool {
        report_types.iter().any(|t| self.matches(t))
    }

    /// Invoke the handler if still active, containing errors and panics.
    pub(crate) async fn dispatch(&self, event: &FileEvent) -> Delivery {
        if !self.is_active() {
            crate::debug_event!(self.name(), "skipped", "{}", event.path().display());
            return Delivery::Skipped;
        }

        match AssertUnwindSafe(self.handler.handle(event))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => {
                crate::debug_event!(self.name(), "handled", "{}", event.path().display());
                Delivery::Handled
            }
            Ok(Err(e)) => {
                tracing::warn!("[{}] handler error: {e}", self.name());
                Delivery::Failed
            }
            Err(panic) => {
                let msg = if let Some(s) = panic.downcast_ref::<String>() {
                    s.clone()
                } else if let Some(s) = panic.downcast_ref::<&str>() {
                    s.to_string()
                } else {
                    "unknown panic".to_string()
                };
                tracing::error!(
                    "[{}] handler panicked on {}: {msg}",
                    self.name(),
                    event.path().display()
                );
                Delivery::Panicked
            }
        }
    }
}
