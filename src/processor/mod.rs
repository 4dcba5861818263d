//! Folder-watching dispatch engine.
//!
//! A [`ReportProcessor`] scans a dynamic set of [`MonitoredFolder`]s on a
//! fixed delay, detects files created or modified since the previous scan,
//! and fans each change out to every [`ReportHandler`] subscribed to one of
//! the folder's report types.
//!
//! ```ignore
//! let processor = ReportProcessor::xml(Duration::from_secs(1))?;
//! processor.register_handler(Arc::new(handler_fn("print", |e: &FileEvent| {
//!     println!("{}", e.path().display());
//!     Ok(())
//! })), ["daily"]);
//! processor.add_folder("/data/inbox", ["daily"]);
//! processor.start();
//! ```
//!
//! Filesystem access goes through the [`FileSystem`] and [`PathFilter`]
//! collaborators.

pub mod engine;
pub mod error;
pub mod filesystem;
pub mod folder;
pub mod handler;
mod pool;
mod registry;
mod scheduler;

pub use engine::{ProcessorState, ReportProcessor, ReportProcessorBuilder};
pub use error::{HandlerError, ProcessorError};
pub use filesystem::{FileSystem, GlobFilter, LocalFileSystem, MemoryFileSystem, PathFilter};
pub use folder::{MonitoredFolder, MonitoringWindow};
pub use handler::{FnHandler, ReportHandler, handler_fn};
pub use pool::DeliveryStats;
