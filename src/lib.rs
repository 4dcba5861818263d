pub mod cli;
pub mod config;
pub mod logging;
pub mod processor;
pub mod types;

pub use config::Settings;
pub use processor::{
    FileSystem, GlobFilter, HandlerError, LocalFileSystem, MemoryFileSystem, PathFilter,
    ProcessorError, ProcessorState, ReportHandler, ReportProcessor, ReportProcessorBuilder,
    handler_fn,
};
pub use types::{FileEvent, FileSnapshot};
