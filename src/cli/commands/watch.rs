//! Watch command - run the processor until interrupted.

use std::collections::BTreeSet;
use std::io::Write;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Local};

use crate::config::{FolderConfig, Settings};
use crate::processor::{HandlerError, ReportHandler, ReportProcessor};
use crate::types::FileEvent;

/// Arguments for the watch command.
pub struct WatchArgs {
    pub folders: Vec<FolderConfig>,
    pub period_ms: Option<u64>,
    pub workers: Option<usize>,
    pub json: bool,
}

/// Prints every delivered event to stdout.
struct EventPrinter {
    json: bool,
}

fn timestamp(time: SystemTime) -> String {
    DateTime::<Local>::from(time).to_rfc3339()
}

fn format_event(event: &FileEvent, json: bool) -> String {
    if json {
        serde_json::json!({
            "path": event.path().display().to_string(),
            "created": timestamp(event.created()),
            "modified": timestamp(event.modified()),
        })
        .to_string()
    } else {
        format!(
            "{}\tcreated {}\tmodified {}",
            event.path().display(),
            timestamp(event.created()),
            timestamp(event.modified())
        )
    }
}

#[async_trait]
impl ReportHandler for EventPrinter {
    fn name(&self) -> &str {
        "printer"
    }

    async fn handle(&self, event: &FileEvent) -> Result<(), HandlerError> {
        let line = format_event(event, self.json);
        writeln!(std::io::stdout().lock(), "{line}")?;
        Ok(())
    }
}

/// Run the watch command.
pub async fn run(args: WatchArgs, settings: Settings) -> Result<()> {
    let mut config = settings.processor.clone();
    if let Some(period_ms) = args.period_ms {
        config.scan_period_ms = period_ms;
    }
    if let Some(workers) = args.workers {
        config.delivery_workers = workers;
    }

    let folders: Vec<FolderConfig> = settings
        .folders
        .iter()
        .cloned()
        .chain(args.folders)
        .collect();
    if folders.is_empty() {
        bail!("No folders to watch. Pass --folder PATH=TYPE or add [[folders]] to settings.toml");
    }

    let processor = ReportProcessor::builder()
        .config(&config)
        .build()
        .context("Failed to build processor")?;

    let report_types: BTreeSet<String> = folders
        .iter()
        .flat_map(|f| f.report_types.iter().cloned())
        .collect();
    processor.register_handler(Arc::new(EventPrinter { json: args.json }), report_types);

    for folder in &folders {
        if !folder.path.is_dir() {
            tracing::warn!("[watch] {} is not a directory (yet)", folder.path.display());
        }
        if !processor.add_folder(&folder.path, folder.report_types.iter().cloned()) {
            tracing::warn!("[watch] {} listed twice, keeping the first", folder.path.display());
        }
    }

    processor.start();
    eprintln!(
        "Watching {} folder(s) every {}ms with {} worker(s). Press Ctrl-C to stop.",
        processor.folder_count(),
        config.scan_period_ms,
        processor.delivery_workers()
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    eprintln!("Draining... press Ctrl-C again to stop immediately.");
    processor.shutdown();

    let timeout = config.termination_timeout();
    let terminated = tokio::select! {
        done = processor.await_termination(timeout) => done,
        _ = tokio::signal::ctrl_c() => {
            processor.shutdown_now();
            processor.await_termination(timeout).await
        }
    };
    if !terminated {
        tracing::warn!("[watch] deliveries still running after {timeout:?}, abandoning them");
        processor.shutdown_now();
    }

    let stats = processor.delivery_stats();
    eprintln!(
        "Stopped: {} delivered, {} failed, {} abandoned",
        stats.handled, stats.failed, stats.abandoned
    );
    Ok(())
}
