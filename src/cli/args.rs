//! CLI argument parsing using clap.
//!
//! Contains the Cli struct and the Commands enum.

use clap::{
    Parser, Subcommand,
    builder::styling::{AnsiColor, Effects, Styles},
};
use std::path::PathBuf;

use crate::config::FolderConfig;

fn clap_cargo_style() -> Styles {
    Styles::styled()
        .header(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .usage(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// Report folder watcher
#[derive(Parser, Debug)]
#[command(
    name = "report-processor",
    version = env!("CARGO_PKG_VERSION"),
    about = "Watch report folders and dispatch new files to handlers",
    next_line_help = true,
    styles = clap_cargo_style()
)]
pub struct Cli {
    /// Path to custom settings.toml file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize project
    #[command(about = "Set up .report-processor directory with default configuration")]
    Init {
        /// Force overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Show current configuration settings
    #[command(about = "Display active settings")]
    Config,

    /// Watch folders until interrupted
    #[command(
        about = "Watch folders and print every delivered file event",
        after_help = "Examples:\n  report-processor watch --folder ./inbox=daily\n  report-processor watch --folder ./in=daily,weekly --folder ./archive=monthly --json\n\nPress Ctrl-C once to drain and stop, twice to stop immediately."
    )]
    Watch {
        /// Folder to monitor, as PATH=TYPE[,TYPE...] (repeatable, added to configured folders)
        #[arg(long = "folder", value_name = "PATH=TYPES", value_parser = FolderConfig::parse)]
        folders: Vec<FolderConfig>,

        /// Scan period in milliseconds (overrides config)
        #[arg(long)]
        period_ms: Option<u64>,

        /// Number of delivery workers (overrides config)
        #[arg(long)]
        workers: Option<usize>,

        /// Print events as JSON lines
        #[arg(long)]
        json: bool,
    },
}
