//! Configuration for the report processor.
//!
//! Settings are layered:
//! - Default values
//! - TOML configuration file (`.report-processor/settings.toml`)
//! - Environment variable overrides
//!
//! # Environment Variables
//!
//! Environment variables must be prefixed with `RP_` and use double underscores
//! to separate nested levels:
//! - `RP_PROCESSOR__SCAN_PERIOD_MS=250` sets `processor.scan_period_ms`
//! - `RP_PROCESSOR__DELIVERY_WORKERS=4` sets `processor.delivery_workers`
//! - `RP_LOGGING__DEFAULT=debug` sets `logging.default`

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Directory holding the settings file.
pub const CONFIG_DIR: &str = ".report-processor";
const CONFIG_FILE: &str = "settings.toml";
const ENV_PREFIX: &str = "RP_";

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Settings {
    /// Version of the configuration schema
    #[serde(default = "default_version")]
    pub version: u32,

    /// Engine settings
    #[serde(default)]
    pub processor: ProcessorConfig,

    /// Folders monitored on startup
    #[serde(default)]
    pub folders: Vec<FolderConfig>,

    /// Log levels
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ProcessorConfig {
    /// Delay between the end of one scan and the start of the next
    #[serde(default = "default_scan_period_ms")]
    pub scan_period_ms: u64,

    /// Maximum number of handler deliveries running at once
    #[serde(default = "default_delivery_workers")]
    pub delivery_workers: usize,

    /// How long a shutdown waits for deliveries to drain
    #[serde(default = "default_termination_timeout_ms")]
    pub termination_timeout_ms: u64,

    /// Glob patterns (matched case-insensitively against file names)
    #[serde(default = "default_file_patterns")]
    pub file_patterns: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct FolderConfig {
    pub path: PathBuf,

    #[serde(default)]
    pub report_types: Vec<String>,
}

/// Log levels: a default plus per-module overrides.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub default: String,

    /// Target (module path) to level, e.g. `report_processor::processor = "debug"`
    #[serde(default)]
    pub modules: HashMap<String, String>,
}

// Default value functions
fn default_version() -> u32 {
    1
}
fn default_scan_period_ms() -> u64 {
    1000
}
/// One core is left for the scanner.
pub fn default_delivery_workers() -> usize {
    num_cpus::get().saturating_sub(1).max(1)
}
fn default_termination_timeout_ms() -> u64 {
    10_000
}
fn default_file_patterns() -> Vec<String> {
    vec!["*.xml".to_string()]
}
fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: default_version(),
            processor: ProcessorConfig::default(),
            folders: Vec::new(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            scan_period_ms: default_scan_period_ms(),
            delivery_workers: default_delivery_workers(),
            termination_timeout_ms: default_termination_timeout_ms(),
            file_patterns: default_file_patterns(),
        }
    }
}

impl ProcessorConfig {
    pub fn scan_period(&self) -> Duration {
        Duration::from_millis(self.scan_period_ms)
    }

    pub fn termination_timeout(&self) -> Duration {
        Duration::from_millis(self.termination_timeout_ms)
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default: default_log_level(),
            modules: HashMap::new(),
        }
    }
}

impl FolderConfig {
    /// Parse `PATH=TYPE[,TYPE...]`.
    pub fn parse(spec: &str) -> Result<Self, String> {
        let (path, types) = spec
            .rsplit_once('=')
            .ok_or_else(|| format!("expected PATH=TYPE[,TYPE...], got '{spec}'"))?;
        if path.is_empty() {
            return Err(format!("missing folder path in '{spec}'"));
        }

        let report_types: Vec<String> = types
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(String::from)
            .collect();
        if report_types.is_empty() {
            return Err(format!("no report types in '{spec}'"));
        }

        Ok(Self {
            path: PathBuf::from(path),
            report_types,
        })
    }
}

impl Settings {
    /// Load configuration from all sources
    pub fn load() -> Result<Self, Box<figment::Error>> {
        // Try to find the workspace root by looking for the config directory
        let config_path = Self::find_workspace_config()
            .unwrap_or_else(|| PathBuf::from(CONFIG_DIR).join(CONFIG_FILE));

        Self::load_from(config_path)
    }

    /// Load configuration from a specific file, still honouring env overrides
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, Box<figment::Error>> {
        Figment::new()
            .merge(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            // Double underscore separates nested levels; single underscore
            // stays within field names
            .merge(Env::prefixed(ENV_PREFIX).map(|key| {
                key.as_str().to_lowercase().replace("__", ".").into()
            }))
            .extract()
            .map_err(Box::new)
    }

    /// Find the settings file by searching from the current directory up to root
    fn find_workspace_config() -> Option<PathBuf> {
        let current = std::env::current_dir().ok()?;

        for ancestor in current.ancestors() {
            let config_dir = ancestor.join(CONFIG_DIR);
            if config_dir.is_dir() {
                return Some(config_dir.join(CONFIG_FILE));
            }
        }

        None
    }

    /// Save current configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Box<dyn std::error::Error>> {
        let parent = path.as_ref().parent().ok_or("Invalid path")?;
        std::fs::create_dir_all(parent)?;

        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_string)?;

        Ok(())
    }

    /// Create a default settings file under `root`
    pub fn init_config_file_in(
        root: impl AsRef<Path>,
        force: bool,
    ) -> Result<PathBuf, Box<dyn std::error::Error>> {
        let config_path = root.as_ref().join(CONFIG_DIR).join(CONFIG_FILE);

        if !force && config_path.exists() {
            return Err("Configuration file already exists. Use --force to overwrite".into());
        }

        Settings::default().save(&config_path)?;
        Ok(config_path)
    }

    /// Create a default settings file in the current directory
    pub fn init_config_file(force: bool) -> Result<PathBuf, Box<dyn std::error::Error>> {
        Self::init_config_file_in(std::env::current_dir()?, force)
    }
}
