//! Configuration system using TOML files.
//!
//! Config is stored in the OS-standard config directory:
//! - Windows: %APPDATA%\tunedex\config.toml
//! - macOS: ~/Library/Application Support/tunedex/config.toml
//! - Linux: ~/.config/tunedex/config.toml
//!
//! The config file is human-readable and editable. Every section and field
//! has a default, so a partial file is fine.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::library::ScanPacing;

/// Application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Library settings
    pub library: LibraryConfig,

    /// Scan pacing
    pub scan: ScanConfig,
}

/// Library management settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LibraryConfig {
    /// Library scan paths
    pub paths: Vec<PathBuf>,

    /// Directories never scanned or watched
    pub exclude: Vec<PathBuf>,

    /// Whether to watch for file changes
    pub watch_for_changes: bool,

    /// Where the song library is saved
    pub library_file: PathBuf,

    /// Skip dot-files and dot-directories when scanning
    pub skip_hidden: bool,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            paths: Vec::new(),
            exclude: Vec::new(),
            watch_for_changes: true,
            library_file: default_library_file(),
            skip_hidden: true,
        }
    }
}

/// How long scans run between yields, and how often they report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Items per `changed`/`removed` emission during rebuild
    pub signal_batch: usize,

    /// Items checked between yields during rebuild
    pub check_batch: usize,

    /// Items per `added` emission during scan
    pub add_batch: usize,

    pub yield_interval_ms: u64,

    pub add_interval_ms: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self::from(&ScanPacing::default())
    }
}

impl From<&ScanPacing> for ScanConfig {
    fn from(pacing: &ScanPacing) -> Self {
        Self {
            signal_batch: pacing.signal_batch,
            check_batch: pacing.check_batch,
            add_batch: pacing.add_batch,
            yield_interval_ms: pacing.yield_interval.as_millis() as u64,
            add_interval_ms: pacing.add_interval.as_millis() as u64,
        }
    }
}

impl ScanConfig {
    /// Pacing for file library tasks. Zero batch sizes are raised to one.
    pub fn pacing(&self) -> ScanPacing {
        ScanPacing {
            signal_batch: self.signal_batch.max(1),
            check_batch: self.check_batch.max(1),
            add_batch: self.add_batch.max(1),
            yield_interval: Duration::from_millis(self.yield_interval_ms),
            add_interval: Duration::from_millis(self.add_interval_ms),
        }
    }
}

// ============================================================================
// Config File Operations
// ============================================================================

/// Get the config directory path
pub fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("tunedex"))
}

/// Get the full path to the config file
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("config.toml"))
}

fn default_library_file() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("tunedex"))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("songs.json")
}

/// Load configuration from disk
///
/// Returns default config if file doesn't exist or can't be parsed.
/// Logs warnings but doesn't fail - we always return a usable config.
pub fn load() -> Config {
    let Some(path) = config_path() else {
        tracing::warn!(target: "config", "Could not determine config directory, using defaults");
        return Config::default();
    };
    load_from(&path)
}

/// Load configuration from a specific file, with the same fallbacks as [`load`].
pub fn load_from(path: &Path) -> Config {
    if !path.exists() {
        tracing::info!(target: "config", path = %path.display(), "No config file found, using defaults");
        return Config::default();
    }

    match std::fs::read_to_string(path) {
        Ok(contents) => match toml::from_str(&contents) {
            Ok(config) => {
                tracing::info!(target: "config", path = %path.display(), "Loaded config");
                config
            }
            Err(e) => {
                tracing::error!(target: "config", path = %path.display(), error = %e, "Failed to parse config file");
                tracing::warn!(target: "config", "Using default configuration");
                Config::default()
            }
        },
        Err(e) => {
            tracing::error!(target: "config", path = %path.display(), error = %e, "Failed to read config file");
            Config::default()
        }
    }
}

/// Save configuration to disk
///
/// Creates the config directory if it doesn't exist.
pub fn save(config: &Config) -> Result<(), ConfigError> {
    let path = config_path().ok_or(ConfigError::NoConfigDir)?;
    save_to(config, &path)
}

/// Save configuration to a specific file, atomically.
pub fn save_to(config: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| ConfigError::CreateDir(dir.to_path_buf(), e))?;
    }

    let contents = toml::to_string_pretty(config).map_err(ConfigError::Serialize)?;

    // Write to a temp file, then rename over the old one
    let temp_path = path.with_extension("toml.tmp");
    std::fs::write(&temp_path, &contents).map_err(|e| ConfigError::Write(temp_path.clone(), e))?;
    std::fs::rename(&temp_path, path)
        .map_err(|e| ConfigError::Rename(temp_path, path.to_path_buf(), e))?;

    tracing::info!(target: "config", path = %path.display(), "Saved config");
    Ok(())
}

// ============================================================================
// Error Types
// ============================================================================

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Could not determine config directory")]
    NoConfigDir,

    #[error("Failed to create config directory {0}: {1}")]
    CreateDir(PathBuf, std::io::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(toml::ser::Error),

    #[error("Failed to write config to {0}: {1}")]
    Write(PathBuf, std::io::Error),

    #[error("Failed to rename temp file {0} to {1}: {2}")]
    Rename(PathBuf, PathBuf, std::io::Error),
}

// ============================================================================
// Tests
// ============================================================================
