//! Crate-wide error types.
//!
//! The index engine recovers from almost everything locally (see
//! [`crate::library`]), so these errors mostly travel between the engine and
//! its collaborators: item loaders, persistence codecs and watcher backends.
//! The binary uses `anyhow` on top of them.
//!
//! # Example
//!
//! ```ignore
//! use tunedex::error::{Error, Result, ResultExt};
//!
//! fn read_blob(path: &Path) -> Result<Vec<u8>> {
//!     std::fs::read(path).with_context(format!("reading {}", path.display()))
//! }
//! ```

use std::path::PathBuf;

use crate::config::ConfigError;
use crate::library::watcher::WatchError;

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// File I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The persistence codec could not encode or decode items
    #[error("Codec error: {0}")]
    Codec(String),

    /// An item could not be read from its backing file
    #[error("Failed to load {path}: {message}")]
    Load { path: PathBuf, message: String },

    /// No loader understands this file
    #[error("Unsupported file: {0}")]
    Unsupported(PathBuf),

    /// Directory watching failed
    #[error("Watch error: {0}")]
    Watch(#[from] WatchError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A library name is already taken in a librarian
    #[error("Library {0:?} is already registered")]
    AlreadyRegistered(String),

    /// No library is registered under this name
    #[error("No library registered as {0:?}")]
    UnknownLibrary(String),

    /// A path argument that cannot be used
    #[error("Invalid path {path}: {reason}")]
    InvalidPath { path: PathBuf, reason: String },

    /// A derived index no longer matches its source
    #[error("Index invariant violated: {0}")]
    Invariant(String),

    /// Generic error with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Create an item load error.
    pub fn load(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Load {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create an invalid path error.
    pub fn invalid_path(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a codec error.
    pub fn codec(message: impl ToString) -> Self {
        Self::Codec(message.to_string())
    }

    /// Add context to an error.
    pub fn context(self, ctx: impl Into<String>) -> Self {
        Self::WithContext {
            context: ctx.into(),
            source: Box::new(self),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

/// Extension trait for adding context to Results.
pub trait ResultExt<T> {
    /// Add context to an error result.
    fn with_context(self, ctx: impl Into<String>) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn with_context(self, ctx: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(ctx))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, std::io::Error> {
    fn with_context(self, ctx: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::Io(e).context(ctx))
    }
}
