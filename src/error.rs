//! Application-wide error types.
//!
//! Library modules use specific error types via `thiserror`, while
//! CLI/main uses `anyhow` for convenient error propagation.
//!
//! # Design
//!
//! - [`Error`]: Top-level error enum for the sync engine
//! - Module-specific errors ([`DecodeError`], [`WatchError`]) for detailed handling
//! - Per-file decode failures never surface here during a sync; they are
//!   recorded as failed imports instead
//!
//! [`DecodeError`]: crate::metadata::DecodeError
//! [`WatchError`]: crate::scanner::WatchError

use std::path::PathBuf;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level application error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// File I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration error
    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// Metadata decoding error
    #[error(transparent)]
    Decode(#[from] crate::metadata::DecodeError),

    /// File watching error
    #[error(transparent)]
    Watch(#[from] crate::scanner::WatchError),

    /// Stat tuple (de)serialisation error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No library with this id
    #[error("Library {0} not found")]
    LibraryNotFound(i64),

    /// Another sync holds the library's in-progress flag
    #[error("Library {0} is already being updated")]
    LibraryBusy(i64),

    /// Library root is not a usable directory
    #[error("Library path is not a directory: {0}")]
    NotADirectory(PathBuf),

    /// A worker queue was closed
    #[error("Channel closed: {0}")]
    Channel(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic error with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Create a channel error.
    pub fn channel(name: impl Into<String>) -> Self {
        Self::Channel(name.into())
    }

    /// Create a config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Add context to an error.
    pub fn context(self, ctx: impl Into<String>) -> Self {
        Self::WithContext {
            context: ctx.into(),
            source: Box::new(self),
        }
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

impl<T> ResultExt<T> for std::result::Result<T, sqlx::Error> {
    fn with_context(self, ctx: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::Database(e).context(ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_errors_display() {
        assert!(Error::LibraryNotFound(7).to_string().contains('7'));
        assert!(Error::LibraryBusy(3).to_string().contains("already being updated"));
    }

    #[test]
    fn test_error_with_context() {
        let err = Error::channel("sync").context("while dispatching");
        let msg = err.to_string();
        assert!(msg.contains("while dispatching"));
        assert!(msg.contains("sync"));
    }

    #[test]
    fn test_result_ext_io() {
        let result: std::result::Result<(), std::io::Error> =
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        let err = result.with_context("reading stat").unwrap_err();
        assert!(err.to_string().contains("reading stat"));
    }

    #[test]
    fn test_result_ext() {
        let result: Result<()> = Err(Error::config("bad interval"));
        let with_ctx = result.with_context("loading config");
        assert!(with_ctx.unwrap_err().to_string().contains("loading config"));
    }
}
