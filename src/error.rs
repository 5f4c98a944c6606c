//! Custom error types and result handling for Shukusho operations.
//!
//! This module defines the error taxonomy used throughout the conversion pipeline.
//! All operations return a [`Result<T>`] which is a type alias for `std::result::Result<T, Error>`.
//!
//! Only [`Error::Discovery`], [`Error::InvalidQuality`] and [`Error::Busy`] ever reach the
//! caller of [`Engine::submit`](crate::engine::Engine::submit). Every other variant is raised
//! inside a worker and ends up as a log line plus the job's `Done` event.
use std::path::PathBuf;
use std::time::Duration;

/// Type alias for Results with Shukusho errors.
pub type Result<T> = std::result::Result<T, Error>;

/// Comprehensive error type for all Shukusho operations.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// I/O errors from the standard library
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Image decoding and encoding errors
    #[error(transparent)]
    Image(#[from] image::ImageError),
    /// ZIP file operation errors
    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),
    /// Async task join errors
    #[error(transparent)]
    Join(#[from] tokio::task::JoinError),
    /// Invalid engine configuration rejected by the builder
    #[error(transparent)]
    EngineBuilder(#[from] crate::engine::EngineConfigBuilderError),
    /// The root directory handed to `submit` is missing or not a directory
    #[error("Cannot scan '{0:?}': {1}")]
    Discovery(PathBuf, String),
    /// Neither the primary codec nor any fallback tool could open the archive
    #[error("Cannot open archive '{path:?}': {reason}")]
    ArchiveOpen { path: PathBuf, reason: String },
    /// Extracting the selected members failed
    #[error("Extraction failed for '{path:?}': {reason}")]
    Extract { path: PathBuf, reason: String },
    /// One page could not be decoded or encoded
    #[error("Cannot transcode '{path:?}': {reason}")]
    Transcode { path: PathBuf, reason: String },
    /// Writing or moving the new container failed
    #[error("Repack failed for '{path:?}': {reason}")]
    Repack { path: PathBuf, reason: String },
    /// Removing a scratch arena failed
    #[error("Cleanup failed for '{path:?}': {reason}")]
    Cleanup { path: PathBuf, reason: String },
    /// A batch is already running
    #[error("A conversion is already running")]
    Busy,
    /// Quality outside 1..=100
    #[error("Quality must be between 1 and 100, got {0}")]
    InvalidQuality(u8),
    /// A job exceeded the configured deadline
    #[error("Job exceeded its deadline of {0:?}")]
    Deadline(Duration),
    /// A job's blocking step stopped early because the job was aborted
    #[error("Operation aborted")]
    Aborted,
    /// A fallback tool is not installed on this host
    #[error("{0} is not installed")]
    NotInstalled(String),
    /// The coordinator task is gone
    #[error("The conversion engine has stopped")]
    EngineStopped,
    /// Error for unsupported operations or formats (e.g., writing RAR)
    #[error("Unsupported: {0}")]
    Unsupported(String),
    /// Other errors that don't fit into specific categories
    #[error("Other error: {0}")]
    Other(String),
}

impl Error {
    pub(crate) fn transcode(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Error::Transcode {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn extract(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Error::Extract {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn cleanup(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Error::Cleanup {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn repack(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Error::Repack {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

// Basic From<String> conversion for convenience
impl From<String> for Error {
    fn from(error: String) -> Self {
        Error::Other(error)
    }
}

impl From<&str> for Error {
    fn from(error: &str) -> Self {
        Error::Other(error.to_string())
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for Error {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.to_string().as_ref())
    }
}
