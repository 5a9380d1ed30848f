//! Engine-wide error type and errno mapping.
//!
//! Every fallible engine operation returns [`EngineError`]. The variants
//! follow the failure taxonomy of the engine: problems with the source
//! tree, encoder failures, cache I/O, storage exhaustion, cancellation,
//! and the filesystem-level refusals (`ENOENT`, `EROFS`). The FUSE layer
//! turns an `EngineError` into an errno with [`EngineError::errno`]; the
//! underlying cause is logged where the error is produced, never shown
//! to the kernel.

use std::io;
use std::path::PathBuf;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur anywhere in the projection engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The source file is missing, unreadable, or changed mid-build.
    #[error("source unavailable: {path}: {detail}")]
    SourceUnavailable {
        /// The source file involved.
        path: PathBuf,
        /// Description of what went wrong.
        detail: String,
    },

    /// An encoder process exited non-zero or produced truncated output.
    #[error("driver '{driver}' failed: {detail}")]
    DriverFailure {
        /// Identifier of the failing driver.
        driver: &'static str,
        /// Exit status or stream error description.
        detail: String,
    },

    /// A cache-directory write, rename, or unlink failed.
    #[error("cache I/O failure at {path}: {source}")]
    CacheIo {
        /// The cache file or directory involved.
        path: PathBuf,
        /// The underlying I/O error.
        source: io::Error,
    },

    /// The cache directory's filesystem ran out of space while a
    /// partial file was being written.
    #[error("cache storage exhausted at {path}")]
    Budget {
        /// The partial file that could not be written.
        path: PathBuf,
    },

    /// The caller cancelled the request (unmount or interrupt).
    #[error("cancelled")]
    Cancelled,

    /// No entry exists at the requested path.
    #[error("no such entry")]
    NotFound,

    /// A write-family operation was attempted on the read-only view.
    #[error("read-only filesystem")]
    NotPermitted,
}

impl EngineError {
    /// The errno reported to the kernel for this error.
    pub fn errno(&self) -> libc::c_int {
        match self {
            EngineError::SourceUnavailable { .. } => libc::EIO,
            EngineError::DriverFailure { .. } => libc::EIO,
            EngineError::CacheIo { .. } => libc::EIO,
            EngineError::Budget { .. } => libc::ENOSPC,
            EngineError::Cancelled => libc::EINTR,
            EngineError::NotFound => libc::ENOENT,
            EngineError::NotPermitted => libc::EROFS,
        }
    }

    /// Wraps an I/O error from an operation on a source-tree file.
    pub fn source(path: impl Into<PathBuf>, err: io::Error) -> Self {
        EngineError::SourceUnavailable {
            path: path.into(),
            detail: err.to_string(),
        }
    }

    /// Wraps an I/O error from an operation on a cache file, promoting
    /// `ENOSPC` to the storage-exhausted variant.
    pub fn cache(path: impl Into<PathBuf>, err: io::Error) -> Self {
        let path = path.into();
        if err.raw_os_error() == Some(libc::ENOSPC) {
            EngineError::Budget { path }
        } else {
            EngineError::CacheIo { path, source: err }
        }
    }
}
