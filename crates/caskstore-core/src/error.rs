//! Error types for CaskStore operations
//!
//! All CaskStore errors are represented by the CaskError enum. I/O failures
//! are captured as kind + message (plus the file involved) so the error
//! stays `Clone` and can be handed to several callers.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::segment::SegmentId;

/// CaskStore error types with detailed context
#[derive(Debug, Clone, Error)]
pub enum CaskError {
    /// The store could not be opened. Wraps the underlying cause.
    #[error("failed to open store at {}: {source}", path.display())]
    OpenFailed {
        /// Store directory
        path: PathBuf,
        /// What went wrong
        #[source]
        source: Box<CaskError>,
    },

    /// A `.data` file whose name does not parse as a segment ID
    #[error("invalid segment file name: {name}")]
    InvalidSegmentName {
        /// The offending file name
        name: String,
    },

    /// A record failed validation (checksum, framing, or content)
    #[error("corrupt record in segment {segment_id} at offset {offset}: {reason}")]
    CorruptRecord {
        /// Segment holding the record
        segment_id: SegmentId,
        /// Byte offset of the record start
        offset: u64,
        /// Description of the corruption
        reason: String,
    },

    /// Key is not present in the key directory
    #[error("key not found")]
    KeyNotFound,

    /// Key exceeds the configured maximum
    #[error("key too large: {size} bytes exceeds limit of {max} bytes")]
    KeyTooLarge {
        /// Size of the rejected key
        size: usize,
        /// Configured limit
        max: usize,
    },

    /// Value exceeds the configured maximum
    #[error("value too large: {size} bytes exceeds limit of {max} bytes")]
    ValueTooLarge {
        /// Size of the rejected value
        size: usize,
        /// Configured limit
        max: usize,
    },

    /// Appending to a segment failed; the key directory was left untouched
    #[error("write to {} failed: {message} ({kind})", path.display())]
    WriteFailed {
        /// Segment file being appended to
        path: PathBuf,
        /// The underlying I/O error kind
        kind: io::ErrorKind,
        /// Human-readable description
        message: String,
    },

    /// I/O operation failed outside the append path
    #[error("{}", format_io(path.as_deref(), kind, message))]
    Io {
        /// The file path where the error occurred
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: io::ErrorKind,
        /// Human-readable description
        message: String,
    },

    /// Configuration rejected by `Config::validate`
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Another compaction is already running on this engine
    #[error("compaction already in progress")]
    CompactionInProgress,

    /// The engine handle has been closed
    #[error("engine is closed")]
    Closed,
}

fn format_io(path: Option<&Path>, kind: &io::ErrorKind, message: &str) -> String {
    match path {
        Some(path) => format!("I/O error in {}: {} ({})", path.display(), message, kind),
        None => format!("I/O error: {} ({})", message, kind),
    }
}

impl CaskError {
    /// Wrap an error raised while opening the store at `path`.
    pub(crate) fn open_failed(path: &Path, source: CaskError) -> Self {
        match source {
            already @ CaskError::OpenFailed { .. } => already,
            other => CaskError::OpenFailed {
                path: path.to_path_buf(),
                source: Box::new(other),
            },
        }
    }

    /// Re-label an I/O failure on the append path as `WriteFailed`.
    pub(crate) fn into_write_failed(self) -> Self {
        match self {
            CaskError::Io { path, kind, message } => CaskError::WriteFailed {
                path: path.unwrap_or_default(),
                kind,
                message,
            },
            other => other,
        }
    }

    /// True for `CorruptRecord`, including when wrapped by `OpenFailed`.
    pub fn is_corruption(&self) -> bool {
        match self {
            CaskError::CorruptRecord { .. } => true,
            CaskError::OpenFailed { source, .. } => source.is_corruption(),
            _ => false,
        }
    }
}

/// Build a closure mapping `io::Error` to `CaskError::Io` with file context.
pub(crate) fn io_err<'a>(
    path: &'a Path,
    context: &'a str,
) -> impl FnOnce(io::Error) -> CaskError + 'a {
    move |e| CaskError::Io {
        path: Some(path.to_path_buf()),
        kind: e.kind(),
        message: format!("{}: {}", context, e),
    }
}

/// Build a closure mapping `io::Error` to `CaskError::WriteFailed`.
pub(crate) fn write_err(path: &Path) -> impl FnOnce(io::Error) -> CaskError + '_ {
    move |e| CaskError::WriteFailed {
        path: path.to_path_buf(),
        kind: e.kind(),
        message: e.to_string(),
    }
}

/// Convert std::io::Error to CaskError::Io
impl From<io::Error> for CaskError {
    fn from(err: io::Error) -> Self {
        CaskError::Io {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for CaskStore operations
pub type CaskResult<T> = Result<T, CaskError>;
