//! Error types for the HNSW index.
//!
//! Errors are grouped the way callers need to react to them:
//! - configuration errors (bad dimensions, out-of-range options) abort the
//!   current call only and are the caller's to fix;
//! - structural violations (corrupt pages, tuples of the wrong type, broken
//!   graph invariants) indicate an earlier bug and are never swallowed;
//! - storage errors wrap the page store.
//!
//! Memory pressure during a build is deliberately absent: it triggers the
//! arena flush and is reported through logging, not through `Err`.

use crate::storage::{ItemPointer, PageRef};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised by the page store and its backends.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Page {page} is out of range (store holds {count} pages)")]
    PageOutOfRange { page: PageRef, count: u32 },

    #[error("Item {offset} does not exist on page {page}")]
    ItemOutOfRange { page: PageRef, offset: u16 },

    #[error("Page {page} has no room for a {needed} byte item ({free} bytes free)")]
    PageOverflow {
        page: PageRef,
        needed: usize,
        free: usize,
    },

    #[error("Invalid image for page {page}: {reason}")]
    InvalidPage { page: PageRef, reason: String },

    #[error("Malformed tuple: {reason}")]
    MalformedTuple { reason: String },

    #[error("Journal '{path}' is corrupted: {reason}")]
    JournalCorrupted { path: PathBuf, reason: String },
}

/// Main error type for index operations.
#[derive(Error, Debug)]
pub enum HnswError {
    /// Configuration errors
    #[error("Vector has {actual} dimensions but the index expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Index cannot have more than {max} dimensions (requested {dimensions})")]
    DimensionsTooLarge { dimensions: usize, max: usize },

    #[error("Cannot index a vector with zero dimensions")]
    EmptyVector,

    #[error("Invalid value for '{option}': {reason}")]
    InvalidOption { option: &'static str, reason: String },

    #[error("Index was created with metric '{stored}' but opened with '{requested}'")]
    MetricMismatch { stored: String, requested: String },

    #[error("Bulk build requires an empty index")]
    NotEmpty,

    /// Structural violations
    #[error("Index appears to be corrupted: {reason}")]
    Corrupted { reason: String },

    #[error("Unexpected tuple at {pointer}: {reason}")]
    InvalidTuple { pointer: ItemPointer, reason: String },

    #[error("Graph invariant violated: {reason}")]
    InvariantViolated { reason: String },

    /// Control flow
    #[error("Operation was cancelled")]
    Cancelled,

    #[error("Build worker failed: {reason}")]
    WorkerFailed { reason: String },

    #[error("Bulk build has already finished")]
    BuildFinished,

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl HnswError {
    /// Get a stable status code for this error type.
    pub fn status_code(&self) -> &'static str {
        match self {
            Self::DimensionMismatch { .. } => "DIMENSION_MISMATCH",
            Self::DimensionsTooLarge { .. } => "DIMENSIONS_TOO_LARGE",
            Self::EmptyVector => "EMPTY_VECTOR",
            Self::InvalidOption { .. } => "INVALID_OPTION",
            Self::MetricMismatch { .. } => "METRIC_MISMATCH",
            Self::NotEmpty => "INDEX_NOT_EMPTY",
            Self::Corrupted { .. } => "INDEX_CORRUPTED",
            Self::InvalidTuple { .. } => "INVALID_TUPLE",
            Self::InvariantViolated { .. } => "INVARIANT_VIOLATED",
            Self::Cancelled => "CANCELLED",
            Self::WorkerFailed { .. } => "WORKER_FAILED",
            Self::BuildFinished => "BUILD_FINISHED",
            Self::Storage(StorageError::Io { .. }) => "STORAGE_IO",
            Self::Storage(_) => "STORAGE_CORRUPTED",
        }
    }

    /// Whether this error signals a broken structure rather than bad input.
    pub fn is_structural(&self) -> bool {
        match self {
            Self::Corrupted { .. } | Self::InvalidTuple { .. } | Self::InvariantViolated { .. } => {
                true
            }
            Self::Storage(StorageError::Io { .. }) => false,
            Self::Storage(_) => true,
            _ => false,
        }
    }

    /// Get recovery suggestions for this error
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            Self::DimensionMismatch { .. } => vec![
                "All vectors in one index must share the dimension fixed at creation",
                "Check the embedding model that produced the vector",
            ],
            Self::DimensionsTooLarge { .. } => vec![
                "Reduce dimensionality before indexing",
                "Raise index.max_dimensions only if a tuple still fits one page",
            ],
            Self::InvalidOption { .. } => vec![
                "m must be within 2..=100 and ef_construction at least 2 * m",
                "ef_search must be within 1..=1000",
            ],
            Self::MetricMismatch { .. } => vec![
                "Open the index with the metric it was created with",
                "Rebuild the index to change its metric",
            ],
            Self::NotEmpty => vec!["Create a fresh index for bulk loading, or use insert()"],
            Self::Corrupted { .. } | Self::InvalidTuple { .. } | Self::Storage(_) => vec![
                "Rebuild the index from the source rows",
                "Check for disk errors or filesystem corruption",
            ],
            Self::InvariantViolated { .. } => vec![
                "Run vacuum to repair neighbor lists",
                "Rebuild the index if the violation persists",
            ],
            Self::WorkerFailed { .. } => vec![
                "Inspect the logged worker error; the partial build should be discarded",
            ],
            _ => vec![],
        }
    }
}

/// Result type alias for index operations
pub type HnswResult<T> = Result<T, HnswError>;

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Helper trait for attaching the offending path to I/O errors
pub trait IoContext<T> {
    fn with_path(self, path: &Path) -> StorageResult<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn with_path(self, path: &Path) -> StorageResult<T> {
        self.map_err(|source| StorageError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_are_stable() {
        let err = HnswError::DimensionMismatch {
            expected: 3,
            actual: 4,
        };
        assert_eq!(err.status_code(), "DIMENSION_MISMATCH");
        assert!(!err.is_structural());
        assert!(!err.recovery_suggestions().is_empty());
    }

    #[test]
    fn test_storage_errors_classification() {
        let corrupt: HnswError = StorageError::MalformedTuple {
            reason: "short".to_string(),
        }
        .into();
        assert!(corrupt.is_structural());
        assert_eq!(corrupt.status_code(), "STORAGE_CORRUPTED");

        let io: HnswError = StorageError::Io {
            path: PathBuf::from("/tmp/x"),
            source: std::io::Error::other("boom"),
        }
        .into();
        assert!(!io.is_structural());
        assert_eq!(io.status_code(), "STORAGE_IO");
    }

    #[test]
    fn test_io_context_keeps_path() {
        let result: std::io::Result<()> = Err(std::io::Error::other("denied"));
        let err = result.with_path(Path::new("/data/index.pages")).unwrap_err();
        assert!(err.to_string().contains("/data/index.pages"));
    }
}
