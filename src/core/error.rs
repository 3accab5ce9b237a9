//! Error types for slidestitch
//!
//! Every fallible library operation returns [`Result`]. The variants follow the
//! failure classes of a level conversion: bad geometry, unreadable fragments,
//! canvas persistence problems, overlapping fragments and encoder failures.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for slidestitch operations
#[derive(Debug, Error)]
pub enum Error {
    /// Zero tile size or non-positive declared extents
    #[error("Invalid grid geometry: {0}")]
    Geometry(String),

    /// A fragment's metadata or tile buffer could not be read or converted
    #[error("Source read failed for fragment '{fragment}': {reason}")]
    SourceRead { fragment: String, reason: String },

    /// Canvas persistence failure
    #[error("Canvas store I/O error at {}: {source}", path.display())]
    StoreIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Canvas file exists but its header or layout is not usable
    #[error("Canvas store format error: {0}")]
    StoreFormat(String),

    /// Two fragments claim the same region of the tile grid
    #[error("Fragments '{first}' and '{second}' overlap: {detail}")]
    Overlap {
        first: String,
        second: String,
        detail: String,
    },

    /// Downstream pyramid encoding failure
    #[error("Pyramid encode failed: {0}")]
    Encode(String),

    /// Invalid configuration or parameters
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// File I/O error outside the canvas store
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build a [`Error::SourceRead`] for the named fragment
    pub fn source_read(fragment: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::SourceRead {
            fragment: fragment.into(),
            reason: reason.into(),
        }
    }

    /// Build a [`Error::StoreIo`] for the canvas at `path`
    pub fn store_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::StoreIo {
            path: path.into(),
            source,
        }
    }
}

/// Convenience result type for slidestitch operations
pub type Result<T> = std::result::Result<T, Error>;
