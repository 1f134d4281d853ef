//! Error types shared across the cache engines.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Error for all cache operations.
///
/// `NotFound` is a normal outcome of a Get and is never fatal; callers test
/// for it with [`Error::is_not_found`] regardless of which tier produced it.
#[derive(Debug, Error)]
pub enum Error {
    /// The requested entry does not exist in the tier that was asked.
    #[error("not found: {0}")]
    NotFound(String),

    /// A stored record could not be parsed. Fatal to the current operation.
    #[error("malformed {what}: {detail}")]
    Malformed { what: &'static str, detail: String },

    /// Filesystem failure, annotated with the path and operation.
    #[error("{op} {path}: {source}")]
    File {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Remote object store failure other than not-found.
    #[error("object store: {0}")]
    Store(String),

    #[error("upstream request: {0}")]
    Upstream(#[from] reqwest::Error),

    /// Missing or invalid configuration, reported at startup only.
    #[error("configuration: {0}")]
    Config(String),
}

impl Error {
    /// Reports whether this error means the entry was absent, unifying the
    /// object-store SDK's not-found sentinels with local file absence.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::File { source, .. } => source.kind() == std::io::ErrorKind::NotFound,
            Error::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    pub(crate) fn file(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::File {
            op,
            path: path.into(),
            source,
        }
    }

    pub(crate) fn malformed(what: &'static str, detail: impl Into<String>) -> Self {
        Error::Malformed {
            what,
            detail: detail.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_predicate() {
        assert!(Error::NotFound("key".into()).is_not_found());
        assert!(Error::Io(std::io::Error::from(std::io::ErrorKind::NotFound)).is_not_found());
        assert!(!Error::Store("boom".into()).is_not_found());
        assert!(!Error::malformed("action record", "garbage").is_not_found());
    }
}
