/// Error types for the history subsystem
///
/// Each layer has its own enum; higher layers wrap lower ones with `#[from]`
/// so `?` works across the stack.
use thiserror::Error;

/// Failures of the SQLite-backed store adapter.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error in {op}: {source}")]
    Sql {
        op: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    #[error("corrupt {what} blob for image {imgid}")]
    CorruptBlob { what: &'static str, imgid: i32 },

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image {0} is not in the catalog")]
    MissingImage(i32),

    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Attach the statement context to a rusqlite error, logging it on the way.
pub(crate) trait SqlContext<T> {
    fn ctx(self, op: &'static str) -> Result<T, StoreError>;
}

impl<T> SqlContext<T> for rusqlite::Result<T> {
    fn ctx(self, op: &'static str) -> Result<T, StoreError> {
        self.map_err(|source| {
            tracing::error!("[{}] sqlite error: {}", op, source);
            StoreError::Sql { op, source }
        })
    }
}

/// Failures of the image metadata cache.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("image {0} is not in the catalog")]
    Missing(i32),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A module could not read parameters written by an older version.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MigrationError {
    #[error("no migration from version {from} to {to}")]
    Unsupported { from: i32, to: i32 },

    #[error("legacy blob has {got} bytes, expected {expected}")]
    Length { expected: usize, got: usize },
}

/// Failures of history operations.
#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("image {0} is not in the catalog")]
    UnknownImage(i32),

    #[error("module `{0}' is not installed")]
    UnknownModule(String),

    #[error("nothing was copied: the clipboard is empty")]
    EmptyClipboard,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Cache(#[from] CacheError),
}
