use thiserror::Error;

use crate::{cache::CacheError, db::DbError};

/// Errors surfaced by the long-running indexer tasks.
///
/// Anything that reaches the supervisor is treated as fatal: the process logs it and exits
/// so that an external supervisor can restart it from the last committed state.
#[derive(Debug, Error)]
pub enum IndexerError {
    /// An unrecoverable error that should stop indexing entirely.
    ///
    /// Examples include a persistence failure, an unknown transaction type or a reference to
    /// data that should already be stored but is not.
    #[error("Fatal error: {0}")]
    Fatal(#[from] anyhow::Error),

    /// A temporary error that was recovered from locally (network, busy database).
    #[error("Intermittent error: {0}")]
    Intermittent(String),

    /// DB execution failed
    #[error("Database execution error: {0}")]
    Db(#[from] DbError),

    /// In-memory state disagrees with what storage should contain.
    #[error("Cache invariant violated: {0}")]
    Cache(#[from] CacheError),
}

impl From<tokio::task::JoinError> for IndexerError {
    fn from(e: tokio::task::JoinError) -> Self {
        IndexerError::Fatal(anyhow::anyhow!("Blocking task failed: {}", e))
    }
}
