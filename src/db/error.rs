use rusqlite::ErrorCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("Database connection error: {0}")]
    ConnectionError(#[from] r2d2::Error),

    #[error("Database execution error: {0}")]
    Rusqlite(#[from] rusqlite::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] rusqlite_migration::Error),

    #[error("Row mapping error: {0}")]
    SerdeRusqlite(#[from] serde_rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Decoding error: {0}")]
    Decoding(String),

    #[error("Missing row: {0}")]
    Missing(String),
}

impl DbError {
    /// Whether the failure is about reaching the database rather than about the statement.
    ///
    /// Only these are worth a reconnect-and-retry; everything else is a bug or corruption.
    pub fn is_connection(&self) -> bool {
        match self {
            DbError::ConnectionError(_) => true,
            DbError::Rusqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::CannotOpen
            ),
            _ => false,
        }
    }
}

// Convenience alias
pub type DbResult<T> = Result<T, DbError>;
