//! Database error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("corrupt job row {id}: {message}")]
    Corrupt { id: uuid::Uuid, message: String },
}

pub type DbResult<T> = std::result::Result<T, DbError>;

impl From<DbError> for deployit_core::Error {
    fn from(err: DbError) -> Self {
        deployit_core::Error::Storage(err.to_string())
    }
}
