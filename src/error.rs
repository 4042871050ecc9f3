//! Error types for the durable sync stores.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt {table} row: {reason}")]
    Corrupt { table: &'static str, reason: String },
    #[error("payload encoding error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("invalid sync state: {0}")]
    Invariant(&'static str),
}

pub type StoreResult<T> = Result<T, StoreError>;
