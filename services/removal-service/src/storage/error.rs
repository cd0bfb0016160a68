use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    DatabaseError(#[from] rusqlite::Error),
    #[error("invalid usage record: {0}")]
    InvalidRecord(String),
    #[error("storage connection poisoned")]
    Poisoned,
    #[error("io error: {0}")]
    IoError(#[from] io::Error),
}
