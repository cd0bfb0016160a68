use thiserror::Error;

use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum QuotaError {
    #[error("api quota exhausted: used={used}, limit={limit}")]
    Exhausted { used: u64, limit: u64 },
    #[error("api quota overrun refused: used={used}, limit={limit}")]
    Overrun { used: u64, limit: u64 },
    #[error("storage error: {0}")]
    StorageError(#[from] StorageError),
}
