use std::sync::{Mutex, PoisonError};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::quota::UsageStats;

use super::error::StorageError;

/// Counters of a closed quota period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageHistoryRecord {
    pub period_key: String,
    pub api_calls_used: u64,
    pub api_calls_limit: u64,
    pub local_processed: u64,
    pub total_processed: u64,
    pub archived_at: String,
}

impl UsageHistoryRecord {
    pub fn from_stats(stats: &UsageStats) -> Self {
        Self {
            period_key: stats.period_key.clone(),
            api_calls_used: stats.api_calls_used,
            api_calls_limit: stats.api_calls_limit,
            local_processed: stats.local_processed,
            total_processed: stats.total_processed,
            archived_at: Utc::now().to_rfc3339(),
        }
    }
}

/// Durable home of the usage counters.
///
/// `save` must not return before the record is durable; the quota store calls
/// it while holding its lock.
pub trait UsageBackend: Send + Sync {
    fn load(&self) -> Result<Option<UsageStats>, StorageError>;

    fn save(&self, stats: &UsageStats) -> Result<(), StorageError>;

    /// Keeps the final counters of a period that is being reset.
    fn archive(&self, stats: &UsageStats) -> Result<(), StorageError>;

    /// Archived periods, newest first.
    fn history(&self) -> Result<Vec<UsageHistoryRecord>, StorageError>;
}

/// Process-local backend for tests and benchmarks.
#[derive(Debug, Default)]
pub struct MemoryUsageBackend {
    current: Mutex<Option<UsageStats>>,
    archived: Mutex<Vec<UsageHistoryRecord>>,
    saves: Mutex<u64>,
}

impl MemoryUsageBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stats(stats: UsageStats) -> Self {
        Self {
            current: Mutex::new(Some(stats)),
            ..Self::default()
        }
    }

    /// Number of completed `save` calls.
    pub fn save_count(&self) -> u64 {
        *self.saves.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl UsageBackend for MemoryUsageBackend {
    fn load(&self) -> Result<Option<UsageStats>, StorageError> {
        Ok(self
            .current
            .lock()
            .map_err(|_| StorageError::Poisoned)?
            .clone())
    }

    fn save(&self, stats: &UsageStats) -> Result<(), StorageError> {
        *self.current.lock().map_err(|_| StorageError::Poisoned)? = Some(stats.clone());
        *self.saves.lock().map_err(|_| StorageError::Poisoned)? += 1;
        Ok(())
    }

    fn archive(&self, stats: &UsageStats) -> Result<(), StorageError> {
        let mut archived = self.archived.lock().map_err(|_| StorageError::Poisoned)?;
        archived.retain(|record| record.period_key != stats.period_key);
        archived.push(UsageHistoryRecord::from_stats(stats));
        Ok(())
    }

    fn history(&self) -> Result<Vec<UsageHistoryRecord>, StorageError> {
        let mut records = self
            .archived
            .lock()
            .map_err(|_| StorageError::Poisoned)?
            .clone();
        records.sort_by(|a, b| b.period_key.cmp(&a.period_key));
        Ok(records)
    }
}
