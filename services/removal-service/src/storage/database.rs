use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::quota::UsageStats;

use super::backend::{UsageBackend, UsageHistoryRecord};
use super::error::StorageError;
use super::schema::init_database;
use super::USAGE_DB_FILENAME;

pub struct UsageDatabase {
    data_dir: Option<PathBuf>,
    conn: Mutex<Connection>,
}

impl UsageDatabase {
    pub fn new(data_dir: PathBuf) -> Result<Self, StorageError> {
        std::fs::create_dir_all(&data_dir)?;
        let db_path = data_dir.join(USAGE_DB_FILENAME);
        let conn = Connection::open(&db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        init_database(&conn)?;

        debug!(path = %db_path.display(), "opened usage database");

        Ok(Self {
            data_dir: Some(data_dir),
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        init_database(&conn)?;

        Ok(Self {
            data_dir: None,
            conn: Mutex::new(conn),
        })
    }

    pub fn data_dir(&self) -> Option<&Path> {
        self.data_dir.as_deref()
    }

    fn connection(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::Poisoned)
    }
}

impl UsageBackend for UsageDatabase {
    fn load(&self) -> Result<Option<UsageStats>, StorageError> {
        let conn = self.connection()?;

        let mut stmt = conn.prepare(
            r#"
            SELECT period_key, api_calls_used, api_calls_limit, local_processed, total_processed
            FROM usage_stats
            WHERE id = 1
            "#,
        )?;

        let row = stmt
            .query_row([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })
            .optional()?;

        row.map(|(period_key, used, limit, local, total)| {
            Ok(UsageStats {
                api_calls_used: to_counter("api_calls_used", used)?,
                api_calls_limit: to_counter("api_calls_limit", limit)?,
                local_processed: to_counter("local_processed", local)?,
                total_processed: to_counter("total_processed", total)?,
                period_key,
            })
        })
        .transpose()
    }

    fn save(&self, stats: &UsageStats) -> Result<(), StorageError> {
        let conn = self.connection()?;
        let now = Utc::now().to_rfc3339();

        conn.execute(
            r#"
            INSERT INTO usage_stats (id, period_key, api_calls_used, api_calls_limit, local_processed, total_processed, updated_at)
            VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(id) DO UPDATE SET
                period_key = excluded.period_key,
                api_calls_used = excluded.api_calls_used,
                api_calls_limit = excluded.api_calls_limit,
                local_processed = excluded.local_processed,
                total_processed = excluded.total_processed,
                updated_at = excluded.updated_at
            "#,
            params![
                stats.period_key,
                stats.api_calls_used as i64,
                stats.api_calls_limit as i64,
                stats.local_processed as i64,
                stats.total_processed as i64,
                now
            ],
        )?;

        Ok(())
    }

    fn archive(&self, stats: &UsageStats) -> Result<(), StorageError> {
        let conn = self.connection()?;
        let now = Utc::now().to_rfc3339();

        conn.execute(
            r#"
            INSERT INTO usage_history (period_key, api_calls_used, api_calls_limit, local_processed, total_processed, archived_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(period_key) DO UPDATE SET
                api_calls_used = excluded.api_calls_used,
                api_calls_limit = excluded.api_calls_limit,
                local_processed = excluded.local_processed,
                total_processed = excluded.total_processed,
                archived_at = excluded.archived_at
            "#,
            params![
                stats.period_key,
                stats.api_calls_used as i64,
                stats.api_calls_limit as i64,
                stats.local_processed as i64,
                stats.total_processed as i64,
                now
            ],
        )?;

        Ok(())
    }

    fn history(&self) -> Result<Vec<UsageHistoryRecord>, StorageError> {
        let conn = self.connection()?;

        let mut stmt = conn.prepare(
            r#"
            SELECT period_key, api_calls_used, api_calls_limit, local_processed, total_processed, archived_at
            FROM usage_history
            ORDER BY period_key DESC
            "#,
        )?;

        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut history = Vec::new();
        for row in rows {
            let (period_key, used, limit, local, total, archived_at) = row?;
            history.push(UsageHistoryRecord {
                period_key,
                api_calls_used: to_counter("api_calls_used", used)?,
                api_calls_limit: to_counter("api_calls_limit", limit)?,
                local_processed: to_counter("local_processed", local)?,
                total_processed: to_counter("total_processed", total)?,
                archived_at,
            });
        }
        Ok(history)
    }
}

fn to_counter(column: &str, value: i64) -> Result<u64, StorageError> {
    u64::try_from(value)
        .map_err(|_| StorageError::InvalidRecord(format!("{column} is negative: {value}")))
}
