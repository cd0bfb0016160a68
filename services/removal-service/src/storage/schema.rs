use rusqlite::Connection;

pub const USAGE_STATS_TABLE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS usage_stats (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    period_key TEXT NOT NULL,
    api_calls_used INTEGER NOT NULL,
    api_calls_limit INTEGER NOT NULL,
    local_processed INTEGER NOT NULL,
    total_processed INTEGER NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

pub const USAGE_HISTORY_TABLE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS usage_history (
    period_key TEXT PRIMARY KEY,
    api_calls_used INTEGER NOT NULL,
    api_calls_limit INTEGER NOT NULL,
    local_processed INTEGER NOT NULL,
    total_processed INTEGER NOT NULL,
    archived_at TEXT NOT NULL
);
"#;

pub fn init_database(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(USAGE_STATS_TABLE_SCHEMA)?;
    conn.execute_batch(USAGE_HISTORY_TABLE_SCHEMA)?;
    Ok(())
}
