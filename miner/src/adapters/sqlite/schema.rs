use rusqlite::Connection;

use crate::types::error::MinerError;

pub fn initialize_schema(conn: &Connection) -> Result<(), MinerError> {
    conn.execute_batch(
        "
        -- One row per stage of a mining task
        CREATE TABLE IF NOT EXISTS tasks (
            id              TEXT PRIMARY KEY,   -- UUID
            user_id         TEXT NOT NULL,
            type            TEXT NOT NULL,      -- 'fetch' | 'extract' | 'clean'
            category        TEXT NOT NULL,      -- 'mining'
            status          TEXT NOT NULL,      -- 'running' | 'done' | 'canceled'
            details         TEXT NOT NULL DEFAULT '{}',  -- JSON
            started_at      INTEGER NOT NULL,   -- unix epoch ms
            stopped_at      INTEGER,            -- unix epoch ms
            duration        INTEGER             -- ms
        );

        CREATE INDEX IF NOT EXISTS idx_tasks_user ON tasks(user_id, started_at DESC);
        ",
    )?;
    Ok(())
}
