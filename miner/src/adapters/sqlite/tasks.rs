use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};

use super::pool::{create_memory_pool, create_pool, DbPool};
use super::schema::initialize_schema;
use crate::services::tasks::store::TaskStore;
use crate::types::error::{MinerError, Result};
use crate::types::mining::{StageKind, StageRecord, StageStatus};

/// Stage records in the `tasks` table.
pub struct SqliteTaskStore {
    pool: DbPool,
}

impl SqliteTaskStore {
    pub fn open(path: &Path) -> Result<Self> {
        Self::with_pool(create_pool(path)?)
    }

    pub fn in_memory() -> Result<Self> {
        Self::with_pool(create_memory_pool()?)
    }

    fn with_pool(pool: DbPool) -> Result<Self> {
        let conn = pool.get()?;
        initialize_schema(&conn)?;
        drop(conn);
        Ok(Self { pool })
    }
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single().ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Integer,
            format!("invalid timestamp {}", ms).into(),
        )
    })
}

fn parse_kind(value: &str) -> Option<StageKind> {
    StageKind::ALL.into_iter().find(|k| k.as_str() == value)
}

impl TaskStore for SqliteTaskStore {
    fn insert_stage(&self, record: &StageRecord) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO tasks (id, user_id, type, category, status, details, started_at, stopped_at, duration)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            rusqlite::params![
                record.id,
                record.user_id,
                record.kind.as_str(),
                record.category,
                record.status.as_str(),
                record.details.to_string(),
                to_millis(record.started_at),
                record.stopped_at.map(to_millis),
                record.duration,
            ],
        )?;
        Ok(())
    }

    fn update_stage(&self, record: &StageRecord) -> Result<()> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE tasks SET status = ?1, details = ?2, stopped_at = ?3, duration = ?4
             WHERE id = ?5",
            rusqlite::params![
                record.status.as_str(),
                record.details.to_string(),
                record.stopped_at.map(to_millis),
                record.duration,
                record.id,
            ],
        )?;
        if changed == 0 {
            return Err(MinerError::NotFound(format!("stage {}", record.id)));
        }
        Ok(())
    }

    fn get_stage(&self, id: &str) -> Result<Option<StageRecord>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, type, category, status, details, started_at, stopped_at, duration
             FROM tasks WHERE id = ?1",
        )?;

        let mut rows = stmt.query_map(rusqlite::params![id], |row| {
            let kind: String = row.get(2)?;
            let status: String = row.get(4)?;
            let details: String = row.get(5)?;
            let stopped_at: Option<i64> = row.get(7)?;
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                kind,
                row.get::<_, String>(3)?,
                status,
                details,
                from_millis(row.get(6)?)?,
                stopped_at.map(from_millis).transpose()?,
                row.get::<_, Option<i64>>(8)?,
            ))
        })?;

        let Some(row) = rows.next() else {
            return Ok(None);
        };
        let (id, user_id, kind, category, status, details, started_at, stopped_at, duration) =
            row?;

        let kind = parse_kind(&kind)
            .ok_or_else(|| MinerError::Database(format!("unknown stage type {}", kind)))?;
        let status = StageStatus::parse(&status)
            .ok_or_else(|| MinerError::Database(format!("unknown stage status {}", status)))?;

        Ok(Some(StageRecord {
            id,
            user_id,
            kind,
            category,
            status,
            details: serde_json::from_str(&details)?,
            started_at,
            stopped_at,
            duration,
        }))
    }
}
