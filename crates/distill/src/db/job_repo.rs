//! Job repository: persistence for the `jobs` table.
//!
//! Rows are written with an optimistic `version` guard so a stale writer
//! can never overwrite a newer revision.

use rusqlite::{params, Row};

use super::log_repo::{self, LogRow};
use super::{Database, DatabaseError};

/// A raw job row from the database. JSON columns are kept as text.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRow {
    pub id: String,
    pub tool_type: String,
    pub content_type: String,
    pub source: String,
    pub options: String,
    pub status: String,
    pub stage: String,
    pub progress: i64,
    pub result: Option<String>,
    pub error: Option<String>,
    pub metadata: String,
    pub owner_id: String,
    pub created_at: String,
    pub updated_at: String,
    pub expires_at: String,
    pub version: i64,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            tool_type: row.get("tool_type")?,
            content_type: row.get("content_type")?,
            source: row.get("source")?,
            options: row.get("options")?,
            status: row.get("status")?,
            stage: row.get("stage")?,
            progress: row.get("progress")?,
            result: row.get("result")?,
            error: row.get("error")?,
            metadata: row.get("metadata")?,
            owner_id: row.get("owner_id")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            expires_at: row.get("expires_at")?,
            version: row.get("version")?,
        })
    }
}

/// Inserts a new job row together with its initial log entries.
///
/// Fails with a constraint violation if the id already exists.
pub fn insert(db: &Database, job: &JobRow, logs: &[LogRow]) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO jobs (id, tool_type, content_type, source, options, status, stage,
             progress, result, error, metadata, owner_id, created_at, updated_at, expires_at,
             version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                job.id,
                job.tool_type,
                job.content_type,
                job.source,
                job.options,
                job.status,
                job.stage,
                job.progress,
                job.result,
                job.error,
                job.metadata,
                job.owner_id,
                job.created_at,
                job.updated_at,
                job.expires_at,
                job.version,
            ],
        )?;
        log_repo::insert_all(&tx, &job.id, logs)?;
        tx.commit()?;
        Ok(())
    })
}

/// Writes a new revision of a job if the stored revision still equals
/// `expected_version`, appending `new_logs` in the same transaction.
///
/// Returns `false` (and writes nothing) when the guard does not match.
pub fn update_versioned(
    db: &Database,
    job: &JobRow,
    expected_version: i64,
    new_logs: &[LogRow],
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let tx = conn.unchecked_transaction()?;
        let changed = tx.execute(
            "UPDATE jobs SET status=?2, stage=?3, progress=?4, result=?5, error=?6,
             metadata=?7, updated_at=?8, expires_at=?9, version=?10
             WHERE id=?1 AND version=?11",
            params![
                job.id,
                job.status,
                job.stage,
                job.progress,
                job.result,
                job.error,
                job.metadata,
                job.updated_at,
                job.expires_at,
                job.version,
                expected_version,
            ],
        )?;
        if changed == 0 {
            return Ok(false);
        }
        log_repo::insert_all(&tx, &job.id, new_logs)?;
        tx.commit()?;
        Ok(true)
    })
}

/// Finds a job by its ID.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM jobs WHERE id = ?1")?;
        let mut rows = stmt.query_map(params![id], JobRow::from_row)?;
        match rows.next() {
            Some(Ok(row)) => Ok(Some(row)),
            Some(Err(e)) => Err(DatabaseError::Sqlite(e)),
            None => Ok(None),
        }
    })
}

/// Returns every job row, oldest first.
pub fn find_all(db: &Database) -> Result<Vec<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM jobs ORDER BY created_at ASC")?;
        let rows = stmt
            .query_map([], JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Deletes terminal jobs whose `expires_at` is before `now`, returning
/// the ids removed. Their logs are removed by cascade.
pub fn delete_expired(db: &Database, now: &str) -> Result<Vec<String>, DatabaseError> {
    db.with_conn(|conn| {
        let tx = conn.unchecked_transaction()?;
        let ids = {
            let mut stmt = tx.prepare(
                "SELECT id FROM jobs
                 WHERE status IN ('completed', 'failed') AND expires_at < ?1",
            )?;
            let ids = stmt
                .query_map(params![now], |r| r.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            ids
        };
        tx.execute(
            "DELETE FROM jobs WHERE status IN ('completed', 'failed') AND expires_at < ?1",
            params![now],
        )?;
        tx.commit()?;
        Ok(ids)
    })
}

/// Counts jobs with the given status.
pub fn count_by_status(db: &Database, status: &str) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE status = ?1",
            params![status],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}
