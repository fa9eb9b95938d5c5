//! Log repository: append-only `job_logs` rows.

use rusqlite::{params, Connection, Row};

use super::{Database, DatabaseError};

#[derive(Debug, Clone, PartialEq)]
pub struct LogRow {
    pub timestamp: String,
    pub level: String,
    pub message: String,
    pub context: Option<String>,
}

impl LogRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            timestamp: row.get("timestamp")?,
            level: row.get("level")?,
            message: row.get("message")?,
            context: row.get("context")?,
        })
    }
}

/// Appends log rows for a job on an already locked connection.
pub(crate) fn insert_all(
    conn: &Connection,
    job_id: &str,
    logs: &[LogRow],
) -> Result<(), DatabaseError> {
    if logs.is_empty() {
        return Ok(());
    }
    let mut stmt = conn.prepare(
        "INSERT INTO job_logs (job_id, timestamp, level, message, context)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    for log in logs {
        stmt.execute(params![
            job_id,
            log.timestamp,
            log.level,
            log.message,
            log.context
        ])?;
    }
    Ok(())
}

/// Returns a job's logs in append order.
pub fn find_by_job(db: &Database, job_id: &str) -> Result<Vec<LogRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT timestamp, level, message, context FROM job_logs
             WHERE job_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![job_id], LogRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}
