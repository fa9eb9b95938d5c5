//! Saved result repository: the `saved_results` table written by the
//! SQLite result sink.

use rusqlite::{params, Row};

use super::{Database, DatabaseError};

#[derive(Debug, Clone, PartialEq)]
pub struct SavedResultRow {
    pub job_id: String,
    pub owner_id: String,
    pub tool_type: String,
    pub title: String,
    pub description: Option<String>,
    pub source_info: String,
    pub result: String,
    pub metadata: String,
    pub created_at: String,
}

impl SavedResultRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            job_id: row.get("job_id")?,
            owner_id: row.get("owner_id")?,
            tool_type: row.get("tool_type")?,
            title: row.get("title")?,
            description: row.get("description")?,
            source_info: row.get("source_info")?,
            result: row.get("result")?,
            metadata: row.get("metadata")?,
            created_at: row.get("created_at")?,
        })
    }
}

/// Inserts a saved result. A second save for the same job replaces the first.
pub fn upsert(db: &Database, row: &SavedResultRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO saved_results (job_id, owner_id, tool_type, title, description,
             source_info, result, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(job_id) DO UPDATE SET title=excluded.title,
             description=excluded.description, result=excluded.result,
             metadata=excluded.metadata",
            params![
                row.job_id,
                row.owner_id,
                row.tool_type,
                row.title,
                row.description,
                row.source_info,
                row.result,
                row.metadata,
                row.created_at,
            ],
        )?;
        Ok(())
    })
}

/// Lists an owner's saved results, newest first.
pub fn find_by_owner(db: &Database, owner_id: &str) -> Result<Vec<SavedResultRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM saved_results WHERE owner_id = ?1 ORDER BY created_at DESC",
        )?;
        let rows = stmt
            .query_map(params![owner_id], SavedResultRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(job_id: &str, title: &str) -> SavedResultRow {
        SavedResultRow {
            job_id: job_id.to_string(),
            owner_id: "owner".to_string(),
            tool_type: "summarize".to_string(),
            title: title.to_string(),
            description: None,
            source_info: r#"{"type":"text"}"#.to_string(),
            result: r#"{"summary":"s"}"#.to_string(),
            metadata: "{}".to_string(),
            created_at: "2026-01-01T00:00:00.000000Z".to_string(),
        }
    }

    #[test]
    fn test_upsert_replaces_by_job() {
        let db = Database::open_in_memory().unwrap();
        upsert(&db, &sample("j1", "first")).unwrap();
        upsert(&db, &sample("j1", "second")).unwrap();
        upsert(&db, &sample("j2", "other")).unwrap();

        let rows = find_by_owner(&db, "owner").unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().any(|r| r.job_id == "j1" && r.title == "second"));
        assert!(find_by_owner(&db, "nobody").unwrap().is_empty());
    }
}
