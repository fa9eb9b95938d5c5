use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::db::result_repo::{self, SavedResultRow};
use crate::db::{Database, DatabaseError};
use crate::job::ToolType;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A completed job's output, handed to the user's saved-results collection.
#[derive(Debug, Clone, Serialize)]
pub struct SavedResult {
    pub job_id: String,
    pub owner_id: String,
    pub tool_type: ToolType,
    pub title: String,
    pub description: Option<String>,
    pub source_info: Value,
    pub result: Value,
    pub metadata: Map<String, Value>,
}

#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn save(&self, result: &SavedResult) -> Result<(), SinkError>;
}

/// Discards results.
pub struct NoopResultSink;

#[async_trait]
impl ResultSink for NoopResultSink {
    async fn save(&self, _result: &SavedResult) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Writes results to the `saved_results` table.
pub struct SqliteResultSink {
    db: Database,
}

impl SqliteResultSink {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ResultSink for SqliteResultSink {
    async fn save(&self, result: &SavedResult) -> Result<(), SinkError> {
        let row = SavedResultRow {
            job_id: result.job_id.clone(),
            owner_id: result.owner_id.clone(),
            tool_type: result.tool_type.as_str().to_string(),
            title: result.title.clone(),
            description: result.description.clone(),
            source_info: serde_json::to_string(&result.source_info)?,
            result: serde_json::to_string(&result.result)?,
            metadata: serde_json::to_string(&result.metadata)?,
            created_at: Utc::now().to_rfc3339(),
        };
        result_repo::upsert(&self.db, &row)?;
        log::debug!("Saved result for job {}", result.job_id);
        Ok(())
    }
}
