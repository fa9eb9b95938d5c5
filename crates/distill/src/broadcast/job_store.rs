//! Job store with an in-memory cache over the durable SQLite record.
//!
//! Every mutation runs under the cache write lock, so writes for a job are
//! serialized within the process, and is persisted with a `version` guard.
//! Status moves forward only, progress never decreases, and terminal jobs
//! accept nothing but log entries.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::broadcast::job_progress::{JobProgressBroadcaster, JobProgressEvent};
use crate::db::job_repo::{self, JobRow};
use crate::db::log_repo::{self, LogRow};
use crate::db::{Database, DatabaseError};
use crate::error::StoreError;
use crate::job::{
    ContentType, Job, JobError, JobStatus, LogEntry, LogLevel, Source, ToolType, STAGE_DONE,
    STAGE_FAILED, STAGE_QUEUED,
};

// ─── Helpers ────────────────────────────────────────────────────────────────

fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|e| {
            log::warn!("parse_timestamp: failed to parse '{}': {}", s, e);
            Utc::now()
        })
}

fn decode<T>(id: &str, column: &'static str, value: &str) -> Result<T, DatabaseError>
where
    T: FromStr<Err = String>,
{
    value.parse().map_err(|reason| DatabaseError::Decode {
        id: id.to_string(),
        column,
        reason,
    })
}

fn decode_json<T>(id: &str, column: &'static str, value: &str) -> Result<T, DatabaseError>
where
    T: serde::de::DeserializeOwned,
{
    serde_json::from_str(value).map_err(|e| DatabaseError::Decode {
        id: id.to_string(),
        column,
        reason: e.to_string(),
    })
}

fn job_to_row(job: &Job) -> Result<JobRow, serde_json::Error> {
    Ok(JobRow {
        id: job.id.clone(),
        tool_type: job.tool_type.as_str().to_string(),
        content_type: job.content_type.as_str().to_string(),
        source: serde_json::to_string(&job.source)?,
        options: serde_json::to_string(&job.options)?,
        status: job.status.as_str().to_string(),
        stage: job.stage.clone(),
        progress: i64::from(job.progress),
        result: job.result.as_ref().map(serde_json::to_string).transpose()?,
        error: job.error.as_ref().map(serde_json::to_string).transpose()?,
        metadata: serde_json::to_string(&job.metadata)?,
        owner_id: job.owner_id.clone(),
        created_at: format_timestamp(job.created_at),
        updated_at: format_timestamp(job.updated_at),
        expires_at: format_timestamp(job.expires_at),
        version: job.version as i64,
    })
}

fn log_to_row(entry: &LogEntry) -> Result<LogRow, serde_json::Error> {
    let context = if entry.context.is_null() {
        None
    } else {
        Some(serde_json::to_string(&entry.context)?)
    };
    Ok(LogRow {
        timestamp: format_timestamp(entry.timestamp),
        level: entry.level.as_str().to_string(),
        message: entry.message.clone(),
        context,
    })
}

fn log_from_row(job_id: &str, row: LogRow) -> Result<LogEntry, DatabaseError> {
    let context = match row.context {
        Some(ref raw) => decode_json(job_id, "context", raw)?,
        None => Value::Null,
    };
    Ok(LogEntry {
        timestamp: parse_timestamp(&row.timestamp),
        level: decode::<LogLevel>(job_id, "level", &row.level)?,
        message: row.message,
        context,
    })
}

fn job_from_row(row: JobRow, logs: Vec<LogRow>) -> Result<Job, DatabaseError> {
    let id = row.id.as_str();
    let logs = logs
        .into_iter()
        .map(|l| log_from_row(id, l))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Job {
        tool_type: decode::<ToolType>(id, "tool_type", &row.tool_type)?,
        content_type: decode::<ContentType>(id, "content_type", &row.content_type)?,
        source: decode_json::<Source>(id, "source", &row.source)?,
        options: decode_json(id, "options", &row.options)?,
        status: decode::<JobStatus>(id, "status", &row.status)?,
        stage: row.stage.clone(),
        progress: row.progress.clamp(0, 100) as u8,
        logs,
        result: row
            .result
            .as_deref()
            .map(|r| decode_json(id, "result", r))
            .transpose()?,
        error: row
            .error
            .as_deref()
            .map(|e| decode_json::<JobError>(id, "error", e))
            .transpose()?,
        metadata: decode_json(id, "metadata", &row.metadata)?,
        created_at: parse_timestamp(&row.created_at),
        updated_at: parse_timestamp(&row.updated_at),
        expires_at: parse_timestamp(&row.expires_at),
        owner_id: row.owner_id.clone(),
        version: row.version.max(0) as u64,
        id: row.id,
    })
}

fn ensure_not_terminal(job: &Job) -> Result<(), StoreError> {
    if job.is_terminal() {
        return Err(StoreError::AlreadyTerminal {
            id: job.id.clone(),
            status: job.status,
        });
    }
    Ok(())
}

fn map_insert_error(id: &str, e: DatabaseError) -> StoreError {
    match e {
        DatabaseError::Sqlite(rusqlite::Error::SqliteFailure(err, _))
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            StoreError::DuplicateId(id.to_string())
        }
        other => StoreError::Database(other),
    }
}

// ─── Inputs and outputs ─────────────────────────────────────────────────────

/// Parameters for a new job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub tool_type: ToolType,
    pub content_type: ContentType,
    pub source: Source,
    pub options: Value,
    pub owner_id: String,
    pub metadata: Map<String, Value>,
}

/// Partial update applied by [`JobStore::update`].
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub stage: Option<String>,
    pub progress: Option<u8>,
    /// Non-terminal status only; terminal states go through
    /// [`JobStore::complete`] and [`JobStore::fail`].
    pub status: Option<JobStatus>,
    /// Shallow-merged into the job's metadata.
    pub metadata: Option<Map<String, Value>>,
}

impl JobUpdate {
    pub fn stage(name: impl Into<String>, progress: u8) -> Self {
        Self {
            stage: Some(name.into()),
            progress: Some(progress),
            ..Default::default()
        }
    }

    pub fn metadata(metadata: Map<String, Value>) -> Self {
        Self {
            metadata: Some(metadata),
            ..Default::default()
        }
    }
}

/// Outcome of the pending→running gate.
#[derive(Debug, Clone)]
pub enum StartOutcome {
    /// The caller won the job and must execute it.
    Started(Job),
    /// The job had already left `pending`; the snapshot is returned unchanged.
    NotPending(Job),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCounts {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

// ─── JobStore ───────────────────────────────────────────────────────────────

/// Job store: the single source of truth for job status, progress and logs.
///
/// The cache holds every live job of this process; the database, when set,
/// is the durable record consulted on cache misses and at startup.
pub struct JobStore {
    /// Database handle (clone is cheap, inner `Arc`).
    db: RwLock<Option<Database>>,
    cache: RwLock<HashMap<String, Job>>,
    broadcaster: Option<JobProgressBroadcaster>,
    ttl: chrono::Duration,
}

impl JobStore {
    /// Creates a store whose jobs expire `ttl` after creation or completion.
    pub fn new(ttl: std::time::Duration) -> Self {
        Self {
            db: RwLock::new(None),
            cache: RwLock::new(HashMap::new()),
            broadcaster: None,
            ttl: chrono::Duration::from_std(ttl)
                .unwrap_or_else(|_| chrono::Duration::days(36_500)),
        }
    }

    /// Publishes a [`JobProgressEvent`] for every write.
    pub fn with_broadcaster(mut self, broadcaster: JobProgressBroadcaster) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    pub fn broadcaster(&self) -> Option<&JobProgressBroadcaster> {
        self.broadcaster.as_ref()
    }

    /// Sets the database connection.
    pub fn set_database(&self, db: Database) {
        let mut guard = match self.db.write() {
            Ok(g) => g,
            Err(poisoned) => {
                log::warn!("Job store DB lock was poisoned, recovering");
                poisoned.into_inner()
            }
        };
        *guard = Some(db);
    }

    /// Gets a cloned database handle if available.
    pub fn get_database(&self) -> Option<Database> {
        let guard = match self.db.read() {
            Ok(g) => g,
            Err(poisoned) => {
                log::warn!("Job store DB lock was poisoned, recovering");
                poisoned.into_inner()
            }
        };
        guard.clone()
    }

    fn read_cache(&self) -> RwLockReadGuard<'_, HashMap<String, Job>> {
        match self.cache.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Job store cache lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn write_cache(&self) -> RwLockWriteGuard<'_, HashMap<String, Job>> {
        match self.cache.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Job store cache lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn publish(&self, job: &Job) {
        if let Some(ref broadcaster) = self.broadcaster {
            broadcaster.send(JobProgressEvent::from_job(job));
        }
    }

    fn load_from_db(&self, id: &str) -> Result<Option<Job>, StoreError> {
        let Some(db) = self.get_database() else {
            return Ok(None);
        };
        match job_repo::find_by_id(&db, id)? {
            Some(row) => {
                let logs = log_repo::find_by_job(&db, id)?;
                Ok(Some(job_from_row(row, logs)?))
            }
            None => Ok(None),
        }
    }

    /// Creates a pending job with a fresh UUID.
    pub fn create(&self, new: NewJob) -> Result<Job, StoreError> {
        let now = Utc::now();
        let job = Job {
            id: Uuid::new_v4().to_string(),
            tool_type: new.tool_type,
            content_type: new.content_type,
            source: new.source,
            options: new.options,
            status: JobStatus::Pending,
            stage: STAGE_QUEUED.to_string(),
            progress: 0,
            logs: vec![LogEntry::new(
                LogLevel::Info,
                "Job created",
                json!({
                    "tool_type": new.tool_type,
                    "content_type": new.content_type,
                }),
            )],
            result: None,
            error: None,
            metadata: new.metadata,
            created_at: now,
            updated_at: now,
            expires_at: now + self.ttl,
            owner_id: new.owner_id,
            version: 0,
        };

        let mut cache = self.write_cache();
        if cache.contains_key(&job.id) {
            return Err(StoreError::DuplicateId(job.id));
        }
        if let Some(db) = self.get_database() {
            let row = job_to_row(&job)?;
            let logs = job
                .logs
                .iter()
                .map(log_to_row)
                .collect::<Result<Vec<_>, _>>()?;
            job_repo::insert(&db, &row, &logs).map_err(|e| map_insert_error(&job.id, e))?;
        }
        cache.insert(job.id.clone(), job.clone());
        self.publish(&job);
        drop(cache);

        log::debug!(
            "Created job {} ({}/{})",
            job.id,
            job.tool_type,
            job.content_type
        );
        Ok(job)
    }

    /// Returns a job by ID, checking the cache then the database.
    pub fn get(&self, id: &str) -> Result<Job, StoreError> {
        let cached = self.read_cache().get(id).cloned();
        if let Some(job) = cached {
            return Ok(job);
        }
        match self.load_from_db(id)? {
            Some(job) => {
                self.write_cache()
                    .entry(id.to_string())
                    .or_insert_with(|| job.clone());
                Ok(job)
            }
            None => Err(StoreError::NotFound(id.to_string())),
        }
    }

    /// Applies `apply` to a copy of the job, persists it under the version
    /// guard, then swaps it into the cache and publishes it.
    fn mutate<F>(&self, id: &str, apply: F) -> Result<Job, StoreError>
    where
        F: FnOnce(&mut Job) -> Result<(), StoreError>,
    {
        let mut cache = self.write_cache();
        let current = match cache.get(id) {
            Some(job) => job.clone(),
            None => self
                .load_from_db(id)?
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?,
        };

        let mut next = current.clone();
        apply(&mut next)?;
        next.version = current.version + 1;
        next.updated_at = Utc::now();

        if let Some(db) = self.get_database() {
            let row = job_to_row(&next)?;
            let new_logs = next.logs[current.logs.len()..]
                .iter()
                .map(log_to_row)
                .collect::<Result<Vec<_>, _>>()?;
            if !job_repo::update_versioned(&db, &row, current.version as i64, &new_logs)? {
                // The durable revision moved underneath us; drop the stale copy.
                cache.remove(id);
                return Err(StoreError::Conflict(id.to_string()));
            }
        }

        cache.insert(id.to_string(), next.clone());
        self.publish(&next);
        Ok(next)
    }

    /// Merges a partial update into a non-terminal job.
    pub fn update(&self, id: &str, update: JobUpdate) -> Result<Job, StoreError> {
        self.mutate(id, |job| {
            ensure_not_terminal(job)?;

            if let Some(status) = update.status {
                if status.is_terminal() {
                    return Err(StoreError::InvalidTransition {
                        id: job.id.clone(),
                        reason: format!("{} is only reachable through complete or fail", status),
                    });
                }
                if status != job.status && !job.status.can_transition_to(status) {
                    return Err(StoreError::InvalidTransition {
                        id: job.id.clone(),
                        reason: format!("{} -> {}", job.status, status),
                    });
                }
                job.status = status;
            }

            if let Some(progress) = update.progress {
                if progress > 100 {
                    return Err(StoreError::InvalidTransition {
                        id: job.id.clone(),
                        reason: format!("progress {} exceeds 100", progress),
                    });
                }
                if progress < job.progress {
                    return Err(StoreError::InvalidTransition {
                        id: job.id.clone(),
                        reason: format!(
                            "progress cannot decrease from {} to {}",
                            job.progress, progress
                        ),
                    });
                }
                job.progress = progress;
            }

            if let Some(stage) = update.stage {
                job.stage = stage;
            }
            if let Some(metadata) = update.metadata {
                job.metadata.extend(metadata);
            }
            Ok(())
        })
    }

    /// Appends a log entry. Allowed on terminal jobs.
    pub fn add_log(
        &self,
        id: &str,
        level: LogLevel,
        message: impl Into<String>,
        context: Value,
    ) -> Result<(), StoreError> {
        let entry = LogEntry::new(level, message, context);
        self.mutate(id, move |job| {
            job.logs.push(entry);
            Ok(())
        })
        .map(|_| ())
    }

    /// The pending→running gate. Exactly one caller observes `Started`.
    pub fn try_start(&self, id: &str) -> Result<StartOutcome, StoreError> {
        let started = self.mutate(id, |job| {
            if job.status != JobStatus::Pending {
                return Err(StoreError::InvalidTransition {
                    id: job.id.clone(),
                    reason: format!("cannot start a {} job", job.status),
                });
            }
            job.status = JobStatus::Running;
            job.logs
                .push(LogEntry::new(LogLevel::Info, "Job started", Value::Null));
            Ok(())
        });
        match started {
            Ok(job) => Ok(StartOutcome::Started(job)),
            Err(StoreError::InvalidTransition { .. }) => Ok(StartOutcome::NotPending(self.get(id)?)),
            Err(e) => Err(e),
        }
    }

    /// Marks a running job completed with its result.
    pub fn complete(&self, id: &str, result: Value) -> Result<Job, StoreError> {
        let expires_at = Utc::now() + self.ttl;
        self.mutate(id, move |job| {
            ensure_not_terminal(job)?;
            if job.status != JobStatus::Running {
                return Err(StoreError::InvalidTransition {
                    id: job.id.clone(),
                    reason: format!("cannot complete a {} job", job.status),
                });
            }
            job.status = JobStatus::Completed;
            job.stage = STAGE_DONE.to_string();
            job.progress = 100;
            job.result = Some(result);
            job.expires_at = expires_at;
            job.logs
                .push(LogEntry::new(LogLevel::Info, "Job completed", Value::Null));
            Ok(())
        })
    }

    /// Marks a pending or running job failed. Progress is left as is.
    pub fn fail(&self, id: &str, error: JobError) -> Result<Job, StoreError> {
        self.fail_at(id, None, error)
    }

    /// Fails the job only if it is still at `version`; any write since then
    /// yields `Conflict` and leaves the job alone.
    pub fn fail_if_unchanged(
        &self,
        id: &str,
        version: u64,
        error: JobError,
    ) -> Result<Job, StoreError> {
        self.fail_at(id, Some(version), error)
    }

    fn fail_at(
        &self,
        id: &str,
        expected_version: Option<u64>,
        error: JobError,
    ) -> Result<Job, StoreError> {
        let expires_at = Utc::now() + self.ttl;
        self.mutate(id, move |job| {
            ensure_not_terminal(job)?;
            if expected_version.is_some_and(|v| v != job.version) {
                return Err(StoreError::Conflict(job.id.clone()));
            }
            job.logs.push(LogEntry::new(
                LogLevel::Error,
                error.message.clone(),
                json!({ "kind": error.kind, "stage": job.stage }),
            ));
            job.status = JobStatus::Failed;
            job.stage = STAGE_FAILED.to_string();
            job.error = Some(error);
            job.expires_at = expires_at;
            Ok(())
        })
    }

    /// Returns all cached jobs with the given status, oldest first.
    pub fn list_by_status(&self, status: JobStatus) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .read_cache()
            .values()
            .filter(|j| j.status == status)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        jobs
    }

    /// Jobs in `status` whose last write is older than `cutoff`.
    pub fn stale(&self, status: JobStatus, cutoff: DateTime<Utc>) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .read_cache()
            .values()
            .filter(|j| j.status == status && j.updated_at < cutoff)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        jobs
    }

    /// Returns the count of cached jobs by status.
    pub fn counts(&self) -> StoreCounts {
        let mut counts = StoreCounts::default();
        for job in self.read_cache().values() {
            match job.status {
                JobStatus::Pending => counts.pending += 1,
                JobStatus::Running => counts.running += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    /// Deletes terminal jobs whose TTL elapsed before `now`.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut cache = self.write_cache();
        let mut removed: HashSet<String> = HashSet::new();

        if let Some(db) = self.get_database() {
            removed.extend(job_repo::delete_expired(&db, &format_timestamp(now))?);
        }
        cache.retain(|id, job| {
            if job.is_expired(now) || removed.contains(id) {
                removed.insert(id.clone());
                false
            } else {
                true
            }
        });

        if !removed.is_empty() {
            log::info!("Purged {} expired jobs", removed.len());
        }
        Ok(removed.len())
    }

    /// Loads every job from the database into the cache.
    ///
    /// Cached entries with a newer revision are kept.
    pub fn load_from_database(&self) -> Result<usize, StoreError> {
        let Some(db) = self.get_database() else {
            return Ok(0);
        };
        let rows = job_repo::find_all(&db)?;
        let mut loaded = 0;
        let mut cache = self.write_cache();
        for row in rows {
            let logs = log_repo::find_by_job(&db, &row.id)?;
            let job = match job_from_row(row, logs) {
                Ok(job) => job,
                Err(e) => {
                    log::warn!("Skipping unreadable job row: {}", e);
                    continue;
                }
            };
            let keep_cached = cache
                .get(&job.id)
                .is_some_and(|cached| cached.version >= job.version);
            if !keep_cached {
                cache.insert(job.id.clone(), job);
                loaded += 1;
            }
        }
        log::info!("Loaded {} jobs from database", loaded);
        Ok(loaded)
    }
}
